//! Interactivity scoring, priority computation and CPU-percentage
//! accounting.
//!
//! A thread's recent history lives in two decayed accumulators, `runtime`
//! and `slptime`, both carrying `SCHED_TICK_SHIFT` fractional bits. The
//! interactivity score maps their ratio onto `[0, 100]`: sleep-dominated
//! threads score low and are placed in the interactive band, run-dominated
//! threads score high and are placed in the batch band where recent CPU use
//! and nice values decide the exact priority.

use super::types::*;

/// Cap for `runtime + slptime`, per the decay rules below.
#[inline]
pub const fn slp_run_max(hz: u32) -> u32 {
    (5 * hz) << SCHED_TICK_SHIFT
}

/// Window targeted by the pct-cpu accumulator.
#[inline]
const fn tick_targ(hz: u32) -> u32 {
    hz * 10
}

#[inline]
const fn tick_max(hz: u32) -> u32 {
    tick_targ(hz) + hz
}

/// Interactivity score in `[0, SCHED_INTERACT_MAX]`.
///
/// The score is dominated by whichever side is larger: mostly-running
/// threads land in `(50, 100]`, mostly-sleeping threads in `[0, 50)`.
/// A thread with no history at all scores 0 so it starts interactive.
pub fn interact_score(runtime: u32, slptime: u32) -> u32 {
    if runtime >= slptime {
        if runtime == 0 {
            // Neither has accumulated; brand new thread.
            return 0;
        }
        // The exact figure only matters below the interactive threshold,
        // which lies under the half-max; short-circuit.
        if SCHED_INTERACT_THRESH <= SCHED_INTERACT_HALF {
            return SCHED_INTERACT_HALF;
        }
        let div = (runtime / SCHED_INTERACT_HALF).max(1);
        return SCHED_INTERACT_HALF + (SCHED_INTERACT_HALF - slptime / div);
    }
    let div = (slptime / SCHED_INTERACT_HALF).max(1);
    runtime / div
}

/// Decay the interactivity accumulators once their sum exceeds the cap.
///
/// Far over the cap (more than 2x) the larger side is clamped to the cap
/// and the smaller to 1; moderately over (more than 6/5 of the cap) both
/// halve; otherwise both are scaled by 4/5.
pub fn interact_update(td: &mut ThreadSched, hz: u32) {
    let max = slp_run_max(hz);
    let sum = td.runtime.wrapping_add(td.slptime);
    if sum < max {
        return;
    }
    if sum > max * 2 {
        if td.runtime > td.slptime {
            td.runtime = max;
            td.slptime = 1;
        } else {
            td.slptime = max;
            td.runtime = 1;
        }
        return;
    }
    if sum > (max / 5) * 6 {
        td.runtime /= 2;
        td.slptime /= 2;
        return;
    }
    td.runtime = td.runtime / 5 * 4;
    td.slptime = td.slptime / 5 * 4;
}

/// Advance the pct-cpu tick window to global tick `t`, charging the
/// elapsed ticks when the thread was `running`.
pub fn pctcpu_update(td: &mut ThreadSched, t: u32, running: bool, hz: u32) {
    let targ = tick_targ(hz);
    if t.wrapping_sub(td.ltick) >= targ {
        // Idle for a whole window; the history is worthless.
        td.ticks = 0;
        td.ftick = t.wrapping_sub(targ);
    } else if t.wrapping_sub(td.ftick) >= tick_max(hz) {
        let window = td.ltick.wrapping_sub(td.ftick);
        if window > 0 {
            td.ticks = (td.ticks / window) * (td.ltick.wrapping_sub(t.wrapping_sub(targ)));
        }
        td.ftick = t.wrapping_sub(targ);
    }
    if running {
        td.ticks = td
            .ticks
            .wrapping_add(t.wrapping_sub(td.ltick) << SCHED_TICK_SHIFT);
    }
    td.ltick = t;
}

/// Recent CPU use as a percentage in `[0, 100]`.
pub fn pct_cpu(td: &ThreadSched, hz: u32) -> u32 {
    if td.ticks == 0 {
        return 0;
    }
    // Real ticks per second over the (ten second) window.
    let rtick = ((td.ticks >> SCHED_TICK_SHIFT) / 10).min(hz);
    rtick * 100 / hz
}

/// Ticks-based batch priority contribution in `[0, SCHED_PRI_RANGE)`.
fn pri_ticks(td: &ThreadSched, hz: u32) -> u32 {
    let total = td.ltick.wrapping_sub(td.ftick).max(hz);
    let tick_hz = td.ticks >> SCHED_TICK_SHIFT;
    // Scale the window down to the priority range.
    let divisor = (total + SCHED_PRI_RANGE - 1) / SCHED_PRI_RANGE;
    (tick_hz / divisor.max(1)).min(SCHED_PRI_RANGE - 1)
}

/// Compute a timeshare thread's user priority from its interactivity.
///
/// Interactive scores map linearly onto `[PRI_MIN_INTERACT,
/// PRI_MAX_INTERACT]`; batch scores start at `SCHED_PRI_MIN` plus the
/// recent-CPU term, and nice shifts the result inside the reserved slots.
/// Other classes keep their static priorities.
pub fn compute_priority(td: &mut ThreadSched, hz: u32) {
    if td.class != SchedClass::Timeshare {
        return;
    }
    let score =
        (interact_score(td.runtime, td.slptime) as i32 + td.nice as i32).max(0) as u32;
    let pri = if score < SCHED_INTERACT_THRESH {
        let step = PRI_INTERACT_RANGE * score / SCHED_INTERACT_THRESH;
        PRI_MIN_INTERACT as i32 + step as i32
    } else {
        let mut pri = SCHED_PRI_MIN as i32;
        if td.ticks != 0 {
            pri += pri_ticks(td, hz) as i32;
        }
        pri + td.nice as i32
    };
    let pri = pri.clamp(PRI_MIN_TIMESHARE as i32, PRI_MAX_TIMESHARE as i32) as u8;
    user_priority(td, pri);
}

/// Set the base user priority, honoring any active lend.
pub fn user_priority(td: &mut ThreadSched, pri: u8) {
    td.base_user_pri = pri;
    if td.lend_user_pri <= pri {
        return;
    }
    td.user_pri = pri;
}
