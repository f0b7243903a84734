//! Scheduler type definitions and the priority constant space.
//!
//! The priority ranges and tuning constants are exactly ULE's: interrupt
//! threads in `[0, 15]`, realtime in `[16, 47]`, kernel priorities from 48,
//! timeshare in `[88, 223]` split between an interactive and a batch band
//! after reserving 40 slots for nice values, idle in `[224, 255]`. Lower
//! numbers are better priorities throughout.

use super::context::TrapFrame;

pub const PRI_MAX: u8 = 255;

pub const PRI_MIN_ITHD: u8 = 0;
pub const PRI_MAX_ITHD: u8 = 15;
pub const PRI_MIN_REALTIME: u8 = 16;
pub const PRI_MAX_REALTIME: u8 = 47;
pub const PRI_MIN_KERN: u8 = 48;
pub const PRI_MIN_TIMESHARE: u8 = 88;
pub const PRI_MAX_TIMESHARE: u8 = PRI_MIN_IDLE - 1;
pub const PRI_MIN_IDLE: u8 = 224;
pub const PRI_MAX_IDLE: u8 = PRI_MAX;

pub const PRIO_MIN: i32 = -20;
pub const PRIO_MAX: i32 = 20;

/// Priority slots reserved for the nice range.
pub const SCHED_PRI_NRESV: u32 = (PRIO_MAX - PRIO_MIN) as u32;

const PRI_TIMESHARE_RANGE: u32 = (PRI_MAX_TIMESHARE - PRI_MIN_TIMESHARE + 1) as u32;
pub const PRI_INTERACT_RANGE: u32 = (PRI_TIMESHARE_RANGE - SCHED_PRI_NRESV) / 2;
pub const PRI_BATCH_RANGE: u32 = PRI_TIMESHARE_RANGE - PRI_INTERACT_RANGE;

pub const PRI_MIN_INTERACT: u8 = PRI_MIN_TIMESHARE;
pub const PRI_MAX_INTERACT: u8 = PRI_MIN_TIMESHARE + PRI_INTERACT_RANGE as u8 - 1;
pub const PRI_MIN_BATCH: u8 = PRI_MIN_TIMESHARE + PRI_INTERACT_RANGE as u8;
pub const PRI_MAX_BATCH: u8 = PRI_MAX_TIMESHARE;

pub const SCHED_PRI_NHALF: u32 = SCHED_PRI_NRESV / 2;
pub const SCHED_PRI_MIN: u8 = PRI_MIN_BATCH + SCHED_PRI_NHALF as u8;
pub const SCHED_PRI_MAX: u8 = PRI_MAX_BATCH - SCHED_PRI_NHALF as u8;
pub const SCHED_PRI_RANGE: u32 = (SCHED_PRI_MAX - SCHED_PRI_MIN + 1) as u32;

pub const SCHED_INTERACT_MAX: u32 = 100;
pub const SCHED_INTERACT_HALF: u32 = SCHED_INTERACT_MAX / 2;
/// Scores below this are interactive; at or above, batch.
pub const SCHED_INTERACT_THRESH: u32 = 30;

/// Tick accumulators carry 10 fractional bits.
pub const SCHED_TICK_SHIFT: u32 = 10;

/// Run-queue buckets and the priorities-per-bucket granularity.
pub const RQ_NQS: usize = 64;
pub const RQ_PPQ: u8 = 4;

pub const NOCPU: u32 = u32::MAX;

/// Cache levels considered when relaxing affinity after a forced migration.
pub const MAX_CACHE_LEVELS: u32 = 2;

// Thread flags.
/// Pinned to its CPU; never migrated.
pub const TDF_BOUND: u32 = 1 << 0;
/// Counted in the queue's transferable load.
pub const TDF_XFERABLE: u32 = 1 << 1;
/// Excluded from the system load average.
pub const TDF_NOLOAD: u32 = 1 << 2;
/// Running on a priority lent by another thread.
pub const TDF_BORROWING: u32 = 1 << 3;
/// This is a per-CPU idle thread.
pub const TDF_IDLETD: u32 = 1 << 4;
/// Re-run CPU selection at the next switch.
pub const TDF_PICKCPU: u32 = 1 << 5;
/// The slice expired; the next switch is not a preemption.
pub const TDF_SLICEEND: u32 = 1 << 6;
/// An AST is pending: reschedule at the next safe boundary.
pub const TDF_NEEDRESCHED: u32 = 1 << 7;

// Inhibitor bits: why an inhibited thread cannot run.
pub const TDI_SUSPENDED: u32 = 1 << 0;
pub const TDI_SLEEPING: u32 = 1 << 1;
pub const TDI_SWAPPED: u32 = 1 << 2;
pub const TDI_LOCK: u32 = 1 << 3;
pub const TDI_IWAIT: u32 = 1 << 4;

// Run-queue request flags.
pub const SRQ_BORING: u32 = 0;
pub const SRQ_YIELDING: u32 = 1 << 0;
pub const SRQ_OURSELF: u32 = 1 << 1;
pub const SRQ_INTR: u32 = 1 << 2;
pub const SRQ_PREEMPTED: u32 = 1 << 3;
pub const SRQ_BORROWING: u32 = 1 << 4;

// Switch flags.
pub const SW_VOL: u32 = 1 << 0;
pub const SW_INVOL: u32 = 1 << 1;
pub const SW_PREEMPT: u32 = 1 << 2;

/// Scheduling class of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedClass {
    Interrupt,
    Realtime,
    Timeshare,
    Idle,
}

/// Execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Inactive,
    /// Cannot run; `inhibitors` says why.
    Inhibited,
    CanRun,
    /// Present on exactly one run queue.
    Runq,
    Running,
}

/// Which of a queue's three run queues a thread sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunqKind {
    Realtime,
    Timeshare,
    Idle,
}

/// Per-thread scheduling state, guarded by the lock the owning
/// `ThreadSlot::lock` tag names.
#[derive(Clone, Debug)]
pub struct ThreadSched {
    pub name: &'static str,
    pub class: SchedClass,
    pub flags: u32,
    pub inhibitors: u32,
    pub state: ThreadState,

    /// Effective priority; what the run queues sort by.
    pub pri: u8,
    pub base_pri: u8,
    pub user_pri: u8,
    pub base_user_pri: u8,
    /// Lowest user priority lent to us; `PRI_MAX` when nothing is lent.
    pub lend_user_pri: u8,
    pub base_ithread_pri: u8,
    pub nice: i8,

    /// Bucket index recorded at insertion.
    pub rqindex: u8,
    pub runq: Option<RunqKind>,

    /// CPU the thread is assigned to run on.
    pub cpu: u32,
    pub lastcpu: u32,
    /// CPU currently executing the thread, or `NOCPU`.
    pub oncpu: u32,

    /// Windowed tick accumulator (shifted by `SCHED_TICK_SHIFT`).
    pub ticks: u32,
    pub ftick: u32,
    pub ltick: u32,
    /// Last tick the thread ran, for affinity decisions.
    pub rltick: u32,
    /// Ticks consumed from the current slice.
    pub slice: u32,

    /// Decayed run time, shifted.
    pub runtime: u32,
    /// Decayed voluntary-sleep time, shifted.
    pub slptime: u32,
    /// Tick at which the thread went to sleep.
    pub slptick: u32,
    /// Run ticks accrued but not yet charged.
    pub incruntime: u32,

    pub frame: TrapFrame,
}

impl ThreadSched {
    pub fn new(name: &'static str, class: SchedClass, base_pri: u8) -> ThreadSched {
        ThreadSched {
            name,
            class,
            flags: 0,
            inhibitors: 0,
            state: ThreadState::Inactive,
            pri: base_pri,
            base_pri,
            user_pri: base_pri,
            base_user_pri: base_pri,
            lend_user_pri: PRI_MAX,
            base_ithread_pri: base_pri,
            nice: 0,
            rqindex: 0,
            runq: None,
            cpu: 0,
            lastcpu: NOCPU,
            oncpu: NOCPU,
            ticks: 0,
            ftick: 0,
            ltick: 0,
            rltick: 0,
            slice: 0,
            runtime: 0,
            slptime: 0,
            slptick: 0,
            incruntime: 0,
            frame: TrapFrame::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_bands_partition_the_timeshare_range() {
        assert_eq!(PRI_MIN_INTERACT, 88);
        assert_eq!(PRI_MAX_INTERACT, 135);
        assert_eq!(PRI_MIN_BATCH, 136);
        assert_eq!(PRI_MAX_BATCH, 223);
        assert_eq!(PRI_INTERACT_RANGE, 48);
        assert_eq!(PRI_BATCH_RANGE, 88);
    }

    #[test]
    fn batch_score_band_leaves_room_for_nice() {
        assert_eq!(SCHED_PRI_MIN, 156);
        assert_eq!(SCHED_PRI_MAX, 203);
        assert_eq!(SCHED_PRI_RANGE, 48);
        // Worst-case nice adjustments stay inside the batch band.
        assert!(SCHED_PRI_MIN as i32 + PRIO_MIN >= PRI_MIN_BATCH as i32);
        assert!(SCHED_PRI_MAX as i32 + PRIO_MAX - 1 <= PRI_MAX_BATCH as i32);
    }
}
