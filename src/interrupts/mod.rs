//! Timer/reschedule trap entry point.
//!
//! The local controller's one-shot timer delivers vector 0x20; the handler
//! advances the clock, runs the per-tick scheduler work and, when an AST or
//! a remote preemption request is pending, drives a context switch by
//! swapping the trap frame in place. The timer is re-armed on every pass —
//! inside the switch when one happens, here otherwise — because a missed
//! arm would stall this CPU's scheduler permanently.

use crate::scheduler::types::{SW_INVOL, SW_PREEMPT};
use crate::scheduler::{TrapFrame, SCHED};
use crate::{hal, irq, lapic, smp};

/// Statically reserved vector for the scheduler tick.
pub const TIMER_VECTOR: u8 = 0x20;

/// One-shot reload value: with the divide-by-16 setup this approximates a
/// millisecond tick on common core-bus frequencies. Calibration against a
/// reference clock is the embedding kernel's job.
pub const TIMER_ONESHOT_COUNT: u32 = 10_000;

/// Reserve the timer vector and route it to [`reschedule`].
pub fn init() {
    irq::router().slots().reserve(TIMER_VECTOR);
    hal::traps().set_handler(TIMER_VECTOR, reschedule);
}

/// Timer vector handler: advance ticks and reschedule if needed.
pub fn reschedule(frame: &mut TrapFrame) {
    let cpu = smp::current_cpu_id();

    SCHED.critical_enter(cpu);
    SCHED.pcpu(cpu).set_cur_frame(frame);

    SCHED.hardclock(cpu, 1);
    SCHED.clock(cpu, 1);

    if SCHED.ast_pending(cpu) {
        SCHED.mi_switch(cpu, SW_INVOL | SW_PREEMPT, frame);
    } else {
        lapic::arm_oneshot(TIMER_VECTOR, TIMER_ONESHOT_COUNT);
    }

    SCHED.pcpu(cpu).clear_cur_frame();
    SCHED.critical_exit(cpu);
    lapic::submit_eoi();
}
