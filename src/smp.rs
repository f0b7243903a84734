//! CPU identity and the interrupt-masking side of the spinlock discipline.
//!
//! The scheduler tracks critical-section and spinlock nesting per thread;
//! this module supplies the CPU-level pieces: who am I, how many of us are
//! there, and the actual interrupt flag manipulation saved and restored at
//! the outermost spinlock level.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::lapic;
use crate::scheduler::SCHED;

pub use crate::scheduler::MAX_CPUS;

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Record the processor count discovered from the firmware tables.
pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS), Ordering::Release);
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Identify the calling CPU. Before the local controller is up only the
/// boot CPU runs, so 0 is always right then.
pub fn current_cpu_id() -> usize {
    if !lapic::is_ready() {
        return 0;
    }
    (lapic::local_id() as usize).min(MAX_CPUS - 1)
}

/// Globally enable or disable interrupt delivery on this CPU.
pub fn set_intr_mode(enabled: bool) {
    if enabled {
        arch_intr_enable();
    } else {
        arch_intr_disable();
    }
}

pub fn intr_enabled() -> bool {
    arch_intr_enabled()
}

/// Disable interrupts, returning whether they were enabled. Used by the
/// outermost spinlock entry.
pub(crate) fn intr_disable() -> bool {
    let enabled = arch_intr_enabled();
    arch_intr_disable();
    enabled
}

/// Restore the interrupt-enable state saved by [`intr_disable`].
pub(crate) fn intr_restore(enabled: bool) {
    if enabled {
        arch_intr_enable();
    }
}

// ============================================================================
// Per-thread nesting entry points (delegate to the scheduler)
// ============================================================================

/// Suppress preemption of the current thread.
pub fn critical_enter() {
    SCHED.critical_enter(current_cpu_id());
}

/// Allow preemption again; an owed preemption becomes an AST at the
/// outermost exit.
pub fn critical_exit() {
    SCHED.critical_exit(current_cpu_id());
}

/// Per-thread spinlock prologue: first entry saves the interrupt flag,
/// disables interrupts and enters a critical section.
pub fn spinlock_enter() {
    SCHED.spinlock_enter(current_cpu_id());
}

pub fn spinlock_exit() {
    SCHED.spinlock_exit(current_cpu_id());
}

// ============================================================================
// Interrupt flag access
// ============================================================================

#[cfg(not(test))]
fn arch_intr_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(not(test))]
fn arch_intr_enable() {
    x86_64::instructions::interrupts::enable();
}

#[cfg(not(test))]
fn arch_intr_disable() {
    x86_64::instructions::interrupts::disable();
}

// The sti/cli pair faults outside ring 0; host tests model the flag.
#[cfg(test)]
use std::cell::Cell;

#[cfg(test)]
thread_local! {
    static INTR_FLAG: Cell<bool> = const { Cell::new(true) };
}

#[cfg(test)]
fn arch_intr_enabled() -> bool {
    INTR_FLAG.with(|f| f.get())
}

#[cfg(test)]
fn arch_intr_enable() {
    INTR_FLAG.with(|f| f.set(true));
}

#[cfg(test)]
fn arch_intr_disable() {
    INTR_FLAG.with(|f| f.set(false));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intr_disable_reports_and_restores() {
        arch_intr_enable();
        assert!(intr_disable());
        assert!(!intr_enabled());
        // Nested disable sees the already-masked state.
        assert!(!intr_disable());
        intr_restore(false);
        assert!(!intr_enabled());
        intr_restore(true);
        assert!(intr_enabled());
    }

    #[test]
    fn cpu_count_is_clamped() {
        set_cpu_count(0);
        assert_eq!(cpu_count(), 1);
        set_cpu_count(10_000);
        assert_eq!(cpu_count(), MAX_CPUS);
        set_cpu_count(1);
    }
}
