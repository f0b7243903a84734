//! Thread arena and the shared-mutable thread lock.
//!
//! Threads live in a fixed-capacity arena indexed by `ThreadId`; nothing is
//! ever deallocated, so thread↔queue references cannot dangle. Each slot
//! carries a *lock tag* naming the spinlock that currently owns the thread's
//! scheduling state: the thread queue of some CPU, the shared sleep lock, or
//! the blocked sentinel used transiently during a context-switch hand-off.
//!
//! The discipline mirrors the classical design: the queue owns the thread,
//! the thread does not own a lock of its own. `ThreadSched` sits in an
//! `UnsafeCell` and every access must happen while holding the lock the tag
//! names; `Scheduler::thread_lock` is the only way to obtain it from outside
//! the switch path.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::KernelError;

use super::types::ThreadSched;

pub type ThreadId = usize;

pub const MAX_THREADS: usize = 256;
/// `curthread` sentinel for "nothing".
pub const NO_THREAD: usize = usize::MAX;

/// Lock tag: mid-hand-off between two CPUs. Spinning on this is expected
/// and bounded by the other CPU finishing its switch.
pub(crate) const TDL_BLOCKED: u32 = u32::MAX;
/// Lock tag: owned by the sleep lock (the waiter's sleep-queue lock).
pub(crate) const TDL_SLEEP: u32 = u32::MAX - 1;

pub(crate) struct ThreadSlot {
    used: AtomicBool,
    /// Which lock owns `sched` right now: a CPU index, `TDL_SLEEP`, or
    /// `TDL_BLOCKED`.
    pub(crate) lock: AtomicU32,
    /// Critical-section nesting; preemption is suppressed while non-zero.
    pub(crate) critnest: AtomicU32,
    /// Spinlock nesting; interrupts are disabled while non-zero.
    pub(crate) spinlocks: AtomicU32,
    /// Interrupt-enable state saved at the outermost spinlock entry.
    pub(crate) saved_intr: AtomicBool,
    sched: UnsafeCell<ThreadSched>,
}

// Access to `sched` is serialized by the lock named in `lock`; the atomics
// are safe from any context.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    fn empty() -> ThreadSlot {
        ThreadSlot {
            used: AtomicBool::new(false),
            lock: AtomicU32::new(TDL_SLEEP),
            critnest: AtomicU32::new(0),
            spinlocks: AtomicU32::new(0),
            saved_intr: AtomicBool::new(false),
            sched: UnsafeCell::new(ThreadSched::new(
                "",
                super::types::SchedClass::Timeshare,
                super::types::PRI_MIN_TIMESHARE,
            )),
        }
    }
}

pub(crate) struct ThreadTable {
    slots: Box<[ThreadSlot]>,
}

impl ThreadTable {
    pub fn new(capacity: usize) -> ThreadTable {
        let mut slots = alloc::vec::Vec::with_capacity(capacity);
        slots.resize_with(capacity, ThreadSlot::empty);
        ThreadTable {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Claim a free slot for a new thread. New threads start owned by the
    /// sleep lock in the `Inactive` state.
    pub fn create(&self, sched: ThreadSched) -> Result<ThreadId, KernelError> {
        for (tid, slot) in self.slots.iter().enumerate() {
            if slot
                .used
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // Sole owner: the slot was just claimed and its lock tag is
                // not yet visible to anyone who could contend.
                unsafe {
                    *slot.sched.get() = sched;
                }
                slot.lock.store(TDL_SLEEP, Ordering::Release);
                slot.critnest.store(0, Ordering::Relaxed);
                slot.spinlocks.store(0, Ordering::Relaxed);
                return Ok(tid);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    pub fn slot(&self, tid: ThreadId) -> &ThreadSlot {
        &self.slots[tid]
    }

    pub fn lock_tag(&self, tid: ThreadId) -> u32 {
        self.slots[tid].lock.load(Ordering::Acquire)
    }

    /// Shared view of a thread's scheduling state.
    ///
    /// # Safety
    /// The caller must hold the lock named by the thread's lock tag, or
    /// otherwise guarantee no concurrent writer (single-threaded tests).
    pub unsafe fn td(&self, tid: ThreadId) -> &ThreadSched {
        &*self.slots[tid].sched.get()
    }

    /// Exclusive view of a thread's scheduling state.
    ///
    /// # Safety
    /// As [`ThreadTable::td`], and the caller must not hold another
    /// reference to the same thread's state.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn td_mut(&self, tid: ThreadId) -> &mut ThreadSched {
        &mut *self.slots[tid].sched.get()
    }
}
