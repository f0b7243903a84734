//! Per-CPU ULE-style thread scheduler.
//!
//! # Module Organization
//!
//! - `types`: priority constants, flags, classes and the per-thread state
//! - `table`: the thread arena and the shared-mutable thread lock
//! - `runq`: the 64-bucket bitmap-indexed FIFO run queue
//! - `percpu`: the per-CPU thread queue (three run queues plus load state)
//! - `priority`: interactivity scoring and priority computation
//! - `core`: CPU selection, preemption, sleep/wake, lending, the switch
//! - `context`: the trap frame swapped by the switch path

pub mod context;
pub mod core;
pub mod percpu;
pub mod priority;
pub mod runq;
pub mod table;
pub mod types;

pub use self::core::{init, Scheduler, MAX_CPUS, SCHED};
pub use context::TrapFrame;
pub use table::{ThreadId, MAX_THREADS};
pub use types::{SchedClass, ThreadState};
