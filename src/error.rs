//! Kernel error taxonomy.
//!
//! Every failure in this crate is a boot-time failure: after `init()` the
//! slot table is preallocated, the run queues are bounded and no steady-state
//! operation can fail. Boot-path functions return `Result<_, KernelError>`
//! and the caller decides whether the condition is fatal (it always is for
//! `init()` itself).

use core::fmt;

/// Errors surfaced while bringing up the interrupt substrate and scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// The page allocator refused a boot-time allocation.
    OutOfMemory,
    /// The interrupt slot table is saturated; no vector can be bound.
    NoVectors,
    /// The firmware did not provide the MADT ("APIC") table.
    NoFirmwareTable,
    /// A redirection entry was configured with no free slot available.
    InvalidRedirection,
    /// The memory manager could not establish a requested mapping.
    MapFailed,
}

impl KernelError {
    pub const fn as_str(self) -> &'static str {
        match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::NoVectors => "interrupt slot table saturated",
            KernelError::NoFirmwareTable => "MADT firmware table absent",
            KernelError::InvalidRedirection => "no free slot for redirection entry",
            KernelError::MapFailed => "page mapping failed",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
