//! Collaborator service interfaces.
//!
//! The memory managers, the firmware table provider and the trap delivery
//! layer live outside this crate. They are reached through the traits below,
//! installed exactly once at boot with [`install`]. Using a service before
//! installation is a programming error and panics.
//!
//! CPU-level intrinsics (MSR access, interrupt masking) are deliberately
//! *not* abstracted here; the `x86_64` crate is used for those directly.

use spin::Once;

use crate::scheduler::context::TrapFrame;

/// Page-mapping attributes requested from the memory manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapFlags {
    pub writable: bool,
    /// Disable caching for the mapping; required for device MMIO.
    pub uncached: bool,
}

impl MapFlags {
    pub const MMIO: MapFlags = MapFlags {
        writable: true,
        uncached: true,
    };
}

/// Physical and virtual memory services.
pub trait MemoryServices: Sync {
    /// Translate a physical address into the kernel's higher-half mirror.
    fn to_higher_half(&self, phys: u64) -> u64;
    /// Inverse of [`MemoryServices::to_higher_half`].
    fn from_higher_half(&self, virt: u64) -> u64;
    /// Establish a 4 KiB (or, with `huge`, 2 MiB) mapping.
    fn map_page(&self, flags: MapFlags, virt: u64, phys: u64, huge: bool) -> Result<(), ()>;
    fn unmap_page(&self, virt: u64);
    /// Allocate `count` contiguous physical pages, or `None` when exhausted.
    fn alloc_pages(&self, count: usize) -> Option<u64>;
}

/// Access to firmware-provided configuration tables.
pub trait FirmwareServices: Sync {
    /// Look up a table by its 4-character signature ("APIC" for the MADT).
    fn table(&self, signature: &str) -> Option<&'static [u8]>;
}

/// Handler registration in the trap delivery layer.
pub trait TrapServices: Sync {
    fn set_handler(&self, vector: u8, handler: fn(&mut TrapFrame));
}

struct Services {
    memory: &'static dyn MemoryServices,
    firmware: &'static dyn FirmwareServices,
    traps: &'static dyn TrapServices,
}

static SERVICES: Once<Services> = Once::new();

/// Install the collaborator services. Only the first call wins; `init()`
/// must not run before this has happened.
pub fn install(
    memory: &'static dyn MemoryServices,
    firmware: &'static dyn FirmwareServices,
    traps: &'static dyn TrapServices,
) {
    SERVICES.call_once(|| Services {
        memory,
        firmware,
        traps,
    });
}

fn services() -> &'static Services {
    SERVICES
        .get()
        .expect("hal services used before hal::install()")
}

pub fn memory() -> &'static dyn MemoryServices {
    services().memory
}

pub fn firmware() -> &'static dyn FirmwareServices {
    services().firmware
}

pub fn traps() -> &'static dyn TrapServices {
    services().traps
}
