//! Per-CPU local interrupt controller.
//!
//! The controller lives at the physical address named by the `IA32_APIC_BASE`
//! MSR, mirrored into the kernel's higher half and mapped uncached. It is
//! enabled once per CPU before the first timer arm; `submit_eoi` acknowledges
//! every vector it delivers, and the one-shot timer drives the scheduler
//! tick.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use x86_64::registers::model_specific::Msr;

use crate::error::KernelError;
use crate::hal::{self, MapFlags};

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_BASE_MASK: u64 = !0xFFF;
/// Architectural default physical base.
const APIC_DEFAULT_PHYS: u64 = 0xFEE0_0000;

const REG_ID: u32 = 0x20;
const REG_EOI: u32 = 0x0B0;
const REG_SVR: u32 = 0x0F0;
const REG_LVT_TIMER: u32 = 0x320;
const REG_TIMER_INITIAL: u32 = 0x380;
const REG_TIMER_DIVIDE: u32 = 0x3E0;

const SVR_APIC_ENABLE: u32 = 1 << 8;
const SPURIOUS_VECTOR: u32 = 0xFF;

const TIMER_MODE_ONESHOT: u32 = 0 << 17;
/// Divide-by-16 encoding for the timer divide configuration register.
const TIMER_DIVIDE_BY_16: u32 = 0x3;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static LAPIC_READY: AtomicBool = AtomicBool::new(false);

/// Discover, map and enable the local controller for the calling CPU.
pub fn init() -> Result<(), KernelError> {
    let msr = unsafe { Msr::new(IA32_APIC_BASE).read() };
    let phys = msr & APIC_BASE_MASK;
    if phys != APIC_DEFAULT_PHYS {
        crate::kwarn!(
            "LAPIC: firmware relocated base to {:#x}, adopting it",
            phys
        );
    }

    let virt = hal::memory().to_higher_half(phys);
    hal::memory()
        .map_page(MapFlags::MMIO, virt, phys, false)
        .map_err(|_| KernelError::MapFailed)?;
    LAPIC_BASE.store(virt, Ordering::SeqCst);

    enable(phys);
    LAPIC_READY.store(true, Ordering::SeqCst);
    crate::kinfo!("LAPIC: enabled at {:#x} (id {})", phys, local_id());
    Ok(())
}

fn enable(phys: u64) {
    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let mut value = msr.read();
        value &= 0xFFF;
        value |= phys | APIC_GLOBAL_ENABLE;
        msr.write(value);

        write_register(REG_SVR, SVR_APIC_ENABLE | SPURIOUS_VECTOR);
    }
}

pub fn is_ready() -> bool {
    LAPIC_READY.load(Ordering::Acquire)
}

/// The calling CPU's local controller id, or 0 before initialization.
pub fn local_id() -> u32 {
    if !is_ready() {
        return 0;
    }
    unsafe { read_register(REG_ID) >> 24 }
}

/// Acknowledge the interrupt currently in service.
pub fn submit_eoi() {
    if !is_ready() {
        return;
    }
    unsafe {
        write_register(REG_EOI, 0);
    }
}

/// Arm the timer for a single expiry of `count` timer ticks delivering
/// `vector`. Re-armed on every reschedule; a missed arm stalls this CPU.
pub fn arm_oneshot(vector: u8, count: u32) {
    if !is_ready() {
        return;
    }
    unsafe {
        write_register(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        write_register(REG_LVT_TIMER, TIMER_MODE_ONESHOT | vector as u32);
        write_register(REG_TIMER_INITIAL, count);
    }
}

unsafe fn read_register(offset: u32) -> u32 {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    read_volatile((base + offset as u64) as *const u32)
}

unsafe fn write_register(offset: u32, value: u32) {
    let base = LAPIC_BASE.load(Ordering::SeqCst);
    write_volatile((base + offset as u64) as *mut u32, value);
}
