//! Helix kernel core: a per-CPU, priority-decayed, multi-level run-queue
//! thread scheduler together with the APIC interrupt-routing substrate that
//! feeds it.
//!
//! The crate is deliberately narrow. Memory management, the ACPI table
//! parser, trap delivery and the boot environment are collaborators reached
//! through the interfaces in [`hal`]; everything else — slot/pin/vector
//! binding, the local and I/O interrupt controllers, the run queues and the
//! scheduler state machine — lives here.
//!
//! # Module Organization
//!
//! - `logger` / `serial`: leveled kernel logging with a pluggable sink
//! - `hal`: collaborator service interfaces (memory, firmware, traps)
//! - `acpi`: MADT walk producing I/O controller and CPU declarations
//! - `lapic`: per-CPU local interrupt controller and one-shot timer
//! - `ioapic`: I/O interrupt controller register access
//! - `irq`: global IRQ slot table and the pin capability objects
//! - `smp`: CPU identity and the critical-section/spinlock discipline
//! - `scheduler`: run queues, per-CPU thread queues and the scheduler core
//! - `interrupts`: the timer/reschedule trap entry point

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod error;
pub mod hal;
pub mod interrupts;
pub mod ioapic;
pub mod irq;
pub mod lapic;
pub mod logger;
pub mod scheduler;
pub mod serial;
pub mod smp;

use crate::error::KernelError;

/// Bring up the interrupt substrate and the scheduler on the boot CPU.
///
/// Order matters: the slot table must exist before any controller can bind
/// vectors, the I/O controllers must be discovered before device pins are
/// handed out, and the local controller must be enabled before the first
/// timer arm. Collaborator services ([`hal::install`]) and a logging sink
/// must be in place before this is called.
pub fn init() -> Result<(), KernelError> {
    irq::init();

    let table = hal::firmware()
        .table("APIC")
        .ok_or(KernelError::NoFirmwareTable)?;
    let madt = acpi::Madt::parse(table);

    let cpus = madt.cpu_count().max(1);
    smp::set_cpu_count(cpus);
    kinfo!("ACPI: MADT reports {} processors", cpus);

    for decl in madt.io_controllers() {
        irq::register_controller(&decl)?;
    }
    for iso in madt.overrides() {
        irq::register_override(&iso);
    }

    lapic::init()?;
    scheduler::init(cpus);
    interrupts::init();

    lapic::arm_oneshot(interrupts::TIMER_VECTOR, interrupts::TIMER_ONESHOT_COUNT);
    smp::set_intr_mode(true);

    kinfo!("helix core online ({} CPUs)", cpus);
    Ok(())
}

/// Fatal-error sink for the embedding kernel's panic handler.
#[cfg(not(test))]
pub fn panic(info: &core::panic::PanicInfo) -> ! {
    kfatal!("KERNEL PANIC: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Fatal, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::Trace, $($arg)*);
    }};
}
