//! Global IRQ slot table and pin binding.
//!
//! A *slot* is a kernel-side interrupt vector: 256 of them, the low 32
//! reserved for CPU exceptions at boot. A *pin* is a hardware interrupt
//! input on some I/O controller, exposed as a capability object offering
//! mask, eoi, configure and handler binding. Binding a pin claims the first
//! free slot as its vector; slots are never recycled in normal operation.
//!
//! Controllers, pins and the slot table live in arenas owned by the router
//! so the pin↔controller references never dangle; nothing here is ever
//! deallocated.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::acpi::{InterruptOverride, IoControllerDecl};
use crate::error::KernelError;
use crate::hal::{self, MapFlags};
use crate::ioapic::{IoApic, MmioRegs, TriggerMode};
use crate::scheduler::context::TrapFrame;
use crate::{kinfo, kwarn};

pub const IRQ_SLOTS: usize = 256;
/// Vectors 0-31 are CPU exceptions.
pub const EXCEPTION_SLOTS: usize = 32;
/// Number of legacy ISA IRQs that may carry a source override.
const LEGACY_IRQS: usize = 16;

pub type PinId = usize;

#[derive(Clone, Copy)]
struct Slot {
    active: bool,
    pin: Option<PinId>,
}

impl Slot {
    const fn free() -> Slot {
        Slot {
            active: false,
            pin: None,
        }
    }
}

/// The flat table of 256 global IRQ slots.
pub struct SlotTable {
    slots: Mutex<[Slot; IRQ_SLOTS]>,
}

impl SlotTable {
    pub const fn new() -> SlotTable {
        SlotTable {
            slots: Mutex::new([Slot::free(); IRQ_SLOTS]),
        }
    }

    /// Mark the first `count` slots active with no pin attached.
    pub fn reserve_low(&self, count: usize) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut().take(count) {
            slot.active = true;
        }
    }

    /// Reserve one specific slot (e.g. the statically assigned timer
    /// vector).
    pub fn reserve(&self, index: u8) {
        self.slots.lock()[index as usize].active = true;
    }

    /// Claim the first inactive slot for `pin` and return its index.
    /// Binding an already-bound pin returns its existing slot.
    pub fn bind(&self, pin: PinId) -> Result<u8, KernelError> {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.iter().position(|s| s.pin == Some(pin)) {
            return Ok(existing as u8);
        }
        match slots.iter().position(|s| !s.active) {
            Some(index) => {
                slots[index].active = true;
                slots[index].pin = Some(pin);
                Ok(index as u8)
            }
            None => Err(KernelError::NoVectors),
        }
    }

    /// The pin a vector was bound to, if any.
    pub fn pin_for_vector(&self, vector: u8) -> Option<PinId> {
        self.slots.lock()[vector as usize].pin
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.active).count()
    }
}

struct IrqPin {
    apic: usize,
    index: u32,
    gsi: u32,
    name: String,
    /// Assigned vector; 0 means unconfigured (vector 0 is an exception
    /// slot and can never be handed out).
    vector: AtomicU8,
}

/// Arena of controllers and pins plus the slot table.
pub struct IrqRouter {
    slots: SlotTable,
    ioapics: Mutex<Vec<IoApic>>,
    pins: Mutex<Vec<IrqPin>>,
    overrides: Mutex<[Option<InterruptOverride>; LEGACY_IRQS]>,
}

impl IrqRouter {
    pub const fn new() -> IrqRouter {
        IrqRouter {
            slots: SlotTable::new(),
            ioapics: Mutex::new(Vec::new()),
            pins: Mutex::new(Vec::new()),
            overrides: Mutex::new([None; LEGACY_IRQS]),
        }
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Adopt a controller, materializing one pin object per hardware pin.
    pub fn add_controller(&self, apic: IoApic) -> Result<(), KernelError> {
        let mut ioapics = self.ioapics.lock();
        let gsi_base = apic.gsi_base();
        let pin_count = apic.pin_count();

        for existing in ioapics.iter() {
            let overlap = gsi_base < existing.gsi_base() + existing.pin_count()
                && existing.gsi_base() < gsi_base + pin_count;
            assert!(
                !overlap,
                "I/O controller GSI range {}..{} overlaps {}..{}",
                gsi_base,
                gsi_base + pin_count,
                existing.gsi_base(),
                existing.gsi_base() + existing.pin_count()
            );
        }

        // Nothing is delivered until a pin is configured and unmasked.
        for pin in 0..pin_count {
            apic.set_masked(pin, true);
        }

        let apic_index = ioapics.len();
        ioapics.push(apic);

        let mut pins = self.pins.lock();
        for index in 0..pin_count {
            pins.push(IrqPin {
                apic: apic_index,
                index,
                gsi: gsi_base + index,
                name: format!("ioapic{}:{}", apic_index, index),
                vector: AtomicU8::new(0),
            });
        }
        Ok(())
    }

    pub fn add_override(&self, iso: &InterruptOverride) {
        if (iso.source_irq as usize) < LEGACY_IRQS {
            self.overrides.lock()[iso.source_irq as usize] = Some(*iso);
        }
    }

    /// Resolve a legacy ISA IRQ number to its global system interrupt.
    pub fn legacy_irq_to_gsi(&self, irq: u8) -> u32 {
        if (irq as usize) < LEGACY_IRQS {
            if let Some(iso) = self.overrides.lock()[irq as usize] {
                return iso.gsi;
            }
        }
        irq as u32
    }

    /// Look up the pin serving a global system interrupt.
    pub fn pin_lookup(&self, gsi: u32) -> Option<PinRef<'_>> {
        let pins = self.pins.lock();
        pins.iter()
            .position(|p| p.gsi == gsi)
            .map(|id| PinRef { router: self, id })
    }

    fn with_apic<R>(&self, pin: PinId, f: impl FnOnce(&IoApic, u32) -> R) -> R {
        let (apic, index) = {
            let pins = self.pins.lock();
            (pins[pin].apic, pins[pin].index)
        };
        let ioapics = self.ioapics.lock();
        f(&ioapics[apic], index)
    }
}

impl Default for IrqRouter {
    fn default() -> Self {
        IrqRouter::new()
    }
}

/// Capability handle for one hardware interrupt input.
pub struct PinRef<'a> {
    router: &'a IrqRouter,
    id: PinId,
}

impl PinRef<'_> {
    pub fn gsi(&self) -> u32 {
        self.router.pins.lock()[self.id].gsi
    }

    pub fn name(&self) -> String {
        self.router.pins.lock()[self.id].name.clone()
    }

    /// The vector assigned by `configure`, if any.
    pub fn vector(&self) -> Option<u8> {
        match self.router.pins.lock()[self.id].vector.load(Ordering::Acquire) {
            0 => None,
            v => Some(v),
        }
    }

    /// Mask or unmask the pin. Unmasking an unconfigured pin is refused:
    /// a redirection entry with no vector would deliver garbage.
    pub fn mask(&self, masked: bool) {
        if !masked && self.vector().is_none() {
            kwarn!(
                "irq: refusing to unmask unconfigured pin {}",
                self.router.pins.lock()[self.id].name
            );
            return;
        }
        self.router
            .with_apic(self.id, |apic, index| apic.set_masked(index, masked));
    }

    /// Bind a slot as this pin's vector and program the redirection entry.
    /// The pin stays masked afterwards.
    pub fn configure(
        &self,
        level: bool,
        high_polarity: bool,
    ) -> Result<TriggerMode, KernelError> {
        let vector = self
            .router
            .slots
            .bind(self.id)
            .map_err(|_| KernelError::InvalidRedirection)?;
        self.router.pins.lock()[self.id]
            .vector
            .store(vector, Ordering::Release);
        let mode = self
            .router
            .with_apic(self.id, |apic, index| {
                apic.program(index, level, high_polarity, vector)
            });
        Ok(mode)
    }

    /// Acknowledge delivery; I/O controllers delegate EOI to the local
    /// controller.
    pub fn eoi(&self) {
        crate::lapic::submit_eoi();
    }

    /// Route the pin's vector to `handler` in the trap delivery layer.
    /// The pin must already be configured.
    pub fn set_handler(&self, handler: fn(&mut TrapFrame)) -> Result<(), KernelError> {
        let vector = self.vector().ok_or(KernelError::InvalidRedirection)?;
        hal::traps().set_handler(vector, handler);
        Ok(())
    }
}

static ROUTER: IrqRouter = IrqRouter::new();

/// Reserve the exception slots in the global table.
pub fn init() {
    ROUTER.slots.reserve_low(EXCEPTION_SLOTS);
}

/// The global router instance.
pub fn router() -> &'static IrqRouter {
    &ROUTER
}

/// Map and adopt an I/O controller declared by the firmware.
pub fn register_controller(decl: &IoControllerDecl) -> Result<(), KernelError> {
    let phys = decl.mmio_base as u64;
    let virt = hal::memory().to_higher_half(phys);
    hal::memory()
        .map_page(MapFlags::MMIO, virt, phys, false)
        .map_err(|_| KernelError::MapFailed)?;

    let apic = IoApic::new(
        Box::new(unsafe { MmioRegs::new(virt as *mut u32) }),
        decl.gsi_base,
    );
    kinfo!(
        "IOAPIC {}: {} pins at {:#x}, GSI base {}",
        decl.id,
        apic.pin_count(),
        phys,
        decl.gsi_base
    );
    ROUTER.add_controller(apic)
}

pub fn register_override(iso: &InterruptOverride) {
    kinfo!("IOAPIC: legacy IRQ {} routed to GSI {}", iso.source_irq, iso.gsi);
    ROUTER.add_override(iso);
}

/// Look up a pin by global system interrupt in the global router.
pub fn pin_lookup(gsi: u32) -> Option<PinRef<'static>> {
    ROUTER.pin_lookup(gsi)
}
