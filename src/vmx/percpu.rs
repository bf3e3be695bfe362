//! Per-processor table the exit landing point and the host exception stubs
//! use to find their controller.
//!
//! Hardware enters both with no argument identifying the controller, so each
//! processor's slot is found by its initial APIC id. Host exception handling
//! only ever touches the atomics in the slot, never the controller itself,
//! since it may interrupt an exit handler halfway through.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use x86::irq::NONMASKABLE_INTERRUPT_VECTOR;

use super::ExitAction;
use super::host::TrapFrame;
use crate::config::MAX_CPUS;
use crate::regs::GuestContext;
use crate::{Result, VmxError};

/// Type-erased entry point into a controller, embedded as its first field.
#[repr(C)]
pub struct ExitTarget {
    on_exit: unsafe fn(NonNull<ExitTarget>, &mut GuestContext) -> ExitAction,
}

impl ExitTarget {
    pub const fn new(on_exit: unsafe fn(NonNull<ExitTarget>, &mut GuestContext) -> ExitAction) -> Self {
        Self { on_exit }
    }

    /// Hands an exit to the controller `target` is embedded in.
    ///
    /// # Safety
    ///
    /// `target` must come from a registered, live controller, and no other
    /// reference to that controller may be in use.
    pub unsafe fn dispatch(target: NonNull<ExitTarget>, ctx: &mut GuestContext) -> ExitAction {
        unsafe { (target.as_ref().on_exit)(target, ctx) }
    }
}

struct PerCpuSlot {
    target: AtomicPtr<ExitTarget>,
    queued_nmis: AtomicU32,
}

static SLOTS: [PerCpuSlot; MAX_CPUS] = [const {
    PerCpuSlot {
        target: AtomicPtr::new(ptr::null_mut()),
        queued_nmis: AtomicU32::new(0),
    }
}; MAX_CPUS];

fn slot(apic_id: u32) -> Option<&'static PerCpuSlot> {
    SLOTS.get(apic_id as usize)
}

/// Records `target` as the controller of processor `apic_id`.
pub fn register(apic_id: u32, target: NonNull<ExitTarget>) -> Result {
    let slot = slot(apic_id).ok_or(VmxError::InvalidInput("APIC id beyond the per-processor table"))?;
    slot.target
        .compare_exchange(
            ptr::null_mut(),
            target.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| VmxError::InvalidInput("processor already has a registered vcpu"))?;
    slot.queued_nmis.store(0, Ordering::Release);
    debug!("registered vcpu {:p} for processor {}", target, apic_id);
    Ok(())
}

/// Clears the slot of `apic_id` if it still refers to `target`.
pub fn unregister(apic_id: u32, target: NonNull<ExitTarget>) {
    if let Some(slot) = slot(apic_id) {
        let _ = slot.target.compare_exchange(
            target.as_ptr(),
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// The controller registered for `apic_id`.
pub fn exit_target(apic_id: u32) -> Option<NonNull<ExitTarget>> {
    NonNull::new(slot(apic_id)?.target.load(Ordering::Acquire))
}

/// Records an NMI taken by processor `apic_id` for later reinjection.
pub fn queue_nmi(apic_id: u32) {
    if let Some(slot) = slot(apic_id) {
        slot.queued_nmis.fetch_add(1, Ordering::AcqRel);
    }
}

/// Removes one queued NMI, returning `false` if there was none.
pub fn take_nmi(apic_id: u32) -> bool {
    slot(apic_id).is_some_and(|slot| {
        slot.queued_nmis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    })
}

/// Number of NMIs waiting to be reinjected on processor `apic_id`.
pub fn pending_nmis(apic_id: u32) -> u32 {
    slot(apic_id).map_or(0, |slot| slot.queued_nmis.load(Ordering::Acquire))
}

/// An instruction that may fault in root operation, and where to continue
/// when it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultFixup {
    pub fault: u64,
    pub fixup: u64,
}

/// Handles an exception or NMI taken in root operation. Returns `false` if
/// it cannot be recovered from.
pub fn handle_host_interrupt(apic_id: u32, frame: &mut TrapFrame, fixups: &[FaultFixup]) -> bool {
    if frame.vector == NONMASKABLE_INTERRUPT_VECTOR as u64 {
        queue_nmi(apic_id);
        return true;
    }
    match fixups.iter().find(|f| f.fault == frame.rip) {
        Some(f) => {
            frame.rip = f.fixup;
            true
        }
        None => false,
    }
}
