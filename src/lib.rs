//! Per-processor Intel VMX controller.
//!
//! [`Vcpu`] takes the logical processor it runs on from normal operation into
//! VMX non-root operation: the code that called [`Vcpu::virtualize`] keeps
//! running, now as a guest, while the controller handles every VM exit on a
//! dedicated host stack with its own GDT, TSS and IDT.
//!
//! The crate is hardware-facing through two seams:
//! - [`VmxCpu`], typed access to CPUID, MSRs, control registers and the VMX
//!   instructions ([`X86Cpu`] on x86_64);
//! - [`Hal`], the embedding environment (address translation and page tables).
#![no_std]

#[macro_use]
extern crate log;

extern crate alloc;

pub mod config;
mod context;
mod cpu;
mod error;
pub(crate) mod msr;
pub mod phys_mem;
#[macro_use]
pub(crate) mod regs;
mod segmentation;
mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use context::{DescriptorTable, ProcessorContext};
pub use cpu::VmxCpu;
pub use error::{Result, VmFailKind, VmxError};
pub use msr::Msr;
pub use phys_mem::PhysMemWindow;
pub use regs::{GeneralRegisters, GeneralRegistersDiff, GuestContext};
pub use segmentation::{Segment, SegmentAccessRights};
pub use vmx::{
    CachedVcpuData, ControlCapability, CrField, ExitAction, HostEnvironment, IdtEntry, InvVpidKind,
    MsrAccess, MsrBitmap, TrapFrame, Vcpu, VcpuState, VmxBasic, VmxControl, VmxControlCapabilities,
    VmxExitReason, VmxInstructionError, has_hardware_support,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use cpu::X86Cpu;
    } else {
        compile_error!("vmx_vcpu only targets x86_64");
    }
}

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;

/// Page-table roots produced by the address-translation subsystem for one
/// processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableRoots {
    /// Root of the monitor's own page tables, loaded into `CR3` on every exit.
    pub host_cr3: HostPhysAddr,
    /// Root of the extended page tables translating guest-physical memory.
    /// `None` runs the guest without EPT.
    pub ept_root: Option<HostPhysAddr>,
}

/// The environment a [`Vcpu`] runs in.
///
/// Implemented once by the embedding kernel; every method is called on the
/// processor being virtualized.
pub trait Hal: Sized {
    /// Low-level CPU access used by the controller.
    type Cpu: VmxCpu;

    /// The direct physical-memory mapping shared by all processors.
    const PHYSICAL_MEMORY: PhysMemWindow = phys_mem::HOST_PHYSICAL_MEMORY;

    /// Translates a host virtual address into the physical address backing it.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Builds the monitor's and the guest's page tables for the processor with
    /// the given initial APIC id.
    fn prepare_page_tables(apic_id: u32) -> Result<PageTableRoots>;
}
