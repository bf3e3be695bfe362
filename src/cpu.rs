//! Typed access to the processor the controller runs on.

use raw_cpuid::CpuIdResult;
use x86::vmx::VmFail;

use crate::context::ProcessorContext;
use crate::msr::Msr;
use crate::vmx::InvVpidKind;

/// Low-level operations the controller needs from the logical processor.
///
/// Every method acts on the processor the caller currently runs on.
pub trait VmxCpu {
    /// Executes `CPUID` with the given leaf and subleaf.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;

    /// Reads an architectural MSR the controller knows about.
    fn read_msr(&self, msr: Msr) -> u64;

    /// Writes an architectural MSR.
    ///
    /// # Safety
    ///
    /// The write must not break the invariants of the running kernel.
    unsafe fn write_msr(&mut self, msr: Msr, value: u64);

    /// Reads an arbitrary MSR, returning `None` if `RDMSR` raised #GP.
    ///
    /// Only meaningful while handling a VM exit: the fault is recovered by the
    /// host IDT installed for the session.
    fn read_msr_checked(&mut self, msr: u32) -> Option<u64>;

    /// Writes an arbitrary MSR, returning `false` if `WRMSR` raised #GP.
    ///
    /// Same context restriction as [`VmxCpu::read_msr_checked`].
    fn write_msr_checked(&mut self, msr: u32, value: u64) -> bool;

    fn read_cr0(&self) -> u64;
    fn read_cr3(&self) -> u64;
    fn read_cr4(&self) -> u64;

    /// # Safety
    ///
    /// The new value must keep the running kernel functional.
    unsafe fn write_cr0(&mut self, value: u64);

    /// # Safety
    ///
    /// The new value must keep the running kernel functional.
    unsafe fn write_cr4(&mut self, value: u64);

    /// Reads the time-stamp counter.
    fn rdtsc(&self) -> u64;

    /// Executes `XSETBV`.
    ///
    /// # Safety
    ///
    /// `value` must be a valid setting of the extended control register.
    unsafe fn xsetbv(&mut self, xcr: u32, value: u64);

    /// Writes back and invalidates the caches.
    ///
    /// # Safety
    ///
    /// Must run at CPL 0.
    unsafe fn wbinvd(&mut self);

    /// # Safety
    ///
    /// `paddr` must be the physical address of a stamped, page-aligned VMXON
    /// region that stays alive for the whole VMX operation.
    unsafe fn vmxon(&mut self, paddr: u64) -> Result<(), VmFail>;

    /// # Safety
    ///
    /// Nothing may rely on VMX operation afterwards.
    unsafe fn vmxoff(&mut self) -> Result<(), VmFail>;

    /// # Safety
    ///
    /// `paddr` must be the physical address of a page-aligned VMCS region.
    unsafe fn vmclear(&mut self, paddr: u64) -> Result<(), VmFail>;

    /// # Safety
    ///
    /// `paddr` must be the physical address of a cleared VMCS region that
    /// outlives its use as the current VMCS.
    unsafe fn vmptrld(&mut self, paddr: u64) -> Result<(), VmFail>;

    /// Invalidates the guest-physical and combined mappings tagged with
    /// `vpid`, or with any VPID for [`InvVpidKind::AllContext`].
    ///
    /// # Safety
    ///
    /// Must run in VMX root operation.
    unsafe fn invvpid(&mut self, kind: InvVpidKind, vpid: u16) -> Result<(), VmFail>;

    /// Reads a field of the current VMCS.
    fn vmread(&self, field: u32) -> Result<u64, VmFail>;

    /// Writes a field of the current VMCS.
    ///
    /// # Safety
    ///
    /// Fields holding addresses must point to memory valid for the session.
    unsafe fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmFail>;

    /// Launches the current VMCS with the caller's own stack and return
    /// address as the guest `RSP`/`RIP`.
    ///
    /// Returns `true` in VMX non-root operation once the launch succeeded, or
    /// `false` in root operation if `VMLAUNCH` failed.
    ///
    /// # Safety
    ///
    /// Every VMCS field must be initialized and the exit landing point must
    /// be able to find the owning controller.
    unsafe fn vmlaunch(&mut self) -> bool;

    /// Snapshots the system state of the processor.
    fn capture_context(&self) -> ProcessorContext;

    /// Loads the system state in `ctx`, except `CS` and `SS` which need a far
    /// return.
    ///
    /// # Safety
    ///
    /// `ctx` must describe a state the kernel can run in.
    unsafe fn restore_context(&mut self, ctx: &ProcessorContext);
}

#[cfg(target_arch = "x86_64")]
mod x86_64_impl {
    use core::arch::asm;

    use raw_cpuid::CpuIdResult;
    use x86::bits64::{rflags, vmx};
    use x86::controlregs::{Xcr0, xcr0_write};
    use x86::debugregs::{Dr7, dr7, dr7_write};
    use x86::dtables::{self, DescriptorTablePointer};
    use x86::segmentation;
    use x86::vmx::VmFail;
    use x86_64::registers::control::{Cr0, Cr0Flags, Cr4};

    use super::VmxCpu;
    use crate::context::{DescriptorTable, ProcessorContext};
    use crate::msr::Msr;
    use crate::segmentation::{Segment, SegmentAccessRights};
    use crate::vmx::{InvVpidKind, entry};
    /// The processor the caller runs on.
    #[derive(Debug, Default)]
    pub struct X86Cpu;

    impl X86Cpu {
        /// Creates a handle to the current processor.
        pub const fn new() -> Self {
            Self
        }
    }

    fn sgdt() -> DescriptorTable {
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        unsafe { dtables::sgdt(&mut gdtp) };
        DescriptorTable {
            base: gdtp.base as u64,
            limit: gdtp.limit,
        }
    }

    fn sidt() -> DescriptorTable {
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe { dtables::sidt(&mut idtp) };
        DescriptorTable {
            base: idtp.base as u64,
            limit: idtp.limit,
        }
    }

    impl VmxCpu for X86Cpu {
        fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
            raw_cpuid::cpuid!(leaf, subleaf)
        }

        fn read_msr(&self, msr: Msr) -> u64 {
            msr.read()
        }

        unsafe fn write_msr(&mut self, msr: Msr, value: u64) {
            unsafe { msr.write(value) }
        }

        fn read_msr_checked(&mut self, msr: u32) -> Option<u64> {
            let mut value = 0;
            unsafe { entry::vmx_vcpu_rdmsr_checked(msr, &mut value) }.then_some(value)
        }

        fn write_msr_checked(&mut self, msr: u32, value: u64) -> bool {
            unsafe { entry::vmx_vcpu_wrmsr_checked(msr, value) }
        }

        fn read_cr0(&self) -> u64 {
            Cr0::read_raw()
        }

        fn read_cr3(&self) -> u64 {
            unsafe { x86::controlregs::cr3() }
        }

        fn read_cr4(&self) -> u64 {
            Cr4::read_raw()
        }

        unsafe fn write_cr0(&mut self, value: u64) {
            unsafe { Cr0::write_raw(value) }
        }

        unsafe fn write_cr4(&mut self, value: u64) {
            unsafe { Cr4::write_raw(value) }
        }

        fn rdtsc(&self) -> u64 {
            unsafe { x86::time::rdtsc() }
        }

        unsafe fn xsetbv(&mut self, xcr: u32, value: u64) {
            debug_assert_eq!(xcr, 0);
            // Components newer than `Xcr0` knows about must survive.
            unsafe { xcr0_write(Xcr0::from_bits_unchecked(value)) }
        }

        unsafe fn wbinvd(&mut self) {
            unsafe { asm!("wbinvd", options(nostack, preserves_flags)) }
        }

        unsafe fn vmxon(&mut self, paddr: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmxon(paddr) }
        }

        unsafe fn vmxoff(&mut self) -> Result<(), VmFail> {
            unsafe { vmx::vmxoff() }
        }

        unsafe fn vmclear(&mut self, paddr: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmclear(paddr) }
        }

        unsafe fn vmptrld(&mut self, paddr: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmptrld(paddr) }
        }

        unsafe fn invvpid(&mut self, kind: InvVpidKind, vpid: u16) -> Result<(), VmFail> {
            // VPID in bits 15:0, linear address in the second quadword.
            let descriptor: [u64; 2] = [vpid as u64, 0];
            let (fail_valid, fail_invalid): (u8, u8);
            unsafe {
                asm!(
                    "invvpid {kind}, [{desc}]",
                    "setz {zf}",
                    "setc {cf}",
                    kind = in(reg) kind as u64,
                    desc = in(reg) &descriptor,
                    zf = out(reg_byte) fail_valid,
                    cf = out(reg_byte) fail_invalid,
                    options(nostack),
                )
            };
            match (fail_valid, fail_invalid) {
                (0, 0) => Ok(()),
                (_, 0) => Err(VmFail::VmFailValid),
                _ => Err(VmFail::VmFailInvalid),
            }
        }

        fn vmread(&self, field: u32) -> Result<u64, VmFail> {
            unsafe { vmx::vmread(field) }
        }

        unsafe fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmFail> {
            unsafe { vmx::vmwrite(field, value) }
        }

        unsafe fn vmlaunch(&mut self) -> bool {
            unsafe { entry::vmx_vcpu_launch() != 0 }
        }

        fn capture_context(&self) -> ProcessorContext {
            let gdt = sgdt();
            let idt = sidt();
            let table =
                unsafe { core::slice::from_raw_parts(gdt.base as *const u64, gdt.entry_count()) };
            let segment = |selector| Segment::from_descriptor_table(selector, table);

            let mut fs = segment(segmentation::fs());
            let mut gs = segment(segmentation::gs());
            fs.base = Msr::IA32_FS_BASE.read();
            gs.base = Msr::IA32_GS_BASE.read();

            ProcessorContext {
                cr0: self.read_cr0(),
                cr3: self.read_cr3(),
                cr4: self.read_cr4(),
                dr7: unsafe { dr7() }.0 as u64,
                rflags: rflags::read().bits(),
                es: segment(segmentation::es()),
                cs: segment(segmentation::cs()),
                ss: segment(segmentation::ss()),
                ds: segment(segmentation::ds()),
                fs,
                gs,
                ldtr: segment(unsafe { dtables::ldtr() }),
                tr: segment(unsafe { x86::task::tr() }),
                gdt,
                idt,
                debugctl: Msr::IA32_DEBUGCTL.read(),
                sysenter_cs: Msr::IA32_SYSENTER_CS.read(),
                sysenter_esp: Msr::IA32_SYSENTER_ESP.read(),
                sysenter_eip: Msr::IA32_SYSENTER_EIP.read(),
                pat: Msr::IA32_PAT.read(),
                efer: Msr::IA32_EFER.read(),
            }
        }

        unsafe fn restore_context(&mut self, ctx: &ProcessorContext) {
            unsafe {
                Msr::IA32_EFER.write(ctx.efer);
                Msr::IA32_PAT.write(ctx.pat);
                Msr::IA32_DEBUGCTL.write(ctx.debugctl);
                Msr::IA32_SYSENTER_CS.write(ctx.sysenter_cs);
                Msr::IA32_SYSENTER_ESP.write(ctx.sysenter_esp);
                Msr::IA32_SYSENTER_EIP.write(ctx.sysenter_eip);

                Cr0::write_raw(ctx.cr0);
                Cr4::write_raw(ctx.cr4);
                // cr3 must be last in case cr4 enables PCID
                x86::controlregs::cr3_write(ctx.cr3);

                lgdt(&ctx.gdt);
                lidt(&ctx.idt);

                // LTR faults on a busy descriptor, and the kernel's GDT may be
                // mapped read-only.
                if ctx.tr.selector.index() != 0 {
                    let gdt = core::slice::from_raw_parts_mut(
                        ctx.gdt.base as *mut u64,
                        ctx.gdt.entry_count(),
                    );
                    let cr0 = Cr0::read_raw();
                    Cr0::write_raw(cr0 & !Cr0Flags::WRITE_PROTECT.bits());
                    SegmentAccessRights::set_descriptor_type(
                        &mut gdt[ctx.tr.selector.index() as usize],
                        SegmentAccessRights::TSS_AVAIL,
                    );
                    Cr0::write_raw(cr0);
                    x86::task::load_tr(ctx.tr.selector);
                }
                dtables::load_ldtr(ctx.ldtr.selector);

                segmentation::load_es(ctx.es.selector);
                segmentation::load_ds(ctx.ds.selector);
                segmentation::load_fs(ctx.fs.selector);
                segmentation::load_gs(ctx.gs.selector);
                Msr::IA32_FS_BASE.write(ctx.fs.base);
                Msr::IA32_GS_BASE.write(ctx.gs.base);

                dr7_write(Dr7(ctx.dr7 as usize));
            }
        }
    }

    unsafe fn lgdt(table: &DescriptorTable) {
        let ptr = DescriptorTablePointer {
            limit: table.limit,
            base: table.base as *const u64,
        };
        unsafe { dtables::lgdt(&ptr) }
    }

    unsafe fn lidt(table: &DescriptorTable) {
        let ptr = DescriptorTablePointer {
            limit: table.limit,
            base: table.base as *const u64,
        };
        unsafe { dtables::lidt(&ptr) }
    }
}

#[cfg(target_arch = "x86_64")]
pub use x86_64_impl::X86Cpu;
