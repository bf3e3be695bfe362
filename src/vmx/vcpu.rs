use alloc::alloc::{Layout, alloc_zeroed};
use alloc::boxed::Box;
use core::fmt::{Debug, Formatter, Result as FmtResult};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};

use bitflags::bitflags;
use spin::Once;
use x86_64::registers::control::Cr4Flags;

use super::capability::CachedVcpuData;
use super::entry;
use super::host::HostEnvironment;
use super::percpu::{self, ExitTarget};
use super::structs::{FeatureControlFlags, MsrAccess, MsrBitmap, VmxBasic, VmxRegion};
use super::vmcs::controls::*;
use super::vmcs::{
    self, CrField, VmcsControl16, VmcsControl32, VmcsControl64, VmcsControlNW, VmcsGuest16,
    VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW,
    VmxControl,
};
use crate::config::{GUEST_VPID, HOST_CS_SELECTOR, HOST_TR_SELECTOR, TSC_LATENCY_ROUNDS};
use crate::cpu::VmxCpu;
use crate::msr::Msr;
use crate::regs::GuestContext;
use crate::{Hal, HostVirtAddr, PageTableRoots, Result, VmxError};

const PAGE_SIZE_4K: usize = 0x1000;

/// Progress of a [`Vcpu`] through its activation sequence.
///
/// Each step may only run from the state right before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VcpuState {
    Uninitialized,
    CapabilitiesCached,
    ExtensionEnabled,
    ExtensionEntered,
    ControlStructureLoaded,
    StructuresPrepared,
    FieldsWritten,
    Launched,
    /// VMX operation was left again, after a failure or when the session ended.
    Terminated,
}

/// What the landing point does once an exit has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// `VMRESUME` into the guest.
    Resume,
    /// Return to the guest's code in root operation; the session is over.
    Terminate,
}

bitflags! {
    /// VMCS field groups written so far.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FieldGroups: u8 {
        const CONTROL = 1 << 0;
        const HOST = 1 << 1;
        const GUEST = 1 << 2;
    }
}

/// Page-aligned structures handed to the processor.
#[repr(C)]
pub(super) struct VcpuPages {
    pub(super) vmxon: VmxRegion,
    pub(super) vmcs: VmxRegion,
    pub(super) msr_bitmap: MsrBitmap,
    pub(super) host: HostEnvironment,
}

/// Controller of one logical processor.
///
/// Created on the processor it virtualizes and driven through
/// [`Vcpu::virtualize`] (or the individual steps). Once launched, the code
/// that called it continues as the guest and the controller only runs again
/// on VM exits. A launched controller must stay alive until the session is
/// terminated from inside the guest.
#[repr(C)]
pub struct Vcpu<H: Hal> {
    // Must stay the first field: the exit landing point reaches the
    // controller through a pointer to it.
    exit_target: ExitTarget,
    pub(super) cpu: H::Cpu,
    pub(super) state: VcpuState,
    written: FieldGroups,
    pub(super) pages: ManuallyDrop<Box<VcpuPages>>,
    cached: Once<CachedVcpuData>,
    roots: Option<PageTableRoots>,
    /// CR0 and CR4 as found before VMX was enabled.
    saved_cr0_cr4: Option<(u64, u64)>,
    vm_exit_tsc_latency: Once<u64>,
    pub(super) in_exit: bool,
    registered_apic_id: Option<u32>,
    _hal: PhantomData<H>,
}

impl<H: Hal> Vcpu<H> {
    /// Creates a controller for the current processor.
    pub fn new(cpu: H::Cpu) -> Result<Box<Self>> {
        let layout = Layout::new::<VcpuPages>();
        // Every field of VcpuPages is valid when zeroed.
        let pages = unsafe { alloc_zeroed(layout) } as *mut VcpuPages;
        if pages.is_null() {
            return Err(VmxError::NoMemory);
        }
        Ok(Box::new(Self {
            exit_target: ExitTarget::new(Self::on_exit),
            cpu,
            state: VcpuState::Uninitialized,
            written: FieldGroups::empty(),
            pages: ManuallyDrop::new(unsafe { Box::from_raw(pages) }),
            cached: Once::new(),
            roots: None,
            saved_cr0_cr4: None,
            vm_exit_tsc_latency: Once::new(),
            in_exit: false,
            registered_apic_id: None,
            _hal: PhantomData,
        }))
    }

    unsafe fn on_exit(target: NonNull<ExitTarget>, ctx: &mut GuestContext) -> ExitAction {
        let vcpu = unsafe { target.cast::<Self>().as_mut() };
        vcpu.handle_exit(ctx)
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// The capability cache, once populated.
    pub fn cdata(&self) -> Result<&CachedVcpuData> {
        self.cached.get().ok_or(VmxError::BadState {
            expected: VcpuState::CapabilitiesCached,
            actual: self.state,
        })
    }

    /// Exit latency in TSC ticks, once measured.
    pub fn vm_exit_tsc_latency(&self) -> Option<u64> {
        self.vm_exit_tsc_latency.get().copied()
    }

    pub fn cpu(&self) -> &H::Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut H::Cpu {
        &mut self.cpu
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap {
        &self.pages.msr_bitmap
    }

    pub fn host_environment(&self) -> &HostEnvironment {
        &self.pages.host
    }

    /// Page-table roots obtained while preparing the external structures.
    pub fn page_table_roots(&self) -> Option<PageTableRoots> {
        self.roots
    }

    fn expect_state(&self, expected: VcpuState) -> Result {
        if self.state != expected {
            return Err(VmxError::BadState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Fails unless a VMCS is current on this processor.
    fn expect_vmcs_loaded(&self) -> Result {
        if self.state < VcpuState::ControlStructureLoaded || self.state == VcpuState::Terminated {
            return Err(VmxError::BadState {
                expected: VcpuState::ControlStructureLoaded,
                actual: self.state,
            });
        }
        Ok(())
    }

    pub(super) fn apic_id(&self) -> Result<u32> {
        Ok(self.cdata()?.apic_id())
    }

    fn phys_addr_of<T>(item: &T) -> Result<u64> {
        let vaddr = HostVirtAddr::from(item as *const T as usize);
        let paddr = H::virt_to_phys(vaddr).as_usize();
        if paddr % PAGE_SIZE_4K != 0 {
            return Err(VmxError::PreconditionViolation("VMX structure is not 4K aligned"));
        }
        Ok(paddr as u64)
    }

    fn exit_target_ptr(&mut self) -> NonNull<ExitTarget> {
        NonNull::from(&mut *self).cast()
    }
}

// Activation sequence.
impl<H: Hal> Vcpu<H> {
    /// Runs the whole activation sequence and launches the guest.
    ///
    /// On success this returns twice in effect: the launch happens inside the
    /// call and the caller continues as the guest. On failure after VMXON, VMX
    /// operation is left again before returning.
    pub fn virtualize(&mut self) -> Result {
        self.cache_capabilities()?;
        self.enable_vmx_operation()?;
        self.enter_vmx_operation()?;

        let result = self
            .load_vmcs_pointer()
            .and_then(|_| self.prepare_external_structures())
            .and_then(|_| self.write_vmcs_fields())
            .and_then(|_| self.launch());
        if let Err(err) = result {
            if self.state != VcpuState::Terminated {
                self.leave_vmx_operation();
                self.state = VcpuState::Terminated;
            }
            error!("failed to virtualize processor: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Reads the capability cache of the current processor. It is never
    /// refreshed afterwards.
    pub fn cache_capabilities(&mut self) -> Result {
        self.expect_state(VcpuState::Uninitialized)?;
        if self.cached.is_completed() {
            return Err(VmxError::BadState {
                expected: VcpuState::Uninitialized,
                actual: VcpuState::CapabilitiesCached,
            });
        }
        let data = CachedVcpuData::read(&self.cpu)?;
        debug!("[VMX] capabilities of processor {}: {:#x?}", data.apic_id(), data);
        self.cached.call_once(|| data);
        self.state = VcpuState::CapabilitiesCached;
        Ok(())
    }

    /// Locks VMX on in `IA32_FEATURE_CONTROL` if firmware left it unlocked,
    /// then sets CR4.VMXE and the fixed CR0/CR4 bits.
    pub fn enable_vmx_operation(&mut self) -> Result {
        self.expect_state(VcpuState::CapabilitiesCached)?;
        let cached = *self.cdata()?;

        // SDM Vol. 3C, Section 24.11.5
        let basic = cached.vmx_basic;
        if basic.region_size as usize != PAGE_SIZE_4K {
            return Err(VmxError::CapabilityAbsent("VMX region size is not 4K"));
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::CapabilityAbsent("VMX memory type is not write-back"));
        }
        if basic.is_32bit_address {
            return Err(VmxError::CapabilityAbsent("VMX structures limited to 32-bit addresses"));
        }

        // SDM Vol. 3C, Section 23.7
        let ctrl = FeatureControlFlags::from_bits_truncate(cached.feature_control);
        if !ctrl.contains(FeatureControlFlags::LOCKED) {
            let locked = cached.feature_control
                | (FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX)
                    .bits();
            unsafe { self.cpu.write_msr(Msr::IA32_FEATURE_CONTROL, locked) };
            debug!("[VMX] locked IA32_FEATURE_CONTROL: {:#x}", locked);
        } else if !ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX) {
            return Err(VmxError::PreconditionViolation("VMX disabled by BIOS"));
        }

        let cr4 = cached.adjust_cr4(self.cpu.read_cr4() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
        if cr4 & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() == 0 {
            return Err(VmxError::CapabilityAbsent("CR4.VMXE is fixed to 0"));
        }
        let original_cr0 = self.cpu.read_cr0();
        self.saved_cr0_cr4 = Some((original_cr0, self.cpu.read_cr4()));
        let cr0 = cached.adjust_cr0(original_cr0);
        unsafe {
            self.cpu.write_cr4(cr4);
            self.cpu.write_cr0(cr0);
        }

        self.state = VcpuState::ExtensionEnabled;
        Ok(())
    }

    /// Executes VMXON on the stamped VMXON region.
    pub fn enter_vmx_operation(&mut self) -> Result {
        self.expect_state(VcpuState::ExtensionEnabled)?;
        let revision_id = self.cdata()?.vmx_basic.revision_id;

        self.pages.vmxon.stamp(revision_id);
        let paddr = Self::phys_addr_of(&self.pages.vmxon)?;
        if let Err(fail) = unsafe { self.cpu.vmxon(paddr) } {
            error!("[VMX] VMXON {:#x} failed: {:?}", paddr, fail);
            self.disable_vmx_extension();
            return Err(VmxError::ActivationRejected(fail.into()));
        }

        info!("[VMX] processor {} entered VMX operation", self.apic_id()?);
        self.state = VcpuState::ExtensionEntered;
        Ok(())
    }

    /// Clears and loads the VMCS, making it current on this processor.
    pub fn load_vmcs_pointer(&mut self) -> Result {
        self.expect_state(VcpuState::ExtensionEntered)?;
        let revision_id = self.cdata()?.vmx_basic.revision_id;

        self.pages.vmcs.stamp(revision_id);
        let paddr = Self::phys_addr_of(&self.pages.vmcs)?;
        unsafe {
            self.cpu
                .vmclear(paddr)
                .map_err(|fail| VmxError::StructureLoadRejected(fail.into()))?;
            self.cpu
                .vmptrld(paddr)
                .map_err(|fail| VmxError::StructureLoadRejected(fail.into()))?;
        }

        debug!("[VMX] VMCS {:#x} loaded", paddr);
        self.state = VcpuState::ControlStructureLoaded;
        Ok(())
    }

    /// Builds the host descriptor tables and asks the environment for the
    /// page tables of this processor.
    pub fn prepare_external_structures(&mut self) -> Result {
        self.expect_state(VcpuState::ControlStructureLoaded)?;
        let apic_id = self.apic_id()?;

        self.pages.host.build(&entry::host_exception_stubs());
        let roots = H::prepare_page_tables(apic_id)?;
        debug!("[VMX] page tables of processor {}: {:x?}", apic_id, roots);
        self.roots = Some(roots);

        self.state = VcpuState::StructuresPrepared;
        Ok(())
    }

    /// Writes the control, host and guest field groups.
    pub fn write_vmcs_fields(&mut self) -> Result {
        self.write_vmcs_control_fields()?;
        self.write_vmcs_host_fields()?;
        self.write_vmcs_guest_fields()
    }

    fn field_group_written(&mut self, group: FieldGroups) {
        self.written |= group;
        if self.written.is_all() {
            self.state = VcpuState::FieldsWritten;
        }
    }

    fn expect_field_group(&self, group: FieldGroups) -> Result {
        self.expect_state(VcpuState::StructuresPrepared)?;
        if self.written.contains(group) {
            return Err(VmxError::InvalidInput("VMCS field group already written"));
        }
        Ok(())
    }

    /// Writes the VM-execution, VM-exit and VM-entry control fields.
    pub fn write_vmcs_control_fields(&mut self) -> Result {
        self.expect_field_group(FieldGroups::CONTROL)?;
        let cached = *self.cdata()?;
        let roots = self.roots.ok_or(VmxError::InvalidInput("page tables not prepared"))?;

        let mut secondary = SecondaryControls::empty();
        if roots.ept_root.is_some() {
            if !cached.supports_ept() {
                return Err(VmxError::CapabilityAbsent("EPT with 4-level write-back tables"));
            }
            secondary |= SecondaryControls::ENABLE_EPT | SecondaryControls::ENABLE_VPID;
        }
        // Instructions the kernel already uses would #UD in the guest otherwise.
        if let Some(cap) = cached.controls.secondary {
            for (supported, control) in [
                (cached.has_rdtscp, SecondaryControls::ENABLE_RDTSCP),
                (cached.has_invpcid, SecondaryControls::ENABLE_INVPCID),
                (cached.has_xsaves, SecondaryControls::ENABLE_XSAVES_XRSTORS),
            ] {
                if supported && cap.allows(control.bits()) {
                    secondary |= control;
                }
            }
        }

        let cpu = &mut self.cpu;
        vmcs::set_control(
            cpu,
            &cached,
            VmxControl::PinBased,
            (PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS).bits(),
            0,
        )?;

        let mut primary = PrimaryControls::USE_MSR_BITMAPS;
        if cached.controls.secondary.is_some() {
            primary |= PrimaryControls::SECONDARY_CONTROLS;
        } else if !secondary.is_empty() {
            return Err(VmxError::CapabilityAbsent("secondary processor-based controls"));
        }
        vmcs::set_control(cpu, &cached, VmxControl::PrimaryProcessorBased, primary.bits(), 0)?;
        if cached.controls.secondary.is_some() {
            vmcs::set_control(
                cpu,
                &cached,
                VmxControl::SecondaryProcessorBased,
                secondary.bits(),
                0,
            )?;
        }

        vmcs::set_control(
            cpu,
            &cached,
            VmxControl::VmExit,
            (ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::SAVE_DEBUG_CONTROLS
                | ExitControls::SAVE_IA32_PAT
                | ExitControls::LOAD_IA32_PAT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;
        vmcs::set_control(
            cpu,
            &cached,
            VmxControl::VmEntry,
            (EntryControls::IA32E_MODE_GUEST
                | EntryControls::LOAD_DEBUG_CONTROLS
                | EntryControls::LOAD_IA32_PAT
                | EntryControls::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        use VmcsControl32::*;
        for field in [
            EXCEPTION_BITMAP,
            PAGE_FAULT_ERR_CODE_MASK,
            PAGE_FAULT_ERR_CODE_MATCH,
            CR3_TARGET_COUNT,
            VMEXIT_MSR_STORE_COUNT,
            VMEXIT_MSR_LOAD_COUNT,
            VMENTRY_MSR_LOAD_COUNT,
            VMENTRY_INTERRUPTION_INFO_FIELD,
        ] {
            field.write(cpu, 0)?;
        }

        // Bits the host owns read from the shadows: everything fixed by VMX
        // operation, plus VMXE.
        let vmxe = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        let cr0 = cpu.read_cr0();
        let cr4 = cpu.read_cr4();
        VmcsControlNW::CR0_GUEST_HOST_MASK.write(cpu, cached.cr0_fixed0 | !cached.cr0_fixed1)?;
        VmcsControlNW::CR0_READ_SHADOW.write(cpu, cr0)?;
        VmcsControlNW::CR4_GUEST_HOST_MASK
            .write(cpu, cached.cr4_fixed0 | !cached.cr4_fixed1 | vmxe)?;
        VmcsControlNW::CR4_READ_SHADOW.write(cpu, cr4 & !vmxe)?;

        VmcsControl64::TSC_OFFSET.write(cpu, 0)?;
        if secondary.contains(SecondaryControls::ENABLE_VPID) {
            VmcsControl16::VPID.write(cpu, GUEST_VPID)?;
        }
        if let Some(ept_root) = roots.ept_root {
            vmcs::set_ept_pointer(cpu, ept_root)?;
        }

        self.pages.msr_bitmap.intercept_all();
        let msr_bitmap = Self::phys_addr_of(&self.pages.msr_bitmap)?;
        VmcsControl64::MSR_BITMAPS_ADDR.write(&mut self.cpu, msr_bitmap)?;

        self.field_group_written(FieldGroups::CONTROL);
        Ok(())
    }

    /// Writes the host-state fields: the dedicated host environment, the
    /// landing point, and control registers and MSRs as they are now.
    pub fn write_vmcs_host_fields(&mut self) -> Result {
        self.expect_field_group(FieldGroups::HOST)?;
        let cached = *self.cdata()?;
        let roots = self.roots.ok_or(VmxError::InvalidInput("page tables not prepared"))?;
        let ctx = self.cpu.capture_context();
        let host = &self.pages.host;
        let cpu = &mut self.cpu;

        VmcsHost16::ES_SELECTOR.write(cpu, 0)?;
        VmcsHost16::CS_SELECTOR.write(cpu, HOST_CS_SELECTOR.bits())?;
        VmcsHost16::SS_SELECTOR.write(cpu, 0)?;
        VmcsHost16::DS_SELECTOR.write(cpu, 0)?;
        VmcsHost16::FS_SELECTOR.write(cpu, 0)?;
        VmcsHost16::GS_SELECTOR.write(cpu, 0)?;
        VmcsHost16::TR_SELECTOR.write(cpu, HOST_TR_SELECTOR.bits())?;

        vmcs::write_cr(cpu, &cached, CrField::HostCr0, ctx.cr0)?;
        vmcs::write_cr(cpu, &cached, CrField::HostCr4, ctx.cr4)?;
        VmcsHostNW::CR3.write(cpu, roots.host_cr3.as_usize() as u64)?;

        VmcsHostNW::FS_BASE.write(cpu, ctx.fs.base)?;
        VmcsHostNW::GS_BASE.write(cpu, ctx.gs.base)?;
        VmcsHostNW::TR_BASE.write(cpu, host.tss_base())?;
        VmcsHostNW::GDTR_BASE.write(cpu, host.gdt_base())?;
        VmcsHostNW::IDTR_BASE.write(cpu, host.idt_base())?;

        VmcsHost64::IA32_PAT.write(cpu, ctx.pat)?;
        VmcsHost64::IA32_EFER.write(cpu, ctx.efer)?;
        VmcsHost32::IA32_SYSENTER_CS.write(cpu, ctx.sysenter_cs as u32)?;
        VmcsHostNW::IA32_SYSENTER_ESP.write(cpu, ctx.sysenter_esp)?;
        VmcsHostNW::IA32_SYSENTER_EIP.write(cpu, ctx.sysenter_eip)?;

        VmcsHostNW::RSP.write(cpu, host.stack_top())?;
        VmcsHostNW::RIP.write(cpu, entry::exit_landing_address())?;

        self.field_group_written(FieldGroups::HOST);
        Ok(())
    }

    /// Writes the guest-state fields from the current processor state, so the
    /// guest continues exactly where the launch was issued.
    pub fn write_vmcs_guest_fields(&mut self) -> Result {
        self.expect_field_group(FieldGroups::GUEST)?;
        let cached = *self.cdata()?;
        let ctx = self.cpu.capture_context();
        let cpu = &mut self.cpu;

        macro_rules! set_guest_segment {
            ($seg: expr, $reg: ident) => {{
                paste::paste! {
                    VmcsGuest16::[<$reg _SELECTOR>].write(cpu, $seg.selector.bits())?;
                    VmcsGuestNW::[<$reg _BASE>].write(cpu, $seg.base)?;
                    VmcsGuest32::[<$reg _LIMIT>].write(cpu, $seg.limit)?;
                    VmcsGuest32::[<$reg _ACCESS_RIGHTS>].write(cpu, $seg.access_rights.bits())?;
                }
            }};
        }

        set_guest_segment!(ctx.es, ES);
        set_guest_segment!(ctx.cs, CS);
        set_guest_segment!(ctx.ss, SS);
        set_guest_segment!(ctx.ds, DS);
        set_guest_segment!(ctx.fs, FS);
        set_guest_segment!(ctx.gs, GS);
        set_guest_segment!(ctx.ldtr, LDTR);
        set_guest_segment!(ctx.tr, TR);

        VmcsGuestNW::GDTR_BASE.write(cpu, ctx.gdt.base)?;
        VmcsGuest32::GDTR_LIMIT.write(cpu, ctx.gdt.limit as u32)?;
        VmcsGuestNW::IDTR_BASE.write(cpu, ctx.idt.base)?;
        VmcsGuest32::IDTR_LIMIT.write(cpu, ctx.idt.limit as u32)?;

        vmcs::write_cr(cpu, &cached, CrField::GuestCr0, ctx.cr0)?;
        vmcs::write_cr(cpu, &cached, CrField::GuestCr4, ctx.cr4)?;
        VmcsGuestNW::CR3.write(cpu, ctx.cr3)?;
        VmcsGuestNW::DR7.write(cpu, ctx.dr7)?;
        VmcsGuestNW::RFLAGS.write(cpu, ctx.rflags)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(cpu, 0)?;

        VmcsGuest64::IA32_DEBUGCTL.write(cpu, ctx.debugctl)?;
        VmcsGuest64::IA32_PAT.write(cpu, ctx.pat)?;
        VmcsGuest64::IA32_EFER.write(cpu, ctx.efer)?;
        VmcsGuest32::IA32_SYSENTER_CS.write(cpu, ctx.sysenter_cs as u32)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write(cpu, ctx.sysenter_esp)?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write(cpu, ctx.sysenter_eip)?;

        VmcsGuest64::LINK_PTR.write(cpu, u64::MAX)?;
        VmcsGuest32::INTERRUPTIBILITY_STATE.write(cpu, 0)?;
        VmcsGuest32::ACTIVITY_STATE.write(cpu, 0)?;

        self.field_group_written(FieldGroups::GUEST);
        Ok(())
    }

    /// Registers the controller for exits and executes VMLAUNCH.
    ///
    /// Returns in the guest on success. On failure the VM-instruction error is
    /// surfaced as [`VmxError::ResumeFailure`] and VMX operation is left.
    pub fn launch(&mut self) -> Result {
        self.expect_state(VcpuState::FieldsWritten)?;
        let apic_id = self.apic_id()?;

        percpu::register(apic_id, self.exit_target_ptr())?;
        self.registered_apic_id = Some(apic_id);
        self.state = VcpuState::Launched;

        if unsafe { self.cpu.vmlaunch() } {
            info!("[VMX] processor {} is now running as a guest", apic_id);
            if let Ok(latency) = self.measure_vm_exit_tsc_latency() {
                debug!("[VMX] exit latency: {} TSC ticks", latency);
            }
            return Ok(());
        }

        let error = vmcs::instruction_error(&self.cpu);
        error!("[VMX] VMLAUNCH failed on processor {}: {:?}", apic_id, error);
        self.unregister();
        self.leave_vmx_operation();
        self.state = VcpuState::Terminated;
        Err(VmxError::ResumeFailure(error))
    }

    /// Measures the cost of an exit round trip as the lowest TSC delta over a
    /// few trapping `CPUID`s. The first measurement is kept for the session.
    pub fn measure_vm_exit_tsc_latency(&mut self) -> Result<u64> {
        self.expect_state(VcpuState::Launched)?;
        if let Some(&latency) = self.vm_exit_tsc_latency.get() {
            return Ok(latency);
        }

        let mut lowest = u64::MAX;
        for _ in 0..TSC_LATENCY_ROUNDS {
            let start = self.cpu.rdtsc();
            self.cpu.cpuid(0, 0);
            let end = self.cpu.rdtsc();
            lowest = lowest.min(end.saturating_sub(start));
        }
        Ok(*self.vm_exit_tsc_latency.call_once(|| lowest))
    }

    /// VMXOFF and clear CR4.VMXE. Failures are only logged: there is nothing
    /// left to fall back to.
    pub(super) fn leave_vmx_operation(&mut self) {
        if let Err(fail) = unsafe { self.cpu.vmxoff() } {
            warn!("[VMX] VMXOFF failed: {:?}", fail);
        }
        let cr4 = self.cpu.read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        unsafe { self.cpu.write_cr4(cr4) };
    }

    /// Undoes [`Self::enable_vmx_operation`] while VMX operation was not
    /// entered.
    fn disable_vmx_extension(&mut self) {
        if let Some((cr0, cr4)) = self.saved_cr0_cr4.take() {
            unsafe {
                self.cpu.write_cr0(cr0);
                self.cpu.write_cr4(cr4);
            }
        }
        self.state = VcpuState::CapabilitiesCached;
    }

    /// Guest translations are tagged with [`GUEST_VPID`] only when EPT is on.
    pub(super) fn vpid_enabled(&self) -> bool {
        self.roots.is_some_and(|roots| roots.ept_root.is_some())
    }

    pub(super) fn unregister(&mut self) {
        if let Some(apic_id) = self.registered_apic_id.take() {
            let target = self.exit_target_ptr();
            percpu::unregister(apic_id, target);
        }
    }
}

// Runtime interface.
impl<H: Hal> Vcpu<H> {
    /// Sets whether `access` to `msr` causes a VM exit.
    pub fn toggle_exiting_for_msr(&mut self, msr: u32, access: MsrAccess, enabled: bool) -> Result {
        self.pages.msr_bitmap.set_intercept(msr, access, enabled)
    }

    /// Writes a whole control field after checking it against the capability
    /// cache.
    pub fn write_control_field(&mut self, control: VmxControl, value: u32) -> Result {
        self.expect_vmcs_loaded()?;
        let cached = *self.cdata()?;
        vmcs::write_control(&mut self.cpu, &cached, control, value)
    }

    /// Writes a guest or host CR0/CR4 field after checking its fixed bits.
    pub fn write_cr_field(&mut self, field: CrField, value: u64) -> Result {
        self.expect_vmcs_loaded()?;
        let cached = *self.cdata()?;
        vmcs::write_cr(&mut self.cpu, &cached, field, value)
    }

    /// Copies physical memory at `paddr` through the direct-mapping window.
    pub fn read_guest_physical(&self, paddr: u64, buf: &mut [u8]) -> Result {
        let vaddr = H::PHYSICAL_MEMORY
            .translate(paddr, buf.len())
            .ok_or(VmxError::InvalidInput("outside the physical memory window"))?;
        unsafe { ptr::copy_nonoverlapping(vaddr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }
}

impl<H: Hal> Drop for Vcpu<H> {
    fn drop(&mut self) {
        self.unregister();
        match self.state {
            VcpuState::Launched => {
                // The processor still references the structures.
                error!("[VMX] dropping a launched vcpu, leaking its VMX structures");
                return;
            }
            VcpuState::ExtensionEnabled => self.disable_vmx_extension(),
            state if state >= VcpuState::ExtensionEntered && state < VcpuState::Launched => {
                self.leave_vmx_operation()
            }
            _ => {}
        }
        unsafe { ManuallyDrop::drop(&mut self.pages) };
    }
}

impl<H: Hal> Debug for Vcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("Vcpu")
            .field("state", &self.state)
            .field("apic_id", &self.cached.get().map(|c| c.apic_id()))
            .field("roots", &self.roots)
            .field("vm_exit_tsc_latency", &self.vm_exit_tsc_latency())
            .finish()
    }
}
