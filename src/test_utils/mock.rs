use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::Cell;

use raw_cpuid::CpuIdResult;
use x86::segmentation::SegmentSelector;
use x86::vmx::VmFail;

use crate::context::{DescriptorTable, ProcessorContext};
use crate::cpu::VmxCpu;
use crate::msr::Msr;
use crate::phys_mem::PhysMemWindow;
use crate::segmentation::{Segment, SegmentAccessRights};
use crate::vmx::InvVpidKind;
use crate::{Hal, HostPhysAddr, HostVirtAddr, PageTableRoots, Result};

const CR4_VMXE: u64 = 1 << 13;
const VM_INSTRUCTION_ERROR: u32 = 0x4400;

/// What a [`MockCpu`] reports and how its VMX instructions behave.
#[derive(Debug, Clone)]
pub struct MockCpuConfig {
    pub cpuid_01: CpuIdResult,
    pub max_extended_leaf: u32,
    /// MSRs that exist; guarded accesses to anything else fault.
    pub msrs: BTreeMap<u32, u64>,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// Whether VMX operation was already entered by someone else.
    pub vmx_already_on: bool,
    /// VM-instruction error reported by VMLAUNCH, `None` to launch.
    pub launch_error: Option<u32>,
    /// TSC ticks between two reads.
    pub tsc_step: u64,
}

impl MockCpuConfig {
    pub const REVISION_ID: u32 = 0x12;

    /// A VMX-capable processor whose initial APIC id is `apic_id`.
    pub fn with_apic_id(apic_id: u32) -> Self {
        let msrs = [
            (Msr::IA32_FEATURE_CONTROL, 0x5),
            (Msr::IA32_SYSENTER_CS, 0x10),
            (Msr::IA32_SYSENTER_ESP, 0xffff_8000_0001_0000),
            (Msr::IA32_SYSENTER_EIP, 0xffff_8000_0002_0000),
            (Msr::IA32_DEBUGCTL, 0),
            (Msr::IA32_PAT, 0x0007_0406_0007_0406),
            (
                Msr::IA32_VMX_BASIC,
                Self::REVISION_ID as u64 | 0x1000 << 32 | 6 << 50 | 1 << 54 | 1 << 55,
            ),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_EXIT_CTLS, 0x003f_efff_0003_6dff),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0000_f3ff_0000_11ff),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_67ff),
            (Msr::IA32_VMX_PROCBASED_CTLS2, 0x0010_10ff_0000_0000),
            (
                Msr::IA32_VMX_EPT_VPID_CAP,
                1 << 6 | 1 << 14 | 1 << 21 | 1 << 32 | 1 << 41 | 1 << 42,
            ),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_00ff_0000_0016),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x003f_efff_0003_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0000_f3ff_0000_11fb),
            (Msr::IA32_EFER, 0xd01),
            (Msr::IA32_FS_BASE, 0),
            (Msr::IA32_GS_BASE, 0xffff_8000_0010_0000),
            (Msr::IA32_KERNEL_GSBASE, 0),
        ]
        .into_iter()
        .map(|(msr, value)| (msr as u32, value))
        .collect();

        Self {
            cpuid_01: CpuIdResult {
                eax: 0x0009_06ea,
                ebx: apic_id << 24 | 0x0010_0800,
                // SSE3, VMX, XSAVE, OSXSAVE
                ecx: 1 << 0 | 1 << 5 | 1 << 26 | 1 << 27,
                edx: 0xbfeb_fbff,
            },
            max_extended_leaf: 0x8000_0008,
            msrs,
            cr0: 0x8005_0033,
            cr3: 0x0010_0000,
            cr4: 0x0034_06a0,
            vmx_already_on: false,
            launch_error: None,
            tsc_step: 120,
        }
    }

    pub fn msr(&self, msr: Msr) -> u64 {
        self.msrs.get(&(msr as u32)).copied().unwrap_or(0)
    }

    pub fn set_msr(&mut self, msr: Msr, value: u64) {
        self.msrs.insert(msr as u32, value);
    }
}

/// A simulated logical processor.
///
/// VMX structures are "physical" at their virtual address, matching
/// [`MockHal`]'s identity translation.
pub struct MockCpu {
    config: MockCpuConfig,
    msrs: BTreeMap<u32, u64>,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    xcr0: u64,
    vmxon_region: Option<u64>,
    current_vmcs: Option<u64>,
    vmcs: BTreeMap<u32, u64>,
    msr_reads: Cell<usize>,
    cpuid_calls: Cell<usize>,
    invvpids: Vec<(InvVpidKind, u16)>,
    tsc: Cell<u64>,
    wbinvd_count: usize,
    restored: Option<ProcessorContext>,
}

impl MockCpu {
    pub fn new(config: MockCpuConfig) -> Self {
        Self {
            msrs: config.msrs.clone(),
            cr0: config.cr0,
            cr3: config.cr3,
            cr4: config.cr4,
            xcr0: 0x3,
            vmxon_region: config.vmx_already_on.then_some(0),
            current_vmcs: None,
            vmcs: BTreeMap::new(),
            msr_reads: Cell::new(0),
            cpuid_calls: Cell::new(0),
            invvpids: Vec::new(),
            tsc: Cell::new(1_000_000),
            wbinvd_count: 0,
            restored: None,
            config,
        }
    }

    /// Number of `read_msr` calls so far.
    pub fn msr_reads(&self) -> usize {
        self.msr_reads.get()
    }

    /// Number of `cpuid` calls so far.
    pub fn cpuid_calls(&self) -> usize {
        self.cpuid_calls.get()
    }

    /// Every INVVPID executed, oldest first.
    pub fn invvpids(&self) -> &[(InvVpidKind, u16)] {
        &self.invvpids
    }

    pub fn msr(&self, msr: u32) -> Option<u64> {
        self.msrs.get(&msr).copied()
    }

    pub fn cr0(&self) -> u64 {
        self.cr0
    }

    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    pub fn xcr0(&self) -> u64 {
        self.xcr0
    }

    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon_region.is_some()
    }

    pub fn current_vmcs(&self) -> Option<u64> {
        self.current_vmcs
    }

    /// A VMCS field as last written, bypassing the current-VMCS check.
    pub fn vmcs_field(&self, field: u32) -> Option<u64> {
        self.vmcs.get(&field).copied()
    }

    /// Sets a VMCS field the way the processor does on a VM exit.
    pub fn set_vmcs_field(&mut self, field: u32, value: u64) {
        self.vmcs.insert(field, value);
    }

    pub fn set_tsc_step(&mut self, step: u64) {
        self.config.tsc_step = step;
    }

    pub fn wbinvd_count(&self) -> usize {
        self.wbinvd_count
    }

    /// The context last loaded by `restore_context`.
    pub fn restored_context(&self) -> Option<&ProcessorContext> {
        self.restored.as_ref()
    }

    fn region_revision(paddr: u64) -> u32 {
        unsafe { *(paddr as *const u32) }
    }
}

impl VmxCpu for MockCpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        self.cpuid_calls.set(self.cpuid_calls.get() + 1);
        let zero = CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        };
        match (leaf, subleaf) {
            (0, _) => CpuIdResult {
                eax: 0x16,
                ebx: u32::from_le_bytes(*b"Genu"),
                ecx: u32::from_le_bytes(*b"ntel"),
                edx: u32::from_le_bytes(*b"ineI"),
            },
            (1, _) => self.config.cpuid_01,
            (0xd, 0) => CpuIdResult {
                eax: 0x7,
                ebx: 0x340,
                ecx: 0x340,
                edx: 0,
            },
            (0x8000_0000, _) => CpuIdResult {
                eax: self.config.max_extended_leaf,
                ..zero
            },
            (0x8000_0001, _) if self.config.max_extended_leaf >= 0x8000_0001 => CpuIdResult {
                ecx: 0x121,
                // RDTSCP, Intel 64
                edx: 1 << 27 | 1 << 29,
                ..zero
            },
            (0x8000_0008, _) if self.config.max_extended_leaf >= 0x8000_0008 => CpuIdResult {
                eax: 0x3027,
                ..zero
            },
            _ => zero,
        }
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        self.msr_reads.set(self.msr_reads.get() + 1);
        self.msrs.get(&(msr as u32)).copied().unwrap_or(0)
    }

    unsafe fn write_msr(&mut self, msr: Msr, value: u64) {
        self.msrs.insert(msr as u32, value);
    }

    fn read_msr_checked(&mut self, msr: u32) -> Option<u64> {
        self.msrs.get(&msr).copied()
    }

    fn write_msr_checked(&mut self, msr: u32, value: u64) -> bool {
        match self.msrs.get_mut(&msr) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn read_cr0(&self) -> u64 {
        self.cr0
    }

    fn read_cr3(&self) -> u64 {
        self.cr3
    }

    fn read_cr4(&self) -> u64 {
        self.cr4
    }

    unsafe fn write_cr0(&mut self, value: u64) {
        self.cr0 = value;
    }

    unsafe fn write_cr4(&mut self, value: u64) {
        self.cr4 = value;
    }

    fn rdtsc(&self) -> u64 {
        let now = self.tsc.get();
        self.tsc.set(now + self.config.tsc_step);
        now
    }

    unsafe fn xsetbv(&mut self, xcr: u32, value: u64) {
        assert_eq!(xcr, 0);
        self.xcr0 = value;
    }

    unsafe fn wbinvd(&mut self) {
        self.wbinvd_count += 1;
    }

    unsafe fn vmxon(&mut self, paddr: u64) -> core::result::Result<(), VmFail> {
        let feature_control = self.msrs.get(&(Msr::IA32_FEATURE_CONTROL as u32)).copied();
        if self.vmxon_region.is_some()
            || self.cr4 & CR4_VMXE == 0
            || feature_control.unwrap_or(0) & 0x5 != 0x5
            || Self::region_revision(paddr) != MockCpuConfig::REVISION_ID
        {
            return Err(VmFail::VmFailInvalid);
        }
        self.vmxon_region = Some(paddr);
        Ok(())
    }

    unsafe fn vmxoff(&mut self) -> core::result::Result<(), VmFail> {
        if self.vmxon_region.take().is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.current_vmcs = None;
        Ok(())
    }

    unsafe fn invvpid(&mut self, kind: InvVpidKind, vpid: u16) -> core::result::Result<(), VmFail> {
        if self.vmxon_region.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.invvpids.push((kind, vpid));
        Ok(())
    }

    unsafe fn vmclear(&mut self, paddr: u64) -> core::result::Result<(), VmFail> {
        if self.vmxon_region.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        if self.current_vmcs == Some(paddr) {
            self.current_vmcs = None;
        }
        Ok(())
    }

    unsafe fn vmptrld(&mut self, paddr: u64) -> core::result::Result<(), VmFail> {
        if self.vmxon_region.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        if Self::region_revision(paddr) != MockCpuConfig::REVISION_ID {
            // VMPTRLD with incorrect VMCS revision identifier
            self.vmcs.insert(VM_INSTRUCTION_ERROR, 11);
            return Err(VmFail::VmFailValid);
        }
        self.current_vmcs = Some(paddr);
        Ok(())
    }

    fn vmread(&self, field: u32) -> core::result::Result<u64, VmFail> {
        if self.current_vmcs.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        Ok(self.vmcs.get(&field).copied().unwrap_or(0))
    }

    unsafe fn vmwrite(&mut self, field: u32, value: u64) -> core::result::Result<(), VmFail> {
        if self.current_vmcs.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.vmcs.insert(field, value);
        Ok(())
    }

    unsafe fn vmlaunch(&mut self) -> bool {
        if self.current_vmcs.is_none() {
            return false;
        }
        match self.config.launch_error {
            Some(error) => {
                self.vmcs.insert(VM_INSTRUCTION_ERROR, error as u64);
                false
            }
            None => true,
        }
    }

    fn capture_context(&self) -> ProcessorContext {
        let code = Segment {
            selector: SegmentSelector::from_raw(0x10),
            base: 0,
            limit: 0xffff_ffff,
            access_rights: SegmentAccessRights::from_bits_truncate(0xa09b),
        };
        let data = Segment {
            selector: SegmentSelector::from_raw(0x18),
            access_rights: SegmentAccessRights::from_bits_truncate(0xc093),
            ..code
        };
        let msr = |msr: Msr| self.msrs.get(&(msr as u32)).copied().unwrap_or(0);
        ProcessorContext {
            cr0: self.cr0,
            cr3: self.cr3,
            cr4: self.cr4,
            es: data,
            cs: code,
            ss: data,
            ds: data,
            gs: Segment {
                selector: SegmentSelector::from_raw(0),
                base: msr(Msr::IA32_GS_BASE),
                ..Segment::invalid()
            },
            tr: Segment {
                selector: SegmentSelector::from_raw(0x40),
                base: 0xffff_8000_0000_3000,
                limit: 0x67,
                access_rights: SegmentAccessRights::TSS_BUSY | SegmentAccessRights::PRESENT,
            },
            gdt: DescriptorTable {
                base: 0xffff_8000_0000_2000,
                limit: 0x7f,
            },
            idt: DescriptorTable {
                base: 0xffff_8000_0000_1000,
                limit: 0xfff,
            },
            debugctl: msr(Msr::IA32_DEBUGCTL),
            sysenter_cs: msr(Msr::IA32_SYSENTER_CS),
            sysenter_esp: msr(Msr::IA32_SYSENTER_ESP),
            sysenter_eip: msr(Msr::IA32_SYSENTER_EIP),
            pat: msr(Msr::IA32_PAT),
            efer: msr(Msr::IA32_EFER),
            ..Default::default()
        }
    }

    unsafe fn restore_context(&mut self, ctx: &ProcessorContext) {
        self.cr0 = ctx.cr0;
        self.cr3 = ctx.cr3;
        self.cr4 = ctx.cr4;
        self.msrs.insert(Msr::IA32_EFER as u32, ctx.efer);
        self.msrs.insert(Msr::IA32_PAT as u32, ctx.pat);
        self.restored = Some(*ctx);
    }
}

/// Root of the monitor page tables handed out by [`MockHal`].
pub const MOCK_HOST_CR3: usize = 0x20_0000;
/// Root of the extended page tables handed out by [`MockHal`].
pub const MOCK_EPT_ROOT: usize = 0x30_0000;

/// Identity-mapped environment with fixed page-table roots.
pub struct MockHal;

impl Hal for MockHal {
    type Cpu = MockCpu;

    // Covers the whole lower half, so test buffers are "physical memory".
    const PHYSICAL_MEMORY: PhysMemWindow = PhysMemWindow::new(0, 1 << 47);

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(vaddr.as_usize())
    }

    fn prepare_page_tables(_apic_id: u32) -> Result<PageTableRoots> {
        Ok(PageTableRoots {
            host_cr3: HostPhysAddr::from(MOCK_HOST_CR3),
            ept_root: Some(HostPhysAddr::from(MOCK_EPT_ROOT)),
        })
    }
}

/// Like [`MockHal`] but without EPT.
pub struct MockHalNoEpt;

impl Hal for MockHalNoEpt {
    type Cpu = MockCpu;

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(vaddr.as_usize())
    }

    fn prepare_page_tables(_apic_id: u32) -> Result<PageTableRoots> {
        Ok(PageTableRoots {
            host_cr3: HostPhysAddr::from(MOCK_HOST_CR3),
            ept_root: None,
        })
    }
}
