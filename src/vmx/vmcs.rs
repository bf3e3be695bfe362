#![allow(non_camel_case_types)]

use bit_field::BitField;
use numeric_enum_macro::numeric_enum;

use super::capability::CachedVcpuData;
use super::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
use crate::cpu::VmxCpu;
use crate::{HostPhysAddr, Result, VmxError};

macro_rules! vmcs_read {
    ($field_enum: ident, u64) => {
        impl $field_enum {
            pub fn read<C: VmxCpu>(self, cpu: &C) -> Result<u64> {
                cpu.vmread(self as u32).map_err(|fail| VmxError::VmcsAccess {
                    field: self as u32,
                    fail: fail.into(),
                })
            }
        }
    };
    ($field_enum: ident, $type: ty) => {
        impl $field_enum {
            pub fn read<C: VmxCpu>(self, cpu: &C) -> Result<$type> {
                cpu.vmread(self as u32)
                    .map(|value| value as $type)
                    .map_err(|fail| VmxError::VmcsAccess {
                        field: self as u32,
                        fail: fail.into(),
                    })
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $type: ty) => {
        impl $field_enum {
            pub fn write<C: VmxCpu>(self, cpu: &mut C, value: $type) -> Result {
                unsafe { cpu.vmwrite(self as u32, value as u64) }.map_err(|fail| {
                    VmxError::VmcsAccess {
                        field: self as u32,
                        fail: fail.into(),
                    }
                })
            }
        }
    };
}

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
}
}
vmcs_write!(VmcsControl16, u16);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
pub enum VmcsControl64 {
    /// Address of MSR bitmaps (full).
    MSR_BITMAPS_ADDR = 0x2004,
    /// TSC offset (full).
    TSC_OFFSET = 0x2010,
    /// EPT pointer (full).
    EPTP = 0x201A,
}
}
vmcs_write!(VmcsControl64, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
pub enum VmcsControl32 {
    /// Pin-based VM-execution controls.
    PINBASED_EXEC_CONTROLS = 0x4000,
    /// Primary processor-based VM-execution controls.
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    /// Exception bitmap.
    EXCEPTION_BITMAP = 0x4004,
    /// Page-fault error-code mask.
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    /// Page-fault error-code match.
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    /// CR3-target count.
    CR3_TARGET_COUNT = 0x400A,
    /// VM-exit controls.
    VMEXIT_CONTROLS = 0x400C,
    /// VM-exit MSR-store count.
    VMEXIT_MSR_STORE_COUNT = 0x400E,
    /// VM-exit MSR-load count.
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    /// VM-entry controls.
    VMENTRY_CONTROLS = 0x4012,
    /// VM-entry MSR-load count.
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    /// VM-entry interruption-information field.
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    /// VM-entry exception error code.
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    /// VM-entry instruction length.
    VMENTRY_INSTRUCTION_LEN = 0x401A,
    /// TPR threshold.
    TPR_THRESHOLD = 0x401C,
    /// Secondary processor-based VM-execution controls.
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
}
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
pub enum VmcsControlNW {
    /// CR0 guest/host mask.
    CR0_GUEST_HOST_MASK = 0x6000,
    /// CR4 guest/host mask.
    CR4_GUEST_HOST_MASK = 0x6002,
    /// CR0 read shadow.
    CR0_READ_SHADOW = 0x6004,
    /// CR4 read shadow.
    CR4_READ_SHADOW = 0x6006,
}
}
vmcs_read!(VmcsControlNW, u64);
vmcs_write!(VmcsControlNW, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
pub enum VmcsReadOnly32 {
    /// VM-instruction error.
    VM_INSTRUCTION_ERROR = 0x4400,
    /// Exit reason.
    EXIT_REASON = 0x4402,
    /// VM-exit interruption information.
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    /// VM-exit interruption error code.
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    /// IDT-vectoring information field.
    IDT_VECTORING_INFO = 0x4408,
    /// IDT-vectoring error code.
    IDT_VECTORING_ERR_CODE = 0x440A,
    /// VM-exit instruction length.
    VMEXIT_INSTRUCTION_LEN = 0x440C,
    /// VM-exit instruction information.
    VMEXIT_INSTRUCTION_INFO = 0x440E,
}
}
vmcs_read!(VmcsReadOnly32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
pub enum VmcsReadOnlyNW {
    /// Exit qualification.
    EXIT_QUALIFICATION = 0x6400,
    /// Guest-linear address.
    GUEST_LINEAR_ADDR = 0x640A,
}
}
vmcs_read!(VmcsReadOnlyNW, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
pub enum VmcsGuest64 {
    /// VMCS link pointer (full).
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
}
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482a,
}
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
}
vmcs_read!(VmcsGuestNW, u64);
vmcs_write!(VmcsGuestNW, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
}
vmcs_write!(VmcsHost16, u16);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
}
}
vmcs_write!(VmcsHost64, u64);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
}
vmcs_write!(VmcsHost32, u32);

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
}
vmcs_write!(VmcsHostNW, u64);

pub mod controls {
    use bitflags::bitflags;

    bitflags! {
        /// Pin-based VM-execution controls. (SDM Vol. 3C, Section 24.6.1)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PinbasedControls: u32 {
            /// External interrupts cause VM exits.
            const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
            /// Non-maskable interrupts cause VM exits.
            const NMI_EXITING = 1 << 3;
            /// NMIs are never blocked and the "blocking by NMI" bit indicates
            /// "virtual-NMI blocking".
            const VIRTUAL_NMIS = 1 << 5;
            /// The VMX-preemption timer counts down in VMX non-root operation.
            const VMX_PREEMPTION_TIMER = 1 << 6;
            /// Posted interrupts are processed.
            const POSTED_INTERRUPTS = 1 << 7;
        }
    }

    bitflags! {
        /// Primary processor-based VM-execution controls. (SDM Vol. 3C, Section 24.6.2)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct PrimaryControls: u32 {
            /// A VM exit occurs at the beginning of any instruction if RFLAGS.IF = 1.
            const INTERRUPT_WINDOW_EXITING = 1 << 2;
            /// RDTSC and friends return the TSC plus the TSC offset.
            const USE_TSC_OFFSETTING = 1 << 3;
            /// HLT causes a VM exit.
            const HLT_EXITING = 1 << 7;
            /// INVLPG causes a VM exit.
            const INVLPG_EXITING = 1 << 9;
            /// MWAIT causes a VM exit.
            const MWAIT_EXITING = 1 << 10;
            /// RDPMC causes a VM exit.
            const RDPMC_EXITING = 1 << 11;
            /// RDTSC and RDTSCP cause VM exits.
            const RDTSC_EXITING = 1 << 12;
            /// MOV to CR3 causes a VM exit unless the value is a CR3 target.
            const CR3_LOAD_EXITING = 1 << 15;
            /// MOV from CR3 causes a VM exit.
            const CR3_STORE_EXITING = 1 << 16;
            /// MOV to CR8 causes a VM exit.
            const CR8_LOAD_EXITING = 1 << 19;
            /// MOV from CR8 causes a VM exit.
            const CR8_STORE_EXITING = 1 << 20;
            /// TPR virtualization and other APIC-virtualization features.
            const USE_TPR_SHADOW = 1 << 21;
            /// A VM exit occurs at the beginning of any instruction if there
            /// is no virtual-NMI blocking.
            const NMI_WINDOW_EXITING = 1 << 22;
            /// MOV DR causes a VM exit.
            const MOV_DR_EXITING = 1 << 23;
            /// Every I/O instruction causes a VM exit.
            const UNCOND_IO_EXITING = 1 << 24;
            /// I/O bitmaps restrict which I/O instructions exit.
            const USE_IO_BITMAPS = 1 << 25;
            /// The monitor trap flag debugging feature is enabled.
            const MONITOR_TRAP_FLAG = 1 << 27;
            /// MSR bitmaps control which RDMSR/WRMSR exit.
            const USE_MSR_BITMAPS = 1 << 28;
            /// MONITOR causes a VM exit.
            const MONITOR_EXITING = 1 << 29;
            /// PAUSE causes a VM exit.
            const PAUSE_EXITING = 1 << 30;
            /// The secondary processor-based VM-execution controls are used.
            const SECONDARY_CONTROLS = 1 << 31;
        }
    }

    bitflags! {
        /// Secondary processor-based VM-execution controls. (SDM Vol. 3C, Section 24.6.2)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct SecondaryControls: u32 {
            /// Accesses to the APIC-access page are virtualized.
            const VIRT_APIC_ACCESSES = 1 << 0;
            /// Extended page tables are enabled.
            const ENABLE_EPT = 1 << 1;
            /// LGDT, LIDT, LLDT, LTR, SGDT, SIDT, SLDT and STR cause VM exits.
            const DT_EXITING = 1 << 2;
            /// RDTSCP does not cause #UD.
            const ENABLE_RDTSCP = 1 << 3;
            /// x2APIC accesses to the TPR are virtualized.
            const VIRT_X2APIC_MODE = 1 << 4;
            /// Cached linear translations are tagged with a VPID.
            const ENABLE_VPID = 1 << 5;
            /// WBINVD causes a VM exit.
            const WBINVD_EXITING = 1 << 6;
            /// The guest may run in unpaged protected mode or in real-address mode.
            const UNRESTRICTED_GUEST = 1 << 7;
            /// INVPCID does not cause #UD.
            const ENABLE_INVPCID = 1 << 12;
            /// VMFUNC does not cause #UD.
            const ENABLE_VM_FUNCTIONS = 1 << 13;
            /// XSAVES and XRSTORS do not cause #UD.
            const ENABLE_XSAVES_XRSTORS = 1 << 20;
        }
    }

    bitflags! {
        /// VM-exit controls. (SDM Vol. 3C, Section 24.7.1)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct ExitControls: u32 {
            /// DR7 and IA32_DEBUGCTL are saved on VM exit.
            const SAVE_DEBUG_CONTROLS = 1 << 2;
            /// The processor is in 64-bit mode after VM exit.
            const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
            /// IA32_PERF_GLOBAL_CTRL is loaded on VM exit.
            const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
            /// The processor acknowledges the interrupt controller on external-interrupt exits.
            const ACK_INTERRUPT_ON_EXIT = 1 << 15;
            /// IA32_PAT is saved on VM exit.
            const SAVE_IA32_PAT = 1 << 18;
            /// IA32_PAT is loaded on VM exit.
            const LOAD_IA32_PAT = 1 << 19;
            /// IA32_EFER is saved on VM exit.
            const SAVE_IA32_EFER = 1 << 20;
            /// IA32_EFER is loaded on VM exit.
            const LOAD_IA32_EFER = 1 << 21;
            /// The VMX-preemption timer value is saved on VM exit.
            const SAVE_VMX_PREEMPTION_TIMER = 1 << 22;
        }
    }

    bitflags! {
        /// VM-entry controls. (SDM Vol. 3C, Section 24.8.1)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct EntryControls: u32 {
            /// DR7 and IA32_DEBUGCTL are loaded on VM entry.
            const LOAD_DEBUG_CONTROLS = 1 << 2;
            /// The logical processor is in IA-32e mode after VM entry.
            const IA32E_MODE_GUEST = 1 << 9;
            /// The logical processor is in SMM after VM entry.
            const ENTRY_TO_SMM = 1 << 10;
            /// IA32_PERF_GLOBAL_CTRL is loaded on VM entry.
            const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
            /// IA32_PAT is loaded on VM entry.
            const LOAD_IA32_PAT = 1 << 14;
            /// IA32_EFER is loaded on VM entry.
            const LOAD_IA32_EFER = 1 << 15;
        }
    }
}

/// The five VM-execution, VM-exit and VM-entry control fields whose legal
/// settings are reported by capability MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    PrimaryProcessorBased,
    SecondaryProcessorBased,
    VmExit,
    VmEntry,
}

impl VmxControl {
    /// The VMCS field holding this control.
    pub const fn field(self) -> VmcsControl32 {
        match self {
            Self::PinBased => VmcsControl32::PINBASED_EXEC_CONTROLS,
            Self::PrimaryProcessorBased => VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            Self::SecondaryProcessorBased => VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            Self::VmExit => VmcsControl32::VMEXIT_CONTROLS,
            Self::VmEntry => VmcsControl32::VMENTRY_CONTROLS,
        }
    }
}

/// Writes `control` with every bit in `set` enabled and every bit in `clear`
/// disabled, filling the rest from the mandatory-one settings in `cached`.
///
/// Fails without writing when a requested bit is not allowed-1, or when a bit
/// to clear is mandatory-one.
pub fn set_control<C: VmxCpu>(
    cpu: &mut C,
    cached: &CachedVcpuData,
    control: VmxControl,
    set: u32,
    clear: u32,
) -> Result {
    let cap = cached.control_capability(control)?;
    let field = control.field();

    if (set & clear) != 0 {
        return Err(VmxError::InvalidInput("control bits both set and cleared"));
    }
    if (set & !cap.allowed1) != 0 {
        error!("not allowed to set bits {:#x} of {:?}", set & !cap.allowed1, field);
        return Err(VmxError::FieldWriteViolation {
            field: field as u32,
            value: set as u64,
        });
    }
    if (clear & cap.allowed0) != 0 {
        error!("not allowed to clear bits {:#x} of {:?}", clear & cap.allowed0, field);
        return Err(VmxError::FieldWriteViolation {
            field: field as u32,
            value: (cap.allowed0 & !clear) as u64,
        });
    }

    let value = cap.allowed0 | set;
    debug!("set {:?}: {:#x}", field, value);
    field.write(cpu, value)
}

/// Writes `value` to `control` as-is after checking it against the
/// capability cache.
pub fn write_control<C: VmxCpu>(
    cpu: &mut C,
    cached: &CachedVcpuData,
    control: VmxControl,
    value: u32,
) -> Result {
    let cap = cached.control_capability(control)?;
    let field = control.field();
    if !cap.is_valid(value) {
        return Err(VmxError::FieldWriteViolation {
            field: field as u32,
            value: value as u64,
        });
    }
    field.write(cpu, value)
}

/// Sets or clears `bits` in `control`, keeping the capability masks intact.
pub fn update_control<C: VmxCpu>(
    cpu: &mut C,
    cached: &CachedVcpuData,
    control: VmxControl,
    bits: u32,
    enable: bool,
) -> Result {
    let old = control.field().read(cpu)?;
    let new = if enable { old | bits } else { old & !bits };
    if new == old {
        return Ok(());
    }
    write_control(cpu, cached, control, new)
}

/// The CR0/CR4 fields whose values must satisfy the fixed-bit MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrField {
    GuestCr0,
    GuestCr4,
    HostCr0,
    HostCr4,
}

impl CrField {
    pub const fn encoding(self) -> u32 {
        match self {
            Self::GuestCr0 => VmcsGuestNW::CR0 as u32,
            Self::GuestCr4 => VmcsGuestNW::CR4 as u32,
            Self::HostCr0 => VmcsHostNW::CR0 as u32,
            Self::HostCr4 => VmcsHostNW::CR4 as u32,
        }
    }

    fn is_cr0(self) -> bool {
        matches!(self, Self::GuestCr0 | Self::HostCr0)
    }
}

/// Writes a CR0/CR4 field after checking it keeps every fixed-to-1 bit set
/// and no fixed-to-0 bit set.
pub fn write_cr<C: VmxCpu>(
    cpu: &mut C,
    cached: &CachedVcpuData,
    field: CrField,
    value: u64,
) -> Result {
    let (fixed0, fixed1) = if field.is_cr0() {
        (cached.cr0_fixed0, cached.cr0_fixed1)
    } else {
        (cached.cr4_fixed0, cached.cr4_fixed1)
    };
    if (value & fixed0) != fixed0 || (value & !fixed1) != 0 {
        error!(
            "{:?} value {:#x} violates fixed bits (must be 1: {:#x}, may be 1: {:#x})",
            field, value, fixed0, fixed1
        );
        return Err(VmxError::FieldWriteViolation {
            field: field.encoding(),
            value,
        });
    }
    unsafe { cpu.vmwrite(field.encoding(), value) }.map_err(|fail| VmxError::VmcsAccess {
        field: field.encoding(),
        fail: fail.into(),
    })
}

/// Programs the EPT pointer for a 4-level, write-back table rooted at `root`.
pub fn set_ept_pointer<C: VmxCpu>(cpu: &mut C, root: HostPhysAddr) -> Result {
    const EPT_MEMORY_TYPE_WB: u64 = 6;
    const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
    let eptp = root.as_usize() as u64 | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB;
    VmcsControl64::EPTP.write(cpu, eptp)
}

pub fn instruction_error<C: VmxCpu>(cpu: &C) -> VmxInstructionError {
    VmcsReadOnly32::VM_INSTRUCTION_ERROR
        .read(cpu)
        .unwrap_or(0)
        .into()
}

/// VM-Exit Informations. (SDM Vol. 3C, Section 24.9.1)
#[derive(Debug)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason, `Err` with the raw number if it is not known.
    pub exit_reason: core::result::Result<VmxExitReason, u32>,
}

pub fn exit_info<C: VmxCpu>(cpu: &C) -> Result<VmxExitInfo> {
    let full_reason = VmcsReadOnly32::EXIT_REASON.read(cpu)?;
    Ok(VmxExitInfo {
        exit_reason: VmxExitReason::try_from(full_reason.get_bits(0..16)),
        entry_failure: full_reason.get_bit(31),
    })
}

/// VM-Entry/VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInterruptInfo {
    /// Vector of interrupt or exception.
    pub vector: u8,
    /// Determines details of how the injection is performed.
    pub int_type: VmxInterruptionType,
    /// For hardware exceptions that would have delivered an error code on the stack.
    pub err_code: Option<u32>,
    /// Whether the field is valid.
    pub valid: bool,
}

impl VmxInterruptInfo {
    /// Convert from the interrupt vector and the error code.
    pub fn from(vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type: VmxInterruptionType::from_vector(vector),
            err_code,
            valid: true,
        }
    }

    /// Raw bits for writing to VMCS.
    pub fn bits(&self) -> u32 {
        let mut bits = self.vector as u32;
        bits |= (self.int_type as u32) << 8;
        bits.set_bit(11, self.err_code.is_some());
        bits.set_bit(31, self.valid);
        bits
    }

    /// Decodes the VM-exit interruption-information field.
    pub fn exit_info<C: VmxCpu>(cpu: &C) -> Result<Self> {
        let info = VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO.read(cpu)?;
        let int_type = VmxInterruptionType::try_from(info.get_bits(8..11) as u8)
            .unwrap_or(VmxInterruptionType::Other);
        let err_code = if info.get_bit(11) {
            Some(VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE.read(cpu)?)
        } else {
            None
        };
        Ok(Self {
            vector: info.get_bits(0..8) as u8,
            int_type,
            err_code,
            valid: info.get_bit(31),
        })
    }
}

/// Queues an event for delivery on the next VM entry.
pub fn inject_event<C: VmxCpu>(cpu: &mut C, vector: u8, err_code: Option<u32>) -> Result {
    // SDM Vol. 3C, Section 26.2.1.3
    let int_info = VmxInterruptInfo::from(vector, err_code);
    if let Some(err_code) = int_info.err_code {
        VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE.write(cpu, err_code)?;
    }
    VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write(cpu, int_info.bits())
}

/// Exit Qualification for Control-Register Accesses. (SDM Vol. 3C, Section 28.2.1, Table 28-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessInfo {
    /// Number of control register.
    pub cr_number: u8,
    /// Access type. (0 = MOV to CR; 1 = MOV from CR; 2 = CLTS; 3 = LMSW)
    pub access_type: u8,
    /// Register operand of MOV CR.
    pub gpr: u8,
    /// LMSW source data.
    pub lmsw_source_data: u16,
}

pub fn cr_access_info<C: VmxCpu>(cpu: &C) -> Result<CrAccessInfo> {
    let qualification = VmcsReadOnlyNW::EXIT_QUALIFICATION.read(cpu)?;
    Ok(CrAccessInfo {
        cr_number: qualification.get_bits(0..4) as u8,
        access_type: qualification.get_bits(4..6) as u8,
        gpr: qualification.get_bits(8..12) as u8,
        lmsw_source_data: qualification.get_bits(16..32) as u16,
    })
}
