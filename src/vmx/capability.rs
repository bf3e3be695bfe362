use bit_field::BitField;
use raw_cpuid::CpuIdResult;

use super::definitions::InvVpidKind;
use super::structs::VmxBasic;
use super::vmcs::VmxControl;
use super::vmcs::controls::PrimaryControls;
use crate::cpu::VmxCpu;
use crate::msr::Msr;
use crate::{Result, VmxError};

/// Legal settings of one VMX control field. (SDM Vol. 3D, Appendix A.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCapability {
    /// Bits that must be 1 (the allowed 0-settings reported as 1).
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

impl ControlCapability {
    /// Splits a capability MSR: allowed 0-settings in the low dword, allowed
    /// 1-settings in the high dword.
    pub fn from_msr(raw: u64) -> Self {
        Self {
            allowed0: raw as u32,
            allowed1: (raw >> 32) as u32,
        }
    }

    /// Returns `true` if every mandatory-one bit is set and no other bit
    /// outside the allowed 1-settings is.
    pub fn is_valid(&self, value: u32) -> bool {
        (value & self.allowed0) == self.allowed0 && (value & !self.allowed1) == 0
    }

    /// Whether `bits` may be set.
    pub fn allows(&self, bits: u32) -> bool {
        (bits & !self.allowed1) == 0
    }
}

/// Capabilities of the five VMX control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxControlCapabilities {
    pub pinbased: ControlCapability,
    pub primary: ControlCapability,
    /// `None` if the secondary controls cannot be activated.
    pub secondary: Option<ControlCapability>,
    pub exit: ControlCapability,
    pub entry: ControlCapability,
}

/// Per-processor virtualization capabilities, read once before VMX is
/// enabled and never refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedVcpuData {
    /// Physical-address width (CPUID.80000008H:EAX[7:0]).
    pub max_phys_addr: u8,
    /// CR0 bits fixed to 1 in VMX operation.
    pub cr0_fixed0: u64,
    /// CR0 bits allowed to be 1 in VMX operation.
    pub cr0_fixed1: u64,
    /// CR4 bits fixed to 1 in VMX operation.
    pub cr4_fixed0: u64,
    /// CR4 bits allowed to be 1 in VMX operation.
    pub cr4_fixed1: u64,
    /// XCR0 bits the processor does not support.
    pub xcr0_unsupported_mask: u64,
    /// `IA32_FEATURE_CONTROL` as found before enabling VMX.
    pub feature_control: u64,
    /// CPUID leaf 1.
    pub cpuid_01: CpuIdResult,
    /// `RDTSCP` is available (CPUID.80000001H:EDX[27]).
    pub has_rdtscp: bool,
    /// `INVPCID` is available (CPUID.(EAX=07H,ECX=0):EBX[10]).
    pub has_invpcid: bool,
    /// `XSAVES`/`XRSTORS` are available (CPUID.(EAX=0DH,ECX=1):EAX[3]).
    pub has_xsaves: bool,
    /// Decoded `IA32_VMX_BASIC`.
    pub vmx_basic: VmxBasic,
    /// Allowed settings of the control fields.
    pub controls: VmxControlCapabilities,
    /// `IA32_VMX_EPT_VPID_CAP`, zero if neither EPT nor VPID can be enabled.
    pub ept_vpid_cap: u64,
}

impl CachedVcpuData {
    const DEFAULT_PHYS_ADDR_WIDTH: u8 = 36;
    const CPUID_VMX: usize = 5;
    const CPUID_XSAVE: usize = 26;
    const CPUID_RDTSCP: usize = 27;
    const CPUID_INVPCID: usize = 10;
    const CPUID_XSAVES: usize = 3;

    /// Queries the current processor.
    ///
    /// Fails with [`VmxError::CapabilityAbsent`] before touching any VMX MSR
    /// if CPUID does not report VMX.
    pub fn read<C: VmxCpu>(cpu: &C) -> Result<Self> {
        let cpuid_01 = cpu.cpuid(1, 0);
        if !cpuid_01.ecx.get_bit(Self::CPUID_VMX) {
            return Err(VmxError::CapabilityAbsent("CPU does not support feature VMX"));
        }

        let max_basic_leaf = cpu.cpuid(0, 0).eax;
        let xcr0_unsupported_mask = if cpuid_01.ecx.get_bit(Self::CPUID_XSAVE) && max_basic_leaf >= 0xd
        {
            let leaf_0d = cpu.cpuid(0xd, 0);
            !((leaf_0d.edx as u64) << 32 | leaf_0d.eax as u64)
        } else {
            u64::MAX
        };

        let max_extended_leaf = cpu.cpuid(0x8000_0000, 0).eax;
        let max_phys_addr = if max_extended_leaf >= 0x8000_0008 {
            cpu.cpuid(0x8000_0008, 0).eax.get_bits(0..8) as u8
        } else {
            Self::DEFAULT_PHYS_ADDR_WIDTH
        };

        let has_rdtscp = max_extended_leaf >= 0x8000_0001
            && cpu.cpuid(0x8000_0001, 0).edx.get_bit(Self::CPUID_RDTSCP);
        let has_invpcid = max_basic_leaf >= 7 && cpu.cpuid(7, 0).ebx.get_bit(Self::CPUID_INVPCID);
        let has_xsaves = max_basic_leaf >= 0xd && cpu.cpuid(0xd, 1).eax.get_bit(Self::CPUID_XSAVES);

        let vmx_basic = VmxBasic::from_raw(cpu.read_msr(Msr::IA32_VMX_BASIC));
        let read_ctls = |true_msr: Msr, msr: Msr| {
            ControlCapability::from_msr(cpu.read_msr(if vmx_basic.vmx_flex_controls {
                true_msr
            } else {
                msr
            }))
        };
        let primary = read_ctls(
            Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            Msr::IA32_VMX_PROCBASED_CTLS,
        );
        let secondary = primary
            .allows(PrimaryControls::SECONDARY_CONTROLS.bits())
            .then(|| ControlCapability::from_msr(cpu.read_msr(Msr::IA32_VMX_PROCBASED_CTLS2)));
        let controls = VmxControlCapabilities {
            pinbased: read_ctls(Msr::IA32_VMX_TRUE_PINBASED_CTLS, Msr::IA32_VMX_PINBASED_CTLS),
            primary,
            secondary,
            exit: read_ctls(Msr::IA32_VMX_TRUE_EXIT_CTLS, Msr::IA32_VMX_EXIT_CTLS),
            entry: read_ctls(Msr::IA32_VMX_TRUE_ENTRY_CTLS, Msr::IA32_VMX_ENTRY_CTLS),
        };

        // IA32_VMX_EPT_VPID_CAP exists only if bit 33 or 37 of PROCBASED_CTLS2 is set.
        let ept_vpid_cap = match secondary {
            Some(cap) if cap.allowed1.get_bit(1) || cap.allowed1.get_bit(5) => {
                cpu.read_msr(Msr::IA32_VMX_EPT_VPID_CAP)
            }
            _ => 0,
        };

        Ok(Self {
            max_phys_addr,
            cr0_fixed0: cpu.read_msr(Msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: cpu.read_msr(Msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: cpu.read_msr(Msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: cpu.read_msr(Msr::IA32_VMX_CR4_FIXED1),
            xcr0_unsupported_mask,
            feature_control: cpu.read_msr(Msr::IA32_FEATURE_CONTROL),
            cpuid_01,
            has_rdtscp,
            has_invpcid,
            has_xsaves,
            vmx_basic,
            controls,
            ept_vpid_cap,
        })
    }

    /// Initial APIC id of the processor (CPUID.01H:EBX[31:24]).
    pub fn apic_id(&self) -> u32 {
        self.cpuid_01.ebx.get_bits(24..32)
    }

    /// Allowed settings of `control`.
    pub fn control_capability(&self, control: VmxControl) -> Result<ControlCapability> {
        match control {
            VmxControl::PinBased => Ok(self.controls.pinbased),
            VmxControl::PrimaryProcessorBased => Ok(self.controls.primary),
            VmxControl::SecondaryProcessorBased => self
                .controls
                .secondary
                .ok_or(VmxError::CapabilityAbsent("secondary processor-based controls")),
            VmxControl::VmExit => Ok(self.controls.exit),
            VmxControl::VmEntry => Ok(self.controls.entry),
        }
    }

    /// Forces `cr0` into the values VMX operation allows.
    pub fn adjust_cr0(&self, cr0: u64) -> u64 {
        (cr0 | self.cr0_fixed0) & self.cr0_fixed1
    }

    /// Forces `cr4` into the values VMX operation allows.
    pub fn adjust_cr4(&self, cr4: u64) -> u64 {
        (cr4 | self.cr4_fixed0) & self.cr4_fixed1
    }

    /// The narrowest INVVPID type the processor supports, if any.
    pub fn invvpid_kind(&self) -> Option<InvVpidKind> {
        const INVVPID: usize = 32;
        if !self.ept_vpid_cap.get_bit(INVVPID) {
            return None;
        }
        [InvVpidKind::SingleContext, InvVpidKind::AllContext]
            .into_iter()
            .find(|kind| self.ept_vpid_cap.get_bit(kind.capability_bit()))
    }

    /// Whether EPT supports 4-level walks over write-back tables.
    pub fn supports_ept(&self) -> bool {
        const PAGE_WALK_LENGTH_4: usize = 6;
        const MEMORY_TYPE_WB: usize = 14;
        self.ept_vpid_cap.get_bit(PAGE_WALK_LENGTH_4) && self.ept_vpid_cap.get_bit(MEMORY_TYPE_WB)
    }
}
