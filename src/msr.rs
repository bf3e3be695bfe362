use numeric_enum_macro::numeric_enum;

numeric_enum! {
    #[repr(u32)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    #[allow(non_camel_case_types)]
    /// X86 model-specific registers. (SDM Vol. 4)
    pub enum Msr {
        IA32_FEATURE_CONTROL = 0x3a,

        IA32_SYSENTER_CS = 0x174,
        IA32_SYSENTER_ESP = 0x175,
        IA32_SYSENTER_EIP = 0x176,

        IA32_DEBUGCTL = 0x1d9,
        IA32_PAT = 0x277,

        IA32_VMX_BASIC = 0x480,
        IA32_VMX_PINBASED_CTLS = 0x481,
        IA32_VMX_PROCBASED_CTLS = 0x482,
        IA32_VMX_EXIT_CTLS = 0x483,
        IA32_VMX_ENTRY_CTLS = 0x484,
        IA32_VMX_MISC = 0x485,
        IA32_VMX_CR0_FIXED0 = 0x486,
        IA32_VMX_CR0_FIXED1 = 0x487,
        IA32_VMX_CR4_FIXED0 = 0x488,
        IA32_VMX_CR4_FIXED1 = 0x489,
        IA32_VMX_PROCBASED_CTLS2 = 0x48b,
        IA32_VMX_EPT_VPID_CAP = 0x48c,
        IA32_VMX_TRUE_PINBASED_CTLS = 0x48d,
        IA32_VMX_TRUE_PROCBASED_CTLS = 0x48e,
        IA32_VMX_TRUE_EXIT_CTLS = 0x48f,
        IA32_VMX_TRUE_ENTRY_CTLS = 0x490,

        IA32_EFER = 0xc000_0080,
        IA32_FS_BASE = 0xc000_0100,
        IA32_GS_BASE = 0xc000_0101,
        IA32_KERNEL_GSBASE = 0xc000_0102,
    }
}

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read(self) -> u64 {
        unsafe { x86::msr::rdmsr(self as _) }
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write(self, value: u64) {
        unsafe { x86::msr::wrmsr(self as _, value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msr_numbers() {
        assert_eq!(Msr::IA32_FEATURE_CONTROL as u32, 0x3a);
        assert_eq!(Msr::IA32_VMX_BASIC as u32, 0x480);
        assert_eq!(Msr::IA32_VMX_TRUE_ENTRY_CTLS as u32, 0x490);
        assert_eq!(Msr::IA32_EFER as u32, 0xc000_0080);
    }

    #[test]
    fn test_msr_from_number() {
        assert_eq!(Msr::try_from(0x277), Ok(Msr::IA32_PAT));
        assert_eq!(Msr::try_from(0xc000_0101), Ok(Msr::IA32_GS_BASE));
        assert!(Msr::try_from(0x10).is_err());
    }
}
