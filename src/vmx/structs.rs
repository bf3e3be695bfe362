use bit_field::BitField;
use bitflags::bitflags;

use crate::{Result, VmxError};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[allow(dead_code)]
#[repr(C, align(4096))]
pub struct VmxRegion {
    revision_id: u32,
    abort_indicator: u32,
    data: [u8; 4088],
}

impl VmxRegion {
    /// Writes the revision identifier, with bit 31 clear for an ordinary
    /// (non-shadow) structure.
    pub fn stamp(&mut self, revision_id: u32) {
        self.revision_id = revision_id & 0x7fff_ffff;
        self.abort_indicator = 0;
    }
}

/// Which half of the MSR bitmap an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrAccess {
    /// `RDMSR`.
    Read,
    /// `WRMSR`.
    Write,
}

/// MSR bitmap. (SDM Vol. 3C, Section 24.6.9)
///
/// Four 1 KiB sub-regions: read-low, read-high, write-low, write-high. The
/// low range covers MSRs `0..=0x1fff`, the high range `0xc000_0000..=0xc000_1fff`.
/// A set bit makes the access exit; MSRs outside both ranges always exit.
#[repr(C, align(4096))]
pub struct MsrBitmap {
    read_low: [u8; 1024],
    read_high: [u8; 1024],
    write_low: [u8; 1024],
    write_high: [u8; 1024],
}

impl MsrBitmap {
    const RANGE_SIZE: u32 = 0x2000;
    const LOW_RANGE: core::ops::RangeInclusive<u32> = 0..=0x1fff;
    const HIGH_RANGE: core::ops::RangeInclusive<u32> = 0xc000_0000..=0xc000_1fff;

    /// Makes every covered MSR access exit.
    pub fn intercept_all(&mut self) {
        self.fill(0xff);
    }

    /// Lets every covered MSR access through.
    pub fn passthrough_all(&mut self) {
        self.fill(0);
    }

    fn fill(&mut self, byte: u8) {
        self.read_low.fill(byte);
        self.read_high.fill(byte);
        self.write_low.fill(byte);
        self.write_high.fill(byte);
    }

    /// Maps an MSR onto its position in the concatenated low/high identifier
    /// space, `0..2 * RANGE_SIZE`.
    fn normalize(msr: u32) -> Option<u32> {
        if Self::LOW_RANGE.contains(&msr) {
            Some(msr)
        } else if Self::HIGH_RANGE.contains(&msr) {
            Some(msr - Self::HIGH_RANGE.start() + Self::RANGE_SIZE)
        } else {
            None
        }
    }

    /// Sub-region, byte offset and bit for `msr`.
    fn locate(&mut self, msr: u32, access: MsrAccess) -> Result<(&mut [u8; 1024], usize, usize)> {
        let id = Self::normalize(msr).ok_or(VmxError::InvalidInput("MSR outside the bitmap"))?;
        let high = id >= Self::RANGE_SIZE;
        let offset = id % Self::RANGE_SIZE;
        let region = match (access, high) {
            (MsrAccess::Read, false) => &mut self.read_low,
            (MsrAccess::Read, true) => &mut self.read_high,
            (MsrAccess::Write, false) => &mut self.write_low,
            (MsrAccess::Write, true) => &mut self.write_high,
        };
        Ok((region, offset as usize / 8, offset as usize % 8))
    }

    /// Sets whether `access` to `msr` exits.
    pub fn set_intercept(&mut self, msr: u32, access: MsrAccess, intercept: bool) -> Result {
        let (region, byte, bit) = self.locate(msr, access)?;
        region[byte].set_bit(bit, intercept);
        Ok(())
    }

    /// Returns whether `access` to `msr` exits.
    pub fn is_intercepted(&self, msr: u32, access: MsrAccess) -> bool {
        let Some(id) = Self::normalize(msr) else {
            return true;
        };
        let offset = (id % Self::RANGE_SIZE) as usize;
        let region = match (access, id >= Self::RANGE_SIZE) {
            (MsrAccess::Read, false) => &self.read_low,
            (MsrAccess::Read, true) => &self.read_high,
            (MsrAccess::Write, false) => &self.write_low,
            (MsrAccess::Write, true) => &self.write_high,
        };
        region[offset / 8].get_bit(offset % 8)
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) -> Result {
        self.set_intercept(msr, MsrAccess::Read, intercept)
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) -> Result {
        self.set_intercept(msr, MsrAccess::Write, intercept)
    }

    /// The whole bitmap as bytes, in hardware order.
    pub fn as_bytes(&self) -> &[u8; 4096] {
        unsafe { &*(self as *const Self as *const [u8; 4096]) }
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of INS and OUTS.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0, the TRUE
    /// capability MSRs report the settings.
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    /// Decodes a raw `IA32_VMX_BASIC` value.
    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
        /// Lock bit: when set, locks this MSR from being written. when clear,
        /// VMXON causes a #GP.
        const LOCKED = 1 << 0;
        /// Enable VMX inside SMX operation.
        const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
        /// Enable VMX outside SMX operation.
        const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}
