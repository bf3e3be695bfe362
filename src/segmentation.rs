use bit_field::BitField;
use bitflags::bitflags;
use x86::segmentation::SegmentSelector;

bitflags! {
    /// Segment access rights in the layout of the VMCS access-rights fields.
    /// (SDM Vol. 3C, Section 24.4.1, Table 24-2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Accessed flag.
        const ACCESSED          = 1 << 0;
        /// For data segments, this flag sets the segment as writable. For code
        /// segments, this flag sets the segment as readable.
        const WRITABLE          = 1 << 1;
        /// For data segments, this flag marks a data segment as “expansion-direction”.
        /// For code segments, this flag marks a code segment as “conforming”.
        const CONFORMING        = 1 << 2;
        /// This flag must be set for code segments.
        const EXECUTABLE        = 1 << 3;
        /// Set for code and data segments, clear for system segments.
        const CODE_DATA         = 1 << 4;
        /// Descriptor privilege level, two bits.
        const DPL_RING_3        = 3 << 5;
        /// Must be set for any segment.
        const PRESENT           = 1 << 7;
        /// Available for use by system software.
        const AVAILABLE         = 1 << 12;
        /// 64-bit code segment.
        const LONG_MODE         = 1 << 13;
        /// Default operation size (0 = 16-bit segment, 1 = 32-bit segment).
        const DB                = 1 << 14;
        /// Limit is scaled by 4 KiB.
        const GRANULARITY       = 1 << 15;
        /// Segment is unusable; every other bit is ignored.
        const UNUSABLE          = 1 << 16;

        /// Available 64-bit TSS.
        const TSS_AVAIL         = 0b1001;
        /// Busy 64-bit TSS.
        const TSS_BUSY          = 0b1011;
        /// LDT.
        const LDT               = 0b0010;
    }
}

impl SegmentAccessRights {
    /// Returns the 4-bit segment type.
    pub fn type_field(&self) -> u32 {
        self.bits() & 0xf
    }

    /// Returns the descriptor privilege level.
    pub fn dpl(&self) -> u8 {
        self.bits().get_bits(5..7) as u8
    }

    /// Replaces the type field of a raw GDT descriptor.
    pub fn set_descriptor_type(desc: &mut u64, ty: Self) {
        desc.set_bits(40..44, ty.type_field() as u64);
    }

    fn from_descriptor(desc: u64) -> Self {
        Self::from_bits_truncate(desc.get_bits(40..48) as u32 | (desc.get_bits(52..56) as u32) << 12)
    }
}

/// A segment register as the VMCS sees it: selector plus the hidden part
/// loaded from the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Visible selector.
    pub selector: SegmentSelector,
    /// Linear base address.
    pub base: u64,
    /// Byte-granular limit.
    pub limit: u32,
    /// Access rights in VMCS layout.
    pub access_rights: SegmentAccessRights,
}

impl Segment {
    /// A null, unusable segment.
    pub const fn invalid() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0,
            access_rights: SegmentAccessRights::UNUSABLE,
        }
    }

    /// Decodes the descriptor `selector` refers to in `gdt`.
    ///
    /// Null selectors, selectors into an LDT and selectors past the end of
    /// the table give an unusable segment.
    pub fn from_descriptor_table(selector: SegmentSelector, gdt: &[u64]) -> Self {
        let index = selector.index() as usize;
        if index == 0 || selector.contains(SegmentSelector::TI_LDT) || index >= gdt.len() {
            return Self {
                selector,
                ..Self::invalid()
            };
        }

        let desc = gdt[index];
        let access_rights = SegmentAccessRights::from_descriptor(desc);

        let mut base = desc.get_bits(16..40) | desc.get_bits(56..64) << 24;
        if !access_rights.contains(SegmentAccessRights::CODE_DATA) {
            // System descriptors are 16 bytes wide in long mode.
            if let Some(high) = gdt.get(index + 1) {
                base |= high.get_bits(0..32) << 32;
            }
        }

        let mut limit = (desc.get_bits(0..16) | desc.get_bits(48..52) << 16) as u32;
        if access_rights.contains(SegmentAccessRights::GRANULARITY) {
            limit = (limit << 12) | 0xfff;
        }

        Self {
            selector,
            base,
            limit,
            access_rights,
        }
    }
}

/// 64-bit ring-0 code descriptor used for the host `CS`.
pub const HOST_CODE_DESCRIPTOR: u64 = 0x00af_9b00_0000_ffff;

/// Encodes the two GDT slots of an available 64-bit TSS descriptor.
pub fn tss_descriptor(base: u64, limit: u32) -> [u64; 2] {
    let mut low = 0u64;
    low.set_bits(0..16, limit.get_bits(0..16) as u64);
    low.set_bits(16..40, base.get_bits(0..24));
    low.set_bits(40..44, SegmentAccessRights::TSS_AVAIL.type_field() as u64);
    low.set_bit(47, true);
    low.set_bits(48..52, limit.get_bits(16..20) as u64);
    low.set_bits(56..64, base.get_bits(24..32));
    [low, base.get_bits(32..64)]
}
