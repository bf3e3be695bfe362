use crate::segmentation::Segment;

/// Base and limit of a descriptor table, as stored by `SGDT`/`SIDT`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    /// Linear base address.
    pub base: u64,
    /// Limit in bytes, one less than the table size.
    pub limit: u16,
}

impl DescriptorTable {
    /// Number of 8-byte slots covered by the limit.
    pub fn entry_count(&self) -> usize {
        (self.limit as usize + 1) / core::mem::size_of::<u64>()
    }
}

/// System state of a logical processor outside its general-purpose
/// registers.
///
/// Captured while activating to seed the guest fields, and rebuilt from the
/// guest fields when the session ends so the processor continues with the
/// guest's last state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorContext {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rflags: u64,

    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,

    pub debugctl: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub efer: u64,
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self {
            cr0: 0,
            cr3: 0,
            cr4: 0,
            dr7: 0x400,
            rflags: 0x2,
            es: Segment::invalid(),
            cs: Segment::invalid(),
            ss: Segment::invalid(),
            ds: Segment::invalid(),
            fs: Segment::invalid(),
            gs: Segment::invalid(),
            ldtr: Segment::invalid(),
            tr: Segment::invalid(),
            gdt: DescriptorTable::default(),
            idt: DescriptorTable::default(),
            debugctl: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pat: 0,
            efer: 0,
        }
    }
}
