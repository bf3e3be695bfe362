use x86_64::structures::tss::TaskStateSegment;

use crate::config::{
    HOST_CS_SELECTOR, HOST_GDT_DESCRIPTOR_COUNT, HOST_IDT_DESCRIPTOR_COUNT, HOST_STACK_SIZE,
    HOST_TR_SELECTOR,
};
use crate::regs::GeneralRegisters;
use crate::segmentation::{HOST_CODE_DESCRIPTOR, tss_descriptor};

/// Number of exception vectors routed to host handlers.
pub const HOST_EXCEPTION_VECTORS: usize = 32;

/// A 64-bit IDT gate descriptor. (SDM Vol. 3A, Section 6.14.1)
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_middle: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    /// Present, DPL 0, 64-bit interrupt gate.
    const INTERRUPT_GATE: u8 = 0x8e;

    /// An interrupt gate to `handler` in the host code segment.
    pub fn interrupt_gate(handler: usize) -> Self {
        Self {
            offset_low: handler as u16,
            selector: HOST_CS_SELECTOR.bits(),
            ist: 0,
            attributes: Self::INTERRUPT_GATE,
            offset_middle: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    pub fn handler(&self) -> usize {
        self.offset_low as usize | (self.offset_middle as usize) << 16 | (self.offset_high as usize) << 32
    }

    pub fn is_present(&self) -> bool {
        self.attributes & 0x80 != 0
    }
}

#[repr(C, align(16))]
struct HostStack([u8; HOST_STACK_SIZE]);

/// Descriptor tables, TSS and stack the processor uses in root operation
/// while a session is active.
///
/// None of it is shared with the kernel that was running before: exits and
/// host exceptions are handled entirely on these structures.
#[repr(C, align(4096))]
pub struct HostEnvironment {
    idt: [IdtEntry; HOST_IDT_DESCRIPTOR_COUNT],
    stack: HostStack,
    gdt: [u64; HOST_GDT_DESCRIPTOR_COUNT],
    tss: TaskStateSegment,
}

impl HostEnvironment {
    /// Fills the GDT, TSS and IDT. `exception_stubs[v]` handles vector `v`;
    /// vectors from 32 up stay not-present since the host runs with
    /// interrupts disabled.
    pub fn build(&mut self, exception_stubs: &[usize; HOST_EXCEPTION_VECTORS]) {
        self.tss = TaskStateSegment::new();

        let [tss_low, tss_high] = tss_descriptor(
            self.tss_base(),
            (core::mem::size_of::<TaskStateSegment>() - 1) as u32,
        );
        self.gdt = [0; HOST_GDT_DESCRIPTOR_COUNT];
        self.gdt[HOST_CS_SELECTOR.index() as usize] = HOST_CODE_DESCRIPTOR;
        self.gdt[HOST_TR_SELECTOR.index() as usize] = tss_low;
        self.gdt[HOST_TR_SELECTOR.index() as usize + 1] = tss_high;

        self.idt = [IdtEntry::default(); HOST_IDT_DESCRIPTOR_COUNT];
        for (entry, &stub) in self.idt.iter_mut().zip(exception_stubs) {
            *entry = IdtEntry::interrupt_gate(stub);
        }
    }

    /// Initial host `RSP`, 16-byte aligned.
    pub fn stack_top(&self) -> u64 {
        self.stack.0.as_ptr_range().end as u64
    }

    pub fn gdt_base(&self) -> u64 {
        self.gdt.as_ptr() as u64
    }

    pub fn idt_base(&self) -> u64 {
        self.idt.as_ptr() as u64
    }

    pub fn tss_base(&self) -> u64 {
        &self.tss as *const TaskStateSegment as u64
    }

    pub fn gdt(&self) -> &[u64; HOST_GDT_DESCRIPTOR_COUNT] {
        &self.gdt
    }

    pub fn idt(&self) -> &[IdtEntry; HOST_IDT_DESCRIPTOR_COUNT] {
        &self.idt
    }
}

/// Register state saved by the host exception stubs.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TrapFrame {
    pub regs: GeneralRegisters,
    pub vector: u64,
    /// Error code pushed by the processor, or 0 for vectors without one.
    pub error_code: u64,

    // pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::{Segment, SegmentAccessRights};
    use alloc::boxed::Box;

    fn new_env() -> Box<HostEnvironment> {
        unsafe { Box::new_zeroed().assume_init() }
    }

    #[test]
    fn test_layout() {
        assert_eq!(core::mem::size_of::<IdtEntry>(), 16);
        assert_eq!(core::mem::align_of::<HostEnvironment>(), 4096);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 23 * 8);
    }

    #[test]
    fn test_build_descriptor_tables() {
        let mut env = new_env();
        let stubs: [usize; HOST_EXCEPTION_VECTORS] =
            core::array::from_fn(|v| 0xffff_8000_0010_0000 + v * 0x10);
        env.build(&stubs);

        let cs = Segment::from_descriptor_table(HOST_CS_SELECTOR, env.gdt());
        assert!(cs.access_rights.contains(SegmentAccessRights::LONG_MODE));

        let tr = Segment::from_descriptor_table(HOST_TR_SELECTOR, env.gdt());
        assert_eq!(tr.base, env.tss_base());
        assert_eq!(tr.limit, 103);
        assert_eq!(tr.access_rights.type_field(), 0b1001);

        assert_eq!(env.idt()[13].handler(), stubs[13]);
        assert!(env.idt()[31].is_present());
        assert!(!env.idt()[32].is_present());
        assert!(!env.idt()[255].is_present());
    }

    #[test]
    fn test_stack_top_alignment() {
        let env = new_env();
        assert_eq!(env.stack_top() % 16, 0);
        assert!(env.stack_top() > env.idt_base());
    }
}
