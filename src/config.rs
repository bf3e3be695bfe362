//! Compile-time configuration of the controller.

use x86::Ring;
use x86::segmentation::SegmentSelector;

/// Selector of the 64-bit code descriptor in the host GDT.
pub const HOST_CS_SELECTOR: SegmentSelector = SegmentSelector::new(1, Ring::Ring0);
/// Selector of the TSS descriptor in the host GDT.
pub const HOST_TR_SELECTOR: SegmentSelector = SegmentSelector::new(2, Ring::Ring0);

/// Number of 8-byte slots in the host GDT: null, code, and the two halves of
/// the TSS descriptor.
pub const HOST_GDT_DESCRIPTOR_COUNT: usize = 4;
/// Number of gates in the host IDT.
pub const HOST_IDT_DESCRIPTOR_COUNT: usize = 256;
/// Size of the stack VM exits and host interrupts run on.
pub const HOST_STACK_SIZE: usize = 0x6000;

/// VPID tagging the guest's TLB entries when EPT is in use.
pub const GUEST_VPID: u16 = 1;

/// Processors addressable by the per-processor table, indexed by initial APIC id.
pub const MAX_CPUS: usize = 256;

/// CPUID round trips timed when calibrating the VM-exit latency.
pub const TSC_LATENCY_ROUNDS: usize = 10;

/// Value a guest passes in `RCX` to have `VMCALL` treated as a hypercall.
pub const HYPERCALL_KEY: u64 = 0x7876_6d78_6876_6d78;

/// Vendor signature reported through CPUID leaf `0x4000_0000`.
pub const HYPERVISOR_SIGNATURE: [u8; 12] = *b"VmxVcpuHost\0";
