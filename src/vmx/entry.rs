//! Assembly entry points: the launch trampoline, the VM-exit landing point,
//! the host exception stubs and the fault-tolerant MSR accessors.

use core::arch::global_asm;

use super::ExitAction;
use super::definitions::VmxInstructionError;
use super::host::{HOST_EXCEPTION_VECTORS, TrapFrame};
use super::percpu::{self, ExitTarget, FaultFixup};
use super::vmcs::{VmcsGuestNW, VmcsReadOnly32};
use crate::regs::GuestContext;

global_asm!(
    ".global vmx_vcpu_launch",
    "vmx_vcpu_launch:",
    // The guest resumes right where VMLAUNCH was issued from, on the same
    // stack, and returns 1 to the caller.
    "mov rax, {guest_rsp}",
    "vmwrite rax, rsp",
    "mov rax, {guest_rip}",
    "lea rcx, [rip + 2f]",
    "vmwrite rax, rcx",
    "vmlaunch",
    "xor eax, eax",
    "ret",
    "2:",
    "mov eax, 1",
    "ret",
    guest_rsp = const VmcsGuestNW::RSP as u32,
    guest_rip = const VmcsGuestNW::RIP as u32,
);

global_asm!(
    ".global vmx_vcpu_exit_landing",
    "vmx_vcpu_exit_landing:",
    // Space for the iret frame of GuestContext, filled in by the handler.
    "sub rsp, {iret_frame_size}",
    save_regs_to_stack!(),
    "mov rdi, rsp",
    "sub rsp, 8",
    "call {dispatch_exit}",
    "add rsp, 8",
    "test al, al",
    "jz 3f",
    restore_regs_from_stack!(),
    "vmresume",
    "sub rsp, 8",
    "call {resume_failed}",
    "3:",
    restore_regs_from_stack!(),
    "iretq",
    iret_frame_size = const GuestContext::IRET_FRAME_SIZE,
    dispatch_exit = sym vmx_vcpu_dispatch_exit,
    resume_failed = sym vmx_vcpu_resume_failed,
);

global_asm!(
    ".macro VMX_VCPU_ISR vector, has_error_code",
    ".global vmx_vcpu_isr_\\vector",
    "vmx_vcpu_isr_\\vector:",
    ".if \\has_error_code == 0",
    "push 0",
    ".endif",
    "push \\vector",
    "jmp vmx_vcpu_isr_common",
    ".endm",
    ".irp vector, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,22,23,24,25,26,27,28,31",
    "VMX_VCPU_ISR \\vector, 0",
    ".endr",
    ".irp vector, 8,10,11,12,13,14,17,21,29,30",
    "VMX_VCPU_ISR \\vector, 1",
    ".endr",
    "vmx_vcpu_isr_common:",
    save_regs_to_stack!(),
    "mov rdi, rsp",
    "sub rsp, 8",
    "call {handle_host_interrupt}",
    "add rsp, 8",
    restore_regs_from_stack!(),
    // vector and error code
    "add rsp, 16",
    "iretq",
    handle_host_interrupt = sym vmx_vcpu_handle_host_interrupt,
);

global_asm!(
    ".global vmx_vcpu_rdmsr_checked",
    "vmx_vcpu_rdmsr_checked:",
    "mov ecx, edi",
    ".global vmx_vcpu_rdmsr_fault",
    "vmx_vcpu_rdmsr_fault:",
    "rdmsr",
    "shl rdx, 32",
    "or rax, rdx",
    "mov [rsi], rax",
    "mov eax, 1",
    "ret",
    ".global vmx_vcpu_rdmsr_fixup",
    "vmx_vcpu_rdmsr_fixup:",
    "xor eax, eax",
    "ret",
    ".global vmx_vcpu_wrmsr_checked",
    "vmx_vcpu_wrmsr_checked:",
    "mov ecx, edi",
    "mov eax, esi",
    "mov rdx, rsi",
    "shr rdx, 32",
    ".global vmx_vcpu_wrmsr_fault",
    "vmx_vcpu_wrmsr_fault:",
    "wrmsr",
    "mov eax, 1",
    "ret",
    ".global vmx_vcpu_wrmsr_fixup",
    "vmx_vcpu_wrmsr_fixup:",
    "xor eax, eax",
    "ret",
);

unsafe extern "C" {
    /// Issues `VMLAUNCH` with the caller's stack and return address as guest
    /// state. Returns 1 in the guest, 0 if the launch failed.
    pub(crate) fn vmx_vcpu_launch() -> u64;
    /// Host `RIP` of every VM exit.
    pub(crate) fn vmx_vcpu_exit_landing();
    /// `RDMSR` that returns `false` instead of faulting.
    pub(crate) fn vmx_vcpu_rdmsr_checked(msr: u32, value: *mut u64) -> bool;
    /// `WRMSR` that returns `false` instead of faulting.
    pub(crate) fn vmx_vcpu_wrmsr_checked(msr: u32, value: u64) -> bool;

    static vmx_vcpu_rdmsr_fault: u8;
    static vmx_vcpu_rdmsr_fixup: u8;
    static vmx_vcpu_wrmsr_fault: u8;
    static vmx_vcpu_wrmsr_fixup: u8;
}

macro_rules! host_exception_stubs {
    ($($vector: literal),* $(,)?) => {
        paste::paste! {
            unsafe extern "C" {
                $(fn [<vmx_vcpu_isr_ $vector>]();)*
            }

            /// Entry points of the host exception stubs, indexed by vector.
            pub fn host_exception_stubs() -> [usize; HOST_EXCEPTION_VECTORS] {
                [$([<vmx_vcpu_isr_ $vector>] as unsafe extern "C" fn() as usize),*]
            }
        }
    };
}

host_exception_stubs!(
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25,
    26, 27, 28, 29, 30, 31,
);

/// Host `RIP` programmed into the VMCS.
pub fn exit_landing_address() -> u64 {
    vmx_vcpu_exit_landing as unsafe extern "C" fn() as u64
}

/// Instructions in the checked MSR accessors that may raise #GP.
fn msr_fault_fixups() -> [FaultFixup; 2] {
    let addr = |sym: &u8| sym as *const u8 as u64;
    unsafe {
        [
            FaultFixup {
                fault: addr(&vmx_vcpu_rdmsr_fault),
                fixup: addr(&vmx_vcpu_rdmsr_fixup),
            },
            FaultFixup {
                fault: addr(&vmx_vcpu_wrmsr_fault),
                fixup: addr(&vmx_vcpu_wrmsr_fixup),
            },
        ]
    }
}

fn current_apic_id() -> u32 {
    raw_cpuid::cpuid!(1).ebx >> 24
}

extern "C" fn vmx_vcpu_dispatch_exit(ctx: &mut GuestContext) -> bool {
    let apic_id = current_apic_id();
    let Some(target) = percpu::exit_target(apic_id) else {
        panic!("VM exit on processor {apic_id} without a registered vcpu");
    };
    unsafe { ExitTarget::dispatch(target, ctx) == ExitAction::Resume }
}

extern "C" fn vmx_vcpu_resume_failed() -> ! {
    let error = unsafe { x86::bits64::vmx::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32) }
        .map_or(VmxInstructionError::from(0), |code| VmxInstructionError::from(code as u32));
    panic!("VMRESUME failed: {:?}", error);
}

extern "C" fn vmx_vcpu_handle_host_interrupt(frame: &mut TrapFrame) {
    let apic_id = current_apic_id();
    if !percpu::handle_host_interrupt(apic_id, frame, &msr_fault_fixups()) {
        panic!(
            "unhandled exception {} (error code {:#x}) in root operation on processor {}:\n{:#x?}",
            frame.vector, frame.error_code, apic_id, frame
        );
    }
}
