//! VM-exit dispatch against a launched controller.

use alloc::boxed::Box;

use super::launched_vcpu;
use crate::config::{HYPERCALL_KEY, HYPERVISOR_SIGNATURE};
use crate::test_utils::mock::{MockCpuConfig, MockHal};
use crate::vmx::percpu::{self, ExitTarget};
use crate::vmx::vmcs::controls::PrimaryControls;
use crate::vmx::vmcs::{
    VmcsControl32, VmcsControlNW, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsReadOnly32, VmcsReadOnlyNW,
};
use crate::{ExitAction, GuestContext, InvVpidKind, Vcpu, VcpuState, VmxExitReason};

const GUEST_RIP: u64 = 0xffff_8000_0040_1000;
const GUEST_RSP: u64 = 0xffff_8000_0080_0000;

/// `#GP(0)`: vector 13, hardware exception, error code delivered.
const INJECT_GP: u64 = 0x8000_0b0d;
/// `#UD`: vector 6, hardware exception.
const INJECT_UD: u64 = 0x8000_0306;
/// NMI: vector 2, NMI type.
const INJECT_NMI: u64 = 0x8000_0202;

type TestVcpu = Box<Vcpu<MockHal>>;

/// Makes the simulated processor report an exit for `reason` caused by an
/// instruction of `len` bytes at [`GUEST_RIP`].
fn simulate_exit(vcpu: &mut TestVcpu, reason: u32, len: u32) {
    let cpu = vcpu.cpu_mut();
    cpu.set_vmcs_field(VmcsReadOnly32::EXIT_REASON as u32, reason as u64);
    cpu.set_vmcs_field(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32, len as u64);
    cpu.set_vmcs_field(VmcsGuestNW::RIP as u32, GUEST_RIP);
    cpu.set_vmcs_field(VmcsGuestNW::RSP as u32, GUEST_RSP);
    cpu.set_vmcs_field(VmcsGuestNW::RFLAGS as u32, 0x2);
    cpu.set_vmcs_field(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32, 0);
}

fn injected_event(vcpu: &TestVcpu) -> u64 {
    vcpu.cpu()
        .vmcs_field(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32)
        .unwrap_or(0)
}

fn primary_controls(vcpu: &TestVcpu) -> PrimaryControls {
    let raw = vcpu
        .cpu()
        .vmcs_field(VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS as u32)
        .unwrap_or(0);
    PrimaryControls::from_bits_truncate(raw as u32)
}

#[test]
fn test_cpuid_hypervisor_leaves() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x70));
    let mut ctx = GuestContext::default();
    ctx.regs.rax = 0x4000_0000;

    simulate_exit(&mut vcpu, VmxExitReason::CPUID as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);

    let mut signature = [0u8; 12];
    signature[0..4].copy_from_slice(&(ctx.regs.rbx as u32).to_le_bytes());
    signature[4..8].copy_from_slice(&(ctx.regs.rcx as u32).to_le_bytes());
    signature[8..12].copy_from_slice(&(ctx.regs.rdx as u32).to_le_bytes());
    assert_eq!(signature, HYPERVISOR_SIGNATURE);
    assert_eq!(ctx.regs.rax, 0x4000_0001);

    assert_eq!(ctx.rip, GUEST_RIP + 2);
    assert_eq!(ctx.rsp, GUEST_RSP);
    assert_eq!(
        vcpu.cpu().vmcs_field(VmcsGuestNW::RIP as u32),
        Some(GUEST_RIP + 2)
    );
}

#[test]
fn test_cpuid_feature_leaf_hides_vmx() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x71));
    let mut ctx = GuestContext::default();
    ctx.regs.rax = 0x1;

    simulate_exit(&mut vcpu, VmxExitReason::CPUID as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_ne!(ctx.regs.rcx & (1 << 31), 0);
    assert_eq!(ctx.regs.rcx & (1 << 5), 0);
    assert_eq!(ctx.regs.rbx >> 24, 0x71);
}

#[test]
fn test_single_step_over_emulated_instruction() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x72));
    let mut ctx = GuestContext::default();

    simulate_exit(&mut vcpu, VmxExitReason::CPUID as u32, 2);
    let cpu = vcpu.cpu_mut();
    cpu.set_vmcs_field(VmcsGuestNW::RFLAGS as u32, 0x102);
    cpu.set_vmcs_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32, 0x1);

    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    let cpu = vcpu.cpu();
    assert_eq!(
        cpu.vmcs_field(VmcsGuestNW::PENDING_DBG_EXCEPTIONS as u32),
        Some(1 << 14)
    );
    assert_eq!(
        cpu.vmcs_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32),
        Some(0)
    );
}

#[test]
fn test_rdmsr_of_switched_msr_reads_guest_field() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x73));
    let mut ctx = GuestContext::default();
    ctx.regs.rcx = 0xc000_0080;
    ctx.regs.rax = 0xdead;

    simulate_exit(&mut vcpu, VmxExitReason::MSR_READ as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(ctx.regs.rax, 0xd01);
    assert_eq!(ctx.regs.rdx, 0);
    assert_eq!(ctx.rip, GUEST_RIP + 2);
}

#[test]
fn test_faulting_rdmsr_injects_gp() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x74));
    let mut ctx = GuestContext::default();
    ctx.regs.rcx = 0x1234;

    simulate_exit(&mut vcpu, VmxExitReason::MSR_READ as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), INJECT_GP);
    assert_eq!(ctx.rip, GUEST_RIP);
}

#[test]
fn test_wrmsr_passes_through() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x75));
    let mut ctx = GuestContext::default();
    ctx.regs.rcx = 0xc000_0102;
    ctx.regs.rdx = 0xffff_8000;
    ctx.regs.rax = 0x1234_5000;

    simulate_exit(&mut vcpu, VmxExitReason::MSR_WRITE as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().msr(0xc000_0102), Some(0xffff_8000_1234_5000));
    assert_eq!(injected_event(&vcpu), 0);

    // PAT lives in the guest-state area while the guest runs.
    ctx.regs.rcx = 0x277;
    ctx.regs.rdx = 0;
    ctx.regs.rax = 0x0606;
    simulate_exit(&mut vcpu, VmxExitReason::MSR_WRITE as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuest64::IA32_PAT as u32), Some(0x0606));
}

#[test]
fn test_xsetbv_checks() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x76));
    let mut ctx = GuestContext::default();

    ctx.regs.rax = 0x7;
    simulate_exit(&mut vcpu, VmxExitReason::XSETBV as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().xcr0(), 0x7);
    assert_eq!(ctx.rip, GUEST_RIP + 3);

    // AVX without SSE, no x87, an unsupported component, and a bad XCR index.
    for (rcx, value) in [(0, 0x5), (0, 0x6), (0, 0xf), (1, 0x7)] {
        ctx.regs.rcx = rcx;
        ctx.regs.set_edx_eax(value);
        simulate_exit(&mut vcpu, VmxExitReason::XSETBV as u32, 3);
        assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
        assert_eq!(injected_event(&vcpu), INJECT_GP, "XSETBV {rcx} <- {value:#x}");
        assert_eq!(ctx.rip, GUEST_RIP);
    }
    assert_eq!(vcpu.cpu().xcr0(), 0x7);
}

#[test]
fn test_invd_and_vmx_instructions() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x77));
    let mut ctx = GuestContext::default();

    simulate_exit(&mut vcpu, VmxExitReason::INVD as u32, 2);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().wbinvd_count(), 1);

    simulate_exit(&mut vcpu, VmxExitReason::VMON as u32, 4);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), INJECT_UD);

    simulate_exit(&mut vcpu, VmxExitReason::GETSEC as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), INJECT_GP);
}

#[test]
fn test_cr_access() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x78));
    let mut ctx = GuestContext::default();
    let qualification = VmcsReadOnlyNW::EXIT_QUALIFICATION as u32;

    // mov cr3, rbx
    ctx.regs.rbx = 0x0055_5000;
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 3 | 3 << 8);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuestNW::CR3 as u32), Some(0x0055_5000));
    assert_eq!(vcpu.cpu().invvpids(), &[(InvVpidKind::SingleContext, 1)]);

    // With CR4.PCIDE, bit 63 keeps the guest's translations and never reaches
    // the guest CR3 field.
    vcpu.cpu_mut().set_vmcs_field(VmcsGuestNW::CR4 as u32, 0x0036_26a0);
    ctx.regs.rbx = 0x8000_0000_0055_5001;
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 3 | 3 << 8);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuestNW::CR3 as u32), Some(0x0055_5001));
    assert_eq!(vcpu.cpu().invvpids().len(), 1);

    ctx.regs.rbx = 0x0055_5002;
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 3 | 3 << 8);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().invvpids().len(), 2);
    ctx.regs.rbx = 0x0055_5000;
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 3 | 3 << 8);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);

    // mov rsp, cr3
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 3 | 1 << 4 | 4 << 8);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(ctx.rsp, 0x0055_5000);
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuestNW::RSP as u32), Some(0x0055_5000));

    // clts
    let shadow = VmcsControlNW::CR0_READ_SHADOW as u32;
    vcpu.cpu_mut().set_vmcs_field(shadow, 0x8005_003b);
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 2);
    vcpu.cpu_mut().set_vmcs_field(qualification, 2 << 4);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().vmcs_field(shadow), Some(0x8005_0033));
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuestNW::CR0 as u32), Some(0x8005_0033));

    // mov cr4, rax keeps VMXE in the real register only
    ctx.regs.rax = 0x0034_06a0;
    simulate_exit(&mut vcpu, VmxExitReason::CR_ACCESS as u32, 3);
    vcpu.cpu_mut().set_vmcs_field(qualification, 4);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(vcpu.cpu().vmcs_field(VmcsGuestNW::CR4 as u32), Some(0x0034_26a0));
    assert_eq!(
        vcpu.cpu().vmcs_field(VmcsControlNW::CR4_READ_SHADOW as u32),
        Some(0x0034_06a0)
    );
}

#[test]
fn test_vmcall_ping_and_rejection() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x79));
    let mut ctx = GuestContext::default();

    ctx.regs.rcx = HYPERCALL_KEY;
    ctx.regs.rax = 0;
    ctx.regs.rdx = 0x5555;
    simulate_exit(&mut vcpu, VmxExitReason::VMCALL as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(ctx.regs.rax, 0);
    assert_eq!(ctx.rip, GUEST_RIP + 3);
    assert_eq!(injected_event(&vcpu), 0);

    ctx.regs.rcx = HYPERCALL_KEY ^ 1;
    simulate_exit(&mut vcpu, VmxExitReason::VMCALL as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), INJECT_UD);
    assert_eq!(ctx.rip, GUEST_RIP);

    ctx.regs.rcx = HYPERCALL_KEY;
    ctx.regs.rax = 0x99;
    simulate_exit(&mut vcpu, VmxExitReason::VMCALL as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), INJECT_UD);
    assert_eq!(vcpu.state(), VcpuState::Launched);
}

#[test]
fn test_vmcall_terminate_restores_processor() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7a));
    let mut ctx = GuestContext::default();
    ctx.regs.rcx = HYPERCALL_KEY;
    ctx.regs.rax = 1;

    simulate_exit(&mut vcpu, VmxExitReason::VMCALL as u32, 3);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Terminate);

    assert_eq!(vcpu.state(), VcpuState::Terminated);
    assert_eq!(ctx.rip, GUEST_RIP + 3);
    assert_eq!(ctx.rsp, GUEST_RSP);
    assert_eq!(ctx.cs, 0x10);
    assert_eq!(ctx.ss, 0x18);

    let cpu = vcpu.cpu();
    assert!(!cpu.in_vmx_operation());
    let restored = cpu.restored_context().unwrap();
    assert_eq!(restored.cr4, 0x0034_06a0);
    assert_eq!(restored.cr3, 0x0010_0000);
    assert_eq!(restored.efer, 0xd01);
    assert_eq!(restored.tr.selector.bits(), 0x40);
    assert_eq!(cpu.cr4(), 0x0034_06a0);
    assert!(percpu::exit_target(0x7a).is_none());
}

#[test]
fn test_unhandled_exits_terminate() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7b));
    let mut ctx = GuestContext::default();
    simulate_exit(&mut vcpu, VmxExitReason::HLT as u32, 1);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Terminate);
    assert_eq!(vcpu.state(), VcpuState::Terminated);
    assert_eq!(ctx.rip, GUEST_RIP);

    // VM-entry failure due to invalid guest state.
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7c));
    simulate_exit(&mut vcpu, 1 << 31 | VmxExitReason::INVALID_GUEST_STATE as u32, 0);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Terminate);
    assert!(!vcpu.cpu().in_vmx_operation());
}

#[test]
fn test_nmi_is_reinjected_through_window() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7d));
    let mut ctx = GuestContext::default();

    simulate_exit(&mut vcpu, VmxExitReason::EXCEPTION_NMI as u32, 0);
    vcpu.cpu_mut()
        .set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32, INJECT_NMI);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(percpu::pending_nmis(0x7d), 1);
    assert_eq!(injected_event(&vcpu), 0);
    assert!(primary_controls(&vcpu).contains(PrimaryControls::NMI_WINDOW_EXITING));

    simulate_exit(&mut vcpu, VmxExitReason::NMI_WINDOW as u32, 0);
    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(percpu::pending_nmis(0x7d), 0);
    assert_eq!(injected_event(&vcpu), INJECT_NMI);
    assert!(!primary_controls(&vcpu).contains(PrimaryControls::NMI_WINDOW_EXITING));
}

#[test]
fn test_guest_exception_is_reflected() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7e));
    let mut ctx = GuestContext::default();

    // #PF with error code 2.
    simulate_exit(&mut vcpu, VmxExitReason::EXCEPTION_NMI as u32, 0);
    let cpu = vcpu.cpu_mut();
    cpu.set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32, 0x8000_0b0e);
    cpu.set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE as u32, 2);

    assert_eq!(vcpu.handle_exit(&mut ctx), ExitAction::Resume);
    assert_eq!(injected_event(&vcpu), 0x8000_0b0e);
    assert_eq!(
        vcpu.cpu()
            .vmcs_field(VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE as u32),
        Some(2)
    );
    assert_eq!(percpu::pending_nmis(0x7e), 0);
}

#[test]
fn test_exit_dispatched_through_processor_table() {
    let mut vcpu = launched_vcpu(MockCpuConfig::with_apic_id(0x7f));
    simulate_exit(&mut vcpu, VmxExitReason::CPUID as u32, 2);

    let target = percpu::exit_target(0x7f).unwrap();
    assert_eq!(
        target.as_ptr() as usize,
        &*vcpu as *const Vcpu<MockHal> as usize
    );

    let mut ctx = GuestContext::default();
    ctx.regs.rax = 0x4000_0001;
    ctx.regs.rbx = 0xffff;
    let action = unsafe { ExitTarget::dispatch(target, &mut ctx) };
    assert_eq!(action, ExitAction::Resume);
    assert_eq!(ctx.regs.rbx, 0);
    assert_eq!(ctx.rip, GUEST_RIP + 2);
}
