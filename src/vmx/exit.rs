//! VM-exit dispatch.
//!
//! Runs on the host stack with interrupts disabled, once per exit, and never
//! re-entered: the landing point only reaches it again after the next
//! `VMRESUME`.

use bit_field::BitField;
use raw_cpuid::CpuIdResult;
use x86::controlregs::Xcr0;
use x86::irq::{GENERAL_PROTECTION_FAULT_VECTOR, INVALID_OPCODE_VECTOR, NONMASKABLE_INTERRUPT_VECTOR};
use x86::segmentation::SegmentSelector;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use super::definitions::{VmxExitReason, VmxInterruptionType};
use super::percpu;
use super::vcpu::{ExitAction, Vcpu, VcpuState};
use super::vmcs::controls::PrimaryControls;
use super::vmcs::{
    self, CrField, VmcsControlNW, VmcsControl32, VmcsGuest16, VmcsGuest32, VmcsGuest64,
    VmcsGuestNW, VmcsReadOnly32, VmxControl, VmxExitInfo, VmxInterruptInfo,
};
use crate::config::{GUEST_VPID, HYPERCALL_KEY, HYPERVISOR_SIGNATURE};
use crate::context::{DescriptorTable, ProcessorContext};
use crate::cpu::VmxCpu;
use crate::msr::Msr;
use crate::regs::GuestContext;
use crate::segmentation::{Segment, SegmentAccessRights};
use crate::{Hal, Result, VmxError};

const LEAF_FEATURE_INFO: u32 = 0x1;
const LEAF_HYPERVISOR_INFO: u32 = 0x4000_0000;
const LEAF_HYPERVISOR_FEATURE: u32 = 0x4000_0001;
const FEATURE_VMX: usize = 5;
const FEATURE_HYPERVISOR: usize = 31;

const HYPERCALL_PING: u64 = 0;
const HYPERCALL_TERMINATE: u64 = 1;

/// Interruptibility-state bits cleared when an instruction is skipped.
const BLOCKING_BY_STI: u32 = 1 << 0;
const BLOCKING_BY_MOV_SS: u32 = 1 << 1;
/// Single-step bit of the pending debug exceptions field.
const PENDING_DBG_BS: u64 = 1 << 14;

/// CR access types in the exit qualification.
const CR_ACCESS_MOV_TO: u8 = 0;
const CR_ACCESS_MOV_FROM: u8 = 1;
const CR_ACCESS_CLTS: u8 = 2;
const CR_ACCESS_LMSW: u8 = 3;

/// Register number of RSP in exit qualifications, which lives in
/// [`GuestContext::rsp`] rather than the register block.
const GPR_RSP: u8 = 4;

/// The VMCS guest field holding `msr` while the guest runs, for MSRs that
/// are switched by VM entry and exit.
fn guest_msr_field(msr: u32) -> Option<u32> {
    let field = match Msr::try_from(msr).ok()? {
        Msr::IA32_FS_BASE => VmcsGuestNW::FS_BASE as u32,
        Msr::IA32_GS_BASE => VmcsGuestNW::GS_BASE as u32,
        Msr::IA32_SYSENTER_CS => VmcsGuest32::IA32_SYSENTER_CS as u32,
        Msr::IA32_SYSENTER_ESP => VmcsGuestNW::IA32_SYSENTER_ESP as u32,
        Msr::IA32_SYSENTER_EIP => VmcsGuestNW::IA32_SYSENTER_EIP as u32,
        Msr::IA32_DEBUGCTL => VmcsGuest64::IA32_DEBUGCTL as u32,
        Msr::IA32_PAT => VmcsGuest64::IA32_PAT as u32,
        Msr::IA32_EFER => VmcsGuest64::IA32_EFER as u32,
        _ => return None,
    };
    Some(field)
}

fn signature_word(index: usize) -> u32 {
    let sig = &HYPERVISOR_SIGNATURE[index * 4..index * 4 + 4];
    u32::from_le_bytes([sig[0], sig[1], sig[2], sig[3]])
}

impl<H: Hal> Vcpu<H> {
    /// Handles one VM exit. `ctx` holds the guest registers saved by the
    /// landing point and is only valid for this call.
    ///
    /// Never fails: a problem that cannot be reflected into the guest ends the
    /// session, and `ctx` then describes where to continue in root operation.
    pub(crate) fn handle_exit(&mut self, ctx: &mut GuestContext) -> ExitAction {
        assert!(!self.in_exit, "nested VM exit");
        self.in_exit = true;

        #[cfg(feature = "tracing")]
        let before = *ctx;

        let action = match self.process_exit(ctx) {
            Ok(action) => action,
            Err(err) => {
                error!("[VMX] exit handling failed: {}", err);
                ExitAction::Terminate
            }
        };
        let action = match action {
            ExitAction::Resume => match self.prepare_resume(ctx) {
                Ok(()) => ExitAction::Resume,
                Err(err) => {
                    error!("[VMX] cannot resume guest: {}", err);
                    ExitAction::Terminate
                }
            },
            ExitAction::Terminate => ExitAction::Terminate,
        };
        if action == ExitAction::Terminate {
            if let Err(err) = self.terminate(ctx) {
                panic!("cannot return processor to normal operation: {}", err);
            }
        }

        #[cfg(feature = "tracing")]
        trace!("{:?}", crate::regs::GeneralRegistersDiff::new(before, *ctx));

        self.in_exit = false;
        action
    }

    fn process_exit(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        ctx.rip = VmcsGuestNW::RIP.read(&self.cpu)?;
        ctx.rsp = VmcsGuestNW::RSP.read(&self.cpu)?;
        ctx.rflags = VmcsGuestNW::RFLAGS.read(&self.cpu)?;

        let exit_info = vmcs::exit_info(&self.cpu)?;
        trace!("[VMX] exit at {:#x}: {:?}", ctx.rip, exit_info);
        self.dispatch(ctx, &exit_info)
    }

    fn dispatch(&mut self, ctx: &mut GuestContext, exit_info: &VmxExitInfo) -> Result<ExitAction> {
        if exit_info.entry_failure {
            error!("[VMX] VM entry failure: {:?}", exit_info);
            return Ok(ExitAction::Terminate);
        }
        let reason = match exit_info.exit_reason {
            Ok(reason) => reason,
            Err(raw) => {
                error!("[VMX] unknown exit reason {:#x}", raw);
                return Ok(ExitAction::Terminate);
            }
        };

        match reason {
            VmxExitReason::CPUID => self.handle_cpuid(ctx),
            VmxExitReason::MSR_READ => self.handle_rdmsr(ctx),
            VmxExitReason::MSR_WRITE => self.handle_wrmsr(ctx),
            VmxExitReason::XSETBV => self.handle_xsetbv(ctx),
            VmxExitReason::CR_ACCESS => self.handle_cr_access(ctx),
            VmxExitReason::INVD => {
                unsafe { self.cpu.wbinvd() };
                self.skip_instruction(ctx)
            }
            VmxExitReason::GETSEC => self.inject_gp(),
            VmxExitReason::VMCALL => self.handle_vmcall(ctx),
            VmxExitReason::EXCEPTION_NMI => self.handle_exception_nmi(),
            VmxExitReason::NMI_WINDOW => self.handle_nmi_window(),
            reason if reason.is_vmx_instruction() => self.inject_ud(),
            reason => {
                error!("[VMX] unhandled exit {:?} at {:#x}", reason, ctx.rip);
                Ok(ExitAction::Terminate)
            }
        }
    }

    /// Moves past the exiting instruction the way the processor would have.
    fn skip_instruction(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let len = VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read(&self.cpu)?;
        ctx.rip += len as u64;

        let interruptibility = VmcsGuest32::INTERRUPTIBILITY_STATE.read(&self.cpu)?;
        if interruptibility & (BLOCKING_BY_STI | BLOCKING_BY_MOV_SS) != 0 {
            VmcsGuest32::INTERRUPTIBILITY_STATE.write(
                &mut self.cpu,
                interruptibility & !(BLOCKING_BY_STI | BLOCKING_BY_MOV_SS),
            )?;
        }

        // SDM Vol. 3C, Section 27.3.1.5
        if ctx.rflags & RFlags::TRAP_FLAG.bits() != 0 {
            let pending = VmcsGuestNW::PENDING_DBG_EXCEPTIONS.read(&self.cpu)?;
            VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write(&mut self.cpu, pending | PENDING_DBG_BS)?;
        }
        Ok(ExitAction::Resume)
    }

    fn inject_gp(&mut self) -> Result<ExitAction> {
        warn!("[VMX] injecting #GP(0)");
        vmcs::inject_event(&mut self.cpu, GENERAL_PROTECTION_FAULT_VECTOR, Some(0))?;
        Ok(ExitAction::Resume)
    }

    fn inject_ud(&mut self) -> Result<ExitAction> {
        vmcs::inject_event(&mut self.cpu, INVALID_OPCODE_VECTOR, None)?;
        Ok(ExitAction::Resume)
    }

    fn handle_cpuid(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let leaf = ctx.regs.eax();
        let subleaf = ctx.regs.ecx();

        let mut res = match leaf {
            LEAF_HYPERVISOR_INFO => CpuIdResult {
                eax: LEAF_HYPERVISOR_FEATURE,
                ebx: signature_word(0),
                ecx: signature_word(1),
                edx: signature_word(2),
            },
            LEAF_HYPERVISOR_FEATURE => CpuIdResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            },
            _ => self.cpu.cpuid(leaf, subleaf),
        };
        if leaf == LEAF_FEATURE_INFO {
            res.ecx.set_bit(FEATURE_HYPERVISOR, true);
            res.ecx.set_bit(FEATURE_VMX, false);
        }

        trace!("[VMX] CPUID {:#x}.{:#x}: {:x?}", leaf, subleaf, res);
        ctx.regs.rax = res.eax as u64;
        ctx.regs.rbx = res.ebx as u64;
        ctx.regs.rcx = res.ecx as u64;
        ctx.regs.rdx = res.edx as u64;
        self.skip_instruction(ctx)
    }

    fn vmread_raw(&self, field: u32) -> Result<u64> {
        self.cpu.vmread(field).map_err(|fail| VmxError::VmcsAccess {
            field,
            fail: fail.into(),
        })
    }

    fn vmwrite_raw(&mut self, field: u32, value: u64) -> Result {
        unsafe { self.cpu.vmwrite(field, value) }.map_err(|fail| VmxError::VmcsAccess {
            field,
            fail: fail.into(),
        })
    }

    fn handle_rdmsr(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let msr = ctx.regs.ecx();
        let value = match guest_msr_field(msr) {
            Some(field) => self.vmread_raw(field)?,
            None => match self.cpu.read_msr_checked(msr) {
                Some(value) => value,
                None => {
                    warn!("[VMX] guest RDMSR {:#x} faulted", msr);
                    return self.inject_gp();
                }
            },
        };
        trace!("[VMX] RDMSR {:#x} -> {:#x}", msr, value);
        ctx.regs.set_edx_eax(value);
        self.skip_instruction(ctx)
    }

    fn handle_wrmsr(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let msr = ctx.regs.ecx();
        let value = ctx.regs.get_edx_eax();
        trace!("[VMX] WRMSR {:#x} <- {:#x}", msr, value);
        match guest_msr_field(msr) {
            Some(field) => self.vmwrite_raw(field, value)?,
            None => {
                if !self.cpu.write_msr_checked(msr, value) {
                    warn!("[VMX] guest WRMSR {:#x} <- {:#x} faulted", msr, value);
                    return self.inject_gp();
                }
            }
        }
        self.skip_instruction(ctx)
    }

    fn handle_xsetbv(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let xcr = ctx.regs.ecx();
        let value = ctx.regs.get_edx_eax();
        let unsupported = self.cdata()?.xcr0_unsupported_mask;

        let x87 = Xcr0::XCR0_FPU_MMX_STATE.bits();
        let sse = Xcr0::XCR0_SSE_STATE.bits();
        let avx = Xcr0::XCR0_AVX_STATE.bits();
        // SDM Vol. 2C, XSETBV
        if xcr != 0
            || value & x87 == 0
            || value & unsupported != 0
            || (value & avx != 0 && value & sse == 0)
        {
            warn!("[VMX] rejecting XSETBV {:#x} <- {:#x}", xcr, value);
            return self.inject_gp();
        }

        unsafe { self.cpu.xsetbv(xcr, value) };
        self.skip_instruction(ctx)
    }

    fn read_gpr(ctx: &GuestContext, gpr: u8) -> u64 {
        if gpr == GPR_RSP {
            ctx.rsp
        } else {
            ctx.regs.get_reg_of_index(gpr)
        }
    }

    fn write_gpr(ctx: &mut GuestContext, gpr: u8, value: u64) {
        if gpr == GPR_RSP {
            ctx.rsp = value;
        } else {
            ctx.regs.set_reg_of_index(gpr, value);
        }
    }

    /// Loads guest CR0, keeping VMX's fixed bits in the real register and the
    /// guest's value in the read shadow.
    fn set_guest_cr0(&mut self, value: u64) -> Result {
        let cached = *self.cdata()?;
        vmcs::write_cr(&mut self.cpu, &cached, CrField::GuestCr0, cached.adjust_cr0(value))?;
        VmcsControlNW::CR0_READ_SHADOW.write(&mut self.cpu, value)
    }

    fn set_guest_cr4(&mut self, value: u64) -> Result {
        let cached = *self.cdata()?;
        vmcs::write_cr(&mut self.cpu, &cached, CrField::GuestCr4, cached.adjust_cr4(value))?;
        VmcsControlNW::CR4_READ_SHADOW.write(&mut self.cpu, value)
    }

    /// Loads guest CR3 and drops the guest's cached translations unless it
    /// asked to keep them.
    fn set_guest_cr3(&mut self, value: u64) -> Result {
        // Reserved in the guest CR3 field.
        const CR3_PCID_NO_FLUSH: u64 = 1 << 63;
        VmcsGuestNW::CR3.write(&mut self.cpu, value & !CR3_PCID_NO_FLUSH)?;

        let pcide = VmcsGuestNW::CR4.read(&self.cpu)? & Cr4Flags::PCID.bits() != 0;
        if value & CR3_PCID_NO_FLUSH == 0 || !pcide {
            self.flush_guest_translations()?;
        }
        Ok(())
    }

    /// Invalidates the mappings tagged with the guest's VPID. Without VPID,
    /// every VM entry and exit already does.
    fn flush_guest_translations(&mut self) -> Result {
        if !self.vpid_enabled() {
            return Ok(());
        }
        let Some(kind) = self.cdata()?.invvpid_kind() else {
            warn!("[VMX] no INVVPID type available, guest TLB not flushed");
            return Ok(());
        };
        unsafe { self.cpu.invvpid(kind, GUEST_VPID) }
            .map_err(|fail| VmxError::InvalidationRejected(fail.into()))
    }

    fn handle_cr_access(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let info = vmcs::cr_access_info(&self.cpu)?;
        trace!("[VMX] CR access: {:?}", info);

        match (info.access_type, info.cr_number) {
            (CR_ACCESS_MOV_TO, 0) => self.set_guest_cr0(Self::read_gpr(ctx, info.gpr))?,
            (CR_ACCESS_MOV_TO, 3) => self.set_guest_cr3(Self::read_gpr(ctx, info.gpr))?,
            (CR_ACCESS_MOV_TO, 4) => self.set_guest_cr4(Self::read_gpr(ctx, info.gpr))?,
            (CR_ACCESS_MOV_FROM, 3) => {
                let cr3 = VmcsGuestNW::CR3.read(&self.cpu)?;
                Self::write_gpr(ctx, info.gpr, cr3);
            }
            (CR_ACCESS_CLTS, _) => {
                let ts = Cr0Flags::TASK_SWITCHED.bits();
                let shadow = VmcsControlNW::CR0_READ_SHADOW.read(&self.cpu)?;
                self.set_guest_cr0(shadow & !ts)?;
            }
            (CR_ACCESS_LMSW, _) => {
                // LMSW loads PE, MP, EM and TS but never clears PE.
                let shadow = VmcsControlNW::CR0_READ_SHADOW.read(&self.cpu)?;
                let source = info.lmsw_source_data as u64;
                self.set_guest_cr0((shadow & !0xe) | (source & 0xf))?;
            }
            _ => {
                error!("[VMX] unexpected CR access {:?}", info);
                return Ok(ExitAction::Terminate);
            }
        }
        self.skip_instruction(ctx)
    }

    fn handle_vmcall(&mut self, ctx: &mut GuestContext) -> Result<ExitAction> {
        let cpl = VmcsGuest16::CS_SELECTOR.read(&self.cpu)? & 0x3;
        if cpl != 0 || ctx.regs.rcx != HYPERCALL_KEY {
            return self.inject_ud();
        }
        match ctx.regs.rax {
            HYPERCALL_PING => {
                ctx.regs.rax = 0;
                self.skip_instruction(ctx)
            }
            HYPERCALL_TERMINATE => {
                info!("[VMX] guest requested termination");
                self.skip_instruction(ctx)?;
                Ok(ExitAction::Terminate)
            }
            _ => self.inject_ud(),
        }
    }

    fn handle_exception_nmi(&mut self) -> Result<ExitAction> {
        let info = VmxInterruptInfo::exit_info(&self.cpu)?;
        if info.int_type == VmxInterruptionType::NMI {
            // Reinjected once the guest can take it.
            percpu::queue_nmi(self.apic_id()?);
            return Ok(ExitAction::Resume);
        }
        warn!("[VMX] reinjecting {:?}", info);
        let reinjected = VmxInterruptInfo { valid: true, ..info };
        if let Some(err_code) = reinjected.err_code {
            VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE.write(&mut self.cpu, err_code)?;
        }
        VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write(&mut self.cpu, reinjected.bits())?;
        Ok(ExitAction::Resume)
    }

    fn handle_nmi_window(&mut self) -> Result<ExitAction> {
        if percpu::take_nmi(self.apic_id()?) {
            vmcs::inject_event(&mut self.cpu, NONMASKABLE_INTERRUPT_VECTOR, None)?;
        }
        Ok(ExitAction::Resume)
    }

    /// Stores the guest's new `RIP`/`RSP`/`RFLAGS` and opens an NMI window
    /// while NMIs are waiting for reinjection.
    fn prepare_resume(&mut self, ctx: &GuestContext) -> Result {
        VmcsGuestNW::RIP.write(&mut self.cpu, ctx.rip)?;
        VmcsGuestNW::RSP.write(&mut self.cpu, ctx.rsp)?;
        VmcsGuestNW::RFLAGS.write(&mut self.cpu, ctx.rflags)?;

        let cached = *self.cdata()?;
        let pending = percpu::pending_nmis(self.apic_id()?) > 0;
        vmcs::update_control(
            &mut self.cpu,
            &cached,
            VmxControl::PrimaryProcessorBased,
            PrimaryControls::NMI_WINDOW_EXITING.bits(),
            pending,
        )
    }

    /// Processor state the guest would have had without VMX, read back from
    /// the guest-state fields.
    fn guest_processor_context(&self) -> Result<ProcessorContext> {
        let cpu = &self.cpu;
        macro_rules! guest_segment {
            ($reg: ident) => {
                paste::paste! {
                    Segment {
                        selector: SegmentSelector::from_raw(VmcsGuest16::[<$reg _SELECTOR>].read(cpu)?),
                        base: VmcsGuestNW::[<$reg _BASE>].read(cpu)?,
                        limit: VmcsGuest32::[<$reg _LIMIT>].read(cpu)?,
                        access_rights: SegmentAccessRights::from_bits_truncate(
                            VmcsGuest32::[<$reg _ACCESS_RIGHTS>].read(cpu)?,
                        ),
                    }
                }
            };
        }

        Ok(ProcessorContext {
            cr0: VmcsGuestNW::CR0.read(cpu)?,
            cr3: VmcsGuestNW::CR3.read(cpu)?,
            cr4: VmcsGuestNW::CR4.read(cpu)? & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits(),
            dr7: VmcsGuestNW::DR7.read(cpu)?,
            rflags: VmcsGuestNW::RFLAGS.read(cpu)?,
            es: guest_segment!(ES),
            cs: guest_segment!(CS),
            ss: guest_segment!(SS),
            ds: guest_segment!(DS),
            fs: guest_segment!(FS),
            gs: guest_segment!(GS),
            ldtr: guest_segment!(LDTR),
            tr: guest_segment!(TR),
            gdt: DescriptorTable {
                base: VmcsGuestNW::GDTR_BASE.read(cpu)?,
                limit: VmcsGuest32::GDTR_LIMIT.read(cpu)? as u16,
            },
            idt: DescriptorTable {
                base: VmcsGuestNW::IDTR_BASE.read(cpu)?,
                limit: VmcsGuest32::IDTR_LIMIT.read(cpu)? as u16,
            },
            debugctl: VmcsGuest64::IA32_DEBUGCTL.read(cpu)?,
            sysenter_cs: VmcsGuest32::IA32_SYSENTER_CS.read(cpu)? as u64,
            sysenter_esp: VmcsGuestNW::IA32_SYSENTER_ESP.read(cpu)?,
            sysenter_eip: VmcsGuestNW::IA32_SYSENTER_EIP.read(cpu)?,
            pat: VmcsGuest64::IA32_PAT.read(cpu)?,
            efer: VmcsGuest64::IA32_EFER.read(cpu)?,
        })
    }

    /// Ends the session: leaves VMX operation, puts the guest's system state
    /// back on the processor and fills the `iretq` frame of `ctx`.
    fn terminate(&mut self, ctx: &mut GuestContext) -> Result {
        let context = self.guest_processor_context()?;
        ctx.cs = context.cs.selector.bits() as u64;
        ctx.ss = context.ss.selector.bits() as u64;

        self.leave_vmx_operation();
        unsafe { self.cpu.restore_context(&context) };
        self.unregister();
        self.state = VcpuState::Terminated;

        info!("[VMX] session terminated, continuing at {:#x}", ctx.rip);
        Ok(())
    }
}
