//! VM-exit dispatch for a virtualized processor.

use bit_field::BitField;
use x86::irq::{GENERAL_PROTECTION_FAULT_VECTOR, INVALID_OPCODE_VECTOR, NONMASKABLE_INTERRUPT_VECTOR};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use super::definitions::{VmxExitReason, VmxInterruptionType};
use super::hypercall::{HypercallCode, HypercallStatus};
use super::structs::{FeatureControlFlags, MsrBitmap};
use super::vcpu::Vcpu;
use super::vmcs::{
    self, CrAccessInfo, EptViolationInfo, VmcsControl32, VmcsControl64, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmxExitInfo, VmxInterruptInfo,
};
use crate::context::DevirtualizedContext;
use crate::ept::Ept;
use crate::hal::{HvHal, VmxArch};
use crate::msr::Msr;
use crate::phys_window::PhysicalMemoryWindow;
use crate::regs::GeneralRegisters;
use crate::segmentation::SegmentAccessRights;
use crate::{HYPERVISOR_SIGNATURE, HvResult};

/// Interruptibility state: blocking by STI, MOV SS or NMI.
const BLOCKING_MASK: u32 = 0b1011;
/// XCR0 state components.
const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

/// What the exit trampoline does after [`Vcpu::handle_vm_exit`].
#[derive(Debug, Clone, Copy)]
pub enum VmExitAction {
    /// VMRESUME with the (possibly updated) register snapshot.
    Resume,
    /// VMX is off. Restore the register snapshot and continue natively with
    /// the given context.
    Deactivate(DevirtualizedContext),
}

/// Outcome of one exit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Resume the guest, skipping the exiting instruction if `advance_rip`.
    Continue { advance_rip: bool },
    /// Resume the guest with an event delivered on entry.
    Inject { vector: u8, err_code: Option<u32> },
    /// Devirtualize the processor.
    Terminate,
}

/// A decoded VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    Cpuid,
    Rdmsr { index: u32 },
    Wrmsr { index: u32, value: u64 },
    EptViolation { gpa: u64, qualification: u64 },
    EptMisconfiguration { gpa: u64 },
    ExceptionOrNmi { info: VmxInterruptInfo },
    Vmcall,
    Xsetbv,
    Getsec,
    Invd,
    VmxInstruction,
    MovCr { info: CrAccessInfo },
    NmiWindow,
    PreemptionTimer,
    TripleFault,
    /// Any other basic exit reason. Bit 31 is set for VM-entry failures.
    Unhandled(u32),
}

impl ExitDecision {
    const SKIP: Self = Self::Continue { advance_rip: true };
    const RETRY: Self = Self::Continue { advance_rip: false };

    fn gp() -> Self {
        Self::Inject {
            vector: GENERAL_PROTECTION_FAULT_VECTOR,
            err_code: Some(0),
        }
    }

    fn ud() -> Self {
        Self::Inject {
            vector: INVALID_OPCODE_VECTOR,
            err_code: None,
        }
    }
}

fn is_canonical(addr: u64) -> bool {
    (((addr as i64) << 16) >> 16) as u64 == addr
}

impl<H: HvHal> Vcpu<H> {
    /// Handle the VM exit that just happened on this processor.
    ///
    /// `regs` is the guest register snapshot saved by the exit trampoline;
    /// handlers update it in place.
    pub fn handle_vm_exit(&mut self, regs: &mut GeneralRegisters) -> VmExitAction {
        let start = H::Arch::rdtsc();
        self.exit_count += 1;
        #[cfg(feature = "tracing")]
        let before = *regs;

        let action = match self.process_exit(regs, start) {
            Ok(action) => action,
            Err(err) => {
                error!("[HV] VM exit handling failed: {}", err);
                match self.devirtualize() {
                    Ok(ctx) => VmExitAction::Deactivate(ctx),
                    // No way back to the guest, and no VMX state to return to.
                    Err(err) => panic!("[HV] failed to devirtualize the processor: {}", err),
                }
            }
        };

        #[cfg(feature = "tracing")]
        {
            let diff = crate::regs::GeneralRegistersDiff::new(before, *regs);
            if !diff.is_same() {
                trace!("[HV] exit #{} changed {:?}", self.exit_count, diff);
            }
        }
        action
    }

    fn process_exit(&mut self, regs: &mut GeneralRegisters, start: u64) -> HvResult<VmExitAction> {
        let info = vmcs::exit_info::<H::Arch>()?;
        let exit = Self::classify(&info, regs)?;
        let interrupted = vmcs::idt_vectoring_info::<H::Arch>()?;
        trace!(
            "[HV] VM exit #{}: {:?} @ {:#x}",
            self.exit_count, exit, info.guest_rip
        );

        match self.dispatch(exit, &info, regs)? {
            ExitDecision::Continue { advance_rip } => {
                // The exit interrupted event delivery. Deliver it again.
                if let Some(event) = interrupted {
                    debug!("[HV] redelivering {:?} after {:?}", event, exit);
                    vmcs::queue_event::<H::Arch>(event)?;
                }
                self.resume(&info, advance_rip, start)?;
                Ok(VmExitAction::Resume)
            }
            ExitDecision::Inject { vector, err_code } => {
                vmcs::inject_event::<H::Arch>(vector, err_code)?;
                self.resume(&info, false, start)?;
                Ok(VmExitAction::Resume)
            }
            ExitDecision::Terminate => {
                warn!("[HV] terminating after {:?} @ {:#x}", exit, info.guest_rip);
                Ok(VmExitAction::Deactivate(self.devirtualize()?))
            }
        }
    }

    /// Decode the current exit from the VMCS.
    pub fn classify(info: &VmxExitInfo, regs: &GeneralRegisters) -> HvResult<VmExit> {
        if info.entry_failure {
            return Ok(VmExit::Unhandled(info.basic_reason as u32 | 1 << 31));
        }
        let reason = match info.exit_reason() {
            Ok(reason) => reason,
            Err(raw) => return Ok(VmExit::Unhandled(raw)),
        };
        let exit = match reason {
            VmxExitReason::CPUID => VmExit::Cpuid,
            VmxExitReason::MSR_READ => VmExit::Rdmsr {
                index: regs.rcx as u32,
            },
            VmxExitReason::MSR_WRITE => VmExit::Wrmsr {
                index: regs.rcx as u32,
                value: regs.get_edx_eax(),
            },
            VmxExitReason::EPT_VIOLATION => VmExit::EptViolation {
                gpa: vmcs::VmcsReadOnly64::GUEST_PHYSICAL_ADDR.read::<H::Arch>()?,
                qualification: vmcs::exit_qualification::<H::Arch>()?,
            },
            VmxExitReason::EPT_MISCONFIG => VmExit::EptMisconfiguration {
                gpa: vmcs::VmcsReadOnly64::GUEST_PHYSICAL_ADDR.read::<H::Arch>()?,
            },
            VmxExitReason::EXCEPTION_NMI => VmExit::ExceptionOrNmi {
                info: vmcs::interrupt_exit_info::<H::Arch>()?,
            },
            VmxExitReason::VMCALL => VmExit::Vmcall,
            VmxExitReason::XSETBV => VmExit::Xsetbv,
            VmxExitReason::GETSEC => VmExit::Getsec,
            VmxExitReason::INVD => VmExit::Invd,
            VmxExitReason::VMCLEAR
            | VmxExitReason::VMLAUNCH
            | VmxExitReason::VMPTRLD
            | VmxExitReason::VMPTRST
            | VmxExitReason::VMREAD
            | VmxExitReason::VMRESUME
            | VmxExitReason::VMWRITE
            | VmxExitReason::VMOFF
            | VmxExitReason::VMON
            | VmxExitReason::INVEPT
            | VmxExitReason::INVVPID
            | VmxExitReason::VMFUNC => VmExit::VmxInstruction,
            VmxExitReason::CR_ACCESS => VmExit::MovCr {
                info: vmcs::cr_access_info::<H::Arch>()?,
            },
            VmxExitReason::NMI_WINDOW => VmExit::NmiWindow,
            VmxExitReason::PREEMPTION_TIMER => VmExit::PreemptionTimer,
            VmxExitReason::TRIPLE_FAULT => VmExit::TripleFault,
            other => VmExit::Unhandled(other as u32),
        };
        Ok(exit)
    }

    fn dispatch(
        &mut self,
        exit: VmExit,
        info: &VmxExitInfo,
        regs: &mut GeneralRegisters,
    ) -> HvResult<ExitDecision> {
        match exit {
            VmExit::Cpuid => Ok(Self::handle_cpuid(regs)),
            VmExit::Rdmsr { index } => self.handle_rdmsr(index, regs),
            VmExit::Wrmsr { index, value } => self.handle_wrmsr(index, value),
            VmExit::EptViolation { gpa, qualification } => {
                self.handle_ept_violation(gpa, qualification)
            }
            VmExit::ExceptionOrNmi { info } => self.handle_exception_nmi(info),
            VmExit::Vmcall => self.handle_hypercall(info, regs),
            VmExit::Xsetbv => Ok(self.handle_xsetbv(regs)),
            VmExit::Getsec | VmExit::VmxInstruction => Ok(ExitDecision::ud()),
            VmExit::Invd => {
                // INVD could discard dirty lines the host owns.
                unsafe { H::Arch::wbinvd() };
                Ok(ExitDecision::SKIP)
            }
            VmExit::MovCr { info } => self.handle_cr_access(info, regs),
            VmExit::NmiWindow => self.handle_nmi_window(),
            VmExit::PreemptionTimer => Ok(ExitDecision::RETRY),
            VmExit::TripleFault | VmExit::EptMisconfiguration { .. } | VmExit::Unhandled(_) => {
                Ok(ExitDecision::Terminate)
            }
        }
    }

    /// Finish a resumed exit: skip the instruction, rearm the timer and
    /// fold the time spent here into the TSC offset.
    fn resume(&mut self, info: &VmxExitInfo, advance_rip: bool, start: u64) -> HvResult {
        if advance_rip {
            Self::advance_rip(info)?;
        }
        if self.preemption_timer != 0 {
            VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE.write::<H::Arch>(self.preemption_timer)?;
        }
        if self.hide_vm_exit_latency {
            let elapsed = H::Arch::rdtsc().wrapping_sub(start);
            self.vm_exit_tsc_latency = self.vm_exit_tsc_latency.wrapping_add(elapsed);
            self.tsc_offset = self.vm_exit_tsc_latency.wrapping_neg();
            VmcsControl64::TSC_OFFSET.write::<H::Arch>(self.tsc_offset)?;
        } else if self.tsc_offset != 0 {
            // Hiding was switched off.
            self.vm_exit_tsc_latency = 0;
            self.tsc_offset = 0;
            VmcsControl64::TSC_OFFSET.write::<H::Arch>(0)?;
        }
        Ok(())
    }

    fn advance_rip(info: &VmxExitInfo) -> HvResult {
        VmcsGuestNW::RIP.write::<H::Arch>(info.guest_rip + info.exit_instruction_length as usize)
    }

    fn handle_cpuid(regs: &mut GeneralRegisters) -> ExitDecision {
        let leaf = regs.rax as u32;
        let subleaf = regs.rcx as u32;
        let mut res = H::Arch::cpuid(leaf, subleaf);
        if leaf == 1 {
            // Nested VMX is not offered.
            res.ecx.set_bit(5, false);
        }
        regs.rax = res.eax as _;
        regs.rbx = res.ebx as _;
        regs.rcx = res.ecx as _;
        regs.rdx = res.edx as _;
        ExitDecision::SKIP
    }

    fn handle_rdmsr(&mut self, index: u32, regs: &mut GeneralRegisters) -> HvResult<ExitDecision> {
        if !MsrBitmap::<H>::is_valid_index(index) || Msr::is_vmx_capability(index) {
            return Ok(ExitDecision::gp());
        }
        let value = match Msr::try_from(index) {
            Ok(Msr::IA32_FEATURE_CONTROL) => FeatureControlFlags::hide_vmx(H::Arch::rdmsr(index)),
            Ok(Msr::IA32_FS_BASE) => VmcsGuestNW::FS_BASE.read::<H::Arch>()? as u64,
            Ok(Msr::IA32_GS_BASE) => VmcsGuestNW::GS_BASE.read::<H::Arch>()? as u64,
            Ok(Msr::IA32_SYSENTER_CS) => VmcsGuest32::IA32_SYSENTER_CS.read::<H::Arch>()? as u64,
            Ok(Msr::IA32_SYSENTER_ESP) => VmcsGuestNW::IA32_SYSENTER_ESP.read::<H::Arch>()? as u64,
            Ok(Msr::IA32_SYSENTER_EIP) => VmcsGuestNW::IA32_SYSENTER_EIP.read::<H::Arch>()? as u64,
            Ok(Msr::IA32_DEBUGCTL) => VmcsGuest64::IA32_DEBUGCTL.read::<H::Arch>()?,
            Ok(Msr::IA32_PAT) => VmcsGuest64::IA32_PAT.read::<H::Arch>()?,
            Ok(Msr::IA32_EFER) => VmcsGuest64::IA32_EFER.read::<H::Arch>()?,
            _ => H::Arch::rdmsr(index),
        };
        trace!("[HV] RDMSR {:#x} -> {:#x}", index, value);
        regs.set_edx_eax(value);
        Ok(ExitDecision::SKIP)
    }

    fn handle_wrmsr(&mut self, index: u32, value: u64) -> HvResult<ExitDecision> {
        if !MsrBitmap::<H>::is_valid_index(index) || Msr::is_vmx_capability(index) {
            return Ok(ExitDecision::gp());
        }
        trace!("[HV] WRMSR {:#x} <- {:#x}", index, value);
        match Msr::try_from(index) {
            // Already locked from the guest's point of view.
            Ok(Msr::IA32_FEATURE_CONTROL) => return Ok(ExitDecision::gp()),
            Ok(
                Msr::IA32_FS_BASE
                | Msr::IA32_GS_BASE
                | Msr::IA32_KERNEL_GSBASE
                | Msr::IA32_SYSENTER_ESP
                | Msr::IA32_SYSENTER_EIP,
            ) if !is_canonical(value) => return Ok(ExitDecision::gp()),
            Ok(Msr::IA32_FS_BASE) => VmcsGuestNW::FS_BASE.write::<H::Arch>(value as _)?,
            Ok(Msr::IA32_GS_BASE) => VmcsGuestNW::GS_BASE.write::<H::Arch>(value as _)?,
            Ok(Msr::IA32_SYSENTER_CS) => VmcsGuest32::IA32_SYSENTER_CS.write::<H::Arch>(value as _)?,
            Ok(Msr::IA32_SYSENTER_ESP) => VmcsGuestNW::IA32_SYSENTER_ESP.write::<H::Arch>(value as _)?,
            Ok(Msr::IA32_SYSENTER_EIP) => VmcsGuestNW::IA32_SYSENTER_EIP.write::<H::Arch>(value as _)?,
            Ok(Msr::IA32_DEBUGCTL) => VmcsGuest64::IA32_DEBUGCTL.write::<H::Arch>(value)?,
            Ok(Msr::IA32_PAT) => VmcsGuest64::IA32_PAT.write::<H::Arch>(value)?,
            Ok(Msr::IA32_EFER) => VmcsGuest64::IA32_EFER.write::<H::Arch>(value)?,
            _ => unsafe { H::Arch::wrmsr(index, value) },
        }
        Ok(ExitDecision::SKIP)
    }

    fn handle_ept_violation(&mut self, gpa: u64, qualification: u64) -> HvResult<ExitDecision> {
        if gpa >= Ept::<H>::mapped_limit() {
            error!(
                "[HV] EPT violation outside the identity map: gpa {:#x}, qualification {:#x}",
                gpa, qualification
            );
            return Ok(ExitDecision::Terminate);
        }
        let restored = self.ept.restore_full_permissions(gpa)?;
        debug!(
            "[HV] {:?}, restored: {}",
            EptViolationInfo::from_qualification(gpa, qualification),
            restored
        );
        unsafe { H::Arch::invept(self.ept.eptp()) }.map_err(super::as_hv_err::<H::Arch>)?;
        Ok(ExitDecision::RETRY)
    }

    fn nmi_blocked() -> HvResult<bool> {
        let pending = VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.read::<H::Arch>()?;
        let blocking = VmcsGuest32::INTERRUPTIBILITY_STATE.read::<H::Arch>()?;
        Ok(pending.get_bit(31) || blocking & BLOCKING_MASK != 0)
    }

    fn set_nmi_window_exiting(enable: bool) -> HvResult {
        use super::vmcs::controls::PrimaryControls;
        let field = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS;
        let mut ctrl = field.read::<H::Arch>()?;
        ctrl.set_bit(PrimaryControls::NMI_WINDOW_EXITING.bits().trailing_zeros() as usize, enable);
        field.write::<H::Arch>(ctrl)
    }

    fn handle_exception_nmi(&mut self, info: VmxInterruptInfo) -> HvResult<ExitDecision> {
        if info.int_type != VmxInterruptionType::NMI {
            return Ok(ExitDecision::Inject {
                vector: info.vector,
                err_code: info.err_code,
            });
        }
        if Self::nmi_blocked()? {
            self.queued_nmis += 1;
            Self::set_nmi_window_exiting(true)?;
            trace!("[HV] NMI queued ({} pending)", self.queued_nmis);
            return Ok(ExitDecision::RETRY);
        }
        Ok(ExitDecision::Inject {
            vector: NONMASKABLE_INTERRUPT_VECTOR,
            err_code: None,
        })
    }

    fn handle_nmi_window(&mut self) -> HvResult<ExitDecision> {
        if self.queued_nmis == 0 {
            Self::set_nmi_window_exiting(false)?;
            return Ok(ExitDecision::RETRY);
        }
        self.queued_nmis -= 1;
        if self.queued_nmis == 0 {
            Self::set_nmi_window_exiting(false)?;
        }
        Ok(ExitDecision::Inject {
            vector: NONMASKABLE_INTERRUPT_VECTOR,
            err_code: None,
        })
    }

    fn handle_xsetbv(&self, regs: &GeneralRegisters) -> ExitDecision {
        let Some(data) = self.cached_data() else {
            return ExitDecision::Terminate;
        };
        let index = regs.rcx as u32;
        let value = regs.get_edx_eax();
        if index != 0
            || value & data.xcr0_unsupported_mask != 0
            || value & XCR0_X87 == 0
            || (value & XCR0_AVX != 0 && value & XCR0_SSE == 0)
        {
            return ExitDecision::gp();
        }
        unsafe { H::Arch::xsetbv(index, value) };
        ExitDecision::SKIP
    }

    fn handle_cr_access(
        &self,
        info: CrAccessInfo,
        regs: &GeneralRegisters,
    ) -> HvResult<ExitDecision> {
        let Some(data) = self.cached_data() else {
            return Ok(ExitDecision::Terminate);
        };
        let cr0 = self.guest_cr(0)?;
        let (cr_idx, value) = match (info.access_type, info.cr_number) {
            // MOV to CR
            (0, cr @ (0 | 4)) => {
                let value = if info.gpr == GeneralRegisters::RSP_INDEX {
                    VmcsGuestNW::RSP.read::<H::Arch>()? as u64
                } else {
                    regs.get_reg_of_index(info.gpr)
                };
                (cr as usize, value)
            }
            // CLTS
            (2, _) => (0, cr0 & !Cr0Flags::TASK_SWITCHED.bits()),
            // LMSW: PE can be set but not cleared.
            (3, _) => (0, (cr0 & !0xf) | (info.lmsw_source_data as u64 & 0xf) | (cr0 & 1)),
            _ => {
                error!("[HV] unexpected CR access {:?}", info);
                return Ok(ExitDecision::Terminate);
            }
        };

        let invalid = match cr_idx {
            0 => {
                value & Cr0Flags::PAGING.bits() != 0
                    && value & Cr0Flags::PROTECTED_MODE_ENABLE.bits() == 0
            }
            // VMX is not offered to the guest.
            _ => {
                value & !data.vmx_cr4_fixed1 != 0
                    || value & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() != 0
            }
        };
        if invalid {
            return Ok(ExitDecision::gp());
        }
        self.set_cr(data, cr_idx, value)?;

        if cr_idx == 0 && (cr0 ^ value) & Cr0Flags::PAGING.bits() != 0 {
            self.update_long_mode(value)?;
        }
        trace!("[HV] guest CR{} <- {:#x}", cr_idx, value);
        Ok(ExitDecision::SKIP)
    }

    /// Keep EFER.LMA and the IA-32e entry control in sync with CR0.PG.
    fn update_long_mode(&self, cr0: u64) -> HvResult {
        use super::vmcs::controls::EntryControls;
        let mut efer = VmcsGuest64::IA32_EFER.read::<H::Arch>()?;
        let mut entry = VmcsControl32::VMENTRY_CONTROLS.read::<H::Arch>()?;
        let long_mode =
            cr0 & Cr0Flags::PAGING.bits() != 0 && efer & EferFlags::LONG_MODE_ENABLE.bits() != 0;
        efer.set_bit(
            EferFlags::LONG_MODE_ACTIVE.bits().trailing_zeros() as usize,
            long_mode,
        );
        entry.set_bit(
            EntryControls::IA32E_MODE_GUEST.bits().trailing_zeros() as usize,
            long_mode,
        );
        VmcsGuest64::IA32_EFER.write::<H::Arch>(efer)?;
        VmcsControl32::VMENTRY_CONTROLS.write::<H::Arch>(entry)
    }

    fn guest_cpl() -> HvResult<u8> {
        let ss = VmcsGuest32::SS_ACCESS_RIGHTS.read::<H::Arch>()?;
        Ok(SegmentAccessRights::from_bits_truncate(ss).dpl())
    }

    fn handle_hypercall(
        &mut self,
        info: &VmxExitInfo,
        regs: &mut GeneralRegisters,
    ) -> HvResult<ExitDecision> {
        let Ok(code) = HypercallCode::try_from(regs.rax) else {
            debug!("[HV] unknown hypercall {:#x}", regs.rax);
            return Ok(ExitDecision::ud());
        };
        if code.is_privileged() && Self::guest_cpl()? != 0 {
            debug!("[HV] {:?} from user mode refused", code);
            return Ok(ExitDecision::ud());
        }
        trace!("[HV] hypercall {:?}({:#x}, {:#x})", code, regs.rcx, regs.rdx);

        let window = PhysicalMemoryWindow::get();
        match code {
            HypercallCode::Ping => regs.rax = HYPERVISOR_SIGNATURE,
            HypercallCode::Unload => {
                // Devirtualization resumes after the VMCALL.
                Self::advance_rip(info)?;
                return Ok(ExitDecision::Terminate);
            }
            HypercallCode::ReadPhysMem => {
                match window.map(|window| window.read_u64::<H>(regs.rcx)) {
                    Some(Ok(value)) => {
                        regs.rax = value;
                        regs.rdx = HypercallStatus::Success as u64;
                    }
                    _ => {
                        regs.rax = 0;
                        regs.rdx = HypercallStatus::BadAddress as u64;
                    }
                }
            }
            HypercallCode::WritePhysMem => {
                let status = match window.map(|window| window.write_u64::<H>(regs.rcx, regs.rdx)) {
                    Some(Ok(())) => HypercallStatus::Success,
                    _ => HypercallStatus::BadAddress,
                };
                regs.rax = status as u64;
            }
            HypercallCode::HideLatency => {
                self.set_hide_vm_exit_latency(regs.rcx != 0);
                regs.rax = HypercallStatus::Success as u64;
            }
        }
        Ok(ExitDecision::SKIP)
    }
}
