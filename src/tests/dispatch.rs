//! Exit handling on a virtualized processor.

use super::virtualized;
use crate::msr::Msr;
use crate::test_utils::mock::{MockArch, MockCpu, MockHal};
use crate::vmx::vmcs::{
    VmcsControl32, VmcsControl64, VmcsControlNW, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW,
};
use crate::{
    Ept, EptFlags, GeneralRegisters, HYPERVISOR_SIGNATURE, HypercallCode, HypercallStatus,
    HOST_PHYSICAL_MEMORY_SIZE, Vcpu, VmExitAction,
};

const GUEST_RIP: u64 = 0xffff_ffff_8100_2000;
/// Valid | hardware exception | error code | #GP.
const INJECT_GP: u64 = 0x8000_0b0d;
/// Valid | hardware exception | #UD.
const INJECT_UD: u64 = 0x8000_0306;
/// Valid | NMI | vector 2.
const INJECT_NMI: u64 = 0x8000_0202;
const NMI_WINDOW_EXITING: u64 = 1 << 22;

fn field(field: u32) -> u64 {
    MockArch::vmcs_field(field).unwrap_or_default()
}

/// Stage an exit with `reason` on an instruction of `len` bytes at [`GUEST_RIP`].
fn stage_exit(reason: u32, len: u32) {
    MockArch::set_vmcs_field(VmcsReadOnly32::EXIT_REASON as u32, reason as u64);
    MockArch::set_vmcs_field(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32, len as u64);
    MockArch::set_vmcs_field(VmcsGuestNW::RIP as u32, GUEST_RIP);
    MockArch::set_vmcs_field(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32, 0);
    MockArch::set_vmcs_field(VmcsReadOnly32::IDT_VECTORING_INFO as u32, 0);
}

fn run(vcpu: &mut Vcpu<MockHal>, regs: &mut GeneralRegisters) {
    assert!(matches!(vcpu.handle_vm_exit(regs), VmExitAction::Resume));
}

fn rip() -> u64 {
    field(VmcsGuestNW::RIP as u32)
}

fn injected() -> u64 {
    field(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32)
}

fn hypercall(vcpu: &mut Vcpu<MockHal>, code: u64, rcx: u64, rdx: u64) -> GeneralRegisters {
    stage_exit(18, 3);
    let mut regs = GeneralRegisters::default();
    regs.rax = code;
    regs.rcx = rcx;
    regs.rdx = rdx;
    run(vcpu, &mut regs);
    regs
}

#[test]
fn test_ping() {
    let mut vcpu = virtualized();
    let regs = hypercall(&mut vcpu, HypercallCode::Ping as u64, 0, 0);
    assert_eq!(regs.rax, HYPERVISOR_SIGNATURE);
    assert_eq!(rip(), GUEST_RIP + 3);
    assert_eq!(injected(), 0);
    assert!(vcpu.is_active());
    assert_eq!(vcpu.exit_count(), 1);
}

#[test]
fn test_unknown_hypercall() {
    let mut vcpu = virtualized();
    let regs = hypercall(&mut vcpu, 0x99, 0, 0);
    assert_eq!(regs.rax, 0x99);
    assert_eq!(injected(), INJECT_UD);
    assert_eq!(rip(), GUEST_RIP);
}

#[test]
fn test_physical_memory_hypercalls() {
    let mut vcpu = virtualized();
    MockHal::phys_page()[3] = 0xdead_beef_0bad_f00d;

    let regs = hypercall(&mut vcpu, HypercallCode::ReadPhysMem as u64, 0x18, 0);
    assert_eq!(regs.rax, 0xdead_beef_0bad_f00d);
    assert_eq!(regs.rdx, HypercallStatus::Success as u64);
    assert_eq!(rip(), GUEST_RIP + 3);

    let regs = hypercall(&mut vcpu, HypercallCode::WritePhysMem as u64, 0x20, 0x1122_3344);
    assert_eq!(regs.rax, HypercallStatus::Success as u64);
    assert_eq!(MockHal::phys_page()[4], 0x1122_3344);

    let beyond = HOST_PHYSICAL_MEMORY_SIZE as u64 - 4;
    let regs = hypercall(&mut vcpu, HypercallCode::ReadPhysMem as u64, beyond, 0);
    assert_eq!(regs.rax, 0);
    assert_eq!(regs.rdx, HypercallStatus::BadAddress as u64);
    let regs = hypercall(&mut vcpu, HypercallCode::WritePhysMem as u64, u64::MAX, 1);
    assert_eq!(regs.rax, HypercallStatus::BadAddress as u64);
    assert!(vcpu.is_active());
}

#[test]
fn test_privileged_hypercall_from_user_mode() {
    let mut vcpu = virtualized();
    // SS with DPL 3.
    MockArch::set_vmcs_field(VmcsGuest32::SS_ACCESS_RIGHTS as u32, 0xf3);
    let regs = hypercall(&mut vcpu, HypercallCode::WritePhysMem as u64, 0x28, 0x55);
    assert_eq!(injected(), INJECT_UD);
    assert_eq!(rip(), GUEST_RIP);
    assert_eq!(regs.rax, HypercallCode::WritePhysMem as u64);
    assert_eq!(MockHal::phys_page()[5], 0);

    // Ping stays available to user mode.
    let regs = hypercall(&mut vcpu, HypercallCode::Ping as u64, 0, 0);
    assert_eq!(regs.rax, HYPERVISOR_SIGNATURE);
}

#[test]
fn test_unload_from_user_mode_refused() {
    let mut vcpu = virtualized();
    MockArch::set_vmcs_field(VmcsGuest32::SS_ACCESS_RIGHTS as u32, 0xf3);
    let regs = hypercall(&mut vcpu, HypercallCode::Unload as u64, 0, 0);
    assert_eq!(injected(), INJECT_UD);
    assert_eq!(rip(), GUEST_RIP);
    assert_eq!(regs.rax, HypercallCode::Unload as u64);
    assert!(vcpu.is_active());
    assert!(MockArch::snapshot().vmx_on);
}

#[test]
fn test_exit_latency_hidden() {
    let mut vcpu = virtualized();
    vcpu.set_hide_vm_exit_latency(true);
    for n in 1..=3u64 {
        stage_exit(10, 2); // CPUID
        let mut regs = GeneralRegisters::default();
        run(&mut vcpu, &mut regs);
        // Two RDTSCs per exit, `tsc_step` apart.
        assert_eq!(vcpu.vm_exit_tsc_latency(), n * 1000);
        assert_eq!(vcpu.tsc_offset(), (n * 1000).wrapping_neg());
        assert_eq!(field(VmcsControl64::TSC_OFFSET as u32), (n * 1000).wrapping_neg());
    }
}

#[test]
fn test_exit_latency_visible_by_default() {
    let mut vcpu = virtualized();
    assert!(!vcpu.hide_vm_exit_latency());
    for _ in 0..3 {
        stage_exit(10, 2);
        let mut regs = GeneralRegisters::default();
        run(&mut vcpu, &mut regs);
    }
    assert_eq!(vcpu.tsc_offset(), 0);
    assert_eq!(field(VmcsControl64::TSC_OFFSET as u32), 0);
}

#[test]
fn test_hide_latency_hypercall() {
    let mut vcpu = virtualized();
    let regs = hypercall(&mut vcpu, HypercallCode::HideLatency as u64, 1, 0);
    assert_eq!(regs.rax, HypercallStatus::Success as u64);
    assert!(vcpu.hide_vm_exit_latency());
    // The enabling exit is already accounted for.
    assert_eq!(field(VmcsControl64::TSC_OFFSET as u32), 1000u64.wrapping_neg());

    hypercall(&mut vcpu, HypercallCode::HideLatency as u64, 0, 0);
    assert!(!vcpu.hide_vm_exit_latency());
    // The guest sees the real TSC again.
    assert_eq!(field(VmcsControl64::TSC_OFFSET as u32), 0);
    assert_eq!(vcpu.tsc_offset(), 0);
    assert_eq!(vcpu.vm_exit_tsc_latency(), 0);

    stage_exit(10, 2);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(field(VmcsControl64::TSC_OFFSET as u32), 0);
}

#[test]
fn test_cpuid_hides_vmx() {
    let mut vcpu = virtualized();
    stage_exit(10, 2);
    let mut regs = GeneralRegisters::default();
    regs.rax = 1;
    run(&mut vcpu, &mut regs);
    assert_eq!(regs.rcx, 0x0ffa_3203);
    assert_eq!(regs.rdx, 0x178b_fbff);
    assert_eq!(rip(), GUEST_RIP + 2);

    stage_exit(10, 2);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    // Vendor string untouched.
    assert_eq!(regs.rbx, 0x756e_6547);
}

#[test]
fn test_feature_control_hidden() {
    let mut vcpu = virtualized();
    let feature_control = Msr::IA32_FEATURE_CONTROL as u64;

    stage_exit(31, 2); // RDMSR
    let mut regs = GeneralRegisters::default();
    regs.rcx = feature_control;
    run(&mut vcpu, &mut regs);
    assert_eq!(regs.rax & 1, 1); // locked
    assert_eq!(regs.rax & 0b110, 0); // VMX outside and inside SMX
    assert_eq!(rip(), GUEST_RIP + 2);

    stage_exit(32, 2); // WRMSR
    let mut regs = GeneralRegisters::default();
    regs.rcx = feature_control;
    regs.rax = 0;
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_GP);
    assert_eq!(field(VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE as u32), 0);
    assert_eq!(rip(), GUEST_RIP);
    assert_eq!(
        MockArch::snapshot().msrs[&(Msr::IA32_FEATURE_CONTROL as u32)],
        MockCpu::FEATURE_CONTROL_LOCKED_ENABLED
    );
}

#[test]
fn test_rdmsr_faults() {
    let mut vcpu = virtualized();
    for msr in [Msr::IA32_VMX_BASIC as u64, 0x4000_0000, 0xc000_2000] {
        stage_exit(31, 2);
        let mut regs = GeneralRegisters::default();
        regs.rcx = msr;
        run(&mut vcpu, &mut regs);
        assert_eq!(injected(), INJECT_GP, "msr {:#x}", msr);
        assert_eq!(rip(), GUEST_RIP);
    }
}

#[test]
fn test_msr_passthrough_and_vmcs_backed() {
    let mut vcpu = virtualized();
    let lstar = Msr::IA32_LSTAR as u32;
    MockArch::set_msr(lstar, 0xffff_ffff_8160_0000);

    stage_exit(31, 2);
    let mut regs = GeneralRegisters::default();
    regs.rcx = lstar as u64;
    run(&mut vcpu, &mut regs);
    assert_eq!(regs.rax, 0x8160_0000);
    assert_eq!(regs.rdx, 0xffff_ffff);

    stage_exit(32, 2);
    let mut regs = GeneralRegisters::default();
    regs.rcx = lstar as u64;
    regs.set_edx_eax(0xffff_ffff_8170_0000);
    run(&mut vcpu, &mut regs);
    assert_eq!(MockArch::snapshot().msrs[&lstar], 0xffff_ffff_8170_0000);

    // GS base lives in the guest-state area.
    stage_exit(32, 2);
    let mut regs = GeneralRegisters::default();
    regs.rcx = Msr::IA32_GS_BASE as u64;
    regs.set_edx_eax(0xffff_8880_4000_0000);
    run(&mut vcpu, &mut regs);
    assert_eq!(field(VmcsGuestNW::GS_BASE as u32), 0xffff_8880_4000_0000);
    assert_eq!(
        MockArch::snapshot().msrs[&(Msr::IA32_GS_BASE as u32)],
        MockCpu::GS_BASE
    );

    stage_exit(32, 2);
    let mut regs = GeneralRegisters::default();
    regs.rcx = Msr::IA32_GS_BASE as u64;
    regs.set_edx_eax(0x0000_8000_0000_0000);
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_GP);
    assert_eq!(field(VmcsGuestNW::GS_BASE as u32), 0xffff_8880_4000_0000);
}

#[test]
fn test_ept_violation_restores_access() {
    let mut vcpu = virtualized();
    let gpa = 0x1000_3000;
    vcpu.ept_mut().set_permissions(gpa, EptFlags::READ).unwrap();
    assert_eq!(vcpu.ept().translate(gpa).unwrap().permissions, EptFlags::READ);

    stage_exit(48, 0);
    MockArch::set_vmcs_field(VmcsReadOnly64::GUEST_PHYSICAL_ADDR as u32, gpa);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0b010); // write
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);

    let translation = vcpu.ept().translate(gpa).unwrap();
    assert_eq!(translation.permissions, EptFlags::RWX);
    assert_eq!(translation.hpa, gpa);
    assert_eq!(MockArch::snapshot().invept_count, 1);
    // The access is retried.
    assert_eq!(rip(), GUEST_RIP);
}

#[test]
fn test_interrupted_event_redelivered() {
    let mut vcpu = virtualized();
    let gpa = 0x1000_5000;
    vcpu.ept_mut().set_permissions(gpa, EptFlags::READ).unwrap();

    // The guest was pushing a #PF frame onto a read-only stack page.
    stage_exit(48, 0);
    MockArch::set_vmcs_field(VmcsReadOnly32::IDT_VECTORING_INFO as u32, 0x8000_0b0e);
    MockArch::set_vmcs_field(VmcsReadOnly32::IDT_VECTORING_ERR_CODE as u32, 0x2);
    MockArch::set_vmcs_field(VmcsReadOnly64::GUEST_PHYSICAL_ADDR as u32, gpa);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0b010);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), 0x8000_0b0e);
    assert_eq!(field(VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE as u32), 0x2);
    assert_eq!(rip(), GUEST_RIP);

    // An external interrupt cut short by an NMI exit while NMIs are blocked.
    stage_exit(0, 0);
    MockArch::set_vmcs_field(VmcsReadOnly32::IDT_VECTORING_INFO as u32, 0x8000_0030);
    MockArch::set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32, INJECT_NMI);
    MockArch::set_vmcs_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32, 0b1000);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), 0x8000_0030);
    // The NMI waits for its window.
    let primary = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS as u32;
    assert_ne!(field(primary) & NMI_WINDOW_EXITING, 0);

    // Nothing in flight: nothing queued.
    stage_exit(10, 2);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), 0);
}

#[test]
fn test_ept_violation_outside_identity_map() {
    let mut vcpu = virtualized();
    stage_exit(48, 0);
    MockArch::set_vmcs_field(
        VmcsReadOnly64::GUEST_PHYSICAL_ADDR as u32,
        Ept::<MockHal>::mapped_limit(),
    );
    let mut regs = GeneralRegisters::default();
    assert!(matches!(
        vcpu.handle_vm_exit(&mut regs),
        VmExitAction::Deactivate(_)
    ));
    assert!(!vcpu.is_active());
}

#[test]
fn test_unknown_exit_reason_deactivates() {
    let mut vcpu = virtualized();
    stage_exit(65, 0);
    let mut regs = GeneralRegisters::default();
    let VmExitAction::Deactivate(ctx) = vcpu.handle_vm_exit(&mut regs) else {
        panic!("unknown exits must deactivate");
    };
    // Resumes on the instruction that exited.
    assert_eq!(ctx.rip, GUEST_RIP);
    assert!(!MockArch::snapshot().vmx_on);
}

#[test]
fn test_entry_failure_deactivates() {
    let mut vcpu = virtualized();
    stage_exit(33 | 1 << 31, 0); // invalid guest state
    let mut regs = GeneralRegisters::default();
    assert!(matches!(
        vcpu.handle_vm_exit(&mut regs),
        VmExitAction::Deactivate(_)
    ));
    assert!(!vcpu.is_active());
    assert!(!MockArch::snapshot().vmx_on);
}

#[test]
fn test_triple_fault_deactivates() {
    let mut vcpu = virtualized();
    stage_exit(2, 0);
    let mut regs = GeneralRegisters::default();
    assert!(matches!(
        vcpu.handle_vm_exit(&mut regs),
        VmExitAction::Deactivate(_)
    ));
}

#[test]
fn test_vmx_instructions_raise_ud() {
    let mut vcpu = virtualized();
    for reason in [11, 19, 20, 27, 50] {
        stage_exit(reason, 3);
        let mut regs = GeneralRegisters::default();
        run(&mut vcpu, &mut regs);
        assert_eq!(injected(), INJECT_UD, "reason {}", reason);
        assert_eq!(rip(), GUEST_RIP);
    }
}

#[test]
fn test_invd_becomes_wbinvd() {
    let mut vcpu = virtualized();
    stage_exit(13, 2);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(MockArch::snapshot().wbinvd_count, 1);
    assert_eq!(rip(), GUEST_RIP + 2);
}

#[test]
fn test_xsetbv() {
    let mut vcpu = virtualized();
    for (xcr, value) in [(1, 0x3), (0, 0x5), (0, 0x2), (0, 0xf)] {
        stage_exit(55, 3);
        let mut regs = GeneralRegisters::default();
        regs.rcx = xcr;
        regs.set_edx_eax(value);
        run(&mut vcpu, &mut regs);
        assert_eq!(injected(), INJECT_GP, "xcr{} <- {:#x}", xcr, value);
        assert_eq!(MockArch::snapshot().xcr0, 0x7);
    }

    stage_exit(55, 3);
    let mut regs = GeneralRegisters::default();
    regs.set_edx_eax(0x3);
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), 0);
    assert_eq!(MockArch::snapshot().xcr0, 0x3);
    assert_eq!(rip(), GUEST_RIP + 3);
}

#[test]
fn test_mov_to_cr4() {
    let mut vcpu = virtualized();

    // mov cr4, rax
    stage_exit(28, 3);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x004);
    let mut regs = GeneralRegisters::default();
    regs.rax = 0x0035_06e0;
    run(&mut vcpu, &mut regs);
    assert_eq!(field(VmcsControlNW::CR4_READ_SHADOW as u32), 0x0035_06e0);
    assert_eq!(field(VmcsGuestNW::CR4 as u32), 0x0035_26e0);
    assert_eq!(rip(), GUEST_RIP + 3);

    // A bit the processor does not support.
    stage_exit(28, 3);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x004);
    let mut regs = GeneralRegisters::default();
    regs.rax = 0x0035_06e0 | 1 << 24;
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_GP);
    assert_eq!(field(VmcsControlNW::CR4_READ_SHADOW as u32), 0x0035_06e0);

    // VMXE is not offered to the guest.
    stage_exit(28, 3);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x004);
    let mut regs = GeneralRegisters::default();
    regs.rax = 0x0035_06e0 | 1 << 13;
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_GP);
    assert_eq!(field(VmcsControlNW::CR4_READ_SHADOW as u32), 0x0035_06e0);
    assert_eq!(rip(), GUEST_RIP);
}

#[test]
fn test_mov_to_cr0() {
    let mut vcpu = virtualized();

    // mov cr0, rbx: paging without protection.
    stage_exit(28, 3);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x300);
    let mut regs = GeneralRegisters::default();
    regs.rbx = 0x8000_0000;
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_GP);
    assert_eq!(field(VmcsControlNW::CR0_READ_SHADOW as u32), 0x8005_0033);

    // Set TS, then CLTS.
    stage_exit(28, 3);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x300);
    let mut regs = GeneralRegisters::default();
    regs.rbx = 0x8005_003b;
    run(&mut vcpu, &mut regs);
    assert_eq!(field(VmcsControlNW::CR0_READ_SHADOW as u32), 0x8005_003b);
    assert_eq!(field(VmcsGuestNW::CR0 as u32), 0x8005_003b);

    stage_exit(28, 2);
    MockArch::set_vmcs_field(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, 0x20);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(field(VmcsControlNW::CR0_READ_SHADOW as u32), 0x8005_0033);
    assert_eq!(rip(), GUEST_RIP + 2);
    // Paging did not change, nor did long mode.
    assert_eq!(field(VmcsGuest64::IA32_EFER as u32), 0xd01);
}

#[test]
fn test_nmi_queued_while_blocked() {
    let mut vcpu = virtualized();
    let primary = VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS as u32;

    // Blocked by a previous NMI.
    MockArch::set_vmcs_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32, 0b1000);
    for _ in 0..2 {
        stage_exit(0, 0);
        MockArch::set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32, INJECT_NMI);
        let mut regs = GeneralRegisters::default();
        run(&mut vcpu, &mut regs);
        assert_eq!(injected(), 0);
        assert_ne!(field(primary) & NMI_WINDOW_EXITING, 0);
    }

    MockArch::set_vmcs_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32, 0);
    stage_exit(8, 0); // NMI window
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_NMI);
    assert_ne!(field(primary) & NMI_WINDOW_EXITING, 0);

    stage_exit(8, 0);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_NMI);
    assert_eq!(field(primary) & NMI_WINDOW_EXITING, 0);
    assert_eq!(rip(), GUEST_RIP);
}

#[test]
fn test_nmi_reflected() {
    let mut vcpu = virtualized();
    stage_exit(0, 0);
    MockArch::set_vmcs_field(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32, INJECT_NMI);
    let mut regs = GeneralRegisters::default();
    run(&mut vcpu, &mut regs);
    assert_eq!(injected(), INJECT_NMI);
    assert_eq!(
        field(VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS as u32) & NMI_WINDOW_EXITING,
        0
    );
}
