//! [`VmxArch`] on the processor this code runs on.

use core::arch::{asm, global_asm};

use raw_cpuid::CpuIdResult;
use x86::bits64::vmx;
use x86::segmentation::SegmentSelector;
use x86::vmx::VmFail;
use x86_64::instructions::tables;
use x86_64::registers::control::{Cr0, Cr4};
use x86_64::registers::rflags;
use x86_64::structures::DescriptorTablePointer;

use crate::hal::{SegmentRegister, VmxArch};
use crate::vmx::vmcs::VmcsGuestNW;

/// Single-context INVEPT. (SDM Vol. 3C, Section 30.3)
const INVEPT_SINGLE_CONTEXT: u64 = 1;

// Launch the current VMCS with guest RSP/RIP set to this stub's own
// continuation, so the guest picks up right where the caller was.
//
// Returns 0 in the guest, 1 on VMfailInvalid, 2 on VMfailValid.
global_asm!(
    ".global x86_hv_vmlaunch_current",
    "x86_hv_vmlaunch_current:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "pushfq",
    "mov rdx, {guest_rsp}",
    "vmwrite rdx, rsp",
    "jbe 2f",
    "mov rdx, {guest_rip}",
    "lea rax, [rip + 4f]",
    "vmwrite rdx, rax",
    "jbe 2f",
    "vmlaunch",
    "2:",
    "mov eax, 2",
    "mov ecx, 1",
    "cmovc eax, ecx",
    "jmp 3f",
    "4:",
    "xor eax, eax",
    "3:",
    "popfq",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    guest_rsp = const VmcsGuestNW::RSP as u32,
    guest_rip = const VmcsGuestNW::RIP as u32,
);

unsafe extern "C" {
    fn x86_hv_vmlaunch_current() -> u64;
}

/// Decode the VMX instruction status from RFLAGS. (SDM Vol. 3C, Section 31.2)
fn vmx_status(flags: u64) -> Result<(), VmFail> {
    if flags & 1 != 0 {
        Err(VmFail::VmFailInvalid)
    } else if flags & (1 << 6) != 0 {
        Err(VmFail::VmFailValid)
    } else {
        Ok(())
    }
}

/// The real processor.
pub struct NativeArch;

impl VmxArch for NativeArch {
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        raw_cpuid::cpuid!(leaf, subleaf)
    }

    fn rdmsr(msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    unsafe fn wrmsr(msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    fn read_cr0() -> u64 {
        Cr0::read_raw()
    }

    fn read_cr3() -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    fn read_cr4() -> u64 {
        Cr4::read_raw()
    }

    unsafe fn write_cr0(value: u64) {
        unsafe { Cr0::write_raw(value) }
    }

    unsafe fn write_cr3(value: u64) {
        unsafe { x86::controlregs::cr3_write(value) }
    }

    unsafe fn write_cr4(value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    fn read_dr7() -> u64 {
        let value: u64;
        unsafe { asm!("mov {}, dr7", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn write_dr7(value: u64) {
        unsafe { asm!("mov dr7, {}", in(reg) value, options(nomem, nostack, preserves_flags)) }
    }

    fn read_rflags() -> u64 {
        rflags::read_raw()
    }

    fn rdtsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn sgdt() -> DescriptorTablePointer {
        tables::sgdt()
    }

    fn sidt() -> DescriptorTablePointer {
        tables::sidt()
    }

    unsafe fn lgdt(gdt: &DescriptorTablePointer) {
        unsafe { tables::lgdt(gdt) }
    }

    unsafe fn lidt(idt: &DescriptorTablePointer) {
        unsafe { tables::lidt(idt) }
    }

    fn selector(reg: SegmentRegister) -> SegmentSelector {
        use x86::segmentation::{cs, ds, es, fs, gs, ss};
        match reg {
            SegmentRegister::Es => es(),
            SegmentRegister::Cs => cs(),
            SegmentRegister::Ss => ss(),
            SegmentRegister::Ds => ds(),
            SegmentRegister::Fs => fs(),
            SegmentRegister::Gs => gs(),
            SegmentRegister::Ldtr => {
                let raw: u16;
                unsafe { asm!("sldt {0:x}", out(reg) raw, options(nomem, nostack, preserves_flags)) };
                SegmentSelector::from_raw(raw)
            }
            SegmentRegister::Tr => unsafe { x86::task::tr() },
        }
    }

    unsafe fn load_tr(selector: SegmentSelector) {
        unsafe { x86::task::load_tr(selector) }
    }

    unsafe fn xsetbv(xcr: u32, value: u64) {
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") xcr,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nomem, nostack, preserves_flags),
            )
        }
    }

    unsafe fn wbinvd() {
        unsafe { asm!("wbinvd", options(nostack, preserves_flags)) }
    }

    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmxon(paddr) }
    }

    unsafe fn vmxoff() -> Result<(), VmFail> {
        unsafe { vmx::vmxoff() }
    }

    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmclear(paddr) }
    }

    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmptrld(paddr) }
    }

    unsafe fn vmread(field: u32) -> Result<u64, VmFail> {
        unsafe { vmx::vmread(field) }
    }

    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail> {
        unsafe { vmx::vmwrite(field, value) }
    }

    unsafe fn vmlaunch_current() -> Result<(), VmFail> {
        match unsafe { x86_hv_vmlaunch_current() } {
            0 => Ok(()),
            1 => Err(VmFail::VmFailInvalid),
            _ => Err(VmFail::VmFailValid),
        }
    }

    unsafe fn invept(eptp: u64) -> Result<(), VmFail> {
        let descriptor: [u64; 2] = [eptp, 0];
        let flags: u64;
        unsafe {
            asm!(
                "invept {0}, [{1}]",
                "pushfq",
                "pop {2}",
                in(reg) INVEPT_SINGLE_CONTEXT,
                in(reg) &descriptor,
                lateout(reg) flags,
            )
        };
        vmx_status(flags)
    }

    unsafe fn vmcall(rax: u64, rcx: u64, rdx: u64) -> u64 {
        let result: u64;
        unsafe {
            asm!(
                "vmcall",
                inout("rax") rax => result,
                inout("rcx") rcx => _,
                inout("rdx") rdx => _,
            )
        };
        result
    }
}
