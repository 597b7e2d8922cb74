//! A software model of one logical processor plus a heap-backed frame
//! allocator, so activation and exit handling can run on a development host.
//!
//! Physical addresses equal host virtual addresses.

extern crate std;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::boxed::Box;
use std::thread_local;

use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::CpuIdResult;
use x86::segmentation::SegmentSelector;
use x86::vmx::VmFail;
use x86_64::VirtAddr as X64VirtAddr;
use x86_64::structures::DescriptorTablePointer;

use crate::hal::{HvHal, SegmentRegister, VmxArch};
use crate::msr::Msr;

const PAGE_SIZE: usize = 0x1000;

thread_local! {
    static LIVE_FRAMES: Cell<isize> = const { Cell::new(0) };
    static FAIL_ALLOC: Cell<bool> = const { Cell::new(false) };
    static CPU: RefCell<MockCpu> = RefCell::new(MockCpu::new());
    /// Backing store for the low physical pages seen through the window.
    static PHYS_MEM: usize = leak_zero_page() as usize;
}

/// Frame allocator backed by the host heap.
#[derive(Debug)]
pub struct MockHal;

impl MockHal {
    pub const VMEXIT_ENTRY: usize = 0xffff_8000_0010_0000;
    pub const INTERRUPT_ENTRY_BASE: usize = 0xffff_8000_0020_0000;

    /// Reset allocation bookkeeping for the current test thread.
    pub fn reset() {
        LIVE_FRAMES.with(|c| c.set(0));
        FAIL_ALLOC.with(|c| c.set(false));
    }

    /// Frames allocated and not yet freed on this thread.
    pub fn live_frames() -> isize {
        LIVE_FRAMES.with(|c| c.get())
    }

    /// The first physical page as the window exposes it.
    pub fn phys_page() -> &'static mut [u64; 512] {
        unsafe { &mut *(Self::phys_mem_base() as *mut [u64; 512]) }
    }

    pub fn fail_allocations(fail: bool) {
        FAIL_ALLOC.with(|c| c.set(fail));
    }

    fn layout(count: usize) -> Layout {
        Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn alloc_frames(count: usize) -> Option<PhysAddr> {
        if FAIL_ALLOC.with(|c| c.get()) {
            return None;
        }
        let ptr = unsafe { alloc_zeroed(Self::layout(count)) };
        if ptr.is_null() {
            return None;
        }
        LIVE_FRAMES.with(|c| c.set(c.get() + count as isize));
        Some(PhysAddr::from_usize(ptr as usize))
    }

    fn dealloc_frames(paddr: PhysAddr, count: usize) {
        unsafe { dealloc(paddr.as_usize() as *mut u8, Self::layout(count)) };
        LIVE_FRAMES.with(|c| c.set(c.get() - count as isize));
    }
}

impl HvHal for MockHal {
    type Arch = MockArch;

    fn alloc_frame() -> Option<PhysAddr> {
        Self::alloc_frames(1)
    }

    fn dealloc_frame(paddr: PhysAddr) {
        Self::dealloc_frames(paddr, 1)
    }

    fn alloc_contiguous_frames(count: usize) -> Option<PhysAddr> {
        Self::alloc_frames(count)
    }

    fn dealloc_contiguous_frames(paddr: PhysAddr, count: usize) {
        Self::dealloc_frames(paddr, count)
    }

    fn phys_to_virt(paddr: PhysAddr) -> VirtAddr {
        VirtAddr::from_usize(paddr.as_usize())
    }

    fn vmexit_entry() -> usize {
        Self::VMEXIT_ENTRY
    }

    fn interrupt_entry(vector: u8) -> usize {
        Self::INTERRUPT_ENTRY_BASE + vector as usize * 0x10
    }

    fn phys_mem_base() -> usize {
        PHYS_MEM.with(|base| *base)
    }
}

/// Observable state of the modelled processor.
#[derive(Debug, Clone)]
pub struct MockCpu {
    pub cpuid: BTreeMap<(u32, u32), CpuIdResult>,
    pub msrs: BTreeMap<u32, u64>,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rflags: u64,
    pub xcr0: u64,
    pub tsc: u64,
    /// Cycles each RDTSC advances the counter by.
    pub tsc_step: u64,
    pub gdtr: (u16, u64),
    pub idtr: (u16, u64),
    pub selectors: BTreeMap<SegmentRegister, u16>,

    pub vmx_on: bool,
    pub vmxon_count: usize,
    pub vmxoff_count: usize,
    pub vmlaunch_count: usize,
    pub fail_vmlaunch: bool,
    pub invept_count: usize,
    pub wbinvd_count: usize,
    pub current_vmcs: Option<u64>,
    pub vmcs: BTreeMap<u32, u64>,
    pub vmcalls: Vec<(u64, u64, u64)>,
    pub loaded_tr: Option<u16>,
}

/// Host GDT used by the modelled kernel: null, code64, data, null, TSS (2 slots).
const MOCK_GDT: [u64; 8] = [
    0,
    0x00af_9b00_0000_ffff,
    0x00cf_9300_0000_ffff,
    0,
    // Busy 64-bit TSS at 0xffff_8880_0001_0000, limit 0x67.
    0x0000_8b01_0000_0067,
    0x0000_0000_ffff_8880,
    0,
    0,
];

fn leak_gdt() -> u64 {
    let gdt: &'static mut [u64; 8] = Box::leak(Box::new(MOCK_GDT));
    gdt.as_mut_ptr() as u64
}

fn leak_zero_page() -> u64 {
    let ptr = unsafe { alloc_zeroed(Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()) };
    ptr as u64
}

impl MockCpu {
    pub const FEATURE_CONTROL_LOCKED_ENABLED: u64 = 0x5;
    pub const VMCS_REVISION: u32 = 0x12;
    pub const TSS_BASE: u64 = 0xffff_8880_0001_0000;
    pub const IDT_BASE: u64 = 0xffff_8880_0002_0000;
    pub const GS_BASE: u64 = 0xffff_8880_3fc0_0000;

    fn new() -> Self {
        let mut cpuid = BTreeMap::new();
        let r = |eax, ebx, ecx, edx| CpuIdResult { eax, ebx, ecx, edx };
        // "GenuineIntel"
        cpuid.insert((0, 0), r(0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69));
        cpuid.insert((1, 0), r(0x000a_0655, 0x0010_0800, 0x0ffa_3223, 0x178b_fbff));
        cpuid.insert((7, 0), r(0, 1 << 10, 0, 0));
        cpuid.insert((0xd, 0), r(0x7, 0x340, 0x340, 0));
        cpuid.insert((0xd, 1), r(0xf, 0, 0, 0));
        cpuid.insert((0x8000_0000, 0), r(0x8000_0008, 0, 0, 0));
        cpuid.insert((0x8000_0001, 0), r(0, 0, 0x121, 0x2c10_0800));
        cpuid.insert((0x8000_0008, 0), r(0x3027, 0, 0, 0));

        let mut msrs = BTreeMap::new();
        let vmx_basic = Self::VMCS_REVISION as u64 | (0x1000 << 32) | (6 << 50) | (1 << 54) | (1 << 55);
        for (msr, value) in [
            (Msr::IA32_FEATURE_CONTROL, Self::FEATURE_CONTROL_LOCKED_ENABLED),
            (Msr::IA32_VMX_BASIC, vmx_basic),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_PROCBASED_CTLS2, 0x0410_10aa_0000_0000),
            (Msr::IA32_VMX_EXIT_CTLS, 0x00ff_ffff_0003_6dff),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x00ff_ffff_0003_6dfb),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0003_ffff_0000_11ff),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0003_ffff_0000_11fb),
            (Msr::IA32_VMX_MISC, 0x7004_c1e5),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_67ff),
            (Msr::IA32_VMX_EPT_VPID_CAP, 0x0f01_0673_4141),
            (Msr::IA32_PAT, 0x0007_0406_0007_0406),
            (Msr::IA32_EFER, 0xd01),
            (Msr::IA32_GS_BASE, Self::GS_BASE),
            (Msr::IA32_MTRRCAP, 0x508),
            (Msr::IA32_MTRR_DEF_TYPE, 0xc06),
        ] {
            msrs.insert(msr as u32, value);
        }
        // Low memory write-back, the legacy VGA hole uncacheable, the
        // option ROM and BIOS areas write-protected.
        const WB: u64 = 0x0606_0606_0606_0606;
        const WP: u64 = 0x0505_0505_0505_0505;
        msrs.insert(Msr::IA32_MTRR_FIX64K_00000 as u32, WB);
        msrs.insert(Msr::IA32_MTRR_FIX16K_80000 as u32, WB);
        msrs.insert(Msr::IA32_MTRR_FIX16K_A0000 as u32, 0);
        for n in 0..8 {
            let types = if n == 0 || n >= 6 { WP } else { WB };
            msrs.insert(Msr::mtrr_fix4k(n), types);
        }
        // 3 GiB..4 GiB is uncacheable.
        msrs.insert(Msr::mtrr_physbase(0), 0xc000_0000);
        msrs.insert(Msr::mtrr_physmask(0), 0x7f_c000_0000 | (1 << 11));

        let mut selectors = BTreeMap::new();
        selectors.insert(SegmentRegister::Cs, 0x08);
        selectors.insert(SegmentRegister::Ss, 0x10);
        selectors.insert(SegmentRegister::Tr, 0x20);

        Self {
            cpuid,
            msrs,
            cr0: 0x8005_0033,
            cr3: leak_zero_page(),
            cr4: 0x0035_06f0,
            dr7: 0x400,
            rflags: 0x246,
            xcr0: 0x7,
            tsc: 1_000_000,
            tsc_step: 1_000,
            gdtr: ((MOCK_GDT.len() * 8 - 1) as u16, leak_gdt()),
            idtr: (0xfff, Self::IDT_BASE),
            selectors,
            vmx_on: false,
            vmxon_count: 0,
            vmxoff_count: 0,
            vmlaunch_count: 0,
            fail_vmlaunch: false,
            invept_count: 0,
            wbinvd_count: 0,
            current_vmcs: None,
            vmcs: BTreeMap::new(),
            vmcalls: Vec::new(),
            loaded_tr: None,
        }
    }
}

/// The modelled processor for the current test thread.
#[derive(Debug)]
pub struct MockArch;

impl MockArch {
    /// Restore a freshly booted, VMX-capable processor.
    pub fn reset() {
        CPU.with(|c| *c.borrow_mut() = MockCpu::new());
    }

    pub fn with<R>(f: impl FnOnce(&mut MockCpu) -> R) -> R {
        CPU.with(|c| f(&mut c.borrow_mut()))
    }

    pub fn snapshot() -> MockCpu {
        Self::with(|cpu| cpu.clone())
    }

    pub fn set_msr(msr: u32, value: u64) {
        Self::with(|cpu| cpu.msrs.insert(msr, value));
    }

    pub fn vmcs_field(field: u32) -> Option<u64> {
        Self::with(|cpu| cpu.vmcs.get(&field).copied())
    }

    pub fn set_vmcs_field(field: u32, value: u64) {
        Self::with(|cpu| cpu.vmcs.insert(field, value));
    }
}

impl VmxArch for MockArch {
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        Self::with(|cpu| {
            cpu.cpuid
                .get(&(leaf, subleaf))
                .or_else(|| cpu.cpuid.get(&(leaf, 0)))
                .copied()
                .unwrap_or(CpuIdResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                })
        })
    }

    fn rdmsr(msr: u32) -> u64 {
        Self::with(|cpu| cpu.msrs.get(&msr).copied().unwrap_or(0))
    }

    unsafe fn wrmsr(msr: u32, value: u64) {
        Self::set_msr(msr, value);
    }

    fn read_cr0() -> u64 {
        Self::with(|cpu| cpu.cr0)
    }

    fn read_cr3() -> u64 {
        Self::with(|cpu| cpu.cr3)
    }

    fn read_cr4() -> u64 {
        Self::with(|cpu| cpu.cr4)
    }

    unsafe fn write_cr0(value: u64) {
        Self::with(|cpu| cpu.cr0 = value);
    }

    unsafe fn write_cr3(value: u64) {
        Self::with(|cpu| cpu.cr3 = value);
    }

    unsafe fn write_cr4(value: u64) {
        Self::with(|cpu| cpu.cr4 = value);
    }

    fn read_dr7() -> u64 {
        Self::with(|cpu| cpu.dr7)
    }

    unsafe fn write_dr7(value: u64) {
        Self::with(|cpu| cpu.dr7 = value);
    }

    fn read_rflags() -> u64 {
        Self::with(|cpu| cpu.rflags)
    }

    fn rdtsc() -> u64 {
        Self::with(|cpu| {
            cpu.tsc += cpu.tsc_step;
            cpu.tsc
        })
    }

    fn sgdt() -> DescriptorTablePointer {
        let (limit, base) = Self::with(|cpu| cpu.gdtr);
        DescriptorTablePointer {
            limit,
            base: X64VirtAddr::new(base),
        }
    }

    fn sidt() -> DescriptorTablePointer {
        let (limit, base) = Self::with(|cpu| cpu.idtr);
        DescriptorTablePointer {
            limit,
            base: X64VirtAddr::new(base),
        }
    }

    unsafe fn lgdt(gdt: &DescriptorTablePointer) {
        Self::with(|cpu| cpu.gdtr = (gdt.limit, gdt.base.as_u64()));
    }

    unsafe fn lidt(idt: &DescriptorTablePointer) {
        Self::with(|cpu| cpu.idtr = (idt.limit, idt.base.as_u64()));
    }

    fn selector(reg: SegmentRegister) -> SegmentSelector {
        SegmentSelector::from_raw(Self::with(|cpu| {
            cpu.selectors.get(&reg).copied().unwrap_or(0)
        }))
    }

    unsafe fn load_tr(selector: SegmentSelector) {
        Self::with(|cpu| {
            cpu.loaded_tr = Some(selector.bits());
            cpu.selectors.insert(SegmentRegister::Tr, selector.bits());
        });
    }

    unsafe fn xsetbv(_xcr: u32, value: u64) {
        Self::with(|cpu| cpu.xcr0 = value);
    }

    unsafe fn wbinvd() {
        Self::with(|cpu| cpu.wbinvd_count += 1);
    }

    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail> {
        let revision = unsafe { *(paddr as *const u32) };
        Self::with(|cpu| {
            if cpu.vmx_on || cpu.cr4 & (1 << 13) == 0 || revision != MockCpu::VMCS_REVISION {
                return Err(VmFail::VmFailInvalid);
            }
            cpu.vmx_on = true;
            cpu.vmxon_count += 1;
            Ok(())
        })
    }

    unsafe fn vmxoff() -> Result<(), VmFail> {
        Self::with(|cpu| {
            if !cpu.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            cpu.vmx_on = false;
            cpu.vmxoff_count += 1;
            cpu.current_vmcs = None;
            Ok(())
        })
    }

    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail> {
        Self::with(|cpu| {
            if !cpu.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            if cpu.current_vmcs == Some(paddr) {
                cpu.current_vmcs = None;
            }
            Ok(())
        })
    }

    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail> {
        Self::with(|cpu| {
            if !cpu.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            cpu.current_vmcs = Some(paddr);
            Ok(())
        })
    }

    unsafe fn vmread(field: u32) -> Result<u64, VmFail> {
        Self::with(|cpu| match cpu.current_vmcs {
            Some(_) => Ok(cpu.vmcs.get(&field).copied().unwrap_or(0)),
            None => Err(VmFail::VmFailInvalid),
        })
    }

    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail> {
        Self::with(|cpu| match cpu.current_vmcs {
            Some(_) => {
                cpu.vmcs.insert(field, value);
                Ok(())
            }
            None => Err(VmFail::VmFailInvalid),
        })
    }

    unsafe fn vmlaunch_current() -> Result<(), VmFail> {
        Self::with(|cpu| {
            if cpu.current_vmcs.is_none() {
                return Err(VmFail::VmFailInvalid);
            }
            if cpu.fail_vmlaunch {
                // VM entry with invalid control field(s).
                cpu.vmcs.insert(0x4400, 7);
                return Err(VmFail::VmFailValid);
            }
            cpu.vmlaunch_count += 1;
            Ok(())
        })
    }

    unsafe fn invept(_eptp: u64) -> Result<(), VmFail> {
        Self::with(|cpu| {
            if !cpu.vmx_on {
                return Err(VmFail::VmFailInvalid);
            }
            cpu.invept_count += 1;
            Ok(())
        })
    }

    unsafe fn vmcall(rax: u64, rcx: u64, rdx: u64) -> u64 {
        Self::with(|cpu| cpu.vmcalls.push((rax, rcx, rdx)));
        0
    }
}
