//! Hardware abstraction seams.
//!
//! [`HvHal`] is supplied by the embedding kernel (memory and entry points),
//! [`VmxArch`] is the processor instruction surface. [`crate::NativeArch`]
//! implements the latter on real hardware.

use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::{CpuIdReader, CpuIdResult};
use x86::segmentation::SegmentSelector;
use x86::vmx::VmFail;
use x86_64::structures::DescriptorTablePointer;

/// Segment registers readable through [`VmxArch::selector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

/// The processor instruction surface used by the hypervisor.
///
/// All functions act on the logical processor the caller is running on.
pub trait VmxArch {
    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult;

    fn rdmsr(msr: u32) -> u64;
    /// # Safety
    ///
    /// Writing an MSR can change processor behavior arbitrarily.
    unsafe fn wrmsr(msr: u32, value: u64);

    fn read_cr0() -> u64;
    fn read_cr3() -> u64;
    fn read_cr4() -> u64;
    /// # Safety
    ///
    /// The value must be valid for the current processor mode.
    unsafe fn write_cr0(value: u64);
    /// # Safety
    ///
    /// The value must reference a valid PML4.
    unsafe fn write_cr3(value: u64);
    /// # Safety
    ///
    /// The value must be valid for the current processor mode.
    unsafe fn write_cr4(value: u64);
    fn read_dr7() -> u64;
    /// # Safety
    ///
    /// Enabled breakpoints fire on the next matching access.
    unsafe fn write_dr7(value: u64);
    fn read_rflags() -> u64;
    fn rdtsc() -> u64;

    fn sgdt() -> DescriptorTablePointer;
    fn sidt() -> DescriptorTablePointer;
    /// # Safety
    ///
    /// The table must stay valid while loaded.
    unsafe fn lgdt(gdt: &DescriptorTablePointer);
    /// # Safety
    ///
    /// The table must stay valid while loaded.
    unsafe fn lidt(idt: &DescriptorTablePointer);
    fn selector(reg: SegmentRegister) -> SegmentSelector;
    /// # Safety
    ///
    /// The selector must reference an available TSS descriptor.
    unsafe fn load_tr(selector: SegmentSelector);

    /// # Safety
    ///
    /// `value` must only contain supported XCR0 bits.
    unsafe fn xsetbv(xcr: u32, value: u64);
    /// Write back and invalidate caches.
    ///
    /// # Safety
    ///
    /// Privileged instruction.
    unsafe fn wbinvd();

    /// # Safety
    ///
    /// `paddr` must be a prepared VMXON region and CR4.VMXE must be set.
    unsafe fn vmxon(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// Must be in VMX root operation.
    unsafe fn vmxoff() -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `paddr` must be a VMCS region.
    unsafe fn vmclear(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// `paddr` must be a VMCS region.
    unsafe fn vmptrld(paddr: u64) -> Result<(), VmFail>;
    /// # Safety
    ///
    /// Requires a current VMCS.
    unsafe fn vmread(field: u32) -> Result<u64, VmFail>;
    /// # Safety
    ///
    /// Requires a current VMCS.
    unsafe fn vmwrite(field: u32, value: u64) -> Result<(), VmFail>;
    /// Launch the current VMCS so the guest continues right after this call.
    ///
    /// Returns `Ok(())` in the guest on success, with guest RSP and RIP
    /// pointing at the caller's continuation.
    ///
    /// # Safety
    ///
    /// The current VMCS must be fully configured.
    unsafe fn vmlaunch_current() -> Result<(), VmFail>;
    /// Single-context EPT invalidation.
    ///
    /// # Safety
    ///
    /// Must be in VMX root operation.
    unsafe fn invept(eptp: u64) -> Result<(), VmFail>;
    /// Issue a hypercall from guest context, returning the new RAX.
    ///
    /// # Safety
    ///
    /// Hypercalls may tear down virtualization on this processor.
    unsafe fn vmcall(rax: u64, rcx: u64, rdx: u64) -> u64;
}

/// Services the embedding kernel provides to the hypervisor.
pub trait HvHal {
    /// The processor instruction surface.
    type Arch: VmxArch;

    /// Allocates a 4 KiB frame, returning its physical address.
    fn alloc_frame() -> Option<PhysAddr>;
    /// Frees a frame returned by [`HvHal::alloc_frame`].
    fn dealloc_frame(paddr: PhysAddr);
    /// Allocates `count` physically contiguous 4 KiB frames.
    fn alloc_contiguous_frames(count: usize) -> Option<PhysAddr>;
    /// Frees frames returned by [`HvHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: PhysAddr, count: usize);
    fn phys_to_virt(paddr: PhysAddr) -> VirtAddr;

    /// Host RIP on every VM exit: the register-save trampoline.
    fn vmexit_entry() -> usize;
    /// Host IDT target for `vector`.
    fn interrupt_entry(vector: u8) -> usize;

    /// Host virtual address at which physical address 0 is visible while
    /// handling VM exits.
    fn phys_mem_base() -> usize {
        crate::HOST_PHYSICAL_MEMORY_BASE
    }
}

/// Adapts [`VmxArch::cpuid`] to `raw_cpuid`.
pub(crate) struct ArchCpuIdReader<A>(core::marker::PhantomData<A>);

impl<A> ArchCpuIdReader<A> {
    pub const fn new() -> Self {
        Self(core::marker::PhantomData)
    }
}

impl<A> Clone for ArchCpuIdReader<A> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<A: VmxArch> CpuIdReader for ArchCpuIdReader<A> {
    fn cpuid2(&self, eax: u32, ecx: u32) -> CpuIdResult {
        A::cpuid(eax, ecx)
    }
}

/// `raw_cpuid` view of the processor behind `A`.
pub(crate) fn cpuid_of<A: VmxArch>() -> raw_cpuid::CpuId<ArchCpuIdReader<A>> {
    raw_cpuid::CpuId::with_cpuid_reader(ArchCpuIdReader::new())
}
