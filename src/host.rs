//! The host side of every VM exit: a private GDT, IDT, TSS and stack.

use bit_field::BitField;
use x86_64::VirtAddr;
use x86_64::structures::gdt::DescriptorFlags;
use x86_64::structures::tss::TaskStateSegment;

use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::hal::HvHal;
use crate::{
    HOST_CS_SELECTOR, HOST_GDT_DESCRIPTOR_COUNT, HOST_IDT_DESCRIPTOR_COUNT, HOST_STACK_SIZE,
    HOST_TR_SELECTOR, HvResult,
};

/// Byte offset of the TSS inside the GDT frame.
const TSS_OFFSET: usize = 0x100;
/// 64-bit interrupt gate, present, DPL 0.
const INTERRUPT_GATE: u64 = 0x8e;
/// Available 64-bit TSS, present.
const TSS_AVAILABLE: u64 = 0x89;
/// IST slot used by the NMI gate (1-based, as encoded in the gate).
const NMI_IST: u64 = 1;
const NMI_STACK_SIZE: usize = PAGE_SIZE;

/// Host-state values the configurator copies into the VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub cs: u16,
    pub tr: u16,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub tr_base: u64,
    pub rsp: u64,
    pub rip: u64,
}

/// Frames backing the host execution environment of one processor record.
#[derive(Debug)]
pub struct HostEnvironment<H: HvHal> {
    stack: ContiguousPhysFrames<H>,
    idt: PhysFrame<H>,
    /// GDT at offset 0, TSS at [`TSS_OFFSET`].
    gdt: PhysFrame<H>,
}

const _: () = assert!(HOST_IDT_DESCRIPTOR_COUNT * 16 <= PAGE_SIZE);
const _: () = assert!(HOST_GDT_DESCRIPTOR_COUNT * 8 <= TSS_OFFSET);
const _: () = assert!(HOST_STACK_SIZE % PAGE_SIZE == 0 && HOST_STACK_SIZE > NMI_STACK_SIZE);

impl<H: HvHal> HostEnvironment<H> {
    /// # Safety
    ///
    /// The frames are placeholders and must never be loaded.
    pub const unsafe fn uninit() -> Self {
        unsafe {
            Self {
                stack: ContiguousPhysFrames::uninit(),
                idt: PhysFrame::uninit(),
                gdt: PhysFrame::uninit(),
            }
        }
    }

    /// Allocate and populate the tables. `record` is stored at the top of
    /// the host stack for the exit trampoline.
    pub fn new(record: usize) -> HvResult<Self> {
        let mut env = Self {
            stack: ContiguousPhysFrames::alloc_zero(HOST_STACK_SIZE / PAGE_SIZE)?,
            idt: PhysFrame::alloc_zero()?,
            gdt: PhysFrame::alloc_zero()?,
        };
        env.build_idt();
        env.build_tss();
        env.build_gdt();
        unsafe { *(env.stack_top() as *mut u64).sub(1) = record as u64 };

        debug!(
            "[HV] host environment: GDT {:#x}, IDT {:#x}, stack top {:#x}",
            env.gdt_base(),
            env.idt_base(),
            env.stack_top()
        );
        Ok(env)
    }

    fn stack_bottom(&self) -> usize {
        self.stack.as_mut_ptr() as usize
    }

    fn stack_top(&self) -> usize {
        self.stack_bottom() + HOST_STACK_SIZE
    }

    fn gdt_base(&self) -> u64 {
        self.gdt.as_mut_ptr() as u64
    }

    fn idt_base(&self) -> u64 {
        self.idt.as_mut_ptr() as u64
    }

    fn tss_base(&self) -> u64 {
        self.gdt_base() + TSS_OFFSET as u64
    }

    fn build_idt(&mut self) {
        let cs = HOST_CS_SELECTOR.bits() as u64;
        let idt = self.idt.as_u64_slice_mut();
        for vector in 0..HOST_IDT_DESCRIPTOR_COUNT {
            let handler = H::interrupt_entry(vector as u8) as u64;
            let ist = if vector == x86::irq::NONMASKABLE_INTERRUPT_VECTOR as usize {
                NMI_IST
            } else {
                0
            };
            let mut low = 0u64;
            low.set_bits(0..16, handler.get_bits(0..16))
                .set_bits(16..32, cs)
                .set_bits(32..35, ist)
                .set_bits(40..48, INTERRUPT_GATE)
                .set_bits(48..64, handler.get_bits(16..32));
            idt[vector * 2] = low;
            idt[vector * 2 + 1] = handler.get_bits(32..64);
        }
    }

    fn build_tss(&mut self) {
        let mut tss = TaskStateSegment::new();
        tss.privilege_stack_table[0] = VirtAddr::new(self.stack_top() as u64);
        tss.interrupt_stack_table[NMI_IST as usize - 1] =
            VirtAddr::new((self.stack_bottom() + NMI_STACK_SIZE) as u64);
        unsafe {
            let ptr = self.gdt.as_mut_ptr().add(TSS_OFFSET) as *mut TaskStateSegment;
            ptr.write_unaligned(tss);
        }
    }

    fn build_gdt(&mut self) {
        let base = self.tss_base();
        let limit = (core::mem::size_of::<TaskStateSegment>() - 1) as u64;
        let mut tss_low = 0u64;
        tss_low
            .set_bits(0..16, limit.get_bits(0..16))
            .set_bits(16..40, base.get_bits(0..24))
            .set_bits(40..48, TSS_AVAILABLE)
            .set_bits(48..52, limit.get_bits(16..20))
            .set_bits(56..64, base.get_bits(24..32));

        let gdt = self.gdt.as_u64_slice_mut();
        gdt[0] = 0;
        gdt[HOST_CS_SELECTOR.index() as usize] = DescriptorFlags::KERNEL_CODE64.bits();
        gdt[HOST_TR_SELECTOR.index() as usize] = tss_low;
        gdt[HOST_TR_SELECTOR.index() as usize + 1] = base.get_bits(32..64);
    }

    /// Values for the host-state area of the VMCS.
    pub fn state(&self) -> HostState {
        HostState {
            cs: HOST_CS_SELECTOR.bits(),
            tr: HOST_TR_SELECTOR.bits(),
            gdtr_base: self.gdt_base(),
            idtr_base: self.idt_base(),
            tr_base: self.tss_base(),
            rsp: (self.stack_top() - core::mem::size_of::<u64>()) as u64,
            rip: H::vmexit_entry() as u64,
        }
    }

    /// The host GDT slots.
    pub fn gdt(&self) -> &[u64] {
        &self.gdt.as_u64_slice()[..HOST_GDT_DESCRIPTOR_COUNT]
    }

    /// Handler address, selector and IST index of gate `vector`.
    pub fn gate(&self, vector: u8) -> (u64, u16, u8) {
        let idt = self.idt.as_u64_slice();
        let (low, high) = (idt[vector as usize * 2], idt[vector as usize * 2 + 1]);
        let handler = low.get_bits(0..16) | low.get_bits(48..64) << 16 | high << 32;
        (handler, low.get_bits(16..32) as u16, low.get_bits(32..35) as u8)
    }

    /// A copy of the host TSS.
    pub fn tss(&self) -> TaskStateSegment {
        unsafe { (self.gdt.as_mut_ptr().add(TSS_OFFSET) as *const TaskStateSegment).read_unaligned() }
    }

    /// Record address stored at the top of the host stack.
    pub fn record(&self) -> usize {
        unsafe { *(self.stack_top() as *const u64).sub(1) as usize }
    }
}
