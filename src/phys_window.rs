//! The host address space shared by every processor: the running kernel's
//! upper half plus a linear window over the first 128 GiB of physical memory.

use memory_addr::PhysAddr;
use spin::Once;
use x86_64::structures::paging::PageTableFlags as PTF;

use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::hal::{HvHal, VmxArch};
use crate::{
    HOST_PHYSICAL_MEMORY_BASE, HOST_PHYSICAL_MEMORY_PML4_IDX, HOST_PHYSICAL_MEMORY_SIZE, HvError,
    HvResult,
};

const ENTRY_COUNT: usize = 512;
const LARGE_PAGE_SIZE: usize = 0x20_0000;
const HUGE_PAGE_SIZE: usize = 0x4000_0000;
const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
/// PDPT entries needed to cover the window.
const WINDOW_PDPT_ENTRIES: usize = HOST_PHYSICAL_MEMORY_SIZE / HUGE_PAGE_SIZE;

static WINDOW: Once<PhysicalMemoryWindow> = Once::new();

/// Host paging structures with the direct physical-memory window installed.
///
/// Built once, then only read. Its PML4 becomes the host CR3 of every
/// virtualized processor.
#[derive(Debug)]
pub struct PhysicalMemoryWindow {
    pml4: PhysAddr,
}

impl PhysicalMemoryWindow {
    /// Build the window on first use and return it.
    ///
    /// The upper half of the current CR3 is copied, so the kernel image,
    /// heap and per-cpu data stay mapped for the exit handler.
    pub fn init<H: HvHal>() -> HvResult<&'static Self> {
        WINDOW.try_call_once(Self::build::<H>)
    }

    /// The window, if [`PhysicalMemoryWindow::init`] has completed.
    pub fn get() -> Option<&'static Self> {
        WINDOW.get()
    }

    fn build<H: HvHal>() -> HvResult<Self> {
        let mut pml4 = PhysFrame::<H>::alloc_zero()?;
        let mut pdpt = PhysFrame::<H>::alloc_zero()?;
        let mut pds = ContiguousPhysFrames::<H>::alloc_zero(WINDOW_PDPT_ENTRIES)?;

        let table_flags = (PTF::PRESENT | PTF::WRITABLE).bits();
        let leaf_flags = (PTF::PRESENT | PTF::WRITABLE | PTF::HUGE_PAGE).bits();

        for i in 0..WINDOW_PDPT_ENTRIES {
            pdpt.as_u64_slice_mut()[i] = pds.frame_paddr(i).as_usize() as u64 | table_flags;
            for (j, entry) in pds.frame_as_u64_slice_mut(i).iter_mut().enumerate() {
                let paddr = i * HUGE_PAGE_SIZE + j * LARGE_PAGE_SIZE;
                *entry = paddr as u64 | leaf_flags;
            }
        }

        let current = H::phys_to_virt(PhysAddr::from_usize(
            (<H::Arch as VmxArch>::read_cr3() & PHYS_ADDR_MASK) as usize,
        ));
        let current =
            unsafe { core::slice::from_raw_parts(current.as_ptr() as *const u64, ENTRY_COUNT) };
        let table = pml4.as_u64_slice_mut();
        table[ENTRY_COUNT / 2..].copy_from_slice(&current[ENTRY_COUNT / 2..]);
        table[HOST_PHYSICAL_MEMORY_PML4_IDX] = pdpt.start_paddr().as_usize() as u64 | table_flags;

        let window = Self {
            pml4: pml4.start_paddr(),
        };
        // Never freed.
        core::mem::forget(pml4);
        core::mem::forget(pdpt);
        core::mem::forget(pds);

        info!(
            "[HV] physical memory window ready: {:#x}..{:#x}, host CR3 {:#x}",
            HOST_PHYSICAL_MEMORY_BASE,
            HOST_PHYSICAL_MEMORY_BASE + HOST_PHYSICAL_MEMORY_SIZE,
            window.pml4.as_usize()
        );
        Ok(window)
    }

    /// Host virtual address of physical address 0.
    pub const fn base(&self) -> usize {
        HOST_PHYSICAL_MEMORY_BASE
    }

    /// Value to load into host CR3.
    pub fn host_cr3(&self) -> u64 {
        self.pml4.as_usize() as u64
    }

    fn check(paddr: u64, len: usize) -> HvResult {
        match paddr.checked_add(len as u64) {
            Some(end) if end <= HOST_PHYSICAL_MEMORY_SIZE as u64 => Ok(()),
            _ => Err(HvError::BadAddress(paddr)),
        }
    }

    /// Host virtual address of `paddr` inside the window.
    pub fn ptr(&self, paddr: u64) -> HvResult<*mut u8> {
        Self::check(paddr, 1)?;
        Ok((self.base() + paddr as usize) as *mut u8)
    }

    /// Read the quadword at `paddr` from the exit path.
    pub fn read_u64<H: HvHal>(&self, paddr: u64) -> HvResult<u64> {
        Self::check(paddr, 8)?;
        let ptr = (H::phys_mem_base() + paddr as usize) as *const u64;
        Ok(unsafe { ptr.read_unaligned() })
    }

    /// Write the quadword at `paddr` from the exit path.
    pub fn write_u64<H: HvHal>(&self, paddr: u64, value: u64) -> HvResult {
        Self::check(paddr, 8)?;
        let ptr = (H::phys_mem_base() + paddr as usize) as *mut u64;
        unsafe { ptr.write_unaligned(value) };
        Ok(())
    }

    /// Walk the window's paging structures for `vaddr`.
    pub fn translate<H: HvHal>(&self, vaddr: usize) -> Option<u64> {
        let read = |table: u64, index: usize| -> u64 {
            let table = H::phys_to_virt(PhysAddr::from_usize((table & PHYS_ADDR_MASK) as usize));
            unsafe { *(table.as_ptr() as *const u64).add(index) }
        };
        let present = PTF::PRESENT.bits();

        let pml4e = read(self.pml4.as_usize() as u64, (vaddr >> 39) & (ENTRY_COUNT - 1));
        if pml4e & present == 0 {
            return None;
        }
        let pdpte = read(pml4e, (vaddr >> 30) & (ENTRY_COUNT - 1));
        if pdpte & present == 0 {
            return None;
        }
        let pde = read(pdpte, (vaddr >> 21) & (ENTRY_COUNT - 1));
        if pde & present == 0 || pde & PTF::HUGE_PAGE.bits() == 0 {
            return None;
        }
        Some((pde & PHYS_ADDR_MASK & !(LARGE_PAGE_SIZE as u64 - 1)) + (vaddr % LARGE_PAGE_SIZE) as u64)
    }
}

const _: () = assert!(HOST_PHYSICAL_MEMORY_SIZE % HUGE_PAGE_SIZE == 0);
const _: () = assert!(WINDOW_PDPT_ENTRIES <= ENTRY_COUNT);
const _: () = assert!(PAGE_SIZE * ENTRY_COUNT == LARGE_PAGE_SIZE);
