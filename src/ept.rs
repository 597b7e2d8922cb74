//! Extended page tables: an identity map of guest-physical memory.

use alloc::vec::Vec;

use bit_field::BitField;
use bitflags::bitflags;
use memory_addr::PhysAddr;

use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::hal::HvHal;
use crate::mtrr::{MemoryType, MtrrData};
use crate::{EPT_PD_COUNT, HvError, HvResult};

const ENTRY_COUNT: usize = 512;
const LARGE_PAGE_SIZE: u64 = 0x20_0000;
const HUGE_PAGE_SIZE: u64 = 0x4000_0000;
const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000; // bits 12..52

const fn p4_index(gpa: u64) -> usize {
    ((gpa >> (12 + 27)) as usize) & (ENTRY_COUNT - 1)
}

const fn p3_index(gpa: u64) -> usize {
    ((gpa >> (12 + 18)) as usize) & (ENTRY_COUNT - 1)
}

const fn p2_index(gpa: u64) -> usize {
    ((gpa >> (12 + 9)) as usize) & (ENTRY_COUNT - 1)
}

const fn p1_index(gpa: u64) -> usize {
    ((gpa >> 12) as usize) & (ENTRY_COUNT - 1)
}

bitflags! {
    /// EPT entry flags. (SDM Vol. 3C, Section 28.3.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        /// Read access.
        const READ =                1 << 0;
        /// Write access.
        const WRITE =               1 << 1;
        /// Execute access.
        const EXECUTE =             1 << 2;
        /// EPT memory type. Only for terminate pages.
        const MEM_TYPE_MASK =       0b111 << 3;
        /// Ignore PAT memory type. Only for terminate pages.
        const IGNORE_PAT =          1 << 6;
        /// Specifies that the entry maps a huge frame instead of a page table.
        /// Only allowed in P2 or P3 tables.
        const HUGE_PAGE =           1 << 7;
        /// If bit 6 of EPTP is 1, accessed flag for EPT.
        const ACCESSED =            1 << 8;
        /// If bit 6 of EPTP is 1, dirty flag for EPT.
        const DIRTY =               1 << 9;
        /// Execute access for user-mode linear addresses.
        const EXECUTE_FOR_USER =    1 << 10;
    }
}

impl EptFlags {
    pub const RWX: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// An entry of any EPT paging level.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A non-leaf entry pointing at the table at `paddr`.
    pub fn new_table(paddr: PhysAddr) -> Self {
        Self((paddr.as_usize() as u64 & PHYS_ADDR_MASK) | EptFlags::RWX.bits())
    }

    /// A leaf entry mapping `paddr` with `flags` and `mem_type`.
    pub fn new_page(paddr: u64, flags: EptFlags, mem_type: MemoryType, huge: bool) -> Self {
        let mut entry = Self((paddr & PHYS_ADDR_MASK) | flags.bits());
        entry.set_mem_type(mem_type);
        if huge {
            entry.0 |= EptFlags::HUGE_PAGE.bits();
        }
        entry
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn paddr(&self) -> u64 {
        self.0 & PHYS_ADDR_MASK
    }

    pub fn flags(&self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    pub fn permissions(&self) -> EptFlags {
        self.flags() & EptFlags::RWX
    }

    pub fn set_permissions(&mut self, perms: EptFlags) {
        self.0 = (self.0 & !EptFlags::RWX.bits()) | (perms & EptFlags::RWX).bits();
    }

    pub fn mem_type(&self) -> Option<MemoryType> {
        MemoryType::try_from(self.0.get_bits(3..6) as u8).ok()
    }

    fn set_mem_type(&mut self, mem_type: MemoryType) {
        self.0.set_bits(3..6, mem_type as u64);
    }

    pub fn is_huge(&self) -> bool {
        self.flags().contains(EptFlags::HUGE_PAGE)
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("EptEntry")
            .field("raw", &self.0)
            .field("paddr", &self.paddr())
            .field("flags", &self.flags())
            .field("mem_type", &self.mem_type())
            .finish()
    }
}

/// Result of an EPT walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptTranslation {
    pub hpa: u64,
    pub permissions: EptFlags,
    pub mem_type: Option<MemoryType>,
    /// Size of the leaf mapping.
    pub page_size: u64,
}

/// A split 2 MiB page and the guest-physical base it covers.
#[derive(Debug)]
struct SplitTable<H: HvHal> {
    gpa_base: u64,
    frame: PhysFrame<H>,
}

/// Second-level translation tables of one processor record.
///
/// The first `EPT_PD_COUNT` GiB of guest-physical memory are identity mapped
/// with 2 MiB pages. Single 2 MiB pages are split into 4 KiB tables on demand.
#[derive(Debug)]
pub struct Ept<H: HvHal> {
    pml4: PhysFrame<H>,
    pdpt: PhysFrame<H>,
    pds: ContiguousPhysFrames<H>,
    pts: Vec<SplitTable<H>>,
    /// Memory types for pages created by splitting.
    mtrrs: MtrrData,
}

impl<H: HvHal> Ept<H> {
    /// # Safety
    ///
    /// The tables are placeholders and must never be installed.
    pub const unsafe fn uninit() -> Self {
        unsafe {
            Self {
                pml4: PhysFrame::uninit(),
                pdpt: PhysFrame::uninit(),
                pds: ContiguousPhysFrames::uninit(),
                pts: Vec::new(),
                mtrrs: MtrrData::disabled(),
            }
        }
    }

    /// Build the default identity map, memory types taken from `mtrrs`.
    pub fn new(mtrrs: &MtrrData) -> HvResult<Self> {
        let mut pml4 = PhysFrame::alloc_zero()?;
        let mut pdpt = PhysFrame::alloc_zero()?;
        let mut pds = ContiguousPhysFrames::alloc_zero(EPT_PD_COUNT)?;

        pml4.as_u64_slice_mut()[0] = EptEntry::new_table(pdpt.start_paddr()).bits();
        for i in 0..EPT_PD_COUNT {
            pdpt.as_u64_slice_mut()[i] = EptEntry::new_table(pds.frame_paddr(i)).bits();
            let pd = pds.frame_as_u64_slice_mut(i);
            for (j, entry) in pd.iter_mut().enumerate() {
                let gpa = i as u64 * HUGE_PAGE_SIZE + j as u64 * LARGE_PAGE_SIZE;
                let mem_type = mtrrs.memory_type(gpa, LARGE_PAGE_SIZE);
                *entry = EptEntry::new_page(gpa, EptFlags::RWX, mem_type, true).bits();
            }
        }
        debug!(
            "[HV] EPT identity map built: {} GiB, root {:#x}",
            EPT_PD_COUNT,
            pml4.start_paddr().as_usize()
        );

        Ok(Self {
            pml4,
            pdpt,
            pds,
            pts: Vec::new(),
            mtrrs: mtrrs.clone(),
        })
    }

    /// Upper bound (exclusive) of the mapped guest-physical range.
    pub const fn mapped_limit() -> u64 {
        EPT_PD_COUNT as u64 * HUGE_PAGE_SIZE
    }

    pub fn root_paddr(&self) -> PhysAddr {
        self.pml4.start_paddr()
    }

    /// EPT pointer: write-back paging structures, 4-level walk. (SDM Vol. 3C, Section 24.6.11)
    pub fn eptp(&self) -> u64 {
        const EPT_POINTER_MEMORY_TYPE_WRITE_BACK: u64 = 6;
        const EPT_POINTER_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        self.root_paddr().as_usize() as u64
            | EPT_POINTER_PAGE_WALK_LENGTH_4
            | EPT_POINTER_MEMORY_TYPE_WRITE_BACK
    }

    fn check_gpa(gpa: u64) -> HvResult {
        if gpa >= Self::mapped_limit() {
            return Err(HvError::BadAddress(gpa));
        }
        Ok(())
    }

    fn pd_entry(&self, gpa: u64) -> EptEntry {
        EptEntry(self.pds.frame_as_u64_slice(p3_index(gpa))[p2_index(gpa)])
    }

    fn pd_entry_mut(&mut self, gpa: u64) -> &mut u64 {
        &mut self.pds.frame_as_u64_slice_mut(p3_index(gpa))[p2_index(gpa)]
    }

    fn split_table_index(&self, gpa: u64) -> Option<usize> {
        let base = gpa & !(LARGE_PAGE_SIZE - 1);
        self.pts.iter().position(|pt| pt.gpa_base == base)
    }

    /// Walk the tables for `gpa`.
    pub fn translate(&self, gpa: u64) -> HvResult<EptTranslation> {
        Self::check_gpa(gpa)?;
        debug_assert_eq!(p4_index(gpa), 0);
        let pde = self.pd_entry(gpa);
        if pde.is_huge() {
            return Ok(EptTranslation {
                hpa: pde.paddr() + (gpa & (LARGE_PAGE_SIZE - 1)),
                permissions: pde.permissions(),
                mem_type: pde.mem_type(),
                page_size: LARGE_PAGE_SIZE,
            });
        }
        let pt = self
            .split_table_index(gpa)
            .map(|i| &self.pts[i])
            .ok_or(HvError::BadAddress(gpa))?;
        let pte = EptEntry(pt.frame.as_u64_slice()[p1_index(gpa)]);
        Ok(EptTranslation {
            hpa: pte.paddr() + (gpa & (PAGE_SIZE as u64 - 1)),
            permissions: pte.permissions(),
            mem_type: pte.mem_type(),
            page_size: PAGE_SIZE as u64,
        })
    }

    /// Replace the 2 MiB page containing `gpa` by 512 4 KiB entries with the
    /// same target and permissions. Each entry gets the exact MTRR memory type
    /// of its own page. A no-op when already split.
    pub fn split_2mb(&mut self, gpa: u64) -> HvResult {
        Self::check_gpa(gpa)?;
        let pde = self.pd_entry(gpa);
        if !pde.is_huge() {
            return Ok(());
        }

        let mut frame = PhysFrame::<H>::alloc_zero()?;
        for (i, entry) in frame.as_u64_slice_mut().iter_mut().enumerate() {
            let hpa = pde.paddr() + (i * PAGE_SIZE) as u64;
            let mem_type = self.mtrrs.memory_type(hpa, PAGE_SIZE as u64);
            *entry = EptEntry::new_page(hpa, pde.permissions(), mem_type, false).bits();
        }
        *self.pd_entry_mut(gpa) = EptEntry::new_table(frame.start_paddr()).bits();
        self.pts.push(SplitTable {
            gpa_base: gpa & !(LARGE_PAGE_SIZE - 1),
            frame,
        });
        debug!("[HV] EPT split 2 MiB page at {:#x}", gpa & !(LARGE_PAGE_SIZE - 1));
        Ok(())
    }

    fn pte_mut(&mut self, gpa: u64) -> HvResult<&mut u64> {
        self.split_2mb(gpa)?;
        let index = self
            .split_table_index(gpa)
            .ok_or(HvError::BadAddress(gpa))?;
        Ok(&mut self.pts[index].frame.as_u64_slice_mut()[p1_index(gpa)])
    }

    /// Map the 4 KiB guest page at `gpa` to host page `hpa` with `perms`.
    ///
    /// The memory type of the surrounding large page is kept.
    pub fn map_4k(&mut self, gpa: u64, hpa: u64, perms: EptFlags) -> HvResult {
        let entry = self.pte_mut(gpa)?;
        let mem_type = EptEntry(*entry)
            .mem_type()
            .unwrap_or(MemoryType::Uncacheable);
        *entry = EptEntry::new_page(hpa, perms, mem_type, false).bits();
        Ok(())
    }

    /// Narrow or widen the access rights of the 4 KiB page at `gpa`.
    pub fn set_permissions(&mut self, gpa: u64, perms: EptFlags) -> HvResult {
        let entry = self.pte_mut(gpa)?;
        let mut pte = EptEntry(*entry);
        pte.set_permissions(perms);
        *entry = pte.bits();
        Ok(())
    }

    /// Give the leaf mapping `gpa` full access again. Never allocates: pages
    /// that were never split are already fully accessible.
    ///
    /// Returns whether anything changed.
    pub fn restore_full_permissions(&mut self, gpa: u64) -> HvResult<bool> {
        Self::check_gpa(gpa)?;
        let pde = self.pd_entry(gpa);
        let entry = if pde.is_huge() {
            self.pd_entry_mut(gpa)
        } else {
            let index = self
                .split_table_index(gpa)
                .ok_or(HvError::BadAddress(gpa))?;
            &mut self.pts[index].frame.as_u64_slice_mut()[p1_index(gpa)]
        };
        let mut leaf = EptEntry(*entry);
        if leaf.permissions() == EptFlags::RWX {
            return Ok(false);
        }
        leaf.set_permissions(EptFlags::RWX);
        *entry = leaf.bits();
        Ok(true)
    }

    /// Number of 2 MiB pages currently split into 4 KiB tables.
    pub fn split_count(&self) -> usize {
        self.pts.len()
    }
}
