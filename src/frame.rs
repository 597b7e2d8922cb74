use core::marker::PhantomData;

use memory_addr::PhysAddr;

use crate::hal::HvHal;
use crate::{HvError, HvResult};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: HvHal> {
    start_paddr: Option<PhysAddr>,
    _marker: PhantomData<H>,
}

impl<H: HvHal> PhysFrame<H> {
    pub fn alloc() -> HvResult<Self> {
        let start_paddr = H::alloc_frame().ok_or(HvError::MemoryAllocationFailed)?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr: Some(start_paddr),
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero() -> HvResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// # Safety
    ///
    /// The frame is a placeholder and must never be accessed.
    pub const unsafe fn uninit() -> Self {
        Self {
            start_paddr: None,
            _marker: PhantomData,
        }
    }

    pub fn is_uninit(&self) -> bool {
        self.start_paddr.is_none()
    }

    pub fn start_paddr(&self) -> PhysAddr {
        self.start_paddr.expect("uninitialized PhysFrame")
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    /// The frame as a table of 512 quadwords.
    pub fn as_u64_slice_mut(&mut self) -> &mut [u64] {
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr() as *mut u64, PAGE_SIZE / 8) }
    }

    pub fn as_u64_slice(&self) -> &[u64] {
        unsafe { core::slice::from_raw_parts(self.as_mut_ptr() as *const u64, PAGE_SIZE / 8) }
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: HvHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        if let Some(start_paddr) = self.start_paddr {
            H::dealloc_frame(start_paddr);
            debug!("[HV] deallocated PhysFrame({:#x})", start_paddr.as_usize());
        }
    }
}

/// A contiguous block of physical memory frames that will be automatically
/// deallocated when dropped. Used for the host stack and the EPT page
/// directories.
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: HvHal> {
    start_paddr: Option<PhysAddr>,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: HvHal> ContiguousPhysFrames<H> {
    pub fn alloc(frame_count: usize) -> HvResult<Self> {
        let start_paddr =
            H::alloc_contiguous_frames(frame_count).ok_or(HvError::MemoryAllocationFailed)?;

        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr: Some(start_paddr),
            frame_count,
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero(frame_count: usize) -> HvResult<Self> {
        let mut frames = Self::alloc(frame_count)?;
        frames.fill(0);
        Ok(frames)
    }

    /// # Safety
    ///
    /// The frames are a placeholder and must never be accessed.
    pub const unsafe fn uninit() -> Self {
        Self {
            start_paddr: None,
            frame_count: 0,
            _marker: PhantomData,
        }
    }

    pub fn start_paddr(&self) -> PhysAddr {
        self.start_paddr.expect("uninitialized ContiguousPhysFrames")
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    /// The `index`-th frame as a table of 512 quadwords.
    pub fn frame_as_u64_slice_mut(&mut self, index: usize) -> &mut [u64] {
        assert!(index < self.frame_count);
        unsafe {
            core::slice::from_raw_parts_mut(
                self.as_mut_ptr().add(index * PAGE_SIZE) as *mut u64,
                PAGE_SIZE / 8,
            )
        }
    }

    pub fn frame_as_u64_slice(&self, index: usize) -> &[u64] {
        assert!(index < self.frame_count);
        unsafe {
            core::slice::from_raw_parts(
                self.as_mut_ptr().add(index * PAGE_SIZE) as *const u64,
                PAGE_SIZE / 8,
            )
        }
    }

    /// Physical address of the `index`-th frame.
    pub fn frame_paddr(&self, index: usize) -> PhysAddr {
        assert!(index < self.frame_count);
        PhysAddr::from_usize(self.start_paddr().as_usize() + index * PAGE_SIZE)
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe {
            core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size());
        }
    }
}

impl<H: HvHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        if let Some(start_paddr) = self.start_paddr {
            H::dealloc_contiguous_frames(start_paddr, self.frame_count);
            debug!(
                "[HV] deallocated ContiguousPhysFrames({:#x}, {} frames)",
                start_paddr.as_usize(),
                self.frame_count
            );
        }
    }
}
