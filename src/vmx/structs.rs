use bit_field::BitField;
use bitflags::bitflags;
use memory_addr::PhysAddr;

use crate::frame::PhysFrame;
use crate::hal::HvHal;
use crate::{HvError, HvResult};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[derive(Debug)]
pub struct VmxRegion<H: HvHal> {
    frame: PhysFrame<H>,
}

impl<H: HvHal> VmxRegion<H> {
    /// # Safety
    ///
    /// The region is a placeholder and must never be handed to hardware.
    pub const unsafe fn uninit() -> Self {
        Self {
            frame: unsafe { PhysFrame::uninit() },
        }
    }

    pub fn new(revision_id: u32, shadow_indicator: bool) -> HvResult<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (*(frame.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, revision_id)
                .set_bit(31, shadow_indicator);
        }
        Ok(Self { frame })
    }

    pub fn revision_id(&self) -> u32 {
        unsafe { (*(self.frame.as_mut_ptr() as *const u32)).get_bits(0..=30) }
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.frame.start_paddr()
    }
}

/// The four 1 KiB MSR access bitmaps, in hardware order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsrBitmapRegion {
    ReadLow = 0,
    ReadHigh = 1024,
    WriteLow = 2048,
    WriteHigh = 3072,
}

/// MSR-Bitmap Address. (SDM Vol. 3C, Section 24.6.9)
///
/// A 4 KiB page: read-low, read-high, write-low, write-high, 1 KiB each. A set
/// bit makes the matching RDMSR or WRMSR exit.
#[derive(Debug)]
pub struct MsrBitmap<H: HvHal> {
    frame: PhysFrame<H>,
}

impl<H: HvHal> MsrBitmap<H> {
    pub const LOW_RANGE: core::ops::RangeInclusive<u32> = 0..=0x1fff;
    pub const HIGH_RANGE: core::ops::RangeInclusive<u32> = 0xc000_0000..=0xc000_1fff;

    pub fn passthrough_all() -> HvResult<Self> {
        Ok(Self {
            frame: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> PhysAddr {
        self.frame.start_paddr()
    }

    /// Whether `msr` can be controlled through the bitmap at all.
    pub fn is_valid_index(msr: u32) -> bool {
        Self::LOW_RANGE.contains(&msr) || Self::HIGH_RANGE.contains(&msr)
    }

    /// Byte offset into the page and bit number for `msr`.
    fn locate(msr: u32, write: bool) -> HvResult<(usize, usize)> {
        let (region, bit) = match (Self::LOW_RANGE.contains(&msr), write) {
            (true, false) => (MsrBitmapRegion::ReadLow, msr),
            (true, true) => (MsrBitmapRegion::WriteLow, msr),
            (false, _) if Self::HIGH_RANGE.contains(&msr) => {
                let region = if write {
                    MsrBitmapRegion::WriteHigh
                } else {
                    MsrBitmapRegion::ReadHigh
                };
                (region, msr - 0xc000_0000)
            }
            _ => return Err(HvError::InvalidMsrIndex(msr)),
        };
        Ok((region as usize + (bit / 8) as usize, (bit % 8) as usize))
    }

    fn set_intercept(&mut self, msr: u32, write: bool, intercept: bool) -> HvResult {
        let (byte, bit) = Self::locate(msr, write)?;
        let bitmap =
            unsafe { core::slice::from_raw_parts_mut(self.frame.as_mut_ptr(), 1024 * 4) };
        bitmap[byte].set_bit(bit, intercept);
        Ok(())
    }

    fn is_intercepted(&self, msr: u32, write: bool) -> HvResult<bool> {
        let (byte, bit) = Self::locate(msr, write)?;
        let bitmap = unsafe { core::slice::from_raw_parts(self.frame.as_mut_ptr(), 1024 * 4) };
        Ok(bitmap[byte].get_bit(bit))
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) -> HvResult {
        self.set_intercept(msr, false, intercept)
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) -> HvResult {
        self.set_intercept(msr, true, intercept)
    }

    pub fn is_read_intercepted(&self, msr: u32) -> HvResult<bool> {
        self.is_intercepted(msr, false)
    }

    pub fn is_write_intercepted(&self, msr: u32) -> HvResult<bool> {
        self.is_intercepted(msr, true)
    }

    /// Raw bitmap contents.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.frame.as_mut_ptr(), 1024 * 4) }
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of INS and OUTS.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0.
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

impl FeatureControlFlags {
    /// Firmware locked the register without enabling VMXON outside SMX.
    pub fn vmx_locked_off(self) -> bool {
        self.contains(Self::LOCKED) && !self.contains(Self::VMXON_ENABLED_OUTSIDE_SMX)
    }

    /// The raw register value a guest sees: locked, with VMX unavailable.
    pub fn hide_vmx(raw: u64) -> u64 {
        (raw | Self::LOCKED.bits())
            & !(Self::VMXON_ENABLED_INSIDE_SMX | Self::VMXON_ENABLED_OUTSIDE_SMX).bits()
    }
}
