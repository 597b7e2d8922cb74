use x86_64::registers::control::Cr4Flags;

use crate::capability::CachedCpuData;
use crate::frame::PAGE_SIZE;
use crate::hal::{HvHal, VmxArch};
use crate::msr::Msr;
use crate::vmx::structs::{FeatureControlFlags, VmxBasic, VmxRegion};
use crate::{HvError, HvResult};

use super::as_hv_err;

const CR4_VMXE: u64 = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();

/// VMX root operation on one logical processor.
///
/// Owns the VMXON region and remembers the CR4 value found before VMXE was
/// set, so a failed activation can put it back.
#[derive(Debug)]
pub struct VmxPerCpuState<H: HvHal> {
    vmxon_region: VmxRegion<H>,
    saved_cr4: u64,
    enabled: bool,
}

impl<H: HvHal> VmxPerCpuState<H> {
    pub const fn new() -> Self {
        Self {
            vmxon_region: unsafe { VmxRegion::uninit() },
            saved_cr4: 0,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// CR4 as it was before [`VmxPerCpuState::hardware_enable`].
    pub fn saved_cr4(&self) -> u64 {
        self.saved_cr4
    }

    /// Check the VMX basic capabilities this crate depends on.
    fn check_vmx_basic(basic: &VmxBasic) -> HvResult {
        if basic.region_size as usize != PAGE_SIZE {
            return hv_err!(UnsupportedHardware, "VMX region size is not 4K");
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return hv_err!(UnsupportedHardware, "VMX memory type is not write-back");
        }
        if basic.is_32bit_address {
            return hv_err!(UnsupportedHardware, "32-bit VMX not supported");
        }
        if !basic.vmx_flex_controls {
            return hv_err!(UnsupportedHardware, "VMX flex controls not supported");
        }
        Ok(())
    }

    /// Enter VMX root operation: feature control, CR4.VMXE, then VMXON.
    pub fn hardware_enable(&mut self, data: &CachedCpuData) -> HvResult {
        let cr4 = H::Arch::read_cr4();
        if self.enabled || cr4 & CR4_VMXE != 0 {
            return hv_err!(VmxAlreadyEnabled);
        }
        Self::check_vmx_basic(&data.vmx_basic)?;

        // Enable VMXON, if required.
        let ctrl = FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read::<H::Arch>());
        if ctrl.vmx_locked_off() {
            return hv_err!(UnsupportedHardware, "VMX disabled by BIOS");
        }
        if !ctrl.contains(FeatureControlFlags::LOCKED) {
            let value = ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX;
            unsafe { Msr::IA32_FEATURE_CONTROL.write::<H::Arch>(value.bits()) };
            debug!("[HV] locked IA32_FEATURE_CONTROL with VMXON enabled");
        }

        self.vmxon_region = VmxRegion::new(data.vmx_basic.revision_id, false)?;
        self.saved_cr4 = cr4;
        unsafe {
            // Enable VMX using the VMXE bit.
            H::Arch::write_cr4(cr4 | CR4_VMXE);
            if let Err(err) = H::Arch::vmxon(self.vmxon_region.phys_addr().as_usize() as u64) {
                H::Arch::write_cr4(cr4);
                self.vmxon_region = VmxRegion::uninit();
                return Err(HvError::VmxInstructionError(alloc::format!(
                    "VMX instruction vmxon failed: {:?}",
                    err
                )));
            }
        }
        self.enabled = true;
        info!("[HV] succeeded to turn on VMX.");
        Ok(())
    }

    /// Leave VMX root operation and clear CR4.VMXE.
    pub fn hardware_disable(&mut self) -> HvResult {
        if !self.enabled {
            return hv_err!(VmxNotEnabled);
        }
        unsafe {
            // Execute VMXOFF.
            H::Arch::vmxoff().map_err(as_hv_err::<H::Arch>)?;
            // Remove VMXE bit in CR4.
            H::Arch::write_cr4(H::Arch::read_cr4() & !CR4_VMXE);
        }
        self.enabled = false;
        self.vmxon_region = unsafe { VmxRegion::uninit() };
        info!("[HV] succeeded to turn off VMX.");
        Ok(())
    }
}
