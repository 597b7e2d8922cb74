//! One-time snapshot of the processor's virtualization capabilities.

use bit_field::BitField;

use crate::hal::{VmxArch, cpuid_of};
use crate::msr::Msr;
use crate::vmx::structs::{FeatureControlFlags, VmxBasic};
use crate::HvResult;

/// Allowed settings of one VMX control field, as reported by a capability MSR
/// pair. (SDM Vol. 3D, Appendix A.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlCapability {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
    /// Low half of the non-"true" MSR: the default settings.
    pub default1: u32,
}

impl ControlCapability {
    fn read<A: VmxArch>(true_msr: Msr, legacy_msr: Msr) -> Self {
        let cap = true_msr.read::<A>();
        Self {
            allowed0: cap.get_bits(0..32) as u32,
            allowed1: cap.get_bits(32..64) as u32,
            default1: legacy_msr.read::<A>().get_bits(0..32) as u32,
        }
    }

    /// `wanted` restricted to the bits the processor allows to be set.
    pub fn supported(&self, wanted: u32) -> u32 {
        wanted & self.allowed1
    }
}

/// Processor data that is assumed to never change once captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCpuData {
    /// Maximum number of bits in a physical address (MAXPHYSADDR).
    pub max_phys_addr: u8,

    /// Reserved bits in CR0/CR4.
    pub vmx_cr0_fixed0: u64,
    pub vmx_cr0_fixed1: u64,
    pub vmx_cr4_fixed0: u64,
    pub vmx_cr4_fixed1: u64,

    /// Mask of unsupported processor state components for XCR0.
    pub xcr0_unsupported_mask: u64,

    /// Raw IA32_FEATURE_CONTROL.
    pub feature_control: u64,
    /// Raw IA32_VMX_MISC.
    pub vmx_misc: u64,
    /// CPUID leaf 0x1 as (eax, ebx, ecx, edx).
    pub cpuid_01: [u32; 4],

    pub vmx_basic: VmxBasic,
    pub pin_controls: ControlCapability,
    pub primary_controls: ControlCapability,
    pub secondary_controls: ControlCapability,
    pub exit_controls: ControlCapability,
    pub entry_controls: ControlCapability,
    /// Raw IA32_VMX_EPT_VPID_CAP.
    pub ept_vpid_cap: u64,
}

macro_rules! cr_is_valid {
    ($value: expr, $crx: ident, $data: expr) => {
        paste::paste! {
            (($value & $data.[<vmx_ $crx _fixed0>]) == $data.[<vmx_ $crx _fixed0>])
                && ($value & !$data.[<vmx_ $crx _fixed1>]) == 0
        }
    };
}

impl CachedCpuData {
    /// Read the capability CPUID leaves and MSRs of the current processor.
    pub fn capture<A: VmxArch>() -> HvResult<Self> {
        let cpuid = cpuid_of::<A>();

        let feature_info = cpuid.get_feature_info();
        match &feature_info {
            Some(info) if info.has_vmx() => {}
            _ => return hv_err!(UnsupportedHardware, "CPU does not support VMX"),
        }

        let feature_control = Msr::IA32_FEATURE_CONTROL.read::<A>();
        if FeatureControlFlags::from_bits_truncate(feature_control).vmx_locked_off() {
            return hv_err!(UnsupportedHardware, "VMX disabled by BIOS");
        }

        let max_leaf = A::cpuid(0, 0).eax;
        if max_leaf < 0xd {
            return hv_err!(UnsupportedHardware, "CPUID leaf 0xD unavailable");
        }
        let xsave = A::cpuid(0xd, 0);
        let xcr0_unsupported_mask = !((xsave.edx as u64) << 32 | xsave.eax as u64);

        let max_phys_addr = match cpuid.get_processor_capacity_feature_info() {
            Some(info) => info.physical_address_bits(),
            None => return hv_err!(UnsupportedHardware, "CPUID leaf 0x80000008 unavailable"),
        };

        let leaf1 = A::cpuid(1, 0);
        let data = Self {
            max_phys_addr,
            vmx_cr0_fixed0: Msr::IA32_VMX_CR0_FIXED0.read::<A>(),
            vmx_cr0_fixed1: Msr::IA32_VMX_CR0_FIXED1.read::<A>(),
            vmx_cr4_fixed0: Msr::IA32_VMX_CR4_FIXED0.read::<A>(),
            vmx_cr4_fixed1: Msr::IA32_VMX_CR4_FIXED1.read::<A>(),
            xcr0_unsupported_mask,
            feature_control,
            vmx_misc: Msr::IA32_VMX_MISC.read::<A>(),
            cpuid_01: [leaf1.eax, leaf1.ebx, leaf1.ecx, leaf1.edx],
            vmx_basic: VmxBasic::from_raw(Msr::IA32_VMX_BASIC.read::<A>()),
            pin_controls: ControlCapability::read::<A>(
                Msr::IA32_VMX_TRUE_PINBASED_CTLS,
                Msr::IA32_VMX_PINBASED_CTLS,
            ),
            primary_controls: ControlCapability::read::<A>(
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
                Msr::IA32_VMX_PROCBASED_CTLS,
            ),
            secondary_controls: ControlCapability::read::<A>(
                Msr::IA32_VMX_PROCBASED_CTLS2,
                Msr::IA32_VMX_PROCBASED_CTLS2,
            ),
            exit_controls: ControlCapability::read::<A>(
                Msr::IA32_VMX_TRUE_EXIT_CTLS,
                Msr::IA32_VMX_EXIT_CTLS,
            ),
            entry_controls: ControlCapability::read::<A>(
                Msr::IA32_VMX_TRUE_ENTRY_CTLS,
                Msr::IA32_VMX_ENTRY_CTLS,
            ),
            ept_vpid_cap: Msr::IA32_VMX_EPT_VPID_CAP.read::<A>(),
        };
        debug!(
            "[HV] captured CPU data: MAXPHYADDR {}, XCR0 unsupported {:#x}",
            data.max_phys_addr, data.xcr0_unsupported_mask
        );
        Ok(data)
    }

    /// Whether `cr0` satisfies the VMX fixed-bit requirements.
    pub fn cr0_is_valid(&self, cr0: u64) -> bool {
        cr_is_valid!(cr0, cr0, self)
    }

    /// Whether `cr4` satisfies the VMX fixed-bit requirements.
    pub fn cr4_is_valid(&self, cr4: u64) -> bool {
        cr_is_valid!(cr4, cr4, self)
    }

    /// Force the fixed bits of CR0 into `cr0`.
    pub fn adjust_cr0(&self, cr0: u64) -> u64 {
        (cr0 | self.vmx_cr0_fixed0) & self.vmx_cr0_fixed1
    }

    /// Force the fixed bits of CR4 into `cr4`.
    pub fn adjust_cr4(&self, cr4: u64) -> u64 {
        (cr4 | self.vmx_cr4_fixed0) & self.vmx_cr4_fixed1
    }

    /// The VMX-preemption timer counts down once every `1 << rate` TSC ticks.
    pub fn preemption_timer_rate(&self) -> u32 {
        self.vmx_misc.get_bits(0..5) as u32
    }

    /// CPUID.1:ECX bit 5.
    pub fn has_vmx(&self) -> bool {
        self.cpuid_01[2].get_bit(5)
    }

    /// Physical addresses must stay below this bound.
    pub fn phys_addr_limit(&self) -> u64 {
        1u64 << self.max_phys_addr
    }
}
