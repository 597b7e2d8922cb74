use crate::hal::VmxArch;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
/// X86 model-specific registers. (SDM Vol. 4)
pub enum Msr {
    IA32_FEATURE_CONTROL = 0x3a,
    IA32_MTRRCAP = 0xfe,

    IA32_SYSENTER_CS = 0x174,
    IA32_SYSENTER_ESP = 0x175,
    IA32_SYSENTER_EIP = 0x176,

    IA32_DEBUGCTL = 0x1d9,

    IA32_MTRR_PHYSBASE0 = 0x200,
    IA32_MTRR_PHYSMASK0 = 0x201,
    IA32_MTRR_FIX64K_00000 = 0x250,
    IA32_MTRR_FIX16K_80000 = 0x258,
    IA32_MTRR_FIX16K_A0000 = 0x259,
    IA32_MTRR_FIX4K_C0000 = 0x268,

    IA32_PAT = 0x277,
    IA32_MTRR_DEF_TYPE = 0x2ff,

    IA32_VMX_BASIC = 0x480,
    IA32_VMX_PINBASED_CTLS = 0x481,
    IA32_VMX_PROCBASED_CTLS = 0x482,
    IA32_VMX_EXIT_CTLS = 0x483,
    IA32_VMX_ENTRY_CTLS = 0x484,
    IA32_VMX_MISC = 0x485,
    IA32_VMX_CR0_FIXED0 = 0x486,
    IA32_VMX_CR0_FIXED1 = 0x487,
    IA32_VMX_CR4_FIXED0 = 0x488,
    IA32_VMX_CR4_FIXED1 = 0x489,
    IA32_VMX_VMCS_ENUM = 0x48a,
    IA32_VMX_PROCBASED_CTLS2 = 0x48b,
    IA32_VMX_EPT_VPID_CAP = 0x48c,
    IA32_VMX_TRUE_PINBASED_CTLS = 0x48d,
    IA32_VMX_TRUE_PROCBASED_CTLS = 0x48e,
    IA32_VMX_TRUE_EXIT_CTLS = 0x48f,
    IA32_VMX_TRUE_ENTRY_CTLS = 0x490,
    IA32_VMX_VMFUNC = 0x491,

    IA32_EFER = 0xc000_0080,
    IA32_STAR = 0xc000_0081,
    IA32_LSTAR = 0xc000_0082,
    IA32_CSTAR = 0xc000_0083,
    IA32_FMASK = 0xc000_0084,

    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,
}
}

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read<A: VmxArch>(self) -> u64 {
        A::rdmsr(self as u32)
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write<A: VmxArch>(self, value: u64) {
        unsafe { A::wrmsr(self as u32, value) }
    }

    /// The `n`-th variable-range MTRR base register.
    pub const fn mtrr_physbase(n: u32) -> u32 {
        Msr::IA32_MTRR_PHYSBASE0 as u32 + 2 * n
    }

    /// The `n`-th variable-range MTRR mask register.
    pub const fn mtrr_physmask(n: u32) -> u32 {
        Msr::IA32_MTRR_PHYSMASK0 as u32 + 2 * n
    }

    /// The `n`-th 4 KiB fixed-range MTRR, covering `0xc0000 + n * 0x8000`.
    pub const fn mtrr_fix4k(n: u32) -> u32 {
        Msr::IA32_MTRR_FIX4K_C0000 as u32 + n
    }

    /// Whether `index` is one of the VMX capability reporting MSRs.
    pub fn is_vmx_capability(index: u32) -> bool {
        (Msr::IA32_VMX_BASIC as u32..=Msr::IA32_VMX_VMFUNC as u32).contains(&index)
    }
}
