//! The VMCALL interface between the guest and the hypervisor.
//!
//! RAX carries a [`HypercallCode`], RCX and RDX the arguments. Results come
//! back in RAX and RDX.

use crate::HYPERVISOR_SIGNATURE;
use crate::hal::VmxArch;

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Hypercall command codes, passed in RAX.
pub enum HypercallCode {
    /// RAX = [`HYPERVISOR_SIGNATURE`].
    Ping = 0,
    /// Turn virtualization off on this processor.
    Unload = 1,
    /// RCX = physical address. RAX = quadword, RDX = status.
    ReadPhysMem = 2,
    /// RCX = physical address, RDX = value. RAX = status.
    WritePhysMem = 3,
    /// RCX != 0 enables VM-exit latency hiding.
    HideLatency = 4,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Status returned by the physical-memory hypercalls.
pub enum HypercallStatus {
    Success = 0,
    /// The address lies outside the physical-memory window.
    BadAddress = 1,
}
}

impl HypercallCode {
    /// Whether the command needs a CPL 0 caller.
    pub fn is_privileged(self) -> bool {
        !matches!(self, Self::Ping)
    }
}

/// Ask the hypervisor whether it is present on this processor.
///
/// VMCALL raises #UD on a processor that is not in VMX non-root operation,
/// so only call this where that is known to be handled.
pub fn ping<A: VmxArch>() -> bool {
    unsafe { A::vmcall(HypercallCode::Ping as u64, 0, 0) == HYPERVISOR_SIGNATURE }
}

/// Ask the hypervisor to turn VMX off on this processor. Execution resumes
/// after the VMCALL, no longer virtualized.
pub fn devirtualize_cpu<A: VmxArch>() {
    unsafe { A::vmcall(HypercallCode::Unload as u64, 0, 0) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::MockArch;

    #[test]
    fn test_codes() {
        assert_eq!(HypercallCode::try_from(0), Ok(HypercallCode::Ping));
        assert_eq!(HypercallCode::try_from(4), Ok(HypercallCode::HideLatency));
        assert_eq!(HypercallCode::try_from(5), Err(5));
        assert!(!HypercallCode::Ping.is_privileged());
        assert!(HypercallCode::Unload.is_privileged());
        assert!(HypercallCode::WritePhysMem.is_privileged());
    }

    #[test]
    fn test_guest_helpers_issue_vmcall() {
        MockArch::reset();
        // The modelled processor is not virtualized: VMCALL returns 0.
        assert!(!ping::<MockArch>());
        devirtualize_cpu::<MockArch>();
        assert_eq!(MockArch::snapshot().vmcalls, [(0, 0, 0), (1, 0, 0)]);
    }
}
