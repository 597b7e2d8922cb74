mod definitions;
mod exit;
mod hypercall;
mod percpu;
pub(crate) mod structs;
mod vcpu;
pub(crate) mod vmcs;

use x86::vmx::VmFail;

use crate::HvError;
use crate::hal::{VmxArch, cpuid_of};

pub use self::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
pub use self::exit::{ExitDecision, VmExit, VmExitAction};
pub use self::hypercall::{HypercallCode, HypercallStatus, devirtualize_cpu, ping};
pub use self::percpu::VmxPerCpuState;
pub use self::structs::MsrBitmap;
pub use self::vcpu::Vcpu;
pub use self::vmcs::{CrAccessInfo, EptViolationInfo, VmxExitInfo, VmxInterruptInfo};

/// Return if the processor behind `A` supports VMX.
pub fn has_hardware_support<A: VmxArch>() -> bool {
    if let Some(feature) = cpuid_of::<A>().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}

fn as_hv_err<A: VmxArch>(err: VmFail) -> HvError {
    match err {
        VmFail::VmFailValid => HvError::VmxInstructionError(alloc::string::String::from(
            vmcs::instruction_error::<A>().as_str(),
        )),
        VmFail::VmFailInvalid => HvError::InvalidVmcsPtr,
    }
}
