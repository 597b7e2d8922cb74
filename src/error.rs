use alloc::string::String;
use core::fmt;

/// Errors reported by the hypervisor core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HvError {
    /// The processor lacks VMX, or firmware locked it off.
    UnsupportedHardware(String),
    /// Current control-register state violates the VMX fixed bits.
    InvalidGuestState(String),
    /// The MSR index is outside both bitmap-controllable ranges.
    InvalidMsrIndex(u32),
    /// A VMX instruction failed with a valid current VMCS.
    VmxInstructionError(String),
    /// A VMX instruction failed without a valid current VMCS.
    InvalidVmcsPtr,
    /// VMX is already on for this processor record.
    VmxAlreadyEnabled,
    /// VMX is not on for this processor record.
    VmxNotEnabled,
    /// The frame allocator is out of memory.
    MemoryAllocationFailed,
    /// A control field cannot be configured as requested.
    InvalidVmcsConfig(String),
    /// The physical or guest-physical address is not covered.
    BadAddress(u64),
}

/// Result type used throughout the crate.
pub type HvResult<T = ()> = core::result::Result<T, HvError>;

impl fmt::Display for HvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvError::UnsupportedHardware(msg) => write!(f, "unsupported hardware: {msg}"),
            HvError::InvalidGuestState(msg) => write!(f, "invalid guest state: {msg}"),
            HvError::InvalidMsrIndex(index) => write!(f, "invalid MSR index {index:#x}"),
            HvError::VmxInstructionError(msg) => write!(f, "VMX instruction error: {msg}"),
            HvError::InvalidVmcsPtr => write!(f, "invalid VMCS pointer"),
            HvError::VmxAlreadyEnabled => write!(f, "VMX is already enabled"),
            HvError::VmxNotEnabled => write!(f, "VMX is not enabled"),
            HvError::MemoryAllocationFailed => write!(f, "memory allocation failed"),
            HvError::InvalidVmcsConfig(msg) => write!(f, "invalid VMCS configuration: {msg}"),
            HvError::BadAddress(addr) => write!(f, "bad address {addr:#x}"),
        }
    }
}

/// Builds an [`HvError`] of the given kind, logging it at `warn` level.
#[macro_export]
macro_rules! hv_err_type {
    ($kind:ident) => {{
        let err = $crate::HvError::$kind;
        warn!("[HV] {}", err);
        err
    }};
    ($kind:ident, $msg:expr) => {{
        let err = $crate::HvError::$kind(::alloc::string::String::from($msg));
        warn!("[HV] {}", err);
        err
    }};
}

/// Returns early with `Err(hv_err_type!(..))`.
#[macro_export]
macro_rules! hv_err {
    ($($args:tt)*) => {
        Err($crate::hv_err_type!($($args)*))
    };
}
