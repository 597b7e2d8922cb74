#![allow(non_camel_case_types)]
#![allow(dead_code)]

use bit_field::BitField;

use super::as_hv_err;
use super::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
use crate::capability::ControlCapability;
use crate::hal::VmxArch;
use crate::HvResult;

pub use x86::vmx::vmcs::control as controls;

macro_rules! vmcs_read {
    ($field_enum: ident, $ty: ty) => {
        impl $field_enum {
            pub fn read<A: VmxArch>(self) -> HvResult<$ty> {
                unsafe { A::vmread(self as u32) }
                    .map(|value| value as $ty)
                    .map_err(as_hv_err::<A>)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $ty: ty) => {
        impl $field_enum {
            pub fn write<A: VmxArch>(self, value: $ty) -> HvResult {
                unsafe { A::vmwrite(self as u32, value as u64) }.map_err(as_hv_err::<A>)
            }
        }
    };
}

/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
    /// Posted-interrupt notification vector.
    POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
    /// EPTP index.
    EPTP_INDEX = 0x4,
}

/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl64 {
    /// Address of I/O bitmap A (full).
    IO_BITMAP_A_ADDR = 0x2000,
    /// Address of I/O bitmap B (full).
    IO_BITMAP_B_ADDR = 0x2002,
    /// Address of MSR bitmaps (full).
    MSR_BITMAPS_ADDR = 0x2004,
    /// VM-exit MSR-store address (full).
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    /// VM-exit MSR-load address (full).
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    /// VM-entry MSR-load address (full).
    VMENTRY_MSR_LOAD_ADDR = 0x200A,
    /// TSC offset (full).
    TSC_OFFSET = 0x2010,
    /// EPT pointer (full).
    EPTP = 0x201A,
}

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControl32 {
    /// Pin-based VM-execution controls.
    PINBASED_EXEC_CONTROLS = 0x4000,
    /// Primary processor-based VM-execution controls.
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    /// Exception bitmap.
    EXCEPTION_BITMAP = 0x4004,
    /// Page-fault error-code mask.
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    /// Page-fault error-code match.
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    /// CR3-target count.
    CR3_TARGET_COUNT = 0x400A,
    /// Primary VM-exit controls.
    VMEXIT_CONTROLS = 0x400C,
    /// VM-exit MSR-store count.
    VMEXIT_MSR_STORE_COUNT = 0x400E,
    /// VM-exit MSR-load count.
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    /// VM-entry controls.
    VMENTRY_CONTROLS = 0x4012,
    /// VM-entry MSR-load count.
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    /// VM-entry interruption-information field.
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    /// VM-entry exception error code.
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    /// VM-entry instruction length.
    VMENTRY_INSTRUCTION_LEN = 0x401A,
    /// TPR threshold.
    TPR_THRESHOLD = 0x401C,
    /// Secondary processor-based VM-execution controls.
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
}

/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
#[derive(Clone, Copy, Debug)]
pub enum VmcsControlNW {
    /// CR0 guest/host mask.
    CR0_GUEST_HOST_MASK = 0x6000,
    /// CR4 guest/host mask.
    CR4_GUEST_HOST_MASK = 0x6002,
    /// CR0 read shadow.
    CR0_READ_SHADOW = 0x6004,
    /// CR4 read shadow.
    CR4_READ_SHADOW = 0x6006,
}

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
}

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest64 {
    /// VMCS link pointer (full).
    LINK_PTR = 0x2800,
    /// Guest IA32_DEBUGCTL (full).
    IA32_DEBUGCTL = 0x2802,
    /// Guest IA32_PAT (full).
    IA32_PAT = 0x2804,
    /// Guest IA32_EFER (full).
    IA32_EFER = 0x2806,
}

/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482a,
    VMX_PREEMPTION_TIMER_VALUE = 0x482e,
}

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680a,
    DS_BASE = 0x680c,
    FS_BASE = 0x680e,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681a,
    RSP = 0x681c,
    RIP = 0x681e,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
}

/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[derive(Clone, Copy, Debug)]
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}

/// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnly64 {
    /// Guest-physical address (full).
    GUEST_PHYSICAL_ADDR = 0x2400,
}

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnly32 {
    /// VM-instruction error.
    VM_INSTRUCTION_ERROR = 0x4400,
    /// Exit reason.
    EXIT_REASON = 0x4402,
    /// VM-exit interruption information.
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    /// VM-exit interruption error code.
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    /// IDT-vectoring information field.
    IDT_VECTORING_INFO = 0x4408,
    /// IDT-vectoring error code.
    IDT_VECTORING_ERR_CODE = 0x440a,
    /// VM-exit instruction length.
    VMEXIT_INSTRUCTION_LEN = 0x440c,
    /// VM-exit instruction information.
    VMEXIT_INSTRUCTION_INFO = 0x440e,
}

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[derive(Clone, Copy, Debug)]
pub enum VmcsReadOnlyNW {
    /// Exit qualification.
    EXIT_QUALIFICATION = 0x6400,
    /// Guest-linear address.
    GUEST_LINEAR_ADDR = 0x640a,
}

vmcs_read!(VmcsControl16, u16);
vmcs_read!(VmcsControl64, u64);
vmcs_read!(VmcsControl32, u32);
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControl16, u16);
vmcs_write!(VmcsControl64, u64);
vmcs_write!(VmcsControl32, u32);
vmcs_write!(VmcsControlNW, usize);

vmcs_read!(VmcsGuest16, u16);
vmcs_read!(VmcsGuest64, u64);
vmcs_read!(VmcsGuest32, u32);
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest32, u32);
vmcs_write!(VmcsGuestNW, usize);

vmcs_write!(VmcsHost16, u16);
vmcs_write!(VmcsHost64, u64);
vmcs_write!(VmcsHost32, u32);
vmcs_write!(VmcsHostNW, usize);

vmcs_read!(VmcsReadOnly64, u64);
vmcs_read!(VmcsReadOnly32, u32);
vmcs_read!(VmcsReadOnlyNW, usize);

/// VM-Exit Informations. (SDM Vol. 3C, Section 24.9.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason, left raw so unknown reasons can be reported.
    pub basic_reason: u16,
    /// For VM exits resulting from instruction execution, this field receives
    /// the length in bytes of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: usize,
}

impl VmxExitInfo {
    pub fn exit_reason(&self) -> Result<VmxExitReason, u32> {
        VmxExitReason::try_from(self.basic_reason as u32)
    }
}

/// VM-Entry/VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInterruptInfo {
    /// Vector of interrupt or exception.
    pub vector: u8,
    /// Determines details of how the injection is performed.
    pub int_type: VmxInterruptionType,
    /// For hardware exceptions that would have delivered an error code on the stack.
    pub err_code: Option<u32>,
    /// Whether the field is valid.
    pub valid: bool,
}

impl VmxInterruptInfo {
    /// Convert from the interrupt vector and the error code.
    pub fn from(vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type: VmxInterruptionType::from_vector(vector),
            err_code,
            valid: true,
        }
    }

    /// Raw bits for writing to VMCS.
    pub fn bits(&self) -> u32 {
        let mut bits = self.vector as u32;
        bits |= (self.int_type as u32) << 8;
        bits.set_bit(11, self.err_code.is_some());
        bits.set_bit(31, self.valid);
        bits
    }

    /// Decode the raw VM-exit interruption information.
    pub fn from_raw(info: u32, err_code: Option<u32>) -> Self {
        let int_type = VmxInterruptionType::try_from(info.get_bits(8..11) as u8)
            .unwrap_or(VmxInterruptionType::Other);
        Self {
            vector: info.get_bits(0..8) as u8,
            int_type,
            err_code: if info.get_bit(11) { err_code } else { None },
            valid: info.get_bit(31),
        }
    }
}

/// Exit Qualification for EPT Violations. (SDM Vol. 3C, Section 28.2.1, Table 28-7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationInfo {
    /// Faulting guest-physical address.
    pub gpa: u64,
    pub read: bool,
    pub write: bool,
    pub instruction_fetch: bool,
    /// The guest-physical address was readable, writable and executable
    /// (bits 3..5) at the time of the access.
    pub entry_permissions: u8,
    /// Whether the guest linear-address field is valid.
    pub linear_valid: bool,
}

impl EptViolationInfo {
    pub fn from_qualification(gpa: u64, qualification: u64) -> Self {
        Self {
            gpa,
            read: qualification.get_bit(0),
            write: qualification.get_bit(1),
            instruction_fetch: qualification.get_bit(2),
            entry_permissions: qualification.get_bits(3..6) as u8,
            linear_valid: qualification.get_bit(7),
        }
    }
}

/// Exit Qualification for Control-Register Accesses. (SDM Vol. 3C, Section 28.2.1, Table 28-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessInfo {
    /// Number of control register (0 for CLTS and LMSW).
    pub cr_number: u8,
    /// Access type (0 = MOV to CR; 1 = MOV from CR; 2 = CLTS; 3 = LMSW).
    pub access_type: u8,
    /// LMSW operand type (0 = register; 1 = memory).
    pub lmsw_op_type: u8,
    /// Number of general-purpose register.
    pub gpr: u8,
    /// Source data for LMSW.
    pub lmsw_source_data: u16,
}

impl CrAccessInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        Self {
            cr_number: qualification.get_bits(0..4) as u8,
            access_type: qualification.get_bits(4..6) as u8,
            lmsw_op_type: qualification.get_bits(6..7) as u8,
            gpr: qualification.get_bits(8..12) as u8,
            lmsw_source_data: qualification.get_bits(16..32) as u16,
        }
    }
}

/// The VM-instruction error of the last failed VMX instruction.
pub fn instruction_error<A: VmxArch>() -> VmxInstructionError {
    let raw = unsafe { A::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32) }.unwrap_or(0);
    VmxInstructionError::from(raw as u32)
}

pub fn exit_info<A: VmxArch>() -> HvResult<VmxExitInfo> {
    let full_reason = VmcsReadOnly32::EXIT_REASON.read::<A>()?;
    Ok(VmxExitInfo {
        basic_reason: full_reason.get_bits(0..16) as u16,
        entry_failure: full_reason.get_bit(31),
        exit_instruction_length: VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read::<A>()?,
        guest_rip: VmcsGuestNW::RIP.read::<A>()?,
    })
}

pub fn exit_qualification<A: VmxArch>() -> HvResult<u64> {
    Ok(VmcsReadOnlyNW::EXIT_QUALIFICATION.read::<A>()? as u64)
}

pub fn interrupt_exit_info<A: VmxArch>() -> HvResult<VmxInterruptInfo> {
    let info = VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO.read::<A>()?;
    let err_code = VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE.read::<A>()?;
    Ok(VmxInterruptInfo::from_raw(info, Some(err_code)))
}

pub fn cr_access_info<A: VmxArch>() -> HvResult<CrAccessInfo> {
    Ok(CrAccessInfo::from_qualification(exit_qualification::<A>()?))
}

/// The event the guest was delivering when the exit happened, if any.
/// (SDM Vol. 3C, Section 24.9.3)
pub fn idt_vectoring_info<A: VmxArch>() -> HvResult<Option<VmxInterruptInfo>> {
    let info = VmcsReadOnly32::IDT_VECTORING_INFO.read::<A>()?;
    if !info.get_bit(31) {
        return Ok(None);
    }
    let err_code = VmcsReadOnly32::IDT_VECTORING_ERR_CODE.read::<A>()?;
    Ok(Some(VmxInterruptInfo::from_raw(info, Some(err_code))))
}

/// Queue `vector` for delivery on the next VM entry. (SDM Vol. 3C, Section 24.8.3)
pub fn inject_event<A: VmxArch>(vector: u8, err_code: Option<u32>) -> HvResult {
    let err_code = if VmxInterruptionType::vector_has_error_code(vector) {
        match err_code {
            Some(code) => Some(code),
            None => Some(VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE.read::<A>()?),
        }
    } else {
        None
    };
    queue_event::<A>(VmxInterruptInfo::from(vector, err_code))
}

/// Write a fully described event to the VM-entry interruption fields.
pub fn queue_event<A: VmxArch>(event: VmxInterruptInfo) -> HvResult {
    if let Some(err_code) = event.err_code {
        VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE.write::<A>(err_code)?;
    }
    if event.int_type.is_soft() {
        VmcsControl32::VMENTRY_INSTRUCTION_LEN
            .write::<A>(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN.read::<A>()?)?;
    }
    VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write::<A>(event.bits())?;
    Ok(())
}

/// Resolve the final value of a VM-execution control field from the
/// capability MSR pair, then write it. (SDM Vol. 3C, Section 31.5.1, Algorithm 3)
pub fn set_control<A: VmxArch>(
    control: VmcsControl32,
    capability: ControlCapability,
    set: u32,
    clear: u32,
) -> HvResult {
    let ControlCapability {
        allowed0,
        allowed1,
        default1,
    } = capability;
    debug_assert_eq!(allowed0 & allowed1, allowed0);
    debug!(
        "[HV] set {:?}: {:#x} (+{:#x}, -{:#x})",
        control, default1, set, clear
    );
    if (set & clear) != 0 {
        return hv_err!(
            InvalidVmcsConfig,
            alloc::format!("can not set and clear the same bit in {:?}", control)
        );
    }
    if (allowed1 & set) != set {
        // failed if set 0-bits in allowed1
        return hv_err!(
            InvalidVmcsConfig,
            alloc::format!("can not set {:#x} in {:?}", set & !allowed1, control)
        );
    }
    if (allowed0 & clear) != 0 {
        // failed if clear 1-bits in allowed0
        return hv_err!(
            InvalidVmcsConfig,
            alloc::format!("can not clear {:#x} in {:?}", allowed0 & clear, control)
        );
    }
    // these bits can be either 0 or 1
    let flexible = !allowed0 & allowed1;
    // bits neither set nor cleared by the caller keep their default
    let unknown = flexible & !(set | clear);
    let default = unknown & default1;
    // these bits are fixed to 1
    let fixed1 = allowed0;
    control.write::<A>(fixed1 | default | set)
}

pub fn set_ept_pointer<A: VmxArch>(eptp: u64) -> HvResult {
    VmcsControl64::EPTP.write::<A>(eptp)
}
