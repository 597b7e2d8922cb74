#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[macro_use]
mod error;

mod context;
mod ept;
mod frame;
mod hal;
mod host;
pub(crate) mod msr;
mod mtrr;
mod phys_window;
pub(crate) mod regs;
mod segmentation;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

use x86::Ring;
use x86::segmentation::SegmentSelector;

pub use context::DevirtualizedContext;
pub use ept::{Ept, EptFlags, EptTranslation};
pub use error::{HvError, HvResult};
pub use hal::{HvHal, SegmentRegister, VmxArch};
pub use host::HostState;
pub use mtrr::MtrrData;
pub use phys_window::PhysicalMemoryWindow;
pub use regs::GeneralRegisters;

/// Host code segment selector, GDT slot 1.
pub const HOST_CS_SELECTOR: SegmentSelector = SegmentSelector::new(1, Ring::Ring0);
/// Host task register selector, GDT slots 2 and 3.
pub const HOST_TR_SELECTOR: SegmentSelector = SegmentSelector::new(2, Ring::Ring0);
/// Null, code, and the two halves of the TSS descriptor.
pub const HOST_GDT_DESCRIPTOR_COUNT: usize = 4;
pub const HOST_IDT_DESCRIPTOR_COUNT: usize = 256;
/// Size of the stack the exit handler runs on.
pub const HOST_STACK_SIZE: usize = 0x6000;

/// PML4 slot of the physical-memory window in the host address space.
pub const HOST_PHYSICAL_MEMORY_PML4_IDX: usize = 255;
/// Host virtual address of physical address 0.
pub const HOST_PHYSICAL_MEMORY_BASE: usize = HOST_PHYSICAL_MEMORY_PML4_IDX << 39;
/// Amount of physical memory reachable through the window.
pub const HOST_PHYSICAL_MEMORY_SIZE: usize = 128 << 30;

/// VPID tagging the guest's TLB entries.
pub const GUEST_VPID: u16 = 1;
/// Returned in RAX by the ping hypercall.
pub const HYPERVISOR_SIGNATURE: u64 = u32::from_be_bytes(*b"jono") as u64;
/// Page directories in the default EPT: 1 GiB of identity map each.
pub const EPT_PD_COUNT: usize = 512;

cfg_if::cfg_if! {
    if #[cfg(feature = "vmx")] {
        mod capability;
        mod vmx;

        #[cfg(target_arch = "x86_64")]
        mod native;
        #[cfg(target_arch = "x86_64")]
        pub use native::NativeArch;

        pub use capability::{CachedCpuData, ControlCapability};
        pub use vmx::{
            CrAccessInfo, EptViolationInfo, ExitDecision, HypercallCode, HypercallStatus,
            MsrBitmap, Vcpu, VmExit, VmExitAction, VmxExitInfo, VmxExitReason,
            VmxInstructionError, VmxInterruptInfo, VmxInterruptionType, VmxPerCpuState,
            devirtualize_cpu, has_hardware_support, ping,
        };

        /// Virtualize the calling processor with `vcpu` as its record.
        ///
        /// Returns `true` in the guest once the processor runs under the
        /// hypervisor, `false` if activation failed and nothing changed.
        pub fn virtualize_cpu<H: HvHal>(vcpu: &mut Vcpu<H>) -> bool {
            match vcpu.virtualize() {
                Ok(()) => true,
                Err(err) => {
                    error!("[HV] virtualize_cpu failed: {}", err);
                    false
                }
            }
        }

        /// Toggle RDMSR/WRMSR exiting for `msr` on `vcpu`.
        pub fn enable_exiting_for_msr<H: HvHal>(
            vcpu: &mut Vcpu<H>,
            msr: u32,
            enabled: bool,
        ) -> HvResult {
            vcpu.enable_exiting_for_msr(msr, enabled)
        }
    }
}
