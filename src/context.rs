use x86::segmentation::SegmentSelector;
use x86_64::VirtAddr;
use x86_64::structures::DescriptorTablePointer;

use crate::hal::VmxArch;
use crate::msr::Msr;
use crate::segmentation::SegmentAccessRights;

/// Guest state handed back to the exit trampoline after VMX is turned off.
///
/// The trampoline restores the general-purpose registers it saved, loads
/// `rsp` and `rflags`, and jumps to `rip`.
#[derive(Debug, Clone, Copy)]
pub struct DevirtualizedContext {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub gdt: DescriptorTablePointer,
    pub idt: DescriptorTablePointer,
    pub tr: SegmentSelector,

    pub fs_base: u64,
    pub gs_base: u64,

    /// VM exits reset DR7 and DEBUGCTL and load the host's PAT, EFER and
    /// SYSENTER MSRs, so the guest's values come from the VMCS.
    pub dr7: u64,
    pub debugctl: u64,
    pub pat: u64,
    pub efer: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
}

unsafe impl Send for DevirtualizedContext {}
unsafe impl Sync for DevirtualizedContext {}

impl Default for DevirtualizedContext {
    fn default() -> Self {
        Self {
            rip: 0,
            rsp: 0,
            rflags: 0x2,
            cr0: 0,
            cr3: 0,
            cr4: 0,
            gdt: DescriptorTablePointer {
                limit: 0,
                base: VirtAddr::zero(),
            },
            idt: DescriptorTablePointer {
                limit: 0,
                base: VirtAddr::zero(),
            },
            tr: SegmentSelector::from_raw(0),
            fs_base: 0,
            gs_base: 0,
            dr7: 0x400,
            debugctl: 0,
            pat: 0x0007_0406_0007_0406,
            efer: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
        }
    }
}

impl DevirtualizedContext {
    /// Put the guest's system registers back on the real processor.
    ///
    /// Must run after VMXOFF, on the processor the context was taken from.
    pub fn restore<A: VmxArch>(&self) {
        unsafe {
            A::write_cr0(self.cr0);
            A::write_cr4(self.cr4);
            // cr3 must be last in case cr4 enables PCID
            A::write_cr3(self.cr3);

            A::lgdt(&self.gdt);
            A::lidt(&self.idt);
        }

        // The guest TSS descriptor is still marked busy from before the
        // launch. LTR faults on a busy descriptor.
        let index = self.tr.index() as usize;
        let entry_count = (self.gdt.limit as usize + 1) / core::mem::size_of::<u64>();
        if index != 0 && index < entry_count {
            let table = unsafe {
                core::slice::from_raw_parts_mut(self.gdt.base.as_mut_ptr::<u64>(), entry_count)
            };
            SegmentAccessRights::set_descriptor_type(
                &mut table[index],
                SegmentAccessRights::TSS_AVAIL,
            );
            unsafe { A::load_tr(self.tr) };
        }

        unsafe {
            Msr::IA32_FS_BASE.write::<A>(self.fs_base);
            Msr::IA32_GS_BASE.write::<A>(self.gs_base);
            Msr::IA32_PAT.write::<A>(self.pat);
            Msr::IA32_EFER.write::<A>(self.efer);
            Msr::IA32_SYSENTER_CS.write::<A>(self.sysenter_cs);
            Msr::IA32_SYSENTER_ESP.write::<A>(self.sysenter_esp);
            Msr::IA32_SYSENTER_EIP.write::<A>(self.sysenter_eip);
            Msr::IA32_DEBUGCTL.write::<A>(self.debugctl);
            A::write_dr7(self.dr7);
        }
        debug!(
            "[HV] restored guest context: rip {:#x}, rsp {:#x}, cr3 {:#x}",
            self.rip, self.rsp, self.cr3
        );
    }
}
