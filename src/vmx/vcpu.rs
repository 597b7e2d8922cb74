use alloc::boxed::Box;
use core::fmt::{Debug, Formatter, Result};

use x86::segmentation::SegmentSelector;
use x86_64::VirtAddr;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::structures::DescriptorTablePointer;

use super::as_hv_err;
use super::hypercall::devirtualize_cpu;
use super::percpu::VmxPerCpuState;
use super::structs::{MsrBitmap, VmxRegion};
use super::vmcs::{
    self, VmcsControl16, VmcsControl32, VmcsControl64, VmcsControlNW, VmcsGuest16, VmcsGuest32,
    VmcsGuest64, VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW,
};
use crate::capability::CachedCpuData;
use crate::context::DevirtualizedContext;
use crate::ept::Ept;
use crate::hal::{HvHal, SegmentRegister, VmxArch, cpuid_of};
use crate::host::{HostEnvironment, HostState};
use crate::msr::Msr;
use crate::mtrr::MtrrData;
use crate::phys_window::PhysicalMemoryWindow;
use crate::segmentation::Segment;
use crate::{GUEST_VPID, HvError, HvResult};

const CR4_VMXE: u64 = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();

/// The virtualization record of one logical processor.
///
/// Heap allocated so its address, stored on the host stack, never changes.
pub struct Vcpu<H: HvHal> {
    percpu: VmxPerCpuState<H>,
    vmcs: VmxRegion<H>,
    msr_bitmap: MsrBitmap<H>,
    host: HostEnvironment<H>,
    pub(super) ept: Ept<H>,
    cached: Option<CachedCpuData>,

    pub(super) tsc_offset: u64,
    /// VMX-preemption timer reload value, 0 when unused.
    pub(super) preemption_timer: u32,
    /// Cycles spent in the exit handler so far.
    pub(super) vm_exit_tsc_latency: u64,
    pub(super) hide_vm_exit_latency: bool,
    /// NMIs waiting for the guest to become NMI-injectable.
    pub(super) queued_nmis: u32,

    active: bool,
    pub(super) exit_count: u64,
}

impl<H: HvHal> Vcpu<H> {
    /// Allocate a record. Only the MSR bitmap is populated until
    /// [`Vcpu::virtualize`].
    pub fn new() -> HvResult<Box<Self>> {
        let vcpu = Box::new(Self {
            percpu: VmxPerCpuState::new(),
            vmcs: unsafe { VmxRegion::uninit() },
            msr_bitmap: MsrBitmap::passthrough_all()?,
            host: unsafe { HostEnvironment::uninit() },
            ept: unsafe { Ept::uninit() },
            cached: None,
            tsc_offset: 0,
            preemption_timer: 0,
            vm_exit_tsc_latency: 0,
            hide_vm_exit_latency: false,
            queued_nmis: 0,
            active: false,
            exit_count: 0,
        });
        debug!(
            "[HV] created Vcpu(msr bitmap: {:#x})",
            vcpu.msr_bitmap.phys_addr().as_usize()
        );
        Ok(vcpu)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The capability snapshot, once captured.
    pub fn cached_data(&self) -> Option<&CachedCpuData> {
        self.cached.as_ref()
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap<H> {
        &self.msr_bitmap
    }

    pub fn ept(&self) -> &Ept<H> {
        &self.ept
    }

    pub fn ept_mut(&mut self) -> &mut Ept<H> {
        &mut self.ept
    }

    pub fn host_state(&self) -> HostState {
        self.host.state()
    }

    pub fn exit_count(&self) -> u64 {
        self.exit_count
    }

    pub fn tsc_offset(&self) -> u64 {
        self.tsc_offset
    }

    pub fn vm_exit_tsc_latency(&self) -> u64 {
        self.vm_exit_tsc_latency
    }

    pub fn hide_vm_exit_latency(&self) -> bool {
        self.hide_vm_exit_latency
    }

    /// Whether exit handling time is subtracted from the guest TSC.
    pub fn set_hide_vm_exit_latency(&mut self, hide: bool) {
        self.hide_vm_exit_latency = hide;
    }

    /// Arm the VMX-preemption timer with `value` on every entry. Takes
    /// effect on the next [`Vcpu::virtualize`].
    pub fn set_preemption_timer(&mut self, value: u32) {
        self.preemption_timer = value;
    }

    /// Toggle RDMSR and WRMSR exiting for `msr`.
    pub fn enable_exiting_for_msr(&mut self, msr: u32, enabled: bool) -> HvResult {
        if !MsrBitmap::<H>::is_valid_index(msr) {
            warn!("[HV] MSR {:#x} can not be controlled by the MSR bitmap", msr);
            return Err(HvError::InvalidMsrIndex(msr));
        }
        self.msr_bitmap.set_read_intercept(msr, enabled)?;
        self.msr_bitmap.set_write_intercept(msr, enabled)?;
        trace!("[HV] MSR {:#x} exiting {}", msr, enabled);
        Ok(())
    }

    /// Turn the current processor into a guest of this record.
    ///
    /// On success the caller continues as the guest. On failure nothing is
    /// left in VMX operation and CR4 is restored.
    pub fn virtualize(&mut self) -> HvResult {
        if self.active {
            return hv_err!(VmxAlreadyEnabled);
        }
        let data = match &self.cached {
            Some(data) => data.clone(),
            None => {
                let data = CachedCpuData::capture::<H::Arch>()?;
                self.cached = Some(data.clone());
                data
            }
        };

        let cr0 = H::Arch::read_cr0();
        let cr4 = H::Arch::read_cr4();
        if !data.cr0_is_valid(cr0) {
            return hv_err!(
                InvalidGuestState,
                alloc::format!("CR0 {:#x} is not valid in VMX operation", cr0)
            );
        }
        if !data.cr4_is_valid(cr4 | CR4_VMXE) {
            return hv_err!(
                InvalidGuestState,
                alloc::format!("CR4 {:#x} is not valid in VMX operation", cr4)
            );
        }

        let result = self
            .prepare(&data)
            .and_then(|window| self.enter(&data, window));
        if let Err(err) = result {
            error!("[HV] failed to virtualize the processor: {}", err);
            self.release();
            return Err(err);
        }
        Ok(())
    }

    /// Build everything that must exist before VMXON.
    fn prepare(&mut self, data: &CachedCpuData) -> HvResult<&'static PhysicalMemoryWindow> {
        let record = self as *const Self as usize;
        self.host = HostEnvironment::new(record)?;
        self.ept = Ept::new(&MtrrData::read::<H::Arch>(data.max_phys_addr))?;
        let window = PhysicalMemoryWindow::init::<H>()?;
        self.setup_msr_bitmap()?;
        self.vmcs = VmxRegion::new(data.vmx_basic.revision_id, false)?;
        Ok(window)
    }

    /// VMXON, populate the VMCS and launch. Undoes VMXON on failure.
    fn enter(&mut self, data: &CachedCpuData, window: &PhysicalMemoryWindow) -> HvResult {
        self.percpu.hardware_enable(data)?;
        let result = self.launch(data, window);
        if result.is_err() {
            self.active = false;
            let paddr = self.vmcs.phys_addr().as_usize() as u64;
            unsafe {
                let _ = H::Arch::vmclear(paddr);
            }
            if let Err(err) = self.percpu.hardware_disable() {
                error!("[HV] failed to leave VMX operation: {}", err);
            }
            unsafe { H::Arch::write_cr4(self.percpu.saved_cr4()) };
        }
        result
    }

    fn launch(&mut self, data: &CachedCpuData, window: &PhysicalMemoryWindow) -> HvResult {
        let paddr = self.vmcs.phys_addr().as_usize() as u64;
        unsafe {
            H::Arch::vmclear(paddr).map_err(as_hv_err::<H::Arch>)?;
            H::Arch::vmptrld(paddr).map_err(as_hv_err::<H::Arch>)?;
        }
        self.setup_vmcs_control(data)?;
        self.setup_vmcs_host(window)?;
        self.setup_vmcs_guest(data)?;

        self.active = true;
        info!("[HV] launching the current processor as a guest");
        unsafe { H::Arch::vmlaunch_current() }.map_err(as_hv_err::<H::Arch>)?;
        debug!("[HV] processor virtualized");
        Ok(())
    }

    /// Free the frames built by [`Vcpu::prepare`].
    fn release(&mut self) {
        self.vmcs = unsafe { VmxRegion::uninit() };
        self.ept = unsafe { Ept::uninit() };
        self.host = unsafe { HostEnvironment::uninit() };
    }

    fn setup_msr_bitmap(&mut self) -> HvResult {
        // The guest must not see or change the VMX configuration.
        let feature_control = Msr::IA32_FEATURE_CONTROL as u32;
        self.msr_bitmap.set_read_intercept(feature_control, true)?;
        self.msr_bitmap.set_write_intercept(feature_control, true)?;
        for msr in Msr::IA32_VMX_BASIC as u32..=Msr::IA32_VMX_VMFUNC as u32 {
            self.msr_bitmap.set_read_intercept(msr, true)?;
            self.msr_bitmap.set_write_intercept(msr, true)?;
        }
        Ok(())
    }

    fn setup_vmcs_control(&mut self, data: &CachedCpuData) -> HvResult {
        use super::vmcs::controls::*;

        // Intercept NMIs, track NMI blocking ourselves.
        use PinbasedControls as PinCtrl;
        let mut pin = PinCtrl::NMI_EXITING | PinCtrl::VIRTUAL_NMIS;
        if self.preemption_timer != 0 {
            pin |= PinCtrl::VMX_PREEMPTION_TIMER;
        }
        vmcs::set_control::<H::Arch>(
            VmcsControl32::PINBASED_EXEC_CONTROLS,
            data.pin_controls,
            pin.bits(),
            0,
        )?;

        // Use MSR bitmaps and TSC offsetting, activate secondary controls,
        // disable CR3 and CR8 interception.
        use PrimaryControls as CpuCtrl;
        vmcs::set_control::<H::Arch>(
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
            data.primary_controls,
            (CpuCtrl::USE_MSR_BITMAPS | CpuCtrl::USE_TSC_OFFSETTING | CpuCtrl::SECONDARY_CONTROLS)
                .bits(),
            (CpuCtrl::CR3_LOAD_EXITING
                | CpuCtrl::CR3_STORE_EXITING
                | CpuCtrl::CR8_LOAD_EXITING
                | CpuCtrl::CR8_STORE_EXITING)
                .bits(),
        )?;

        // Enable EPT and VPID, plus the instructions the guest already uses.
        use SecondaryControls as CpuCtrl2;
        let raw_cpuid = cpuid_of::<H::Arch>();
        let mut optional = CpuCtrl2::empty();
        if let Some(features) = raw_cpuid.get_extended_processor_and_feature_identifiers() {
            if features.has_rdtscp() {
                optional |= CpuCtrl2::ENABLE_RDTSCP;
            }
        }
        if let Some(features) = raw_cpuid.get_extended_feature_info() {
            if features.has_invpcid() {
                optional |= CpuCtrl2::ENABLE_INVPCID;
            }
            if features.has_waitpkg() {
                optional |= CpuCtrl2::ENABLE_USER_WAIT_PAUSE;
            }
        }
        if let Some(features) = raw_cpuid.get_extended_state_info() {
            if features.has_xsaves_xrstors() {
                optional |= CpuCtrl2::ENABLE_XSAVES_XRSTORS;
            }
        }
        let secondary = (CpuCtrl2::ENABLE_EPT | CpuCtrl2::ENABLE_VPID).bits()
            | data.secondary_controls.supported(optional.bits());
        vmcs::set_control::<H::Arch>(
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS,
            data.secondary_controls,
            secondary,
            0,
        )?;

        // Switch to 64-bit host, switch IA32_PAT/IA32_EFER on VM exit.
        use ExitControls as ExitCtrl;
        vmcs::set_control::<H::Arch>(
            VmcsControl32::VMEXIT_CONTROLS,
            data.exit_controls,
            (ExitCtrl::HOST_ADDRESS_SPACE_SIZE
                | ExitCtrl::SAVE_DEBUG_CONTROLS
                | ExitCtrl::SAVE_IA32_PAT
                | ExitCtrl::LOAD_IA32_PAT
                | ExitCtrl::SAVE_IA32_EFER
                | ExitCtrl::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        // The guest is the running 64-bit kernel.
        use EntryControls as EntryCtrl;
        vmcs::set_control::<H::Arch>(
            VmcsControl32::VMENTRY_CONTROLS,
            data.entry_controls,
            (EntryCtrl::IA32E_MODE_GUEST
                | EntryCtrl::LOAD_DEBUG_CONTROLS
                | EntryCtrl::LOAD_IA32_PAT
                | EntryCtrl::LOAD_IA32_EFER)
                .bits(),
            0,
        )?;

        vmcs::set_ept_pointer::<H::Arch>(self.ept.eptp())?;
        VmcsControl16::VPID.write::<H::Arch>(GUEST_VPID)?;
        VmcsControl64::MSR_BITMAPS_ADDR.write::<H::Arch>(self.msr_bitmap.phys_addr().as_usize() as _)?;

        self.tsc_offset = 0;
        VmcsControl64::TSC_OFFSET.write::<H::Arch>(0)?;

        // No MSR switches, no exceptions intercepted.
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write::<H::Arch>(0)?;
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write::<H::Arch>(0)?;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write::<H::Arch>(0)?;
        VmcsControl32::CR3_TARGET_COUNT.write::<H::Arch>(0)?;
        VmcsControl32::EXCEPTION_BITMAP.write::<H::Arch>(0)?;
        VmcsControl32::PAGE_FAULT_ERR_CODE_MASK.write::<H::Arch>(0)?;
        VmcsControl32::PAGE_FAULT_ERR_CODE_MATCH.write::<H::Arch>(0)?;
        VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write::<H::Arch>(0)?;
        Ok(())
    }

    fn setup_vmcs_host(&self, window: &PhysicalMemoryWindow) -> HvResult {
        let host = self.host.state();

        VmcsHost64::IA32_PAT.write::<H::Arch>(Msr::IA32_PAT.read::<H::Arch>())?;
        VmcsHost64::IA32_EFER.write::<H::Arch>(Msr::IA32_EFER.read::<H::Arch>())?;

        VmcsHostNW::CR0.write::<H::Arch>(H::Arch::read_cr0() as _)?;
        VmcsHostNW::CR3.write::<H::Arch>(window.host_cr3() as _)?;
        VmcsHostNW::CR4.write::<H::Arch>(H::Arch::read_cr4() as _)?;

        VmcsHost16::ES_SELECTOR.write::<H::Arch>(0)?;
        VmcsHost16::CS_SELECTOR.write::<H::Arch>(host.cs)?;
        VmcsHost16::SS_SELECTOR.write::<H::Arch>(0)?;
        VmcsHost16::DS_SELECTOR.write::<H::Arch>(0)?;
        VmcsHost16::FS_SELECTOR.write::<H::Arch>(0)?;
        VmcsHost16::GS_SELECTOR.write::<H::Arch>(0)?;
        VmcsHost16::TR_SELECTOR.write::<H::Arch>(host.tr)?;
        VmcsHostNW::FS_BASE.write::<H::Arch>(Msr::IA32_FS_BASE.read::<H::Arch>() as _)?;
        VmcsHostNW::GS_BASE.write::<H::Arch>(Msr::IA32_GS_BASE.read::<H::Arch>() as _)?;
        VmcsHostNW::TR_BASE.write::<H::Arch>(host.tr_base as _)?;
        VmcsHostNW::GDTR_BASE.write::<H::Arch>(host.gdtr_base as _)?;
        VmcsHostNW::IDTR_BASE.write::<H::Arch>(host.idtr_base as _)?;

        VmcsHostNW::RSP.write::<H::Arch>(host.rsp as _)?;
        VmcsHostNW::RIP.write::<H::Arch>(host.rip as _)?;

        VmcsHostNW::IA32_SYSENTER_ESP.write::<H::Arch>(0)?;
        VmcsHostNW::IA32_SYSENTER_EIP.write::<H::Arch>(0)?;
        VmcsHost32::IA32_SYSENTER_CS.write::<H::Arch>(0)?;
        Ok(())
    }

    /// Copy the state of the running processor into the guest area, so the
    /// guest continues exactly where the launch happened.
    fn setup_vmcs_guest(&mut self, data: &CachedCpuData) -> HvResult {
        let gdt = H::Arch::sgdt();
        let idt = H::Arch::sidt();

        self.set_cr(data, 0, H::Arch::read_cr0())?;
        self.set_cr(data, 4, self.percpu.saved_cr4())?;
        self.set_cr(data, 3, H::Arch::read_cr3())?;

        macro_rules! set_guest_segment {
            ($seg: expr, $reg: ident) => {{
                let seg = $seg;
                paste::paste! {
                    VmcsGuest16::[<$reg _SELECTOR>].write::<H::Arch>(seg.selector.bits())?;
                    VmcsGuestNW::[<$reg _BASE>].write::<H::Arch>(seg.base as _)?;
                    VmcsGuest32::[<$reg _LIMIT>].write::<H::Arch>(seg.limit)?;
                    VmcsGuest32::[<$reg _ACCESS_RIGHTS>].write::<H::Arch>(seg.access_rights.bits())?;
                }
            }};
        }
        let segment = |reg| Segment::from_selector(H::Arch::selector(reg), &gdt);

        set_guest_segment!(segment(SegmentRegister::Es), ES);
        set_guest_segment!(segment(SegmentRegister::Cs), CS);
        set_guest_segment!(segment(SegmentRegister::Ss), SS);
        set_guest_segment!(segment(SegmentRegister::Ds), DS);
        // FS and GS bases live in MSRs in 64-bit mode.
        set_guest_segment!(
            Segment {
                base: Msr::IA32_FS_BASE.read::<H::Arch>(),
                ..segment(SegmentRegister::Fs)
            },
            FS
        );
        set_guest_segment!(
            Segment {
                base: Msr::IA32_GS_BASE.read::<H::Arch>(),
                ..segment(SegmentRegister::Gs)
            },
            GS
        );
        set_guest_segment!(segment(SegmentRegister::Tr), TR);
        set_guest_segment!(segment(SegmentRegister::Ldtr), LDTR);

        VmcsGuestNW::GDTR_BASE.write::<H::Arch>(gdt.base.as_u64() as _)?;
        VmcsGuest32::GDTR_LIMIT.write::<H::Arch>(gdt.limit as _)?;
        VmcsGuestNW::IDTR_BASE.write::<H::Arch>(idt.base.as_u64() as _)?;
        VmcsGuest32::IDTR_LIMIT.write::<H::Arch>(idt.limit as _)?;

        VmcsGuestNW::DR7.write::<H::Arch>(H::Arch::read_dr7() as _)?;
        VmcsGuestNW::RFLAGS.write::<H::Arch>(H::Arch::read_rflags() as _)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write::<H::Arch>(0)?;

        VmcsGuest32::IA32_SYSENTER_CS.write::<H::Arch>(Msr::IA32_SYSENTER_CS.read::<H::Arch>() as _)?;
        VmcsGuestNW::IA32_SYSENTER_ESP.write::<H::Arch>(Msr::IA32_SYSENTER_ESP.read::<H::Arch>() as _)?;
        VmcsGuestNW::IA32_SYSENTER_EIP.write::<H::Arch>(Msr::IA32_SYSENTER_EIP.read::<H::Arch>() as _)?;

        VmcsGuest32::ACTIVITY_STATE.write::<H::Arch>(0)?;
        VmcsGuest32::INTERRUPTIBILITY_STATE.write::<H::Arch>(0)?;
        VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE.write::<H::Arch>(self.preemption_timer)?;

        VmcsGuest64::LINK_PTR.write::<H::Arch>(u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        VmcsGuest64::IA32_DEBUGCTL.write::<H::Arch>(Msr::IA32_DEBUGCTL.read::<H::Arch>())?;
        VmcsGuest64::IA32_PAT.write::<H::Arch>(Msr::IA32_PAT.read::<H::Arch>())?;
        VmcsGuest64::IA32_EFER.write::<H::Arch>(Msr::IA32_EFER.read::<H::Arch>())?;
        Ok(())
    }

    /// Write a guest control register, keeping the VMX fixed bits forced on
    /// the processor while the guest reads back its own value.
    pub(super) fn set_cr(&self, data: &CachedCpuData, cr_idx: usize, val: u64) -> HvResult {
        match cr_idx {
            0 => {
                // NW and CD are not restored on VM exit: never let them
                // reach the processor.
                let must0 =
                    data.vmx_cr0_fixed1 & !(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE).bits();
                let must1 = data.vmx_cr0_fixed0;
                VmcsGuestNW::CR0.write::<H::Arch>(((val & must0) | must1) as _)?;
                VmcsControlNW::CR0_READ_SHADOW.write::<H::Arch>(val as _)?;
                VmcsControlNW::CR0_GUEST_HOST_MASK.write::<H::Arch>((must1 | !must0) as _)?;
            }
            3 => VmcsGuestNW::CR3.write::<H::Arch>(val as _)?,
            4 => {
                let must0 = data.vmx_cr4_fixed1;
                let must1 = data.vmx_cr4_fixed0 | CR4_VMXE;
                VmcsGuestNW::CR4.write::<H::Arch>(((val & must0) | must1) as _)?;
                VmcsControlNW::CR4_READ_SHADOW.write::<H::Arch>((val & !CR4_VMXE) as _)?;
                VmcsControlNW::CR4_GUEST_HOST_MASK.write::<H::Arch>((must1 | !must0) as _)?;
            }
            _ => return hv_err!(InvalidVmcsConfig, alloc::format!("CR{} is not shadowed", cr_idx)),
        }
        Ok(())
    }

    /// The value of CR0 or CR4 as the guest believes it to be.
    pub(super) fn guest_cr(&self, cr_idx: usize) -> HvResult<u64> {
        let (mask, shadow, real) = match cr_idx {
            0 => (
                VmcsControlNW::CR0_GUEST_HOST_MASK.read::<H::Arch>()?,
                VmcsControlNW::CR0_READ_SHADOW.read::<H::Arch>()?,
                VmcsGuestNW::CR0.read::<H::Arch>()?,
            ),
            4 => (
                VmcsControlNW::CR4_GUEST_HOST_MASK.read::<H::Arch>()?,
                VmcsControlNW::CR4_READ_SHADOW.read::<H::Arch>()?,
                VmcsGuestNW::CR4.read::<H::Arch>()?,
            ),
            _ => return hv_err!(InvalidVmcsConfig, alloc::format!("CR{} is not shadowed", cr_idx)),
        };
        Ok(((shadow & mask) | (real & !mask)) as u64)
    }

    /// Leave VMX operation from the exit handler and put the guest's system
    /// state back on the processor.
    pub(super) fn devirtualize(&mut self) -> HvResult<DevirtualizedContext> {
        if !self.active {
            return hv_err!(VmxNotEnabled);
        }

        let ctx = DevirtualizedContext {
            rip: VmcsGuestNW::RIP.read::<H::Arch>()? as _,
            rsp: VmcsGuestNW::RSP.read::<H::Arch>()? as _,
            rflags: VmcsGuestNW::RFLAGS.read::<H::Arch>()? as _,
            cr0: self.guest_cr(0)?,
            cr3: VmcsGuestNW::CR3.read::<H::Arch>()? as _,
            cr4: self.guest_cr(4)?,
            gdt: DescriptorTablePointer {
                limit: VmcsGuest32::GDTR_LIMIT.read::<H::Arch>()? as _,
                base: VirtAddr::new_truncate(VmcsGuestNW::GDTR_BASE.read::<H::Arch>()? as _),
            },
            idt: DescriptorTablePointer {
                limit: VmcsGuest32::IDTR_LIMIT.read::<H::Arch>()? as _,
                base: VirtAddr::new_truncate(VmcsGuestNW::IDTR_BASE.read::<H::Arch>()? as _),
            },
            tr: SegmentSelector::from_raw(VmcsGuest16::TR_SELECTOR.read::<H::Arch>()?),
            fs_base: VmcsGuestNW::FS_BASE.read::<H::Arch>()? as _,
            gs_base: VmcsGuestNW::GS_BASE.read::<H::Arch>()? as _,
            dr7: VmcsGuestNW::DR7.read::<H::Arch>()? as _,
            debugctl: VmcsGuest64::IA32_DEBUGCTL.read::<H::Arch>()?,
            pat: VmcsGuest64::IA32_PAT.read::<H::Arch>()?,
            efer: VmcsGuest64::IA32_EFER.read::<H::Arch>()?,
            sysenter_cs: VmcsGuest32::IA32_SYSENTER_CS.read::<H::Arch>()? as _,
            sysenter_esp: VmcsGuestNW::IA32_SYSENTER_ESP.read::<H::Arch>()? as _,
            sysenter_eip: VmcsGuestNW::IA32_SYSENTER_EIP.read::<H::Arch>()? as _,
        };

        let paddr = self.vmcs.phys_addr().as_usize() as u64;
        unsafe { H::Arch::vmclear(paddr) }.map_err(as_hv_err::<H::Arch>)?;
        self.percpu.hardware_disable()?;
        self.active = false;
        ctx.restore::<H::Arch>();

        info!(
            "[HV] processor devirtualized after {} exits, resuming at {:#x}",
            self.exit_count, ctx.rip
        );
        Ok(ctx)
    }
}

impl<H: HvHal> Drop for Vcpu<H> {
    fn drop(&mut self) {
        if self.active {
            warn!("[HV] dropping an active Vcpu, devirtualizing first");
            devirtualize_cpu::<H::Arch>();
        }
        info!("[HV] dropped Vcpu after {} exits", self.exit_count);
    }
}

impl<H: HvHal> Debug for Vcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_struct("Vcpu")
            .field("active", &self.active)
            .field("exit_count", &self.exit_count)
            .field("tsc_offset", &self.tsc_offset)
            .field("vm_exit_tsc_latency", &self.vm_exit_tsc_latency)
            .field("hide_vm_exit_latency", &self.hide_vm_exit_latency)
            .field("preemption_timer", &self.preemption_timer)
            .field("queued_nmis", &self.queued_nmis)
            .finish()
    }
}
