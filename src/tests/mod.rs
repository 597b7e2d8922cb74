//! Crate-level tests running the hypervisor against the modelled processor.

mod dispatch;

use alloc::boxed::Box;

use crate::test_utils::mock::{MockArch, MockHal};
use crate::{PhysicalMemoryWindow, Vcpu, virtualize_cpu};

/// Fresh processor and allocator state. The shared window is built first so
/// frame accounting starts at zero.
fn reset() {
    PhysicalMemoryWindow::init::<MockHal>().unwrap();
    MockHal::reset();
    MockArch::reset();
}

/// A record that has virtualized the modelled processor.
fn virtualized() -> Box<Vcpu<MockHal>> {
    reset();
    let mut vcpu = Vcpu::new().unwrap();
    assert!(virtualize_cpu(&mut vcpu));
    vcpu
}
