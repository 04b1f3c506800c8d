//! Kernel-hosted devices.
//!
//! Devices live inside the kernel and see kernel slots directly. They are
//! the only way host input reaches vats (via [`DeviceIo::send_only`]), and
//! their state is persisted with the crank that changed it.

use capkernel_types::{CapData, KernelMessage, KernelSlot, Message};

/// What a device invocation produces: data to fulfill the result promise
/// with, or a rejection reason.
pub type DeviceOutcome = Result<CapData<KernelSlot>, CapData<KernelSlot>>;

pub trait Device {
    /// Handle a message sent to the device's slot, or injected by the host.
    fn invoke(&mut self, method: &str, args: &CapData<KernelSlot>, io: &mut DeviceIo) -> DeviceOutcome;

    /// Called once at kernel start with whatever the device last stored.
    fn restore(&mut self, _state: Option<&str>) {}
}

/// Side effects a device may request during one invocation.
#[derive(Debug, Default)]
pub struct DeviceIo {
    pub(crate) sends: Vec<(KernelSlot, KernelMessage)>,
    pub(crate) state: Option<String>,
}

impl DeviceIo {
    /// Queue a message with no result promise.
    pub fn send_only(&mut self, target: KernelSlot, method: impl Into<String>, args: CapData<KernelSlot>) {
        self.sends.push((target, Message::new(method, args, None)));
    }

    /// Replace the device's persisted state.
    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = Some(state.into());
    }
}
