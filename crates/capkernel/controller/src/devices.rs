//! Built-in devices.
//!
//! `bridge` carries messages between the host and a handler object a vat
//! registers; `clock` is a host-driven tick counter. Both persist their state
//! with the crank that changed it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::debug;

use capkernel_kernel::{Device, DeviceIo, DeviceOutcome};
use capkernel_types::{CapData, KernelSlot};

use crate::error::{ControllerError, ControllerResult};

/// Names accepted by [`builtin_device`].
pub const BUILTIN_DEVICES: [&str; 2] = ["bridge", "clock"];

pub fn builtin_device(name: &str) -> ControllerResult<Box<dyn Device>> {
    match name {
        "bridge" => Ok(Box::new(BridgeDevice::default())),
        "clock" => Ok(Box::new(ClockDevice::default())),
        other => Err(ControllerError::Config(format!(
            "unknown device {other:?}, expected one of {BUILTIN_DEVICES:?}"
        ))),
    }
}

fn data(body: Json) -> CapData<KernelSlot> {
    CapData::from_json(&body, Vec::new())
}

fn type_error(message: impl Into<String>) -> CapData<KernelSlot> {
    CapData::error("TypeError", message)
}

/// Persisted bridge state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeState {
    /// Object that receives `inbound` messages
    pub handler: Option<KernelSlot>,
    /// Bodies passed to `outbound`, oldest first
    pub outbox: Vec<Json>,
}

impl BridgeState {
    /// Parse the state string a dump reports for the bridge.
    pub fn parse(state: &str) -> ControllerResult<Self> {
        Ok(serde_json::from_str(state)?)
    }
}

/// Vat-facing methods: `register(handler)` and `outbound(...)`. Host-facing:
/// `inbound(...)`, which forwards its arguments to the handler.
#[derive(Debug, Default)]
pub struct BridgeDevice {
    state: BridgeState,
}

impl BridgeDevice {
    fn save(&self, io: &mut DeviceIo) -> Result<(), CapData<KernelSlot>> {
        let state = serde_json::to_string(&self.state).map_err(|e| type_error(e.to_string()))?;
        io.set_state(state);
        Ok(())
    }
}

impl Device for BridgeDevice {
    fn invoke(&mut self, method: &str, args: &CapData<KernelSlot>, io: &mut DeviceIo) -> DeviceOutcome {
        match method {
            "register" => {
                let [handler] = args.slots.as_slice() else {
                    return Err(type_error("register expects exactly one object"));
                };
                self.state.handler = Some(*handler);
                self.save(io)?;
                debug!(handler = %handler, "Bridge handler registered");
                Ok(data(Json::Null))
            }
            "outbound" => {
                if !args.slots.is_empty() {
                    return Err(type_error("outbound messages cannot carry capabilities"));
                }
                let body = args.body_json().map_err(|e| type_error(e.to_string()))?;
                self.state.outbox.push(body);
                self.save(io)?;
                Ok(data(json!(self.state.outbox.len())))
            }
            "inbound" => {
                let Some(handler) = self.state.handler else {
                    return Err(type_error("no inbound handler registered"));
                };
                io.send_only(handler, "inbound", args.clone());
                Ok(data(Json::Null))
            }
            other => Err(type_error(format!("bridge has no method {other:?}"))),
        }
    }

    fn restore(&mut self, state: Option<&str>) {
        self.state = state
            .and_then(|s| BridgeState::parse(s).ok())
            .unwrap_or_default();
    }
}

/// `now()` reads the tick count; the host advances it with `tick()`.
#[derive(Debug, Default)]
pub struct ClockDevice {
    ticks: u64,
}

impl Device for ClockDevice {
    fn invoke(&mut self, method: &str, _args: &CapData<KernelSlot>, io: &mut DeviceIo) -> DeviceOutcome {
        match method {
            "now" => Ok(data(json!(self.ticks))),
            "tick" => {
                self.ticks += 1;
                io.set_state(self.ticks.to_string());
                Ok(data(json!(self.ticks)))
            }
            other => Err(type_error(format!("clock has no method {other:?}"))),
        }
    }

    fn restore(&mut self, state: Option<&str>) {
        self.ticks = state.and_then(|s| s.parse().ok()).unwrap_or(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(body: Json, slots: Vec<KernelSlot>) -> CapData<KernelSlot> {
        CapData::from_json(&body, slots)
    }

    #[test]
    fn test_bridge_forwards_inbound_to_handler() {
        let mut bridge = BridgeDevice::default();
        let mut io = DeviceIo::default();
        assert!(bridge.invoke("inbound", &args(json!(["hi"]), vec![]), &mut io).is_err());

        let handler = KernelSlot::object(21);
        let registered = bridge.invoke(
            "register",
            &args(json!([capkernel_types::slot_ref(0)]), vec![handler]),
            &mut io,
        );
        assert!(registered.is_ok());

        let mut io = DeviceIo::default();
        bridge
            .invoke("inbound", &args(json!(["hi"]), vec![]), &mut io)
            .unwrap();
        let forwarded = format!("{io:?}");
        assert!(forwarded.contains("inbound"));
    }

    #[test]
    fn test_bridge_outbox_survives_restore() {
        let mut bridge = BridgeDevice::default();
        let mut io = DeviceIo::default();
        let count = bridge
            .invoke("outbound", &args(json!([{"total": 3}]), vec![]), &mut io)
            .unwrap();
        assert_eq!(count.body, "1");

        let state = serde_json::to_string(&bridge.state).unwrap();
        let mut restored = BridgeDevice::default();
        restored.restore(Some(&state));
        assert_eq!(restored.state.outbox, vec![json!([{"total": 3}])]);
    }

    #[test]
    fn test_bridge_rejects_capabilities_outbound() {
        let mut bridge = BridgeDevice::default();
        let mut io = DeviceIo::default();
        let outcome = bridge.invoke(
            "outbound",
            &args(json!([capkernel_types::slot_ref(0)]), vec![KernelSlot::object(20)]),
            &mut io,
        );
        assert!(outcome.is_err());
    }

    #[test]
    fn test_clock_ticks_and_restores() {
        let mut clock = ClockDevice::default();
        let mut io = DeviceIo::default();
        assert_eq!(clock.invoke("now", &args(json!([]), vec![]), &mut io).unwrap().body, "0");
        clock.invoke("tick", &args(json!([]), vec![]), &mut io).unwrap();
        clock.invoke("tick", &args(json!([]), vec![]), &mut io).unwrap();
        assert_eq!(clock.invoke("now", &args(json!([]), vec![]), &mut io).unwrap().body, "2");

        let mut restored = ClockDevice::default();
        restored.restore(Some("2"));
        assert_eq!(restored.ticks, 2);
    }

    #[test]
    fn test_unknown_builtin_device() {
        assert!(builtin_device("bridge").is_ok());
        assert!(matches!(builtin_device("radio"), Err(ControllerError::Config(_))));
    }
}
