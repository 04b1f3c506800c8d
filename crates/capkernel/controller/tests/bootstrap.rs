//! Genesis and bootstrap through the controller.

use std::sync::{Arc, Mutex};

use serde_json::json;

use capkernel_controller::{
    builtin_device, BridgeState, Controller, ControllerBuilder, ControllerConfig, ControllerError,
    ModuleRegistry, VatConfig,
};
use capkernel_kernel::KernelError;
use capkernel_liveslots::{liveslots_vat, Far, Value};
use capkernel_types::{SharedVatSetup, VatOptions};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Seen = Arc<Mutex<Vec<(Vec<String>, Vec<String>, Value)>>>;

fn keys(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Record(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn recording_bootstrap(seen: Seen) -> SharedVatSetup {
    liveslots_vat(move |_ctx| {
        let seen = seen.clone();
        Far::new("Bootstrap").method("bootstrap", move |_ctx, args| {
            let argv = args.first().cloned().unwrap_or(Value::Undefined);
            seen.lock()
                .unwrap()
                .push((keys(args.get(1)), keys(args.get(2)), argv));
            Ok(Value::from("started"))
        })
    })
}

fn idle() -> SharedVatSetup {
    liveslots_vat(|_ctx| Far::new("Idle"))
}

fn genesis(seen: Seen) -> ControllerBuilder {
    ControllerBuilder::new()
        .vat("boot", recording_bootstrap(seen), VatOptions::default())
        .vat("alice", idle(), VatOptions::default())
        .vat("bob", idle(), VatOptions::default())
        .device("clock", builtin_device("clock").unwrap())
        .bootstrap("boot")
        .argv(json!(["x"]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn bootstrap_gets_argv_other_vats_and_devices() {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let mut controller = genesis(seen.clone()).build().unwrap();
    assert_eq!(controller.run().unwrap(), 1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (vats, devices, argv) = &seen[0];
    assert_eq!(vats, &vec!["alice".to_string(), "bob".to_string()]);
    assert_eq!(devices, &vec!["clock".to_string()]);
    assert_eq!(argv, &Value::List(vec![Value::from("x")]));
}

#[test]
fn bootstrap_runs_only_on_first_start() {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let mut controller = genesis(seen.clone()).build().unwrap();
    controller.run().unwrap();
    let cranks = controller.crank_number().unwrap();
    let storage = controller.shutdown();

    let mut controller: Controller = genesis(seen).storage(storage).build().unwrap();
    assert!(!controller.is_fresh());
    assert_eq!(controller.run().unwrap(), 0);
    assert_eq!(controller.crank_number().unwrap(), cranks);
}

#[test]
fn unknown_bootstrap_vat_is_rejected() {
    let err = ControllerBuilder::new()
        .vat("alice", idle(), VatOptions::default())
        .bootstrap("nobody")
        .build()
        .err();
    assert!(matches!(
        err,
        Some(ControllerError::Kernel(KernelError::UnknownVat(name))) if name == "nobody"
    ));
}

#[test]
fn duplicate_genesis_names_are_rejected() {
    let err = ControllerBuilder::new()
        .vat("alice", idle(), VatOptions::default())
        .device("alice", builtin_device("clock").unwrap())
        .build()
        .err();
    assert!(matches!(
        err,
        Some(ControllerError::Kernel(KernelError::DuplicateName(_)))
    ));
}

#[test]
fn demo_genesis_reports_counter_total() {
    let config = ControllerConfig::default().with_demo_genesis();
    let mut controller = ControllerBuilder::from_config(&config, &ModuleRegistry::with_builtins())
        .unwrap()
        .build()
        .unwrap();
    controller.run().unwrap();
    assert!(controller.faults().is_empty());

    let state = controller.device_state("bridge").unwrap().unwrap();
    let bridge = BridgeState::parse(&state).unwrap();
    assert!(bridge.handler.is_some());
    assert_eq!(bridge.outbox, vec![json!([{ "total": 1 }])]);
    assert_eq!(controller.dump().unwrap().log, vec!["counter total 1"]);
}

#[test]
fn config_declared_vats_use_registered_modules() {
    let mut registry = ModuleRegistry::with_builtins();
    registry.register("idle", idle());

    let mut config = ControllerConfig::default();
    config.vats.push(VatConfig::new("quiet", "idle"));
    config.devices.push("clock".to_string());

    let controller = ControllerBuilder::from_config(&config, &registry)
        .unwrap()
        .build()
        .unwrap();
    assert!(controller.vat_name_to_id("quiet").is_ok());
    assert!(controller.device_name_to_id("clock").is_ok());
}
