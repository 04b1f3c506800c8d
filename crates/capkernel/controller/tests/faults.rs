//! A vat whose delivery fails part way keeps its view of the world, and
//! the kernel keeps the matching half: imports it was handed stay mapped,
//! and sends it made before failing still go out.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use serde_json::json;

use capkernel_controller::{Controller, ControllerBuilder};
use capkernel_liveslots::{liveslots_vat, Far, Value};
use capkernel_store::{HostStorage, MemoryStore};
use capkernel_types::{KernelSlot, SharedVatSetup, VatOptions, VatSlot};

type Log = Arc<Mutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

/// Answers `who` with its name and records every `note`.
fn named(name: &'static str, log: Log) -> SharedVatSetup {
    liveslots_vat(move |_ctx| {
        let log = log.clone();
        Far::new(name)
            .method("who", move |_ctx, _args| Ok(name.into()))
            .method("note", move |_ctx, args| {
                let text = arg(&args, 0).as_str().unwrap_or_default().to_string();
                log.lock().unwrap().push(format!("{name}: {text}"));
                Ok(Value::Undefined)
            })
    })
}

/// `keep(ref)` stores the reference, tells it so, then spins until its
/// meter runs out. `other(ref)` ignores its argument. `ask()` asks the
/// stored reference who it is.
fn keeper_vat() -> SharedVatSetup {
    liveslots_vat(|_ctx| {
        let stored: Rc<RefCell<Value>> = Rc::new(RefCell::new(Value::Undefined));
        let (keep, ask) = (stored.clone(), stored);
        Far::new("Keeper")
            .method("keep", move |ctx, args| {
                let target = arg(&args, 0);
                *keep.borrow_mut() = target.clone();
                ctx.send(&target, "note", vec!["kept".into()]);
                let looper = ctx.export(Far::new("Looper").method("go", |ctx, args| {
                    ctx.send(&args[0], "go", vec![args[0].clone()]);
                    Ok(Value::Undefined)
                }));
                ctx.send(&looper, "go", vec![looper.clone()]);
                Ok(Value::Undefined)
            })
            .method("other", |_ctx, _args| Ok(Value::Undefined))
            .method("ask", move |ctx, _args| {
                let target = ask.borrow().clone();
                Ok(ctx.send(&target, "who", vec![]))
            })
    })
}

fn host(log: Log) -> SharedVatSetup {
    liveslots_vat(move |_ctx| {
        let log = log.clone();
        Far::new("Host").method("bootstrap", move |ctx, args| {
            let vats = arg(&args, 1);
            let field = |name: &str| vats.get(name).cloned().unwrap_or(Value::Undefined);
            let (keeper, alice, bob) = (field("keeper"), field("alice"), field("bob"));

            let kept = ctx.send(&keeper, "keep", vec![alice]);
            ctx.send(&keeper, "other", vec![bob]);
            let answer = ctx.send(&keeper, "ask", vec![]);

            let (kept_log, answer_log) = (log.clone(), log.clone());
            ctx.when(kept, move |_ctx, outcome| {
                let line = if outcome.is_ok() { "keep: fulfilled" } else { "keep: rejected" };
                kept_log.lock().unwrap().push(line.to_string());
                outcome
            });
            ctx.when(answer, move |_ctx, outcome| {
                let who = match &outcome {
                    Ok(value) => value.as_str().unwrap_or("?").to_string(),
                    Err(_) => "rejected".to_string(),
                };
                answer_log.lock().unwrap().push(format!("ask: {who}"));
                outcome
            });
            Ok(Value::Undefined)
        })
    })
}

fn build(log: &Log, storage: Box<dyn HostStorage>) -> Controller {
    let budget = VatOptions {
        microtask_budget: Some(20),
        ..VatOptions::default()
    };
    ControllerBuilder::new()
        .storage(storage)
        .vat("host", host(log.clone()), VatOptions::default())
        .vat("keeper", keeper_vat(), budget)
        .vat("alice", named("alice", log.clone()), VatOptions::default())
        .vat("bob", named("bob", log.clone()), VatOptions::default())
        .bootstrap("host")
        .argv(json!([]))
        .build()
        .unwrap()
}

fn vs(s: &str) -> VatSlot {
    s.parse().unwrap()
}

#[test]
fn failed_delivery_keeps_its_imports_and_earlier_sends() {
    let log: Log = Arc::default();
    let mut controller = build(&log, Box::new(MemoryStore::new()));
    controller.run().unwrap();

    let keeper = controller.vat_name_to_id("keeper").unwrap();
    let faults = controller.faults();
    assert_eq!(faults.len(), 1, "faults: {faults:?}");
    assert_eq!(faults[0].vat, Some(keeper));
    assert!(faults[0].error.contains("microtask budget"));

    // `keep` answered before its meter ran out, so its result stands.
    let mut seen = entries(&log);
    seen.sort();
    assert_eq!(seen, vec!["alice: kept", "ask: alice", "keep: fulfilled"]);

    // The keeper's o-10 is alice's root and bob got a slot of his own.
    let dump = controller.dump().unwrap();
    let root_of = |vat: &str| {
        dump.vat(vat)
            .unwrap()
            .clist
            .iter()
            .find(|e| e.vat_slot == VatSlot::root())
            .map(|e| e.kernel_slot)
            .unwrap()
    };
    let clist = &dump.vat("keeper").unwrap().clist;
    let slot_of = |kslot: KernelSlot| clist.iter().find(|e| e.kernel_slot == kslot).map(|e| e.vat_slot);
    assert_eq!(slot_of(root_of("alice")), Some(vs("o-10")));
    assert_eq!(slot_of(root_of("bob")), Some(vs("o-11")));
}

#[test]
fn failed_delivery_replays_after_restart() {
    let log: Log = Arc::default();
    let mut controller = build(&log, Box::new(MemoryStore::new()));
    controller.run().unwrap();
    let before = controller.dump().unwrap();
    let storage = controller.shutdown();

    let restarted = build(&Log::default(), storage);
    assert!(!restarted.is_fresh());
    assert_eq!(restarted.dump().unwrap(), before);
}
