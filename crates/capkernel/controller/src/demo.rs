//! Demo vats shipped with the `capkernel` binary.
//!
//! The bootstrap vat wires the others together: it registers an inbound
//! handler with the bridge, drives the counter through a pipelined fork, and
//! reports the counter total outbound and to the kernel log.

use std::cell::Cell;
use std::rc::Rc;

use capkernel_liveslots::{liveslots_vat, Far, Value};
use capkernel_types::SharedVatSetup;

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or(Value::Undefined)
}

fn counter(start: i64) -> Far {
    let total = Rc::new(Cell::new(start));
    let (inc, read, fork) = (total.clone(), total.clone(), total);
    Far::new("Counter")
        .method("increment", move |_ctx, args| {
            let by = arg(&args, 0).as_i64().unwrap_or(1);
            inc.set(inc.get() + by);
            Ok(inc.get().into())
        })
        .method("read", move |_ctx, _args| Ok(read.get().into()))
        .method("fork", move |ctx, _args| Ok(ctx.export(counter(fork.get()))))
}

/// `demo-counter`: a counter whose `fork` hands out independent copies.
pub fn counter_vat() -> SharedVatSetup {
    liveslots_vat(|_ctx| counter(0))
}

/// `demo-echo`: returns its first argument.
pub fn echo_vat() -> SharedVatSetup {
    liveslots_vat(|_ctx| Far::new("Echo").method("echo", |_ctx, args| Ok(arg(&args, 0))))
}

fn inbound_handler(echo: Value, bridge: Value) -> Far {
    Far::new("InboundHandler").method("inbound", move |ctx, args| {
        let reply = ctx.send(&echo, "echo", vec![arg(&args, 0)]);
        let bridge = bridge.clone();
        Ok(ctx.when(reply, move |ctx, outcome| {
            let value = outcome?;
            ctx.send(&bridge, "outbound", vec![value.clone()]);
            Ok(value)
        }))
    })
}

/// `demo-bootstrap`: `bootstrap(argv, vats, devices)` expects `counter` and
/// `echo` vats and a `bridge` device; the result settles to the total.
pub fn bootstrap_vat() -> SharedVatSetup {
    liveslots_vat(|_ctx| {
        Far::new("Bootstrap").method("bootstrap", |ctx, args| {
            let vats = arg(&args, 1);
            let devices = arg(&args, 2);
            let (Some(counter), Some(echo), Some(bridge)) =
                (vats.get("counter"), vats.get("echo"), devices.get("bridge"))
            else {
                return Err(Value::type_error("bootstrap needs counter, echo and bridge"));
            };
            let (counter, echo, bridge) = (counter.clone(), echo.clone(), bridge.clone());

            let handler = ctx.export(inbound_handler(echo.clone(), bridge.clone()));
            ctx.send(&bridge, "register", vec![handler]);
            ctx.send(&echo, "echo", vec![arg(&args, 0)]);

            let fork = ctx.send(&counter, "fork", vec![]);
            ctx.send(&fork, "increment", vec![2.into()]);
            ctx.send(&counter, "increment", vec![1.into()]);
            let total = ctx.send(&counter, "read", vec![]);

            Ok(ctx.when(total, move |ctx, outcome| {
                let total = outcome?;
                if let Some(n) = total.as_i64() {
                    ctx.log(format!("counter total {n}"));
                }
                let mut report = std::collections::BTreeMap::new();
                report.insert("total".to_string(), total.clone());
                ctx.send(&bridge, "outbound", vec![Value::Record(report)]);
                Ok(total)
            }))
        })
    })
}
