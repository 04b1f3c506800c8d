//! Process-wide setup that must happen once, before any vat runs.

use std::any::Any;
use std::cell::Cell;
use std::panic;
use std::sync::Once;

use tracing::{debug, warn};

static LOCKDOWN: Once = Once::new();

thread_local! {
    static IN_VAT: Cell<bool> = const { Cell::new(false) };
}

/// Install the panic hook that keeps vat panics off stderr and reports them
/// through `tracing` instead. Panics outside vat code still reach the
/// previous hook. Safe to call any number of times.
pub fn lockdown() {
    LOCKDOWN.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_VAT.with(Cell::get) {
                warn!(panic = %info, "Panic in vat code");
            } else {
                previous(info);
            }
        }));
        debug!("Lockdown complete");
    });
}

pub fn is_locked_down() -> bool {
    LOCKDOWN.is_completed()
}

/// Marks the current thread as running vat code until dropped.
pub(crate) struct InVat {
    previous: bool,
}

impl InVat {
    pub(crate) fn enter() -> Self {
        Self {
            previous: IN_VAT.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for InVat {
    fn drop(&mut self) {
        IN_VAT.with(|flag| flag.set(self.previous));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
