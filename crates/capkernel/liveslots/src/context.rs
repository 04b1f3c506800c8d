use tracing::debug;

use capkernel_types::VatId;

use crate::far::Far;
use crate::value::{PromiseRef, Value};
use crate::vat::{Decider, VatState};

/// What vat code can do. Handed to every method handler and reaction.
pub struct VatContext<'a> {
    state: &'a mut VatState,
}

impl<'a> VatContext<'a> {
    pub(crate) fn new(state: &'a mut VatState) -> Self {
        Self { state }
    }
}

impl VatContext<'_> {
    pub fn vat_name(&self) -> &str {
        &self.state.name
    }

    pub fn vat_id(&self) -> VatId {
        self.state.vat_id
    }

    /// Make an object invocable by other vats once it is passed to them.
    pub fn export(&mut self, far: Far) -> Value {
        Value::Object(self.state.add_object(far))
    }

    /// A promise this vat resolves itself.
    pub fn make_promise(&mut self) -> PromiseRef {
        self.state.new_promise(Decider::Local)
    }

    /// Fulfill a promise made here. Ignored for promises decided
    /// elsewhere and for promises already resolved.
    pub fn resolve(&mut self, promise: PromiseRef, value: impl Into<Value>) {
        if self.state.decides(promise) {
            self.state.resolve(promise, value.into());
        } else {
            debug!(vat = %self.state.vat_id, "Ignoring resolve of a promise decided elsewhere");
        }
    }

    pub fn reject(&mut self, promise: PromiseRef, reason: impl Into<Value>) {
        if self.state.decides(promise) {
            self.state.reject(promise, reason.into());
        } else {
            debug!(vat = %self.state.vat_id, "Ignoring reject of a promise decided elsewhere");
        }
    }

    /// Eventual send. Returns a promise for the result right away.
    pub fn send(&mut self, target: &Value, method: &str, args: Vec<Value>) -> Value {
        Value::Promise(self.state.send(target, method.to_string(), args))
    }

    /// Run `reaction` once `value` settles (immediately, in a microtask, for
    /// non-promises). Returns a promise for the reaction's outcome.
    pub fn when<F>(&mut self, value: Value, reaction: F) -> Value
    where
        F: FnOnce(&mut VatContext<'_>, Result<Value, Value>) -> Result<Value, Value> + 'static,
    {
        Value::Promise(self.state.when(value, Box::new(reaction)))
    }

    /// Append a line to the kernel log.
    pub fn log(&mut self, line: impl Into<String>) {
        self.state.log(line.into());
    }

    /// The settlement of a promise, if it has one yet.
    pub fn settlement(&self, promise: PromiseRef) -> Option<Result<Value, Value>> {
        self.state.settlement(promise).cloned()
    }
}
