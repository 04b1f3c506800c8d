use tracing::debug;

use capkernel_types::{
    CapDataError, DeliveryOutcome, DispatchError, Message, SlotKind, VatDelivery, VatDispatch,
    VatParams, VatSlot,
};

use crate::context::VatContext;
use crate::far::Far;
use crate::lockdown::lockdown;
use crate::marshal;
use crate::value::{ObjectRef, PromiseRef, Value};
use crate::vat::{Decider, VatState};

enum Receiver {
    Object(ObjectRef),
    Promise(PromiseRef),
}

/// Adapts a vat built from [`Far`] objects to the kernel's delivery
/// surface. Each delivery runs to quiescence and returns its syscalls in
/// emission order.
pub struct LiveSlots {
    state: VatState,
}

impl LiveSlots {
    /// Build a vat. `build` returns the root object, which is exported as
    /// `o+0`.
    pub fn new<B>(params: &VatParams, build: B) -> Self
    where
        B: FnOnce(&mut VatContext<'_>) -> Far,
    {
        lockdown();
        let mut state = VatState::new(params.vat_id, params.name.clone(), params.options.clone());
        let root = build(&mut VatContext::new(&mut state));
        debug!(vat = %params.vat_id, name = %params.name, root = root.interface(), "Vat built");
        let root = state.add_object(root);
        state.set_root(root);
        Self { state }
    }

    fn deliver(&mut self, target: VatSlot, msg: &Message<VatSlot>) -> Result<(), DispatchError> {
        let state = &mut self.state;
        let receiver = match target.kind {
            SlotKind::Object if target.allocated_by_vat => Receiver::Object(
                state
                    .exported_object(target)
                    .ok_or(DispatchError::UnknownSlot(target))?,
            ),
            SlotKind::Promise => Receiver::Promise(
                state
                    .promise_for_slot(target)
                    .ok_or(DispatchError::UnknownSlot(target))?,
            ),
            _ => return Err(DispatchError::BadTarget(target)),
        };

        let args = match marshal::unserialize(state, &msg.args)? {
            Value::List(items) => items,
            other => {
                return Err(CapDataError::Unsupported(format!(
                    "arguments must be a list, got {other}"
                ))
                .into())
            }
        };
        let result = match msg.result {
            Some(slot) => state.accept_result(slot),
            None => state.new_promise(Decider::Local),
        };

        match receiver {
            Receiver::Object(object) => {
                state.push_invoke(object, msg.method.clone(), args, result);
            }
            Receiver::Promise(promise) => {
                let forwarded = state.forward(&Value::Promise(promise), msg.method.clone(), args);
                state.resolve(result, Value::Promise(forwarded));
            }
        }
        Ok(())
    }

    fn notify(&mut self, promise: VatSlot, outcome: Result<Value, Value>) -> Result<(), DispatchError> {
        let local = self
            .state
            .promise_for_slot(promise)
            .ok_or(DispatchError::UnknownSlot(promise))?;
        if self.state.decides(local) {
            return Err(DispatchError::Internal(format!(
                "notified about {promise}, which this vat decides"
            )));
        }
        match outcome {
            Ok(value) => self.state.resolve(local, value),
            Err(reason) => self.state.reject(local, reason),
        }
        Ok(())
    }

    fn handle(&mut self, delivery: &VatDelivery) -> Result<(), DispatchError> {
        match delivery {
            VatDelivery::Deliver { target, msg } => self.deliver(*target, msg)?,
            VatDelivery::NotifyFulfillToPresence { promise, target } => {
                let presence = self.state.import_slot(*target)?;
                self.notify(*promise, Ok(presence))?;
            }
            VatDelivery::NotifyFulfillToData { promise, data } => {
                let value = marshal::unserialize(&mut self.state, data)?;
                self.notify(*promise, Ok(value))?;
            }
            VatDelivery::NotifyReject { promise, data } => {
                let reason = marshal::unserialize(&mut self.state, data)?;
                self.notify(*promise, Err(reason))?;
            }
        }
        self.state.drain()
    }
}

impl VatDispatch for LiveSlots {
    fn dispatch(&mut self, delivery: &VatDelivery) -> DeliveryOutcome {
        let handled = self.handle(delivery);
        let syscalls = self.state.take_syscalls();
        debug!(
            vat = %self.state.vat_id,
            delivery = delivery.name(),
            syscalls = syscalls.len(),
            ok = handled.is_ok(),
            "Delivery complete"
        );
        DeliveryOutcome {
            syscalls,
            error: handled.err(),
        }
    }
}
