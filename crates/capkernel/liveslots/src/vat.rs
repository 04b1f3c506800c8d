//! The vat heap: object and promise arenas, vpid tables, the syscall buffer
//! and the microtask queue.
//!
//! Every cross-vat reference is a [`VatSlot`] looked up in these tables;
//! vat code only ever holds [`ObjectRef`]/[`PromiseRef`] indices.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use capkernel_types::{CapData, DispatchError, SlotKind, VatId, VatOptions, VatSlot, VatSyscall};

use crate::context::VatContext;
use crate::far::Far;
use crate::lockdown::{panic_message, InVat};
use crate::marshal;
use crate::value::{ObjectRef, PromiseRef, Value};

/// `o+0` is the root; fresh exports start after it.
const FIRST_OBJECT_EXPORT: u64 = 1;
const FIRST_PROMISE_EXPORT: u64 = 5;

pub(crate) type Outcome = Result<Value, Value>;
pub(crate) type Reaction = Box<dyn FnOnce(&mut VatContext<'_>, Outcome) -> Outcome>;

enum ObjectEntry {
    Local(Far),
    Imported(VatSlot),
}

/// Who settles a local promise: vat code, or the kernel via a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Decider {
    Local,
    Remote,
}

enum PromiseState {
    Pending,
    Following(PromiseRef),
    Settled(Outcome),
}

struct QueuedSend {
    method: String,
    args: Vec<Value>,
    result: PromiseRef,
}

struct LocalPromise {
    state: PromiseState,
    decider: Decider,
    vpid: Option<VatSlot>,
    // The kernel promise vat code's sends go to, once this promise has
    // arrived from the kernel as data.
    kernel_target: Option<VatSlot>,
    queued: Vec<QueuedSend>,
    reactions: Vec<(Reaction, PromiseRef)>,
    followers: Vec<PromiseRef>,
}

enum Microtask {
    Invoke {
        target: ObjectRef,
        method: String,
        args: Vec<Value>,
        result: PromiseRef,
    },
    React {
        reaction: Reaction,
        outcome: Outcome,
        result: PromiseRef,
    },
    EmitResolution(PromiseRef),
}

pub(crate) struct VatState {
    pub(crate) vat_id: VatId,
    pub(crate) name: String,
    options: VatOptions,
    objects: Vec<ObjectEntry>,
    object_slots: BTreeMap<ObjectRef, VatSlot>,
    slot_objects: BTreeMap<VatSlot, ObjectRef>,
    promises: Vec<LocalPromise>,
    slot_promises: BTreeMap<VatSlot, PromiseRef>,
    next_object_export: u64,
    next_promise_export: u64,
    syscalls: Vec<VatSyscall>,
    microtasks: VecDeque<Microtask>,
}

fn not_callable(method: &str, target: &Value) -> Value {
    Value::type_error(format!("cannot send {method:?} to {target}: not callable"))
}

impl VatState {
    pub(crate) fn new(vat_id: VatId, name: String, options: VatOptions) -> Self {
        Self {
            vat_id,
            name,
            options,
            objects: Vec::new(),
            object_slots: BTreeMap::new(),
            slot_objects: BTreeMap::new(),
            promises: Vec::new(),
            slot_promises: BTreeMap::new(),
            next_object_export: FIRST_OBJECT_EXPORT,
            next_promise_export: FIRST_PROMISE_EXPORT,
            syscalls: Vec::new(),
            microtasks: VecDeque::new(),
        }
    }

    pub(crate) fn take_syscalls(&mut self) -> Vec<VatSyscall> {
        std::mem::take(&mut self.syscalls)
    }

    // ---- objects ----

    pub(crate) fn add_object(&mut self, far: Far) -> ObjectRef {
        self.objects.push(ObjectEntry::Local(far));
        ObjectRef(self.objects.len() - 1)
    }

    pub(crate) fn set_root(&mut self, root: ObjectRef) {
        self.bind_object(root, VatSlot::root());
    }

    fn bind_object(&mut self, object: ObjectRef, slot: VatSlot) {
        self.object_slots.insert(object, slot);
        self.slot_objects.insert(slot, object);
    }

    /// The slot an object travels as, allocating `o+N` on first export.
    pub(crate) fn export_object(&mut self, object: ObjectRef) -> VatSlot {
        if let Some(slot) = self.object_slots.get(&object) {
            return *slot;
        }
        let slot = match &self.objects[object.0] {
            ObjectEntry::Imported(slot) => *slot,
            ObjectEntry::Local(_) => {
                let slot = VatSlot::exported(SlotKind::Object, self.next_object_export);
                self.next_object_export += 1;
                slot
            }
        };
        self.bind_object(object, slot);
        slot
    }

    /// A local object the kernel may deliver to.
    pub(crate) fn exported_object(&self, slot: VatSlot) -> Option<ObjectRef> {
        self.slot_objects
            .get(&slot)
            .copied()
            .filter(|o| matches!(self.objects[o.0], ObjectEntry::Local(_)))
    }

    /// Turn an inbound slot into a value, creating presences and imported
    /// promises on first sight.
    pub(crate) fn import_slot(&mut self, slot: VatSlot) -> Result<Value, DispatchError> {
        if slot.kind == SlotKind::Promise {
            return Ok(Value::Promise(self.import_promise(slot)));
        }
        if let Some(object) = self.slot_objects.get(&slot) {
            return Ok(Value::Object(*object));
        }
        if slot.allocated_by_vat {
            return Err(DispatchError::UnknownSlot(slot));
        }
        self.objects.push(ObjectEntry::Imported(slot));
        let object = ObjectRef(self.objects.len() - 1);
        self.bind_object(object, slot);
        Ok(Value::Object(object))
    }

    // ---- promises ----

    pub(crate) fn new_promise(&mut self, decider: Decider) -> PromiseRef {
        self.promises.push(LocalPromise {
            state: PromiseState::Pending,
            decider,
            vpid: None,
            kernel_target: None,
            queued: Vec::new(),
            reactions: Vec::new(),
            followers: Vec::new(),
        });
        PromiseRef(self.promises.len() - 1)
    }

    fn bind_vpid(&mut self, promise: PromiseRef, slot: VatSlot) {
        self.promises[promise.0].vpid = Some(slot);
        self.slot_promises.insert(slot, promise);
    }

    fn retire_vpid(&mut self, promise: PromiseRef) {
        if let Some(slot) = self.promises[promise.0].vpid.take() {
            self.slot_promises.remove(&slot);
            debug!(vat = %self.vat_id, vpid = %slot, "Retired vpid");
        }
    }

    fn allocate_promise_slot(&mut self) -> VatSlot {
        let slot = VatSlot::exported(SlotKind::Promise, self.next_promise_export);
        self.next_promise_export += 1;
        slot
    }

    pub(crate) fn promise_for_slot(&self, slot: VatSlot) -> Option<PromiseRef> {
        self.slot_promises.get(&slot).copied()
    }

    /// A promise arriving as data. New ones are decided elsewhere, so the
    /// vat subscribes to hear about their resolution. A kernel promise
    /// this vat already holds as a delivery result is subscribed to on its
    /// first arrival as data too.
    fn import_promise(&mut self, slot: VatSlot) -> PromiseRef {
        let from_kernel = !slot.allocated_by_vat;
        if let Some(promise) = self.promise_for_slot(slot) {
            let record = &mut self.promises[promise.0];
            if from_kernel && record.kernel_target.is_none() {
                record.kernel_target = Some(slot);
                self.syscalls.push(VatSyscall::Subscribe { promise: slot });
            }
            return promise;
        }
        let promise = self.new_promise(Decider::Remote);
        self.bind_vpid(promise, slot);
        if from_kernel {
            self.promises[promise.0].kernel_target = Some(slot);
        }
        self.syscalls.push(VatSyscall::Subscribe { promise: slot });
        promise
    }

    /// The result slot of an inbound delivery: this vat now decides it.
    pub(crate) fn accept_result(&mut self, slot: VatSlot) -> PromiseRef {
        match self.promise_for_slot(slot) {
            Some(promise) => {
                self.promises[promise.0].decider = Decider::Local;
                promise
            }
            None => {
                let promise = self.new_promise(Decider::Local);
                self.bind_vpid(promise, slot);
                promise
            }
        }
    }

    /// The slot a promise travels as. A promise that is already settled
    /// gets a fresh vpid and its resolution follows in a microtask.
    pub(crate) fn promise_slot(&mut self, promise: PromiseRef) -> VatSlot {
        if let Some(vpid) = self.promises[promise.0].vpid {
            return vpid;
        }
        let slot = self.allocate_promise_slot();
        self.bind_vpid(promise, slot);
        self.promises[promise.0].decider = Decider::Local;
        if matches!(self.promises[promise.0].state, PromiseState::Settled(_)) {
            self.microtasks.push_back(Microtask::EmitResolution(promise));
        }
        slot
    }

    pub(crate) fn decides(&self, promise: PromiseRef) -> bool {
        self.promises[promise.0].decider == Decider::Local
    }

    fn chase(&self, mut promise: PromiseRef) -> PromiseRef {
        while let PromiseState::Following(next) = self.promises[promise.0].state {
            promise = next;
        }
        promise
    }

    pub(crate) fn settlement(&self, promise: PromiseRef) -> Option<&Outcome> {
        match &self.promises[self.chase(promise).0].state {
            PromiseState::Settled(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Resolve with a value. Resolving with another promise makes this one
    /// follow it. Already resolved promises are left alone.
    pub(crate) fn resolve(&mut self, promise: PromiseRef, value: Value) {
        if !matches!(self.promises[promise.0].state, PromiseState::Pending) {
            return;
        }
        let Value::Promise(target) = value else {
            return self.settle(promise, Ok(value));
        };
        let target = self.chase(target);
        if target == promise {
            return self.settle(
                promise,
                Err(Value::type_error("a promise cannot resolve to itself")),
            );
        }
        match &self.promises[target.0].state {
            PromiseState::Settled(outcome) => {
                let outcome = outcome.clone();
                self.settle(promise, outcome);
            }
            _ => {
                self.promises[promise.0].state = PromiseState::Following(target);
                self.promises[target.0].followers.push(promise);
            }
        }
    }

    pub(crate) fn reject(&mut self, promise: PromiseRef, reason: Value) {
        if matches!(self.promises[promise.0].state, PromiseState::Pending) {
            self.settle(promise, Err(reason));
        }
    }

    fn settle_with(&mut self, promise: PromiseRef, outcome: Outcome) {
        match outcome {
            Ok(value) => self.resolve(promise, value),
            Err(reason) => self.reject(promise, reason),
        }
    }

    fn rejected(&mut self, reason: Value) -> PromiseRef {
        let promise = self.new_promise(Decider::Local);
        self.settle(promise, Err(reason));
        promise
    }

    /// The single state transition. A promise this vat decides reports its
    /// resolution to the kernel right away; one the kernel decided just
    /// drops its vpid. Followers settle synchronously, reactions run as
    /// microtasks.
    fn settle(&mut self, promise: PromiseRef, outcome: Outcome) {
        let record = &mut self.promises[promise.0];
        if matches!(record.state, PromiseState::Settled(_)) {
            return;
        }
        record.state = PromiseState::Settled(outcome.clone());
        let queued = std::mem::take(&mut record.queued);
        let reactions = std::mem::take(&mut record.reactions);
        let followers = std::mem::take(&mut record.followers);
        let (decider, has_vpid) = (record.decider, record.vpid.is_some());

        if decider == Decider::Remote {
            self.promises[promise.0].kernel_target = None;
        }
        if has_vpid {
            match decider {
                Decider::Local => self.emit_resolution(promise),
                Decider::Remote => self.retire_vpid(promise),
            }
        }
        for follower in followers {
            self.settle(follower, outcome.clone());
        }
        for send in queued {
            let forwarded = match &outcome {
                Ok(value) => self.send(value, send.method, send.args),
                Err(reason) => self.rejected(reason.clone()),
            };
            self.resolve(send.result, Value::Promise(forwarded));
        }
        for (reaction, result) in reactions {
            self.microtasks.push_back(Microtask::React {
                reaction,
                outcome: outcome.clone(),
                result,
            });
        }
    }

    fn emit_resolution(&mut self, promise: PromiseRef) {
        let Some(vpid) = self.promises[promise.0].vpid else {
            return;
        };
        let PromiseState::Settled(outcome) = &self.promises[promise.0].state else {
            return;
        };
        let syscall = match outcome.clone() {
            Ok(Value::Object(object)) => VatSyscall::FulfillToPresence {
                promise: vpid,
                target: self.export_object(object),
            },
            Ok(value) => match marshal::serialize(self, &value) {
                Ok(data) => VatSyscall::FulfillToData { promise: vpid, data },
                Err(e) => VatSyscall::Reject {
                    promise: vpid,
                    data: CapData::error("TypeError", e.to_string()),
                },
            },
            Err(reason) => VatSyscall::Reject {
                promise: vpid,
                data: marshal::serialize(self, &reason)
                    .unwrap_or_else(|e| CapData::error("TypeError", e.to_string())),
            },
        };
        self.syscalls.push(syscall);
        self.retire_vpid(promise);
    }

    pub(crate) fn when(&mut self, value: Value, reaction: Reaction) -> PromiseRef {
        let result = self.new_promise(Decider::Local);
        match value {
            Value::Promise(promise) => match &self.promises[promise.0].state {
                PromiseState::Settled(outcome) => {
                    let outcome = outcome.clone();
                    self.microtasks.push_back(Microtask::React {
                        reaction,
                        outcome,
                        result,
                    });
                }
                _ => self.promises[promise.0].reactions.push((reaction, result)),
            },
            value => self.microtasks.push_back(Microtask::React {
                reaction,
                outcome: Ok(value),
                result,
            }),
        }
        result
    }

    // ---- sends ----

    /// Eventual send from vat code. A promise that came from the kernel is
    /// addressed through the kernel for as long as it has a kernel target,
    /// even when this vat decides it.
    pub(crate) fn send(&mut self, target: &Value, method: String, args: Vec<Value>) -> PromiseRef {
        if let Value::Promise(promise) = target {
            if let Some(slot) = self.promises[promise.0].kernel_target {
                return self.send_syscall(slot, method, args);
            }
        }
        self.forward(target, method, args)
    }

    /// Local objects are invoked in a microtask, remote ones become a
    /// `send` syscall, and promises are chased to wherever the message can
    /// go. Messages the kernel pipelined to a promise enter here, never
    /// bouncing back through the kernel.
    pub(crate) fn forward(&mut self, target: &Value, method: String, args: Vec<Value>) -> PromiseRef {
        match target {
            Value::Object(object) => match &self.objects[object.0] {
                ObjectEntry::Imported(slot) => {
                    let slot = *slot;
                    self.send_syscall(slot, method, args)
                }
                ObjectEntry::Local(_) => {
                    let result = self.new_promise(Decider::Local);
                    self.push_invoke(*object, method, args, result);
                    result
                }
            },
            Value::Promise(promise) => {
                let promise = self.chase(*promise);
                let record = &self.promises[promise.0];
                match &record.state {
                    PromiseState::Settled(Ok(value)) => {
                        let value = value.clone();
                        self.forward(&value, method, args)
                    }
                    PromiseState::Settled(Err(reason)) => {
                        let reason = reason.clone();
                        self.rejected(reason)
                    }
                    _ => match (record.decider, record.vpid) {
                        (Decider::Remote, Some(vpid)) => self.send_syscall(vpid, method, args),
                        _ => {
                            let result = self.new_promise(Decider::Local);
                            self.promises[promise.0].queued.push(QueuedSend {
                                method,
                                args,
                                result,
                            });
                            result
                        }
                    },
                }
            }
            other => {
                let reason = not_callable(&method, other);
                self.rejected(reason)
            }
        }
    }

    /// Arguments are serialized before the result vpid is allocated.
    fn send_syscall(&mut self, target: VatSlot, method: String, args: Vec<Value>) -> PromiseRef {
        let args = match marshal::serialize_args(self, &args) {
            Ok(args) => args,
            Err(e) => return self.rejected(Value::type_error(e.to_string())),
        };
        let slot = self.allocate_promise_slot();
        let result = self.new_promise(Decider::Remote);
        self.bind_vpid(result, slot);
        self.syscalls.push(VatSyscall::Send {
            target,
            method,
            args,
            result: Some(slot),
        });
        self.syscalls.push(VatSyscall::Subscribe { promise: slot });
        result
    }

    pub(crate) fn log(&mut self, line: String) {
        self.syscalls.push(VatSyscall::Log { line });
    }

    // ---- microtasks ----

    pub(crate) fn push_invoke(&mut self, target: ObjectRef, method: String, args: Vec<Value>, result: PromiseRef) {
        self.microtasks.push_back(Microtask::Invoke {
            target,
            method,
            args,
            result,
        });
    }

    /// Run microtasks until the queue is empty or the budget is spent.
    pub(crate) fn drain(&mut self) -> Result<(), DispatchError> {
        let budget = self.options.microtask_budget;
        let mut ran = 0u64;
        while let Some(task) = self.microtasks.pop_front() {
            ran += 1;
            if let Some(budget) = budget {
                if ran > budget {
                    self.microtasks.clear();
                    warn!(vat = %self.vat_id, budget, "Microtask budget exhausted");
                    return Err(DispatchError::MeterExhausted { budget });
                }
            }
            match task {
                Microtask::Invoke {
                    target,
                    method,
                    args,
                    result,
                } => self.invoke(target, &method, args, result),
                Microtask::React {
                    reaction,
                    outcome,
                    result,
                } => {
                    let outcome = self.run_vat_code(|ctx| reaction(ctx, outcome));
                    self.settle_with(result, outcome);
                }
                Microtask::EmitResolution(promise) => self.emit_resolution(promise),
            }
        }
        Ok(())
    }

    fn invoke(&mut self, target: ObjectRef, method: &str, args: Vec<Value>, result: PromiseRef) {
        let far = match &self.objects[target.0] {
            ObjectEntry::Local(far) => far,
            ObjectEntry::Imported(slot) => {
                let slot = *slot;
                let forwarded = self.send_syscall(slot, method.to_string(), args);
                return self.resolve(result, Value::Promise(forwarded));
            }
        };
        let Some(handler) = far.lookup(method) else {
            let reason = Value::type_error(format!(
                "{} has no such method {method:?}",
                far.interface()
            ));
            return self.reject(result, reason);
        };
        let outcome = self.run_vat_code(|ctx| handler(ctx, args));
        self.settle_with(result, outcome);
    }

    /// Call into vat code, turning a panic into a rejection.
    fn run_vat_code<F>(&mut self, f: F) -> Outcome
    where
        F: FnOnce(&mut VatContext<'_>) -> Outcome,
    {
        let caught = {
            let _guard = InVat::enter();
            let mut ctx = VatContext::new(self);
            panic::catch_unwind(AssertUnwindSafe(|| f(&mut ctx)))
        };
        caught.unwrap_or_else(|payload| {
            let message = panic_message(&*payload);
            warn!(vat = %self.vat_id, name = %self.name, panic = %message, "Vat code panicked");
            Err(Value::error("Error", format!("vat code panicked: {message}")))
        })
    }
}
