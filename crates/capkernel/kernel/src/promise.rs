//! Kernel promise records and the resolution engine.
//!
//! A promise is resolved at most once, only by its decider. Decision
//! rights move exactly once: when a vat uses the promise as the result of
//! an outbound send, the kernel takes them, and hands them to whichever
//! vat the message is delivered to.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use capkernel_types::{CapData, KernelMessage, KernelSlot, SlotKind, VatId};

use crate::error::{KernelError, ProtocolViolation};
use crate::keeper::{KernelKeeper, RunQueueEntry};

/// Who may resolve a promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decider {
    Kernel,
    Vat(VatId),
}

impl fmt::Display for Decider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decider::Kernel => f.write_str("kernel"),
            Decider::Vat(vat) => write!(f, "{vat}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "camelCase")]
pub enum PromiseState {
    Unresolved,
    FulfilledToPresence(KernelSlot),
    FulfilledToData(CapData<KernelSlot>),
    Rejected(CapData<KernelSlot>),
}

impl PromiseState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PromiseState::Unresolved)
    }
}

/// How a promise gets settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    ToPresence(KernelSlot),
    ToData(CapData<KernelSlot>),
    Reject(CapData<KernelSlot>),
}

impl From<Resolution> for PromiseState {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::ToPresence(slot) => PromiseState::FulfilledToPresence(slot),
            Resolution::ToData(data) => PromiseState::FulfilledToData(data),
            Resolution::Reject(data) => PromiseState::Rejected(data),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPromise {
    pub state: PromiseState,
    pub decider: Decider,
    pub subscribers: BTreeSet<VatId>,
    /// Messages waiting for resolution (only while unresolved).
    pub queue: Vec<KernelMessage>,
    pub decider_transferred: bool,
}

impl KernelPromise {
    pub fn new(decider: Decider) -> Self {
        Self {
            state: PromiseState::Unresolved,
            decider,
            subscribers: BTreeSet::new(),
            queue: Vec::new(),
            decider_transferred: false,
        }
    }
}

/// The rejection a message gets when its target resolved to plain data.
pub fn not_callable(target: KernelSlot, method: &str) -> CapData<KernelSlot> {
    CapData::error(
        "TypeError",
        format!("cannot send {method:?} to {target}: it resolved to data, which is not callable"),
    )
}

impl KernelKeeper {
    fn expect_promise(&self, kpid: KernelSlot) -> Result<KernelPromise, KernelError> {
        if kpid.kind != SlotKind::Promise {
            return Err(ProtocolViolation::NotAPromise(kpid.to_string()).into());
        }
        self.promise(kpid)
    }

    /// Add `vat` to the subscribers. A vat subscribing to an already
    /// resolved promise is notified right away.
    pub fn subscribe(&mut self, vat: VatId, kpid: KernelSlot) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        if !promise.subscribers.insert(vat) {
            return Ok(());
        }
        if promise.state.is_resolved() {
            self.push_run_queue(RunQueueEntry::Notify { vat, kpid })?;
        }
        self.set_promise(kpid, &promise)
    }

    /// Settle a promise on behalf of `resolver`.
    ///
    /// Queued messages go back on the run-queue addressed to the promise,
    /// so they are retargeted or failed when processed. Every subscriber
    /// other than the resolver gets one notification.
    pub fn resolve(
        &mut self,
        resolver: Decider,
        kpid: KernelSlot,
        resolution: Resolution,
    ) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        if promise.state.is_resolved() {
            return Err(ProtocolViolation::DoubleResolution { kpid }.into());
        }
        if promise.decider != resolver {
            return Err(ProtocolViolation::NotDecider {
                kpid,
                caller: resolver.to_string(),
            }
            .into());
        }
        if let Resolution::ToPresence(target) = &resolution {
            if target.kind == SlotKind::Promise {
                return Err(ProtocolViolation::InvalidPresence {
                    kpid,
                    target: *target,
                }
                .into());
            }
        }

        for msg in std::mem::take(&mut promise.queue) {
            self.push_run_queue(RunQueueEntry::Send { target: kpid, msg })?;
        }
        for &vat in &promise.subscribers {
            if Decider::Vat(vat) != resolver {
                self.push_run_queue(RunQueueEntry::Notify { vat, kpid })?;
            }
        }
        promise.state = resolution.into();
        debug!(kpid = %kpid, by = %resolver, subscribers = promise.subscribers.len(), "Promise resolved");
        self.set_promise(kpid, &promise)
    }

    /// Take decision rights from `vat` because it named `kpid` as the result
    /// of a send.
    pub fn transfer_to_kernel(&mut self, vat: VatId, kpid: KernelSlot) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        if promise.state.is_resolved() {
            return Err(ProtocolViolation::DoubleResolution { kpid }.into());
        }
        if promise.decider != Decider::Vat(vat) {
            return Err(ProtocolViolation::NotDecider {
                kpid,
                caller: vat.to_string(),
            }
            .into());
        }
        if promise.decider_transferred {
            return Err(ProtocolViolation::DeciderAlreadyTransferred { kpid }.into());
        }
        promise.decider = Decider::Kernel;
        promise.decider_transferred = true;
        self.set_promise(kpid, &promise)
    }

    /// Reject a promise the kernel itself decides.
    pub fn reject_as_kernel(&mut self, kpid: KernelSlot, reason: CapData<KernelSlot>) -> Result<(), KernelError> {
        self.resolve(Decider::Kernel, kpid, Resolution::Reject(reason))
    }

    /// Hand a kernel-held result promise to the vat answering the message.
    pub fn assign_decider(&mut self, kpid: KernelSlot, vat: VatId) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        if promise.decider != Decider::Kernel || promise.state.is_resolved() {
            return Err(KernelError::Corrupt(format!(
                "result promise {kpid} is not held by the kernel"
            )));
        }
        promise.decider = Decider::Vat(vat);
        self.set_promise(kpid, &promise)
    }

    /// Take an unresolved result promise back from a vat whose delivery
    /// failed, so the kernel can reject it.
    pub fn reclaim_decider(&mut self, kpid: KernelSlot) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        if promise.state.is_resolved() {
            return Err(ProtocolViolation::DoubleResolution { kpid }.into());
        }
        promise.decider = Decider::Kernel;
        self.set_promise(kpid, &promise)
    }

    /// Park a message on an unresolved promise.
    pub fn queue_on_promise(&mut self, kpid: KernelSlot, msg: KernelMessage) -> Result<(), KernelError> {
        let mut promise = self.expect_promise(kpid)?;
        promise.queue.push(msg);
        self.set_promise(kpid, &promise)
    }

    /// A promise the kernel creates to stand for the result of a message it
    /// injects itself.
    pub fn add_result_promise(&mut self) -> Result<KernelSlot, KernelError> {
        let kpid = self.add_kernel_promise(Decider::Kernel)?;
        let mut promise = self.promise(kpid)?;
        promise.decider_transferred = true;
        self.set_promise(kpid, &promise)?;
        Ok(kpid)
    }
}
