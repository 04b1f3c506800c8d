//! Messages, syscalls (vat → kernel) and deliveries (kernel → vat).

use serde::{Deserialize, Serialize};

use crate::capdata::CapData;
use crate::slots::{KernelSlot, VatSlot};

/// An eventual send: a method name, its arguments and an optional result
/// promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<S> {
    pub method: String,
    pub args: CapData<S>,
    pub result: Option<S>,
}

impl<S> Message<S> {
    pub fn new(method: impl Into<String>, args: CapData<S>, result: Option<S>) -> Self {
        Self {
            method: method.into(),
            args,
            result,
        }
    }
}

pub type KernelMessage = Message<KernelSlot>;

/// A single action a vat asks the kernel to perform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: VatSlot,
        method: String,
        args: CapData<VatSlot>,
        result: Option<VatSlot>,
    },
    Subscribe {
        promise: VatSlot,
    },
    FulfillToPresence {
        promise: VatSlot,
        target: VatSlot,
    },
    FulfillToData {
        promise: VatSlot,
        data: CapData<VatSlot>,
    },
    Reject {
        promise: VatSlot,
        data: CapData<VatSlot>,
    },
    /// Append a line to the kernel log.
    Log {
        line: String,
    },
}

impl VatSyscall {
    pub fn name(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::FulfillToPresence { .. } => "fulfillToPresence",
            VatSyscall::FulfillToData { .. } => "fulfillToData",
            VatSyscall::Reject { .. } => "reject",
            VatSyscall::Log { .. } => "log",
        }
    }
}

/// A single thing the kernel hands to a vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    Deliver {
        target: VatSlot,
        msg: Message<VatSlot>,
    },
    NotifyFulfillToPresence {
        promise: VatSlot,
        target: VatSlot,
    },
    NotifyFulfillToData {
        promise: VatSlot,
        data: CapData<VatSlot>,
    },
    NotifyReject {
        promise: VatSlot,
        data: CapData<VatSlot>,
    },
}

impl VatDelivery {
    pub fn name(&self) -> &'static str {
        match self {
            VatDelivery::Deliver { .. } => "deliver",
            VatDelivery::NotifyFulfillToPresence { .. } => "notifyFulfillToPresence",
            VatDelivery::NotifyFulfillToData { .. } => "notifyFulfillToData",
            VatDelivery::NotifyReject { .. } => "notifyReject",
        }
    }
}
