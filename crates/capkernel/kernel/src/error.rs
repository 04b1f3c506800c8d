use thiserror::Error;

use capkernel_store::StoreError;
use capkernel_types::{CapDataError, DispatchError, KernelSlot, SlotKind, VatId, VatSlot};

/// A vat (or device) broke the kernel protocol. The offending syscall is
/// refused and the kernel keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("promise {kpid} is already resolved")]
    DoubleResolution { kpid: KernelSlot },

    #[error("{caller} is not the decider of {kpid}")]
    NotDecider { kpid: KernelSlot, caller: String },

    #[error("decision rights for {kpid} were already transferred")]
    DeciderAlreadyTransferred { kpid: KernelSlot },

    #[error("kind mismatch: {slot} is mapped to {mapped} (expected a {expected})")]
    KindMismatch {
        slot: String,
        mapped: String,
        expected: SlotKind,
    },

    #[error("{vat} has no mapping for {slot}")]
    UnknownVatSlot { vat: VatId, slot: VatSlot },

    #[error("{vat} cannot export {slot}")]
    IllegalExport { vat: VatId, slot: VatSlot },

    #[error("malformed capdata: {0}")]
    MalformedCapData(#[from] CapDataError),

    #[error("{0} is not a promise")]
    NotAPromise(String),

    #[error("{kpid} cannot be fulfilled to {target}: presences must be objects or devices")]
    InvalidPresence { kpid: KernelSlot, target: KernelSlot },
}

/// Errors from kernel operations.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("dispatch to {vat} failed: {source}")]
    Dispatch {
        vat: VatId,
        #[source]
        source: DispatchError,
    },

    #[error("refused {} syscall(s) from {owner}: {}", .reasons.len(), .reasons.join("; "))]
    Refused { owner: String, reasons: Vec<String> },

    #[error("storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("replay of {vat} diverged at transcript entry {index}: {detail}")]
    ReplayDivergence {
        vat: VatId,
        index: u64,
        detail: String,
    },

    #[error("unknown vat: {0}")]
    UnknownVat(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("duplicate vat or device name: {0}")]
    DuplicateName(String),

    #[error("kernel already started")]
    AlreadyStarted,

    #[error("kernel not started")]
    NotStarted,

    #[error("corrupt kernel state: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KernelError {
    /// Whether this error aborts only the current crank rather than the
    /// whole kernel.
    pub fn is_crank_fault(&self) -> bool {
        matches!(
            self,
            KernelError::Protocol(_) | KernelError::Dispatch { .. } | KernelError::Refused { .. }
        )
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Serialization(e.to_string())
    }
}
