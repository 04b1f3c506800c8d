use thiserror::Error;

use crate::slots::VatSlot;

/// Errors from parsing slot and ID strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotParseError {
    #[error("malformed slot or id: {0:?}")]
    Malformed(String),

    #[error("unknown slot kind in {0:?}")]
    UnknownKind(String),

    #[error("vats cannot allocate device slots: {0:?}")]
    VatAllocatedDevice(String),
}

/// Errors from validating or walking a capdata body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapDataError {
    #[error("capdata body is not valid JSON: {0}")]
    InvalidBody(String),

    #[error("slot reference index {index} out of range (only {len} slots)")]
    SlotIndexOutOfRange { index: u64, len: usize },

    #[error("malformed @qclass entry: {0}")]
    MalformedQClass(String),

    #[error("unsupported value in capdata body: {0}")]
    Unsupported(String),
}

/// Errors a vat dispatcher reports back to the kernel.
///
/// These are faults of the dispatcher itself (it was handed something it
/// cannot interpret, or it exceeded its budget). Faults of vat *code* never
/// surface here; the dispatcher converts them into rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown vat slot {0}")]
    UnknownSlot(VatSlot),

    #[error("slot {0} cannot be the target of a delivery")]
    BadTarget(VatSlot),

    #[error("malformed capdata: {0}")]
    MalformedCapData(#[from] CapDataError),

    #[error("microtask budget of {budget} exhausted")]
    MeterExhausted { budget: u64 },

    #[error("dispatcher failure: {0}")]
    Internal(String),
}
