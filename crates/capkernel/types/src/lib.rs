//! Shared vocabulary for the capkernel workspace: identifiers, kernel and
//! vat slots, capdata, messages, and the syscall/delivery surface between
//! the kernel and vat dispatchers.

pub mod capdata;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod message;
pub mod slots;

pub use capdata::{slot_ref, walk_slot_refs, CapData, QCLASS};
pub use dispatch::{DeliveryOutcome, SharedVatSetup, VatDispatch, VatOptions, VatParams, VatSetup};
pub use error::{CapDataError, DispatchError, SlotParseError};
pub use ids::{DeviceId, VatId};
pub use message::{KernelMessage, Message, VatDelivery, VatSyscall};
pub use slots::{KernelSlot, SlotKind, VatSlot};
