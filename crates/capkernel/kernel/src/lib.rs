//! The capkernel kernel: vat and device registry, per-vat CLists, the
//! promise table, the run-queue, and crank-atomic execution over a
//! [`HostStorage`](capkernel_store::HostStorage).
//!
//! Every crank pops one run-queue entry, delivers it, applies the syscalls
//! it produced, and commits the lot. A syscall that breaks the protocol is
//! refused on its own; the rest of the delivery stands, so a vat's slot
//! table and its CList never disagree. A crank that faults before anything
//! was delivered is rolled back. Either way the message's result promise is
//! rejected unless a healthy vat still decides it. On restart each vat is
//! rebuilt by replaying its transcript.

pub mod clist;
pub mod config;
pub mod device;
pub mod dump;
pub mod error;
pub mod keeper;
pub mod kernel;
pub mod promise;
pub mod transcript;

pub use clist::ClistEntry;
pub use config::KernelConfig;
pub use device::{Device, DeviceIo, DeviceOutcome};
pub use dump::{DeviceDump, KernelDump, ObjectDump, PromiseDump, VatDump};
pub use error::{KernelError, ProtocolViolation};
pub use keeper::{KernelKeeper, RunQueueEntry};
pub use kernel::{Bootstrap, CrankFault, Kernel};
pub use promise::{Decider, KernelPromise, PromiseState, Resolution};
pub use transcript::TranscriptEntry;
