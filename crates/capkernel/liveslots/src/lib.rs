//! LiveSlots: the vat-side runtime that lets ordinary Rust closures act as
//! remotely invocable objects.
//!
//! Vat code works with [`Value`]s, [`Far`] objects and local promises. This
//! crate translates between those and the slot-based syscall surface the
//! kernel understands, allocating `o+N`/`p+N` identifiers on export and
//! subscribing to imported promises on first sight.

pub mod context;
pub mod far;
mod liveslots;
pub mod lockdown;
mod marshal;
pub mod value;
mod vat;

use std::sync::Arc;

use capkernel_types::{SharedVatSetup, VatDispatch, VatParams};

pub use context::VatContext;
pub use far::{Far, Method};
pub use liveslots::LiveSlots;
pub use lockdown::{is_locked_down, lockdown};
pub use value::{ObjectRef, PromiseRef, Value};

/// Wrap a root-object builder as a vat setup the kernel can call at genesis
/// and on every restart.
pub fn liveslots_vat<F>(build: F) -> SharedVatSetup
where
    F: Fn(&mut VatContext<'_>) -> Far + Send + Sync + 'static,
{
    lockdown();
    Arc::new(move |params: &VatParams| -> Box<dyn VatDispatch> {
        Box::new(LiveSlots::new(params, &build))
    })
}
