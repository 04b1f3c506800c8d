//! The narrow contract between the kernel and whatever runs vat code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::ids::VatId;
use crate::message::{VatDelivery, VatSyscall};

/// Per-vat options supplied at registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VatOptions {
    /// Overrides the kernel-wide pipelining setting for messages to
    /// promises this vat decides.
    pub enable_pipelining: Option<bool>,
    /// Maximum number of microtasks one delivery may run.
    pub microtask_budget: Option<u64>,
}

/// What a vat is told about itself when it is built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VatParams {
    pub vat_id: VatId,
    pub name: String,
    pub options: VatOptions,
}

/// What a vat did with one delivery.
///
/// A dispatcher that fails part way still reports the syscalls it made
/// before failing: the vat's tables already assume them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub syscalls: Vec<VatSyscall>,
    pub error: Option<DispatchError>,
}

impl DeliveryOutcome {
    pub fn ok(syscalls: Vec<VatSyscall>) -> Self {
        Self {
            syscalls,
            error: None,
        }
    }

    pub fn failed(syscalls: Vec<VatSyscall>, error: DispatchError) -> Self {
        Self {
            syscalls,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The syscalls, or the error (dropping whatever came before it).
    pub fn into_result(self) -> Result<Vec<VatSyscall>, DispatchError> {
        match self.error {
            None => Ok(self.syscalls),
            Some(e) => Err(e),
        }
    }
}

impl From<Result<Vec<VatSyscall>, DispatchError>> for DeliveryOutcome {
    fn from(result: Result<Vec<VatSyscall>, DispatchError>) -> Self {
        match result {
            Ok(syscalls) => Self::ok(syscalls),
            Err(e) => Self::failed(Vec::new(), e),
        }
    }
}

/// A running vat. Each call handles one delivery to quiescence and returns
/// the syscalls it produced, in emission order.
pub trait VatDispatch {
    fn dispatch(&mut self, delivery: &VatDelivery) -> DeliveryOutcome;
}

/// Builds fresh, isolated vat instances. The kernel calls this once at
/// genesis and once more for every restart, so it must be deterministic.
pub trait VatSetup: Send + Sync {
    fn setup(&self, params: &VatParams) -> Box<dyn VatDispatch>;
}

impl<F> VatSetup for F
where
    F: Fn(&VatParams) -> Box<dyn VatDispatch> + Send + Sync,
{
    fn setup(&self, params: &VatParams) -> Box<dyn VatDispatch> {
        self(params)
    }
}

pub type SharedVatSetup = Arc<dyn VatSetup>;
