use serde::{Deserialize, Serialize};

use capkernel_types::{VatDelivery, VatSyscall};

/// One delivery to a vat and everything it did in response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub crank: u64,
    pub delivery: VatDelivery,
    pub syscalls: Vec<VatSyscall>,
    /// Set when the dispatcher itself failed; `syscalls` then holds what it
    /// made before failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
}
