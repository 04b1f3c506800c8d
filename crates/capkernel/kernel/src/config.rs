use serde::{Deserialize, Serialize};

/// Kernel-wide settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Deliver messages aimed at an unresolved promise straight to the vat
    /// that decides it. Vats may override this for their own promises.
    pub enable_pipelining: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            enable_pipelining: true,
        }
    }
}
