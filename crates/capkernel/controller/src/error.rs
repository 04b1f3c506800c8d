//! Error types for capkernel-controller

use capkernel_kernel::KernelError;
use capkernel_store::StoreError;
use thiserror::Error;

/// Controller-level errors
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kernel error, including replay divergence
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configured vat names a module nobody registered
    #[error("Unknown vat module: {0}")]
    UnknownModule(String),

    /// Storage error while opening or checking a store
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Output serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ControllerError {
    fn from(err: config::ConfigError) -> Self {
        ControllerError::Config(err.to_string())
    }
}

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;
