use thiserror::Error;

/// Errors from host storage.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("journal is closed")]
    Closed,

    #[error("no journal found in {}", .0.display())]
    NotFound(std::path::PathBuf),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
