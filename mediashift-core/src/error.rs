//! Error types shared across the engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolkitError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Incomplete transfer of '{name}': received {received} of {expected} bytes")]
    ShortTransfer {
        name: String,
        expected: u64,
        received: u64,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Service control error: {0}")]
    ServiceControl(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ToolkitError {
    /// True for the cancellation outcome, which is terminal but not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolkitError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, ToolkitError>;
