//! Error types for Switchyard.

use thiserror::Error;

/// Errors shared by every Switchyard crate.
#[derive(Debug, Error)]
pub enum SwitchyardError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SwitchyardError>;
