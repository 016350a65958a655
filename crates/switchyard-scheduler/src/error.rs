//! Scheduling engine errors.

use switchyard_core::SwitchyardError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected input; `field` names the violated constraint.
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("job \"{0}\" not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("job \"{0}\" is not paused")]
    NotPaused(String),

    #[error(transparent)]
    Storage(#[from] SwitchyardError),
}

impl EngineError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
