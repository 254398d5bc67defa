//! Error types for Loam

use thiserror::Error;

/// Result type alias for Loam operations
pub type Result<T> = std::result::Result<T, LoamError>;

/// Main error type shared across the workspace
#[derive(Error, Debug)]
pub enum LoamError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl LoamError {
    pub fn invalid_value(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        LoamError::InvalidValue {
            key: key.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
