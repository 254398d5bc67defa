//! Error types for the catalog sync pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors reported by a catalog provider
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Upstream refused the call because the daily allowance is used up
    #[error("Provider quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The invocation's own request budget has no calls left
    #[error("Request budget of {cap} calls exhausted")]
    BudgetExhausted { cap: u32 },

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, ProviderError::QuotaExceeded(_))
    }
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid run state: {0}")]
    InvalidState(String),
}

impl SyncError {
    pub fn store(msg: impl Into<String>) -> Self {
        SyncError::Store(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SyncError::InvalidState(msg.into())
    }
}
