//! Service-boundary error taxonomy
//!
//! Internal code propagates `anyhow::Error`; nothing crosses the service
//! boundary without being mapped onto one of these kinds. Stack traces
//! never leak to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpError {
    /// An id did not resolve. Not retryable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input violates an invariant. Reported synchronously; batch
    /// creation aborts atomically on the first validation failure.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Illegal state-machine transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// External platform 4xx/5xx or network timeout after the retry
    /// budget is exhausted. Inside a batch this becomes an item-level
    /// failure, never a batch-level fatal.
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// External credentials invalid; the account is marked needs-reauth
    /// and its downstream syncs halt. Other accounts are unaffected.
    #[error("credentials expired for account {0}")]
    AuthExpired(i64),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type OpResult<T> = Result<T, OpError>;

impl OpError {
    /// Stable machine-readable kind for logging and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OpError::NotFound(_) => "not_found",
            OpError::Validation(_) => "validation",
            OpError::Conflict(_) => "conflict",
            OpError::ExternalFailure(_) => "external_failure",
            OpError::AuthExpired(_) => "auth_expired",
            OpError::Internal(_) => "internal",
        }
    }
}
