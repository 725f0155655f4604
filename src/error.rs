//! Error types for studio-ops.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Template naming policy rejected the plan. Nothing was touched.
    #[error("template policy violation: {0}")]
    Policy(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("bad job payload: {0}")]
    Payload(String),

    /// Another workflow holds the lock for this scope. Callers report "busy".
    #[error("workflow lock unavailable for scope {scope}")]
    LockUnavailable { scope: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the error is the expected "busy" outcome of a lock try-acquire.
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, Error::LockUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
