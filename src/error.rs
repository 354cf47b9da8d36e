// src/error.rs
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the queue and fingerprint backends.
///
/// `Unavailable` is the hard-failure signal: callers are expected to halt
/// producers/consumers until the store comes back.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_) | QueueError::Io(_))
    }
}
