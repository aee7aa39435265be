//! Error types for the log.

use crate::id::InvalidKey;
use thicket_merkle::{StoreError, SyncError};
use thiserror::Error;

/// Boxed error returned by consumers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in log operations.
///
/// A message that is waiting on its parents is not an error; see
/// [`crate::Status::Pending`].
#[derive(Error, Debug)]
pub enum LogError {
    /// Bad payload, topic, shape or encoding. Such messages are never stored.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidKey(#[from] InvalidKey),

    /// Signature missing, unexpected or not verifiable.
    #[error("signature error: {0}")]
    Signature(String),

    /// The consumer refused to apply the message. Nothing was committed.
    #[error("apply failed: {0}")]
    Apply(#[source] BoxError),

    /// A sync attempt was aborted by a malformed or inconsistent peer.
    #[error("sync failed: {0}")]
    SyncProtocol(SyncError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for LogError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(err) => LogError::Store(err),
            other => LogError::SyncProtocol(other),
        }
    }
}

impl LogError {
    /// Whether another sync attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::SyncProtocol(_))
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
