//! Error types for the Thicket SDK.

use crate::network::NetworkError;
use thicket_log::LogError;
use thiserror::Error;

/// Error type for SDK operations.
#[derive(Error, Debug)]
pub enum SdkError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// The replica was shut down.
    #[error("replica stopped")]
    Stopped,
}

impl SdkError {
    /// Whether a later attempt at the same operation might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Log(err) => err.is_retryable(),
            SdkError::Network(_) => true,
            SdkError::Stopped => false,
        }
    }
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
