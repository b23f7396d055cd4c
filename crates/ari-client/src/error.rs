//! ARI error types

use thiserror::Error;

/// Errors returned by ARI verbs and the event subscription
#[derive(Debug, Error)]
pub enum AriError {
    /// The channel, bridge or playback no longer exists
    #[error("ARI resource not found: {0}")]
    NotFound(String),

    /// The verb is not valid in the resource's current state
    #[error("ARI state conflict: {0}")]
    StateConflict(String),

    /// Credentials rejected
    #[error("ARI authorization failed: {0}")]
    Unauthorized(String),

    /// Network-level failure talking to the ARI endpoint
    #[error("ARI transport error: {0}")]
    Transport(String),

    /// The peer answered with something we could not interpret
    #[error("ARI protocol error: {0}")]
    Protocol(String),

    /// The verb's deadline elapsed
    #[error("ARI request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl AriError {
    /// True when retrying the same verb later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, AriError::Transport(_) | AriError::Timeout(_))
    }
}

impl From<reqwest::Error> for AriError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AriError::Timeout(std::time::Duration::from_secs(0))
        } else if err.is_connect() {
            AriError::Transport(err.to_string())
        } else {
            AriError::Protocol(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AriError {
    fn from(err: serde_json::Error) -> Self {
        AriError::Protocol(err.to_string())
    }
}

/// Result type for ARI operations
pub type Result<T> = std::result::Result<T, AriError>;
