//! Engine error types
//!
//! Every internal failure path is a typed result; panics are reserved for
//! programmer errors and are caught at task boundaries by the supervisors.

use thiserror::Error;

/// Sub-kind for provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    RateLimit,
    Protocol,
    Timeout,
    Disconnect,
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Protocol => "protocol",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::Disconnect => "disconnect",
        };
        f.write_str(s)
    }
}

/// Sub-kind for tool failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    InvalidArgs,
    DestinationNotFound,
    DestinationUnreachable,
    Timeout,
    Declined,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolErrorKind::InvalidArgs => "invalid_args",
            ToolErrorKind::DestinationNotFound => "destination_not_found",
            ToolErrorKind::DestinationUnreachable => "destination_unreachable",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Declined => "declined",
        };
        f.write_str(s)
    }
}

/// Errors raised anywhere inside the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed configuration, unknown provider, missing secret
    #[error("config error: {0}")]
    Config(String),

    /// Socket bind/accept/read/write failure, RTP decode failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A provider session failed
    #[error("provider error ({kind}): {detail}")]
    Provider {
        kind: ProviderErrorKind,
        detail: String,
    },

    /// An ARI verb was issued in the wrong state
    #[error("state error: {0}")]
    State(String),

    /// A tool invocation failed
    #[error("tool error ({kind}): {detail}")]
    Tool {
        kind: ToolErrorKind,
        detail: String,
    },

    /// Session cleanup exceeded its deadline
    #[error("teardown exceeded {0:?}")]
    TeardownTimeout(std::time::Duration),
}

impl EngineError {
    pub fn provider(kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        EngineError::Provider {
            kind,
            detail: detail.into(),
        }
    }

    pub fn tool(kind: ToolErrorKind, detail: impl Into<String>) -> Self {
        EngineError::Tool {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<arivox_media_core::MediaError> for EngineError {
    fn from(err: arivox_media_core::MediaError) -> Self {
        EngineError::Transport(err.to_string())
    }
}

impl From<arivox_ari_client::AriError> for EngineError {
    fn from(err: arivox_ari_client::AriError) -> Self {
        use arivox_ari_client::AriError;
        match err {
            AriError::NotFound(d) | AriError::StateConflict(d) => EngineError::State(d),
            AriError::Unauthorized(d) => EngineError::Config(d),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// Result type used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;
