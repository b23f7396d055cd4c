//! Media error types

use thiserror::Error;

/// Errors produced while decoding, encoding or converting audio
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MediaError {
    /// Unsupported sample rate
    #[error("unsupported sample rate {rate} Hz (supported: {supported:?})")]
    InvalidSampleRate { rate: u32, supported: Vec<u32> },

    /// A wire frame failed to parse
    #[error("malformed frame: {details}")]
    MalformedFrame { details: String },

    /// Payload does not match the negotiated format
    #[error("invalid payload: {details}")]
    InvalidPayload { details: String },

    /// Caller-supplied buffer is too small
    #[error("buffer too small: needed {needed}, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    /// Unknown audio profile name
    #[error("unknown audio profile '{0}'")]
    UnknownProfile(String),
}

/// Result type for media operations
pub type Result<T> = std::result::Result<T, MediaError>;
