//! Error types for playhead-sink
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Device failures carry a recoverability flag: a recoverable
//! failure means the caller may retry after the sink has adjusted itself
//! (for example by downgrading out of offload mode), an unrecoverable one
//! means no further buffers are accepted until `flush()`.

use playhead_common::AudioFormat;
use thiserror::Error;

/// Main error type for playhead-sink
#[derive(Error, Debug)]
pub enum SinkError {
    /// The requested stream format cannot be configured for output
    #[error("Configuration error for {format:?}: {reason}")]
    Configuration { format: AudioFormat, reason: String },

    /// Opening the output device failed
    #[error("Device initialization failed (recoverable: {recoverable}): {reason}")]
    Initialization { reason: String, recoverable: bool },

    /// A non-blocking device write failed
    #[error("Device write failed (recoverable: {recoverable}): {reason}")]
    Write { reason: String, recoverable: bool },

    /// A processing stage rejected its input format
    #[error("Unhandled audio format in pipeline: {0:?}")]
    UnhandledFormat(AudioFormat),

    /// Operation invalid in the current sink state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SinkError {
    /// Whether the caller may retry the failed operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            SinkError::Initialization { recoverable, .. } => *recoverable,
            SinkError::Write { recoverable, .. } => *recoverable,
            _ => false,
        }
    }
}

/// Convenience Result type using playhead-sink SinkError
pub type Result<T> = std::result::Result<T, SinkError>;
