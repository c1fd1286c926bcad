//! Error types for playhead-common
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Error type for shared playhead operations (tuning file loading)
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tuning file parse errors
    #[error("Tuning parse error: {0}")]
    Parse(String),
}

/// Convenience Result type using playhead-common Error
pub type Result<T> = std::result::Result<T, Error>;
