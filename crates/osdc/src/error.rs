//! Error types for the OSD client

use thiserror::Error;

/// Errors that can occur while dispatching OSD requests
#[derive(Debug, Error)]
pub enum OsdcError {
    #[error("OSD error {code}")]
    OsdError { code: i32 },

    #[error("transport error: {0}")]
    Transport(#[from] msgr::MsgrError),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("request aborted")]
    Aborted,
}

/// Result type alias for OSD client operations
pub type Result<T> = std::result::Result<T, OsdcError>;
