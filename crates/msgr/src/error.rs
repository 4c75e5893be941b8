//! Error types for the transport surface

use thiserror::Error;

/// Errors surfaced by the transport boundary.
#[derive(Debug, Error)]
pub enum MsgrError {
    /// The connection's outgoing queue is full. Transient: the caller may
    /// retry later (the OSD client latches such sends for its timeout tick).
    #[error("send queue full")]
    QueueFull,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("malformed entity address: {0}")]
    BadAddress(String),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, MsgrError>;
