//! Error types for the gridmon transport core

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in the transport core
#[derive(Error, Debug)]
pub enum TransportError {
    /// Broker connection lost or unreachable
    #[error("transport failure: {0}")]
    Transport(String),

    /// Exchange/queue/binding declaration failed
    #[error("declare failed: {0}")]
    Declare(String),

    /// Payload encode/decode failure
    #[error("codec failure: {0}")]
    Codec(String),

    /// A bounded wait elapsed without completing
    #[error("timeout: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Errors raised by an intentional shutdown sequence
    #[error("shutdown error: {0}")]
    Shutdown(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a declare error
    pub fn declare(msg: impl Into<String>) -> Self {
        Self::Declare(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a shutdown error
    pub fn shutdown(msg: impl Into<String>) -> Self {
        Self::Shutdown(msg.into())
    }

    /// Whether this error indicates the underlying connection should be
    /// replaced rather than the operation retried as-is.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Io(_))
    }
}
