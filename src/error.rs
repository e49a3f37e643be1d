//! Error types for corkboard operations.

use thiserror::Error;

/// Result type alias for corkboard operations.
pub type Result<T> = std::result::Result<T, CorkboardError>;

/// Main error type for corkboard operations.
#[derive(Error, Debug)]
pub enum CorkboardError {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected wire frames
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reply target is not present in the local store
    #[error("Reply target {0} does not exist")]
    ParentMissing(u64),

    /// Invalid message fields or arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure to register with the primary server
    #[error("Registration error: {0}")]
    Registration(String),
}

impl CorkboardError {
    /// Creates a new protocol error.
    pub fn protocol<T: ToString>(msg: T) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Creates a new validation error.
    pub fn validation<T: ToString>(msg: T) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Creates a new configuration error.
    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Creates a new registration error.
    pub fn registration<T: ToString>(msg: T) -> Self {
        Self::Registration(msg.to_string())
    }
}
