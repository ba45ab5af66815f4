//! etherdwarf Error Types

use thiserror::Error;

use crate::peers::PeerFileError;

/// Result type alias for etherdwarf operations
pub type Result<T> = std::result::Result<T, Error>;

/// etherdwarf error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error(transparent)]
    PeerFile(#[from] PeerFileError),

    #[error("TLS material error: {0}")]
    TlsMaterial(String),

    // Transport errors
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Unable to listen at {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(String),

    // Session errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session closed")]
    SessionClosed,

    // Device errors
    #[error("Virtual device error: {0}")]
    Device(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by the dial loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Tls(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::HandshakeTimeout(_)
                | Error::Authentication(_)
                | Error::Protocol(_)
                | Error::SessionClosed
                | Error::Io(_)
        )
    }

    /// Process exit status used when this error aborts startup
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PeerFile(e) => e.exit_code(),
            Error::Config(_) | Error::ConfigParse(_) => 2,
            Error::TlsMaterial(_) => 105,
            Error::Bind { .. } => 20,
            Error::Device(_) => 5,
            _ => 1,
        }
    }
}
