//! Common error types for vrrpd components.

use std::fmt;

/// A specialized Result type for daemon-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for daemon-level operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("VRRP error: {0}")]
    Vrrp(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new VRRP engine error.
    pub fn vrrp(msg: impl fmt::Display) -> Self {
        Error::Vrrp(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
