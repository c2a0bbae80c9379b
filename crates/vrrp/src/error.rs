//! Error types for the VRRP engine.

use crate::types::{ConfigField, InstanceKey};
use std::io;
use thiserror::Error;

/// Configuration errors, reported back to the management caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("VRID must be between 1 and 255, got {0}")]
    InvalidVrid(u8),

    #[error("Priority must be between 1 and 255, got {0}")]
    InvalidPriority(u8),

    #[error("No VRRP instance configured for {0}")]
    UnknownInstance(InstanceKey),

    #[error("Field {0} cannot be changed after creation")]
    ImmutableField(ConfigField),
}

/// Switch adapter and transport errors.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Interface {0} is not known to the switch adapter")]
    InterfaceNotFound(i32),

    #[error("Failed to open capture on {name}: {source}")]
    CaptureOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Capture binding closed")]
    Closed,

    #[error("Connection not required")]
    NotRequired,

    #[error("Adapter unreachable: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the server facade.
#[derive(Debug, Error)]
pub enum VrrpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("VRRP engine is not ready: waiting for {0:?}")]
    NotReady(Vec<String>),

    #[error("VRRP engine has stopped")]
    EngineStopped,
}
