//! Common utilities and types shared across the vrrpd components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
