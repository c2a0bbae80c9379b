//! Logging utilities for vrrpd components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing, plain or JSON formatted.
///
/// RUST_LOG takes precedence over `level` when it is set.
pub fn init_with_level(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}
