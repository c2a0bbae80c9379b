//! VRRP daemon
//!
//! Runs the VRRP engine on Linux kernel interfaces. Interfaces and instances
//! come from a YAML configuration file; state and metrics are served over
//! HTTP.
//!
//! # Components
//!
//! - **Config**: YAML configuration with validation
//! - **KernelAdapter**: switch adapter backed by raw sockets
//! - **StatusServer**: `/state` bulk-state pages and `/metrics`

pub mod adapter;
pub mod config;
pub mod http_server;
pub mod metrics;

pub use adapter::KernelAdapter;
pub use config::{Config, ConfigError};
pub use http_server::StatusServer;
pub use metrics::MetricsRegistry;
