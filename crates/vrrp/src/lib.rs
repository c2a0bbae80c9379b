//! Virtual Router Redundancy Protocol (VRRP) engine
//!
//! RFC 3768 implementation for a switch/router daemon. Instances are keyed by
//! interface and VRID and run the Init/Backup/Master state machine on a single
//! dispatcher task.
//!
//! # Features
//!
//! - VRRPv2 advertisements over IPv4
//! - Priority-based master election with preemption
//! - Graceful resignation (priority 0 advertisements)
//! - Paged state snapshots for management reads
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vrrp::{EngineSettings, InstanceConfig, SwitchAdapter, VrrpServer};
//!
//! # async fn example(adapter: Arc<dyn SwitchAdapter>) -> Result<(), Box<dyn std::error::Error>> {
//! let server = VrrpServer::spawn(adapter, Vec::new(), EngineSettings::default());
//! server.wait_ready().await?;
//!
//! let mut config = InstanceConfig::new(3, 1, "192.168.1.1".parse()?);
//! config.priority = 200;
//! server.create_instance(config).await?;
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod binder;
pub mod bootstrap;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod registry;
pub mod server;
pub mod socket;
pub mod state_machine;
pub mod timer;
pub mod types;

pub use adapter::{CaptureBinding, Dependency, SwitchAdapter};
pub use bootstrap::{ConnectOutcome, Readiness, RetryPolicy};
pub use dispatcher::{CreateOutcome, InterfaceEvent};
pub use error::{AdapterError, ConfigError, VrrpError};
pub use packet::{Advertisement, DecodeError};
pub use server::{EngineSettings, VrrpServer};
pub use socket::RawCapture;
pub use types::{
    BulkState, ConfigField, DropStats, InstanceConfig, InstanceKey, InstanceSnapshot,
    InstanceUpdate, VRRP_VERSION, VrrpState, VrrpStats,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let config = InstanceConfig::new(1, 1, "10.0.0.1".parse().unwrap());
        assert_eq!(config.priority, types::DEFAULT_PRIORITY);

        let state = VrrpState::Init;
        assert_eq!(state.to_string(), "INIT");
    }
}
