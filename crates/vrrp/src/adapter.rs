//! Capabilities the engine consumes from the switch adapter.

use crate::error::AdapterError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// An open capture+transmit binding on one interface.
///
/// `recv` is driven by the interface's receive task while the dispatcher calls
/// `send` on the same handle, so implementations must allow both concurrently.
#[async_trait]
pub trait CaptureBinding: Send + Sync {
    /// Interface name the binding was opened on
    fn name(&self) -> &str;

    /// Wait for the next captured IPv4 datagram.
    ///
    /// Returns [`AdapterError::Closed`] once the binding has been closed.
    async fn recv(&self) -> Result<Bytes, AdapterError>;

    /// Transmit an advertisement (IPv4 payload) to the VRRP multicast group
    fn send(&self, payload: &[u8]) -> Result<(), AdapterError>;

    /// Close the binding, unblocking any pending `recv`
    fn close(&self);
}

/// Switch/ASIC adapter: interface resolution, capture bindings and the
/// hardware rule punting VRRP frames to the CPU.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SwitchAdapter: Send + Sync {
    /// Resolve a logical interface to the name capture bindings are opened on
    async fn resolve_interface_name(&self, if_index: i32) -> Result<String, AdapterError>;

    /// Open a capture+transmit binding restricted by `filter`
    async fn open_capture(
        &self,
        name: &str,
        filter: &str,
    ) -> Result<Arc<dyn CaptureBinding>, AdapterError>;

    /// Install or remove the shared protocol MAC filter.
    ///
    /// The caller reference-counts; each call is a real change.
    async fn program_protocol_filter(&self, enable: bool) -> Result<(), AdapterError>;
}

/// A service that has to be reachable before protocol traffic is accepted.
#[async_trait]
pub trait Dependency: Send + Sync {
    fn name(&self) -> &str;

    /// Attempt to connect; [`AdapterError::NotRequired`] removes the dependency
    /// from the set the engine waits on.
    async fn connect(&self) -> Result<(), AdapterError>;
}
