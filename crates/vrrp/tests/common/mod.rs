//! In-memory switch adapter for driving the engine end to end.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use vrrp::{
    AdapterError, Advertisement, CaptureBinding, EngineSettings, InstanceConfig, InstanceKey,
    InterfaceEvent, SwitchAdapter, VrrpServer, VrrpState,
};

/// Advertisement captured on the way out
#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub advertisement: Advertisement,
}

/// What the next capture read yields
enum Inbound {
    Datagram(Bytes),
    ReadError(io::Error),
}

pub struct MemoryBinding {
    name: String,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    sent: Mutex<Vec<Sent>>,
    closed: CancellationToken,
}

impl MemoryBinding {
    fn new(name: &str) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            inbound_tx,
            inbound: tokio::sync::Mutex::new(inbound),
            sent: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Deliver a datagram as if captured from the wire
    pub fn inject(&self, datagram: Vec<u8>) {
        let _ = self.inbound_tx.send(Inbound::Datagram(Bytes::from(datagram)));
    }

    /// Make the next read fail the way a full socket buffer does
    pub fn fail_read(&self) {
        let error = io::Error::other("No buffer space available");
        let _ = self.inbound_tx.send(Inbound::ReadError(error));
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl CaptureBinding for MemoryBinding {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self) -> Result<Bytes, AdapterError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(AdapterError::Closed),
            inbound = inbound.recv() => match inbound {
                Some(Inbound::Datagram(datagram)) => Ok(datagram),
                Some(Inbound::ReadError(error)) => Err(AdapterError::Io(error)),
                None => Err(AdapterError::Closed),
            },
        }
    }

    fn send(&self, payload: &[u8]) -> Result<(), AdapterError> {
        if self.closed.is_cancelled() {
            return Err(AdapterError::Closed);
        }
        let advertisement = Advertisement::decode(payload)
            .map_err(|e| AdapterError::Unreachable(e.to_string()))?;
        self.sent.lock().unwrap().push(Sent {
            at: Instant::now(),
            advertisement,
        });
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[derive(Default)]
pub struct MemoryAdapter {
    bindings: Mutex<HashMap<String, Arc<MemoryBinding>>>,
    filter_calls: Mutex<Vec<bool>>,
    opens: AtomicUsize,
}

impl MemoryAdapter {
    /// Most recent binding opened for an interface
    pub fn binding(&self, if_index: i32) -> Arc<MemoryBinding> {
        self.bindings
            .lock()
            .unwrap()
            .get(&interface_name(if_index))
            .cloned()
            .expect("no binding opened for interface")
    }

    pub fn has_binding(&self, if_index: i32) -> bool {
        self.bindings.lock().unwrap().contains_key(&interface_name(if_index))
    }

    pub fn filter_calls(&self) -> Vec<bool> {
        self.filter_calls.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

pub fn interface_name(if_index: i32) -> String {
    format!("eth{}", if_index)
}

#[async_trait]
impl SwitchAdapter for MemoryAdapter {
    async fn resolve_interface_name(&self, if_index: i32) -> Result<String, AdapterError> {
        if if_index <= 0 {
            return Err(AdapterError::InterfaceNotFound(if_index));
        }
        Ok(interface_name(if_index))
    }

    async fn open_capture(
        &self,
        name: &str,
        _filter: &str,
    ) -> Result<Arc<dyn CaptureBinding>, AdapterError> {
        let binding = Arc::new(MemoryBinding::new(name));
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.bindings
            .lock()
            .unwrap()
            .insert(name.to_string(), binding.clone());
        Ok(binding)
    }

    async fn program_protocol_filter(&self, enable: bool) -> Result<(), AdapterError> {
        self.filter_calls.lock().unwrap().push(enable);
        Ok(())
    }
}

pub struct Harness {
    pub server: VrrpServer,
    pub adapter: Arc<MemoryAdapter>,
    pub start: Instant,
}

impl Harness {
    pub fn new() -> Self {
        let adapter = Arc::new(MemoryAdapter::default());
        let server = VrrpServer::spawn(adapter.clone(), Vec::new(), EngineSettings::default());
        Self {
            server,
            adapter,
            start: Instant::now(),
        }
    }

    /// Assign an address and let the dispatcher handle it
    pub async fn assign_address(&self, if_index: i32, address: &str) {
        self.server
            .notify_interface(InterfaceEvent::AddressAssigned {
                if_index,
                address: address.parse().unwrap(),
            })
            .await
            .unwrap();
        settle().await;
    }

    pub async fn notify(&self, event: InterfaceEvent) {
        self.server.notify_interface(event).await.unwrap();
        settle().await;
    }

    pub async fn state(&self, key: InstanceKey) -> VrrpState {
        self.server.get_instance(key).await.unwrap().state
    }

    /// Sleep until `offset` after the harness was created
    pub async fn at(&self, offset: Duration) {
        tokio::time::sleep_until(self.start + offset).await;
    }

    /// Inject an advertisement from a peer on the interface
    pub async fn receive(&self, if_index: i32, source: &str, ttl: u8, advertisement: &Advertisement) {
        self.adapter
            .binding(if_index)
            .inject(datagram(source.parse().unwrap(), ttl, &advertisement.encode()));
        settle().await;
    }
}

pub fn config(if_index: i32, vrid: u8, priority: u8) -> InstanceConfig {
    let mut config = InstanceConfig::new(if_index, vrid, "10.0.0.254".parse().unwrap());
    config.priority = priority;
    config
}

/// Let every ready task run; with paused time the clock only moves once the
/// runtime is otherwise idle.
pub async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

/// Wrap an advertisement in an IPv4 header addressed to the VRRP group
pub fn datagram(source: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = (20 + payload.len()) as u16;
    let mut datagram = vec![0x45, 0, 0, 0, 0, 0, 0, 0, ttl, 112, 0, 0];
    datagram[2..4].copy_from_slice(&total_len.to_be_bytes());
    datagram.extend_from_slice(&source.octets());
    datagram.extend_from_slice(&[224, 0, 0, 18]);
    datagram.extend_from_slice(payload);
    datagram
}
