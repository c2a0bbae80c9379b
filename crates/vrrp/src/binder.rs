//! Capture bindings per interface and their receive tasks.
//!
//! The first instance on an interface opens a binding and starts a receive
//! task; the last one leaving closes it, which ends the task. The shared
//! protocol filter is installed with the first binding in the process and
//! removed with the last one. All of this runs on the dispatcher task, so the
//! reference counts need no locking.

use crate::adapter::{CaptureBinding, SwitchAdapter};
use crate::error::AdapterError;
use crate::packet::{DecodeError, DropClass, IngressFrame};
use crate::registry::RegistryHandle;
use crate::types::{CAPTURE_FILTER, DropStats, InstanceKey};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First pause after a failed capture read; doubles up to [`RECV_RETRY_MAX`]
const RECV_RETRY_INITIAL: Duration = Duration::from_millis(50);
const RECV_RETRY_MAX: Duration = Duration::from_secs(1);

/// Advertisement that passed ingress validation, tagged with its instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxAdvert {
    pub key: InstanceKey,
    pub frame: IngressFrame,
}

/// Drop counters shared by every receive task
#[derive(Debug, Default)]
pub struct DropCounters {
    malformed_length: AtomicU64,
    checksum_mismatch: AtomicU64,
    vrid_mismatch: AtomicU64,
    ttl_violation: AtomicU64,
}

impl DropCounters {
    pub fn record(&self, error: &DecodeError) {
        let counter = match error.class() {
            DropClass::MalformedLength => &self.malformed_length,
            DropClass::ChecksumMismatch => &self.checksum_mismatch,
            DropClass::VridMismatch => &self.vrid_mismatch,
            DropClass::TtlViolation => &self.ttl_violation,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DropStats {
        DropStats {
            malformed_length: self.malformed_length.load(Ordering::Relaxed),
            checksum_mismatch: self.checksum_mismatch.load(Ordering::Relaxed),
            vrid_mismatch: self.vrid_mismatch.load(Ordering::Relaxed),
            ttl_violation: self.ttl_violation.load(Ordering::Relaxed),
        }
    }
}

struct BoundInterface {
    binding: Arc<dyn CaptureBinding>,
    vrids: BTreeSet<u8>,
    task: JoinHandle<()>,
}

pub struct InterfaceBinder {
    adapter: Arc<dyn SwitchAdapter>,
    interfaces: HashMap<i32, BoundInterface>,
    filter_installed: bool,
    registry: RegistryHandle,
    drops: Arc<DropCounters>,
    rx_tx: mpsc::Sender<RxAdvert>,
}

impl InterfaceBinder {
    pub fn new(
        adapter: Arc<dyn SwitchAdapter>,
        registry: RegistryHandle,
        drops: Arc<DropCounters>,
        rx_tx: mpsc::Sender<RxAdvert>,
    ) -> Self {
        Self {
            adapter,
            interfaces: HashMap::new(),
            filter_installed: false,
            registry,
            drops,
            rx_tx,
        }
    }

    /// Bind an instance to its interface, opening the binding if it is the first one.
    pub async fn attach(&mut self, key: InstanceKey) -> Result<Arc<dyn CaptureBinding>, AdapterError> {
        if let Some(bound) = self.interfaces.get_mut(&key.if_index) {
            bound.vrids.insert(key.vrid);
            return Ok(bound.binding.clone());
        }

        let name = self.adapter.resolve_interface_name(key.if_index).await?;
        let binding = self.adapter.open_capture(&name, CAPTURE_FILTER).await?;

        if !self.filter_installed {
            info!("Adding protocol mac for punting packets to CPU");
            if let Err(e) = self.adapter.program_protocol_filter(true).await {
                binding.close();
                return Err(e);
            }
            self.filter_installed = true;
        }

        let task = tokio::spawn(receive_loop(
            key.if_index,
            binding.clone(),
            self.registry.clone(),
            self.drops.clone(),
            self.rx_tx.clone(),
        ));

        info!(if_index = key.if_index, interface = %name, "Opened capture binding");
        self.interfaces.insert(
            key.if_index,
            BoundInterface {
                binding: binding.clone(),
                vrids: BTreeSet::from([key.vrid]),
                task,
            },
        );
        Ok(binding)
    }

    /// Drop an instance's claim on its interface, closing the binding with the last one.
    pub async fn detach(&mut self, key: InstanceKey) {
        let Some(bound) = self.interfaces.get_mut(&key.if_index) else {
            return;
        };
        if !bound.vrids.remove(&key.vrid) || !bound.vrids.is_empty() {
            return;
        }

        if let Some(bound) = self.interfaces.remove(&key.if_index) {
            close(key.if_index, bound);
        }

        if self.interfaces.is_empty() {
            self.remove_filter().await;
        }
    }

    pub fn is_bound(&self, if_index: i32) -> bool {
        self.interfaces.contains_key(&if_index)
    }

    pub fn filter_installed(&self) -> bool {
        self.filter_installed
    }

    /// Close every binding and remove the protocol filter
    pub async fn shutdown(&mut self) {
        for (if_index, bound) in self.interfaces.drain() {
            close(if_index, bound);
        }
        self.remove_filter().await;
    }

    async fn remove_filter(&mut self) {
        if !self.filter_installed {
            return;
        }
        info!("No more vrrp configured, disabling protocol mac");
        if let Err(e) = self.adapter.program_protocol_filter(false).await {
            warn!(error = %e, "Failed to remove protocol mac");
        }
        self.filter_installed = false;
    }
}

fn close(if_index: i32, bound: BoundInterface) {
    info!(if_index, interface = bound.binding.name(), "Closing capture binding");
    bound.binding.close();
    // The receive task exits on its own once recv reports the close
    drop(bound.task);
}

/// Validate a captured datagram for the interface's instances.
///
/// Length and checksum first, then the VRID against the registry, then TTL.
pub async fn decode_ingress(
    if_index: i32,
    datagram: &[u8],
    registry: &RegistryHandle,
) -> Result<RxAdvert, DecodeError> {
    let frame = IngressFrame::parse(datagram)?;
    let key = InstanceKey::new(if_index, frame.vrid());
    if !registry.contains(key).await {
        return Err(DecodeError::VridMismatch(frame.vrid()));
    }
    frame.check_ttl()?;
    Ok(RxAdvert { key, frame })
}

async fn receive_loop(
    if_index: i32,
    binding: Arc<dyn CaptureBinding>,
    registry: RegistryHandle,
    drops: Arc<DropCounters>,
    rx_tx: mpsc::Sender<RxAdvert>,
) {
    debug!(if_index, "Receive task started");
    let mut retry_delay = RECV_RETRY_INITIAL;

    loop {
        let datagram: Bytes = match binding.recv().await {
            Ok(datagram) => {
                retry_delay = RECV_RETRY_INITIAL;
                datagram
            }
            Err(AdapterError::Closed) => break,
            Err(e) => {
                // Only a close ends the task; read errors such as ENOBUFS are transient
                warn!(
                    if_index,
                    error = %e,
                    retry_ms = retry_delay.as_millis() as u64,
                    "Capture read failed"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(RECV_RETRY_MAX);
                continue;
            }
        };

        match decode_ingress(if_index, &datagram, &registry).await {
            Ok(advert) => {
                if rx_tx.send(advert).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                drops.record(&e);
                debug!(if_index, error = %e, "Dropped advertisement");
            }
        }
    }

    debug!(if_index, "Receive task stopped");
}
