//! The event dispatcher: the single task that mutates VRRP state.
//!
//! Configuration requests, interface notifications, received advertisements,
//! timer expiries and transmit requests arrive on separate channels and are
//! handled one at a time. Each event runs to completion, including the timer
//! and transmit side effects of any transition, before the next is taken.

use crate::adapter::{CaptureBinding, SwitchAdapter};
use crate::binder::{DropCounters, InterfaceBinder, RxAdvert};
use crate::error::{ConfigError, VrrpError};
use crate::packet::{Advertisement, DecodeError};
use crate::registry::{Created, Instance, Registry, RegistryHandle};
use crate::state_machine::{self, Action, FsmEvent, TimerDelay};
use crate::timer::{TimerClass, TimerExpiry, TimerManager};
use crate::types::{InstanceConfig, InstanceKey, InstanceUpdate, RESIGN_PRIORITY, VrrpState};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Result of a create request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// New instance, started on its interface
    Created,
    /// Key already existed; fields were applied as an update
    Updated,
    /// New instance waiting for its interface address, link or binding
    Deferred,
}

pub struct CreateRequest {
    pub config: InstanceConfig,
    pub reply: oneshot::Sender<CreateOutcome>,
}

pub struct UpdateRequest {
    pub key: InstanceKey,
    pub update: InstanceUpdate,
    pub reply: oneshot::Sender<Result<(), ConfigError>>,
}

pub struct DeleteRequest {
    pub key: InstanceKey,
    pub reply: oneshot::Sender<Result<(), ConfigError>>,
}

/// Interface and address notifications from the switch adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    AddressAssigned { if_index: i32, address: Ipv4Addr },
    Up { if_index: i32 },
    Down { if_index: i32 },
}

/// Encoded advertisement queued for a binding
pub struct TxRequest {
    pub key: InstanceKey,
    pub binding: Arc<dyn CaptureBinding>,
    pub payload: Bytes,
}

/// Sending side of the dispatcher's inbound channels
#[derive(Clone)]
pub struct DispatcherHandle {
    create_tx: mpsc::Sender<CreateRequest>,
    update_tx: mpsc::Sender<UpdateRequest>,
    delete_tx: mpsc::Sender<DeleteRequest>,
    interface_tx: mpsc::Sender<InterfaceEvent>,
}

impl DispatcherHandle {
    pub async fn create(&self, config: InstanceConfig) -> Result<CreateOutcome, VrrpError> {
        let (reply, rx) = oneshot::channel();
        self.create_tx
            .send(CreateRequest { config, reply })
            .await
            .map_err(|_| VrrpError::EngineStopped)?;
        rx.await.map_err(|_| VrrpError::EngineStopped)
    }

    pub async fn update(&self, key: InstanceKey, update: InstanceUpdate) -> Result<(), VrrpError> {
        let (reply, rx) = oneshot::channel();
        self.update_tx
            .send(UpdateRequest { key, update, reply })
            .await
            .map_err(|_| VrrpError::EngineStopped)?;
        Ok(rx.await.map_err(|_| VrrpError::EngineStopped)??)
    }

    pub async fn delete(&self, key: InstanceKey) -> Result<(), VrrpError> {
        let (reply, rx) = oneshot::channel();
        self.delete_tx
            .send(DeleteRequest { key, reply })
            .await
            .map_err(|_| VrrpError::EngineStopped)?;
        Ok(rx.await.map_err(|_| VrrpError::EngineStopped)??)
    }

    pub async fn notify(&self, event: InterfaceEvent) -> Result<(), VrrpError> {
        self.interface_tx
            .send(event)
            .await
            .map_err(|_| VrrpError::EngineStopped)
    }
}

pub struct Dispatcher {
    registry: Registry,
    timers: TimerManager,
    binder: InterfaceBinder,
    drops: Arc<DropCounters>,
    /// Primary IPv4 address per interface, from address notifications
    addresses: HashMap<i32, Ipv4Addr>,
    link_down: HashSet<i32>,

    create_rx: mpsc::Receiver<CreateRequest>,
    update_rx: mpsc::Receiver<UpdateRequest>,
    delete_rx: mpsc::Receiver<DeleteRequest>,
    interface_rx: mpsc::Receiver<InterfaceEvent>,
    rx_rx: mpsc::Receiver<RxAdvert>,
    expiry_rx: mpsc::UnboundedReceiver<TimerExpiry>,
    tx_tx: mpsc::UnboundedSender<TxRequest>,
    tx_rx: mpsc::UnboundedReceiver<TxRequest>,
}

impl Dispatcher {
    pub fn new(adapter: Arc<dyn SwitchAdapter>, channel_size: usize) -> (Self, DispatcherHandle) {
        let (create_tx, create_rx) = mpsc::channel(channel_size);
        let (update_tx, update_rx) = mpsc::channel(channel_size);
        let (delete_tx, delete_rx) = mpsc::channel(channel_size);
        let (interface_tx, interface_rx) = mpsc::channel(channel_size);
        let (rx_tx, rx_rx) = mpsc::channel(channel_size);
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (tx_tx, tx_rx) = mpsc::unbounded_channel();

        let registry = Registry::new();
        let drops = Arc::new(DropCounters::default());
        let binder = InterfaceBinder::new(adapter, registry.handle(), drops.clone(), rx_tx);

        let dispatcher = Self {
            registry,
            timers: TimerManager::new(expiry_tx),
            binder,
            drops,
            addresses: HashMap::new(),
            link_down: HashSet::new(),
            create_rx,
            update_rx,
            delete_rx,
            interface_rx,
            rx_rx,
            expiry_rx,
            tx_tx,
            tx_rx,
        };
        let handle = DispatcherHandle {
            create_tx,
            update_tx,
            delete_tx,
            interface_tx,
        };
        (dispatcher, handle)
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.handle()
    }

    pub fn drop_counters(&self) -> Arc<DropCounters> {
        self.drops.clone()
    }

    /// Process events until `shutdown` is cancelled, then release everything.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("VRRP dispatcher started");

        loop {
            // Queued transmits first, then notifications ahead of the config
            // requests that may depend on them
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(request) = self.tx_rx.recv() => self.transmit(request).await,
                Some(event) = self.interface_rx.recv() => self.handle_interface(event).await,
                Some(request) = self.create_rx.recv() => {
                    let outcome = self.handle_create(request.config).await;
                    let _ = request.reply.send(outcome);
                }
                Some(request) = self.update_rx.recv() => {
                    let result = self.handle_update(request.key, &request.update).await;
                    let _ = request.reply.send(result);
                }
                Some(request) = self.delete_rx.recv() => {
                    let result = self.handle_delete(request.key).await;
                    let _ = request.reply.send(result);
                }
                Some(expiry) = self.expiry_rx.recv() => self.handle_expiry(expiry).await,
                Some(advert) = self.rx_rx.recv() => self.handle_advert(advert).await,
            }
        }

        self.teardown().await;
        info!("VRRP dispatcher stopped");
    }

    async fn handle_create(&mut self, config: InstanceConfig) -> CreateOutcome {
        let key = config.key();
        let bound_address = self.addresses.get(&key.if_index).copied();

        match self.registry.create(config, bound_address).await {
            Created::Inserted(instance) => {
                info!(vrid = key.vrid, if_index = key.if_index, "Created VRRP instance");
                if self.start(&instance).await {
                    CreateOutcome::Created
                } else {
                    CreateOutcome::Deferred
                }
            }
            Created::Updated {
                instance,
                timing_changed,
            } => {
                info!(vrid = key.vrid, if_index = key.if_index, "VRRP instance exists, updated in place");
                if timing_changed {
                    self.apply(&instance, FsmEvent::TimingChanged).await;
                }
                CreateOutcome::Updated
            }
        }
    }

    async fn handle_update(
        &mut self,
        key: InstanceKey,
        update: &InstanceUpdate,
    ) -> Result<(), ConfigError> {
        let (instance, timing_changed) = self.registry.update(key, update).await?;
        debug!(vrid = key.vrid, if_index = key.if_index, ?update, "Updated VRRP instance");
        if timing_changed {
            self.apply(&instance, FsmEvent::TimingChanged).await;
        }
        Ok(())
    }

    async fn handle_delete(&mut self, key: InstanceKey) -> Result<(), ConfigError> {
        let instance = self
            .registry
            .get(key)
            .await
            .ok_or(ConfigError::UnknownInstance(key))?;

        self.apply(&instance, FsmEvent::Shutdown).await;
        self.timers.cancel_all(key);
        self.registry.delete(key).await;
        info!(vrid = key.vrid, if_index = key.if_index, "Deleted VRRP instance");
        Ok(())
    }

    async fn handle_interface(&mut self, event: InterfaceEvent) {
        match event {
            InterfaceEvent::AddressAssigned { if_index, address } => {
                info!(if_index, %address, "IPv4 address assigned");
                self.addresses.insert(if_index, address);
                for instance in self.registry.on_interface(if_index).await {
                    instance.set_bound_address(Some(address)).await;
                    self.start(&instance).await;
                }
            }
            InterfaceEvent::Up { if_index } => {
                info!(if_index, "Interface up");
                self.link_down.remove(&if_index);
                for instance in self.registry.on_interface(if_index).await {
                    self.start(&instance).await;
                }
            }
            InterfaceEvent::Down { if_index } => {
                info!(if_index, "Interface down");
                self.link_down.insert(if_index);
                for instance in self.registry.on_interface(if_index).await {
                    self.apply(&instance, FsmEvent::Shutdown).await;
                }
            }
        }
    }

    async fn handle_advert(&mut self, advert: RxAdvert) {
        let RxAdvert { key, frame } = advert;
        let Some(instance) = self.registry.get(key).await else {
            // Deleted between validation and dispatch
            self.drops.record(&DecodeError::VridMismatch(key.vrid));
            return;
        };
        if instance.binding().await.is_none() {
            trace!(vrid = key.vrid, if_index = key.if_index, "Advertisement for inactive instance");
            return;
        }

        let priority = frame.advertisement.priority;
        instance.record_received(priority);
        trace!(vrid = key.vrid, if_index = key.if_index, priority, source = %frame.source, "Advertisement received");

        self.apply(
            &instance,
            FsmEvent::AdvertReceived {
                priority,
                source: frame.source,
            },
        )
        .await;
    }

    async fn handle_expiry(&mut self, expiry: TimerExpiry) {
        if !self.timers.accept(&expiry) {
            trace!(key = %expiry.key, class = ?expiry.class, generation = expiry.generation, "Stale timer expiry");
            return;
        }
        let Some(instance) = self.registry.get(expiry.key).await else {
            return;
        };

        let event = match expiry.class {
            TimerClass::MasterDown => FsmEvent::MasterDownExpired,
            TimerClass::Advertisement => FsmEvent::AdvertTimerExpired,
        };
        self.apply(&instance, event).await;
    }

    async fn transmit(&mut self, request: TxRequest) {
        let key = request.key;
        match request.binding.send(&request.payload) {
            Ok(()) => {
                if let Some(instance) = self.registry.get(key).await {
                    instance.record_sent();
                }
            }
            Err(e) => {
                warn!(vrid = key.vrid, if_index = key.if_index, error = %e, "Failed to send advertisement");
            }
        }
    }

    /// Send any queued advertisements before a binding goes away
    async fn flush_transmit(&mut self) {
        while let Ok(request) = self.tx_rx.try_recv() {
            self.transmit(request).await;
        }
    }

    /// Bind and start a dormant instance if its interface is usable.
    ///
    /// Returns whether the instance is running.
    async fn start(&mut self, instance: &Arc<Instance>) -> bool {
        let key = instance.key();
        if instance.binding().await.is_some() {
            return true;
        }
        if !self.addresses.contains_key(&key.if_index) {
            debug!(vrid = key.vrid, if_index = key.if_index, "No IPv4 address yet, deferring start");
            return false;
        }
        if self.link_down.contains(&key.if_index) {
            debug!(vrid = key.vrid, if_index = key.if_index, "Interface down, deferring start");
            return false;
        }

        match self.binder.attach(key).await {
            Ok(binding) => {
                instance.set_binding(Some(binding)).await;
                self.apply(instance, FsmEvent::Startup).await;
                true
            }
            Err(e) => {
                warn!(vrid = key.vrid, if_index = key.if_index, error = %e, "Failed to bind interface");
                false
            }
        }
    }

    /// Run one state machine step for an instance and execute its actions
    async fn apply(&mut self, instance: &Arc<Instance>, event: FsmEvent) {
        let ctx = instance.fsm_context().await;
        let transition = state_machine::step(&ctx, event);
        let key = instance.key();

        if transition.state != ctx.state {
            info!(
                vrid = key.vrid,
                if_index = key.if_index,
                from = %ctx.state,
                to = %transition.state,
                ?event,
                "VRRP state transition"
            );
            instance.set_state(transition.state).await;
        }

        for action in transition.actions {
            self.execute(instance, action).await;
        }
    }

    async fn execute(&mut self, instance: &Arc<Instance>, action: Action) {
        let key = instance.key();
        match action {
            Action::SendAdvertisement => self.queue_advertisement(instance, None).await,
            Action::SendResignation => {
                self.queue_advertisement(instance, Some(RESIGN_PRIORITY)).await
            }
            Action::StartTimer(class, delay) => {
                let params = instance.params().await;
                let after = match delay {
                    TimerDelay::AdvertInterval => params.config.advert_interval(),
                    TimerDelay::MasterDownInterval => params.master_down_interval,
                    TimerDelay::SkewTime => params.skew_time,
                };
                self.timers.schedule(key, class, after);
            }
            Action::CancelTimer(class) => {
                self.timers.cancel(key, class);
            }
            Action::ReleaseBinding => {
                self.flush_transmit().await;
                if instance.binding().await.is_some() {
                    instance.set_binding(None).await;
                    self.binder.detach(key).await;
                }
            }
        }
    }

    async fn queue_advertisement(&mut self, instance: &Arc<Instance>, priority: Option<u8>) {
        let key = instance.key();
        let Some(binding) = instance.binding().await else {
            debug!(vrid = key.vrid, if_index = key.if_index, "No binding, advertisement not sent");
            return;
        };

        let config = instance.params().await.config;
        let advertisement = Advertisement::new(
            config.vrid,
            priority.unwrap_or(config.priority),
            config.advert_interval,
            vec![config.virtual_ip],
        );
        let _ = self.tx_tx.send(TxRequest {
            key,
            binding,
            payload: advertisement.encode(),
        });
    }

    /// Resign every master, close bindings and release timers and instances
    async fn teardown(&mut self) {
        for instance in self.registry.all().await {
            if instance.state().await != VrrpState::Init || instance.binding().await.is_some() {
                self.apply(&instance, FsmEvent::Shutdown).await;
            }
        }
        self.flush_transmit().await;
        self.binder.shutdown().await;
        self.timers.clear();
        self.registry.clear().await;
    }
}
