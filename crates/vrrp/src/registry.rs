//! Keyed store of VRRP instances.
//!
//! [`Registry`] is owned by the dispatcher and is the only way to mutate the
//! key space. Readers on other tasks get a [`RegistryHandle`], which can take
//! point or paged snapshots. Every instance keeps its configuration, its state
//! and its capture binding behind separate locks so a snapshot never blocks
//! packet handling on an unrelated field and never sees a half-applied update.

use crate::adapter::CaptureBinding;
use crate::error::ConfigError;
use crate::state_machine::FsmContext;
use crate::types::{
    BulkState, InstanceConfig, InstanceKey, InstanceSnapshot, InstanceUpdate, VrrpState, VrrpStats,
    virtual_mac,
};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration plus the values derived from it, updated together
#[derive(Debug, Clone)]
pub struct InstanceParams {
    pub config: InstanceConfig,
    pub skew_time: Duration,
    pub master_down_interval: Duration,
    pub bound_address: Option<Ipv4Addr>,
}

impl InstanceParams {
    fn new(config: InstanceConfig, bound_address: Option<Ipv4Addr>) -> Self {
        Self {
            skew_time: config.skew_time(),
            master_down_interval: config.master_down_interval(),
            config,
            bound_address,
        }
    }

    fn recompute(&mut self) {
        self.skew_time = self.config.skew_time();
        self.master_down_interval = self.config.master_down_interval();
    }
}

#[derive(Debug, Default)]
struct Counters {
    master_transitions: AtomicU64,
    backup_transitions: AtomicU64,
    adverts_sent: AtomicU64,
    adverts_received: AtomicU64,
    priority_zero_received: AtomicU64,
}

/// One redundancy-group membership
pub struct Instance {
    key: InstanceKey,
    virtual_mac: String,
    params: RwLock<InstanceParams>,
    state: RwLock<VrrpState>,
    binding: RwLock<Option<Arc<dyn CaptureBinding>>>,
    counters: Counters,
}

impl Instance {
    fn new(config: InstanceConfig, bound_address: Option<Ipv4Addr>) -> Self {
        Self {
            key: config.key(),
            virtual_mac: virtual_mac(config.vrid),
            params: RwLock::new(InstanceParams::new(config, bound_address)),
            state: RwLock::new(VrrpState::Init),
            binding: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    pub async fn state(&self) -> VrrpState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: VrrpState) {
        *self.state.write().await = state;
        match state {
            VrrpState::Master => self.counters.master_transitions.fetch_add(1, Ordering::Relaxed),
            VrrpState::Backup => self.counters.backup_transitions.fetch_add(1, Ordering::Relaxed),
            VrrpState::Init => 0,
        };
    }

    pub async fn params(&self) -> InstanceParams {
        self.params.read().await.clone()
    }

    pub(crate) async fn set_bound_address(&self, address: Option<Ipv4Addr>) {
        self.params.write().await.bound_address = address;
    }

    pub async fn binding(&self) -> Option<Arc<dyn CaptureBinding>> {
        self.binding.read().await.clone()
    }

    pub(crate) async fn set_binding(&self, binding: Option<Arc<dyn CaptureBinding>>) {
        *self.binding.write().await = binding;
    }

    /// View the state machine operates on
    pub async fn fsm_context(&self) -> FsmContext {
        let params = self.params.read().await;
        FsmContext {
            state: *self.state.read().await,
            priority: params.config.priority,
            preempt: params.config.preempt,
            bound_address: params.bound_address,
        }
    }

    pub(crate) fn record_sent(&self) {
        self.counters.adverts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, priority: u8) {
        self.counters.adverts_received.fetch_add(1, Ordering::Relaxed);
        if priority == 0 {
            self.counters.priority_zero_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> VrrpStats {
        VrrpStats {
            master_transitions: self.counters.master_transitions.load(Ordering::Relaxed),
            backup_transitions: self.counters.backup_transitions.load(Ordering::Relaxed),
            adverts_sent: self.counters.adverts_sent.load(Ordering::Relaxed),
            adverts_received: self.counters.adverts_received.load(Ordering::Relaxed),
            priority_zero_received: self.counters.priority_zero_received.load(Ordering::Relaxed),
        }
    }

    pub async fn snapshot(&self) -> InstanceSnapshot {
        let params = self.params().await;
        let state = self.state().await;
        let capture_bound = self.binding.read().await.is_some();

        InstanceSnapshot {
            if_index: self.key.if_index,
            vrid: self.key.vrid,
            state,
            priority: params.config.priority,
            advert_interval: params.config.advert_interval,
            preempt: params.config.preempt,
            accept_mode: params.config.accept_mode,
            virtual_ip: params.config.virtual_ip,
            bound_address: params.bound_address,
            virtual_mac: self.virtual_mac.clone(),
            skew_time: params.skew_time,
            master_down_interval: params.master_down_interval,
            capture_bound,
            stats: self.stats(),
        }
    }
}

struct Slot {
    seq: u64,
    instance: Arc<Instance>,
}

#[derive(Default)]
struct Table {
    slots: HashMap<InstanceKey, Slot>,
    /// Registration order; a key keeps its position until deleted
    order: BTreeMap<u64, InstanceKey>,
    next_seq: u64,
}

/// Outcome of [`Registry::create`]
pub enum Created {
    Inserted(Arc<Instance>),
    /// Key already existed; the configuration was applied as an update
    Updated {
        instance: Arc<Instance>,
        timing_changed: bool,
    },
}

/// Single-writer side of the instance store
pub struct Registry {
    table: Arc<RwLock<Table>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table::default())),
        }
    }

    /// Read-only handle for other tasks
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            table: self.table.clone(),
        }
    }

    /// Insert a new instance in Init, or update in place if the key exists.
    pub async fn create(
        &mut self,
        config: InstanceConfig,
        bound_address: Option<Ipv4Addr>,
    ) -> Created {
        let key = config.key();
        let mut table = self.table.write().await;

        if let Some(slot) = table.slots.get(&key) {
            let instance = slot.instance.clone();
            drop(table);
            let timing_changed = apply(&instance, &InstanceUpdate::replace_all(&config)).await;
            return Created::Updated {
                instance,
                timing_changed,
            };
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let instance = Arc::new(Instance::new(config, bound_address));
        table.order.insert(seq, key);
        table.slots.insert(
            key,
            Slot {
                seq,
                instance: instance.clone(),
            },
        );
        Created::Inserted(instance)
    }

    /// Apply a partial update; returns whether the protocol timing changed.
    pub async fn update(
        &mut self,
        key: InstanceKey,
        update: &InstanceUpdate,
    ) -> Result<(Arc<Instance>, bool), ConfigError> {
        let instance = self.get(key).await.ok_or(ConfigError::UnknownInstance(key))?;
        let timing_changed = apply(&instance, update).await;
        Ok((instance, timing_changed))
    }

    pub async fn delete(&mut self, key: InstanceKey) -> Option<Arc<Instance>> {
        let mut table = self.table.write().await;
        let slot = table.slots.remove(&key)?;
        table.order.remove(&slot.seq);
        Some(slot.instance)
    }

    pub async fn get(&self, key: InstanceKey) -> Option<Arc<Instance>> {
        self.table.read().await.slots.get(&key).map(|slot| slot.instance.clone())
    }

    /// Instances on one interface, in registration order
    pub async fn on_interface(&self, if_index: i32) -> Vec<Arc<Instance>> {
        let table = self.table.read().await;
        table
            .order
            .values()
            .filter(|key| key.if_index == if_index)
            .filter_map(|key| table.slots.get(key).map(|slot| slot.instance.clone()))
            .collect()
    }

    /// Every instance, in registration order
    pub async fn all(&self) -> Vec<Arc<Instance>> {
        let table = self.table.read().await;
        table
            .order
            .values()
            .filter_map(|key| table.slots.get(key).map(|slot| slot.instance.clone()))
            .collect()
    }

    pub async fn clear(&mut self) {
        let mut table = self.table.write().await;
        table.slots.clear();
        table.order.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn apply(instance: &Instance, update: &InstanceUpdate) -> bool {
    let mut params = instance.params.write().await;
    let timing_changed = update.apply_to(&mut params.config);
    if timing_changed {
        params.recompute();
    }
    timing_changed
}

/// Read side of the registry, safe to use from any task
#[derive(Clone)]
pub struct RegistryHandle {
    table: Arc<RwLock<Table>>,
}

impl RegistryHandle {
    pub async fn contains(&self, key: InstanceKey) -> bool {
        self.table.read().await.slots.contains_key(&key)
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, key: InstanceKey) -> Option<InstanceSnapshot> {
        let instance = self.table.read().await.slots.get(&key).map(|slot| slot.instance.clone())?;
        Some(instance.snapshot().await)
    }

    /// Page through instances in registration order.
    ///
    /// `next_index` is 0 once the page reaches the end of the registry.
    pub async fn bulk(&self, start: usize, count: usize) -> BulkState {
        let (instances, total) = {
            let table = self.table.read().await;
            let instances: Vec<Arc<Instance>> = table
                .order
                .values()
                .skip(start)
                .take(count)
                .filter_map(|key| table.slots.get(key).map(|slot| slot.instance.clone()))
                .collect();
            (instances, table.order.len())
        };

        let mut entries = Vec::with_capacity(instances.len());
        for instance in instances {
            entries.push(instance.snapshot().await);
        }

        let end = start + entries.len();
        BulkState {
            next_index: if end < total { end } else { 0 },
            count: entries.len(),
            entries,
        }
    }
}
