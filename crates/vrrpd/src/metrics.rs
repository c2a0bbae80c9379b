//! Prometheus metrics for the VRRP daemon.
//!
//! Values are taken from instance snapshots at scrape time; the engine itself
//! only keeps plain counters.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashSet;
use std::sync::Mutex;
use vrrp::{DropStats, InstanceSnapshot, VrrpState};

/// Labels for per-instance metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub if_index: String,
    pub vrid: String,
}

impl InstanceLabels {
    fn of(snapshot: &InstanceSnapshot) -> Self {
        Self {
            if_index: snapshot.if_index.to_string(),
            vrid: snapshot.vrid.to_string(),
        }
    }
}

/// Labels for dropped packet metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// malformed_length, checksum_mismatch, vrid_mismatch, ttl_violation
    pub reason: String,
}

pub struct MetricsRegistry {
    pub registry: Registry,

    /// Current state (0=init, 1=backup, 2=master)
    state: Family<InstanceLabels, Gauge>,
    priority: Family<InstanceLabels, Gauge>,
    master_transitions: Family<InstanceLabels, Counter>,
    backup_transitions: Family<InstanceLabels, Counter>,
    adverts_sent: Family<InstanceLabels, Counter>,
    adverts_received: Family<InstanceLabels, Counter>,
    priority_zero_received: Family<InstanceLabels, Counter>,

    instances: Gauge,
    packets_dropped: Family<DropLabels, Counter>,

    /// Instances exported by the last refresh; also serializes concurrent scrapes
    exported: Mutex<HashSet<InstanceLabels>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let state = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "vrrp_instance_state",
            "Current VRRP state (0=init, 1=backup, 2=master)",
            state.clone(),
        );

        let priority = Family::<InstanceLabels, Gauge>::default();
        registry.register(
            "vrrp_instance_priority",
            "Configured priority",
            priority.clone(),
        );

        let master_transitions = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vrrp_master_transitions",
            "Transitions to master",
            master_transitions.clone(),
        );

        let backup_transitions = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vrrp_backup_transitions",
            "Transitions to backup",
            backup_transitions.clone(),
        );

        let adverts_sent = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vrrp_adverts_sent",
            "Advertisements sent",
            adverts_sent.clone(),
        );

        let adverts_received = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vrrp_adverts_received",
            "Valid advertisements received",
            adverts_received.clone(),
        );

        let priority_zero_received = Family::<InstanceLabels, Counter>::default();
        registry.register(
            "vrrp_priority_zero_received",
            "Priority zero advertisements received",
            priority_zero_received.clone(),
        );

        let instances = Gauge::default();
        registry.register("vrrp_instances", "Configured VRRP instances", instances.clone());

        let packets_dropped = Family::<DropLabels, Counter>::default();
        registry.register(
            "vrrp_packets_dropped",
            "Received packets dropped by reason",
            packets_dropped.clone(),
        );

        Self {
            registry,
            state,
            priority,
            master_transitions,
            backup_transitions,
            adverts_sent,
            adverts_received,
            priority_zero_received,
            instances,
            packets_dropped,
            exported: Mutex::new(HashSet::new()),
        }
    }

    /// Bring every series up to date with the current snapshots
    pub fn refresh(&self, snapshots: &[InstanceSnapshot], drops: &DropStats) {
        let mut exported = self.exported.lock().unwrap_or_else(|e| e.into_inner());

        // Deleted instances drop out of every per-instance family
        let current: HashSet<InstanceLabels> = snapshots.iter().map(InstanceLabels::of).collect();
        for labels in exported.difference(&current) {
            for family in self.counter_families() {
                family.remove(labels);
            }
        }
        self.state.clear();
        self.priority.clear();
        self.instances.set(snapshots.len() as i64);

        for snapshot in snapshots {
            let labels = InstanceLabels::of(snapshot);
            let state = match snapshot.state {
                VrrpState::Init => 0,
                VrrpState::Backup => 1,
                VrrpState::Master => 2,
            };
            self.state.get_or_create(&labels).set(state);
            self.priority
                .get_or_create(&labels)
                .set(i64::from(snapshot.priority));

            let stats = &snapshot.stats;
            advance(&self.master_transitions, &labels, stats.master_transitions);
            advance(&self.backup_transitions, &labels, stats.backup_transitions);
            advance(&self.adverts_sent, &labels, stats.adverts_sent);
            advance(&self.adverts_received, &labels, stats.adverts_received);
            advance(&self.priority_zero_received, &labels, stats.priority_zero_received);
        }
        *exported = current;

        for (reason, value) in [
            ("malformed_length", drops.malformed_length),
            ("checksum_mismatch", drops.checksum_mismatch),
            ("vrid_mismatch", drops.vrid_mismatch),
            ("ttl_violation", drops.ttl_violation),
        ] {
            let labels = DropLabels {
                reason: reason.to_string(),
            };
            advance(&self.packets_dropped, &labels, value);
        }
    }

    fn counter_families(&self) -> [&Family<InstanceLabels, Counter>; 5] {
        [
            &self.master_transitions,
            &self.backup_transitions,
            &self.adverts_sent,
            &self.adverts_received,
            &self.priority_zero_received,
        ]
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Move a counter to an absolute value.
///
/// A value below the exported one means the instance was re-created between
/// scrapes, so the series starts over.
fn advance<L>(family: &Family<L, Counter>, labels: &L, value: u64)
where
    L: Clone + std::hash::Hash + Eq,
{
    let current = family.get_or_create(labels).get();
    if value < current {
        family.remove(labels);
        family.get_or_create(labels).inc_by(value);
    } else if value > current {
        family.get_or_create(labels).inc_by(value - current);
    }
}
