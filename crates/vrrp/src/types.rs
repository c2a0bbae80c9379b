//! VRRP data types and structures.
//!
//! Based on RFC 3768: Virtual Router Redundancy Protocol (VRRP)

use crate::error::ConfigError;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// VRRP protocol version carried in advertisements
pub const VRRP_VERSION: u8 = 2;

/// VRRP IP protocol number
pub const VRRP_PROTOCOL: u8 = 112;

/// VRRP multicast address for IPv4
pub const VRRP_MULTICAST_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// TTL every advertisement is sent with and must arrive with
pub const VRRP_TTL: u8 = 255;

/// Priority reserved for the router owning the virtual address
pub const OWNER_PRIORITY: u8 = 255;

/// Priority advertised by a master that is resigning
pub const RESIGN_PRIORITY: u8 = 0;

/// Default priority for backup routers
pub const DEFAULT_PRIORITY: u8 = 100;

/// Default advertisement interval (seconds)
pub const DEFAULT_ADVERT_INTERVAL: u8 = 1;

/// Capture filter handed to the switch adapter when binding an interface
pub const CAPTURE_FILTER: &str = "ip proto 112 and dst host 224.0.0.18";

/// IEEE assigned prefix of the virtual router MAC address
const VIRTUAL_MAC_PREFIX: &str = "00:00:5e:00:01";

/// Identity of one redundancy-group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceKey {
    pub if_index: i32,
    pub vrid: u8,
}

impl InstanceKey {
    pub fn new(if_index: i32, vrid: u8) -> Self {
        Self { if_index, vrid }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.if_index, self.vrid)
    }
}

/// VRRP state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VrrpState {
    /// Initial state - not yet initialized, or parked while the link is down
    Init,
    /// Backup state - monitoring for master failures
    Backup,
    /// Master state - sending advertisements
    Master,
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrrpState::Init => write!(f, "INIT"),
            VrrpState::Backup => write!(f, "BACKUP"),
            VrrpState::Master => write!(f, "MASTER"),
        }
    }
}

/// Management-set configuration of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Logical interface the group lives on (immutable once created)
    pub if_index: i32,

    /// Virtual Router ID (1-255, immutable once created)
    pub vrid: u8,

    /// Priority for this router (1-255, 255 = IP address owner)
    pub priority: u8,

    /// Advertisement interval in seconds
    pub advert_interval: u8,

    /// Whether a higher priority backup may take over from a lower priority master
    pub preempt: bool,

    /// Accept packets destined for the virtual IP even when not owner
    pub accept_mode: bool,

    /// Virtual IPv4 address protected by the group
    pub virtual_ip: Ipv4Addr,
}

impl InstanceConfig {
    /// Configuration with default priority, interval and preempt mode.
    pub fn new(if_index: i32, vrid: u8, virtual_ip: Ipv4Addr) -> Self {
        Self {
            if_index,
            vrid,
            priority: DEFAULT_PRIORITY,
            advert_interval: DEFAULT_ADVERT_INTERVAL,
            preempt: true,
            accept_mode: false,
            virtual_ip,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.if_index, self.vrid)
    }

    /// Validate configuration, normalising a zero advertisement interval to the default.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.vrid == 0 {
            return Err(ConfigError::InvalidVrid(self.vrid));
        }
        if self.priority == 0 {
            return Err(ConfigError::InvalidPriority(self.priority));
        }
        if self.advert_interval == 0 {
            self.advert_interval = DEFAULT_ADVERT_INTERVAL;
        }
        Ok(self)
    }

    /// Advertisement interval as a duration
    pub fn advert_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.advert_interval))
    }

    pub fn skew_time(&self) -> Duration {
        skew_time(self.priority)
    }

    pub fn master_down_interval(&self) -> Duration {
        master_down_interval(self.priority, self.advert_interval())
    }
}

/// Skew_Time = (256 - Priority) / 256 seconds
pub fn skew_time(priority: u8) -> Duration {
    // 1/256 s is exactly 3_906_250 ns
    Duration::from_nanos((256 - u64::from(priority)) * 3_906_250)
}

/// Master_Down_Interval = (3 * Advertisement_Interval) + Skew_Time
pub fn master_down_interval(priority: u8, advert_interval: Duration) -> Duration {
    advert_interval * 3 + skew_time(priority)
}

/// Virtual router MAC address derived from the VRID.
pub fn virtual_mac(vrid: u8) -> String {
    format!("{}:{:02x}", VIRTUAL_MAC_PREFIX, vrid)
}

/// Named configuration fields, used by management layers that report a dirty-field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    IfIndex,
    Vrid,
    Priority,
    AdvertInterval,
    Preempt,
    AcceptMode,
    VirtualIp,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigField::IfIndex => "if_index",
            ConfigField::Vrid => "vrid",
            ConfigField::Priority => "priority",
            ConfigField::AdvertInterval => "advert_interval",
            ConfigField::Preempt => "preempt",
            ConfigField::AcceptMode => "accept_mode",
            ConfigField::VirtualIp => "virtual_ip",
        };
        f.write_str(name)
    }
}

/// Partial update of the mutable configuration fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub priority: Option<u8>,
    pub advert_interval: Option<u8>,
    pub preempt: Option<bool>,
    pub accept_mode: Option<bool>,
    pub virtual_ip: Option<Ipv4Addr>,
}

impl InstanceUpdate {
    /// Build an update from a dirty-field set and a struct carrying the new values.
    ///
    /// Fails if the set names an immutable field.
    pub fn from_dirty<I>(dirty: I, values: &InstanceConfig) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = ConfigField>,
    {
        let mut update = Self::default();
        for field in dirty {
            match field {
                ConfigField::IfIndex | ConfigField::Vrid => {
                    return Err(ConfigError::ImmutableField(field));
                }
                ConfigField::Priority => update.priority = Some(values.priority),
                ConfigField::AdvertInterval => update.advert_interval = Some(values.advert_interval),
                ConfigField::Preempt => update.preempt = Some(values.preempt),
                ConfigField::AcceptMode => update.accept_mode = Some(values.accept_mode),
                ConfigField::VirtualIp => update.virtual_ip = Some(values.virtual_ip),
            }
        }
        Ok(update)
    }

    /// Update replacing every mutable field, used when a create hits an existing key.
    pub fn replace_all(config: &InstanceConfig) -> Self {
        Self {
            priority: Some(config.priority),
            advert_interval: Some(config.advert_interval),
            preempt: Some(config.preempt),
            accept_mode: Some(config.accept_mode),
            virtual_ip: Some(config.virtual_ip),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.priority == Some(0) {
            return Err(ConfigError::InvalidPriority(0));
        }
        if self.advert_interval == Some(0) {
            self.advert_interval = Some(DEFAULT_ADVERT_INTERVAL);
        }
        Ok(self)
    }

    /// Apply to a configuration; returns true when the protocol timers depend on a changed value.
    pub fn apply_to(&self, config: &mut InstanceConfig) -> bool {
        let mut timing_changed = false;

        if let Some(priority) = self.priority {
            timing_changed |= config.priority != priority;
            config.priority = priority;
        }
        if let Some(interval) = self.advert_interval {
            timing_changed |= config.advert_interval != interval;
            config.advert_interval = interval;
        }
        if let Some(preempt) = self.preempt {
            config.preempt = preempt;
        }
        if let Some(accept_mode) = self.accept_mode {
            config.accept_mode = accept_mode;
        }
        if let Some(virtual_ip) = self.virtual_ip {
            config.virtual_ip = virtual_ip;
        }

        timing_changed
    }
}

/// VRRP statistics for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VrrpStats {
    /// Number of transitions to Master state
    pub master_transitions: u64,

    /// Number of transitions to Backup state
    pub backup_transitions: u64,

    /// Advertisements sent
    pub adverts_sent: u64,

    /// Valid advertisements received
    pub adverts_received: u64,

    /// Priority zero advertisements received
    pub priority_zero_received: u64,
}

/// Packets dropped by the receive path, per failure class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropStats {
    pub malformed_length: u64,
    pub checksum_mismatch: u64,
    pub vrid_mismatch: u64,
    pub ttl_violation: u64,
}

/// Point-in-time view of one instance as served by the bulk-state query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub if_index: i32,
    pub vrid: u8,
    pub state: VrrpState,
    pub priority: u8,
    pub advert_interval: u8,
    pub preempt: bool,
    pub accept_mode: bool,
    pub virtual_ip: Ipv4Addr,
    pub bound_address: Option<Ipv4Addr>,
    pub virtual_mac: String,
    #[serde(with = "millis")]
    pub skew_time: Duration,
    #[serde(with = "millis")]
    pub master_down_interval: Duration,
    pub capture_bound: bool,
    pub stats: VrrpStats,
}

impl InstanceSnapshot {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.if_index, self.vrid)
    }
}

/// One page of the bulk-state query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkState {
    /// Index to resume from, 0 once the end of the registry was reached
    pub next_index: usize,
    pub count: usize,
    pub entries: Vec<InstanceSnapshot>,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_time_formula() {
        for priority in 1..=254u8 {
            let expected = (256.0 - f64::from(priority)) / 256.0;
            assert!((skew_time(priority).as_secs_f64() - expected).abs() < 1e-9);
        }
        assert_eq!(skew_time(100), Duration::from_nanos(609_375_000));
    }

    #[test]
    fn test_master_down_interval() {
        let config = InstanceConfig::new(1, 1, "192.168.1.1".parse().unwrap());

        // Master_Down_Interval = (3 * 1s) + (156 / 256)s = 3.609375s
        assert_eq!(config.master_down_interval(), Duration::from_nanos(3_609_375_000));

        for priority in 1..=254u8 {
            for interval in [1u64, 3, 10] {
                let t = Duration::from_secs(interval);
                assert_eq!(master_down_interval(priority, t), t * 3 + skew_time(priority));
            }
        }
    }

    #[test]
    fn test_config_validation() {
        let config = InstanceConfig::new(1, 1, "192.168.1.1".parse().unwrap());
        assert!(config.clone().validate().is_ok());

        let mut invalid = config.clone();
        invalid.vrid = 0;
        assert_eq!(invalid.validate(), Err(ConfigError::InvalidVrid(0)));

        let mut invalid = config.clone();
        invalid.priority = 0;
        assert_eq!(invalid.validate(), Err(ConfigError::InvalidPriority(0)));

        let mut zero_interval = config;
        zero_interval.advert_interval = 0;
        assert_eq!(zero_interval.validate().unwrap().advert_interval, 1);
    }

    #[test]
    fn test_virtual_mac() {
        assert_eq!(virtual_mac(1), "00:00:5e:00:01:01");
        assert_eq!(virtual_mac(10), "00:00:5e:00:01:0a");
        assert_eq!(virtual_mac(255), "00:00:5e:00:01:ff");
    }

    #[test]
    fn test_update_from_dirty_fields() {
        let mut values = InstanceConfig::new(7, 3, "10.0.0.254".parse().unwrap());
        values.priority = 200;
        values.preempt = false;

        let update =
            InstanceUpdate::from_dirty([ConfigField::Priority, ConfigField::Preempt], &values).unwrap();
        assert_eq!(update.priority, Some(200));
        assert_eq!(update.preempt, Some(false));
        assert_eq!(update.advert_interval, None);

        let err = InstanceUpdate::from_dirty([ConfigField::Vrid], &values).unwrap_err();
        assert_eq!(err, ConfigError::ImmutableField(ConfigField::Vrid));
    }

    #[test]
    fn test_update_reports_timing_changes() {
        let mut config = InstanceConfig::new(7, 3, "10.0.0.254".parse().unwrap());

        let update = InstanceUpdate {
            accept_mode: Some(true),
            ..Default::default()
        };
        assert!(!update.apply_to(&mut config));
        assert!(config.accept_mode);

        let update = InstanceUpdate {
            advert_interval: Some(3),
            ..Default::default()
        };
        assert!(update.apply_to(&mut config));
        assert_eq!(config.advert_interval(), Duration::from_secs(3));

        // Same value again is not a change
        assert!(!update.apply_to(&mut config));
    }
}
