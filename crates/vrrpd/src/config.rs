//! Configuration loading and validation for the VRRP daemon

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};
use vrrp::{EngineSettings, InstanceConfig, RetryPolicy};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "VRRPD_CONFIG";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub bootstrap: BootstrapSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Interfaces known at startup
    #[serde(default)]
    pub interfaces: Vec<InterfaceSettings>,

    /// Instances created at startup
    #[serde(default)]
    pub instances: Vec<InstanceSettings>,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.bootstrap.validate()?;
        for interface in &self.interfaces {
            interface.validate()?;
        }
        for instance in &self.instances {
            instance.validate()?;
        }
        Ok(())
    }
}

/// Server-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    /// Capacity of each dispatcher channel
    #[validate(range(min = 1, max = 100000))]
    pub channel_size: usize,

    /// Listen address of the status and metrics endpoint
    #[validate(custom = "validate_listen_addr")]
    pub status_listen: String,
}

/// Adapter connection retry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BootstrapSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_retry_delay")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_retry_delay")]
    pub max_delay: Duration,

    #[validate(range(min = 1, max = 1000))]
    pub max_attempts: u32,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    /// "json" for structured output, plain text otherwise
    pub format: Option<String>,
}

/// A kernel interface the daemon runs VRRP on
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InterfaceSettings {
    #[validate(range(min = 1))]
    pub if_index: i32,

    #[validate(length(min = 1, max = 15))]
    pub name: String,

    /// Primary IPv4 address; read from the kernel when omitted
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

/// A VRRP instance created at startup
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InstanceSettings {
    #[validate(range(min = 1))]
    pub if_index: i32,

    #[validate(range(min = 1, max = 255))]
    pub vrid: u8,

    #[serde(default = "default_priority")]
    #[validate(range(min = 1, max = 255))]
    pub priority: u8,

    #[serde(default = "default_advert_interval")]
    pub advert_interval: u8,

    #[serde(default = "default_preempt")]
    pub preempt: bool,

    #[serde(default)]
    pub accept_mode: bool,

    pub virtual_ip: Ipv4Addr,
}

fn default_priority() -> u8 {
    vrrp::types::DEFAULT_PRIORITY
}

fn default_advert_interval() -> u8 {
    vrrp::types::DEFAULT_ADVERT_INTERVAL
}

fn default_preempt() -> bool {
    true
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            channel_size: 1024,
            status_listen: "127.0.0.1:9112".to_string(),
        }
    }
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            initial_delay: retry.initial_delay,
            max_delay: retry.max_delay,
            max_attempts: retry.max_attempts,
        }
    }
}

// Custom validators

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.parse::<std::net::SocketAddr>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("listen_addr_invalid"))
}

fn validate_retry_delay(delay: &Duration) -> Result<(), ValidationError> {
    let millis = delay.as_millis();
    if !(10..=300_000).contains(&millis) {
        return Err(ValidationError::new("retry_delay_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from `VRRPD_CONFIG` or the default search paths
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            tracing::info!("Loading configuration from {}: {}", CONFIG_ENV, path);
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/vrrpd/vrrpd.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./vrrpd.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/vrrpd/vrrpd.yaml"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            channel_size: self.server.channel_size,
            retry: RetryPolicy {
                initial_delay: self.bootstrap.initial_delay,
                max_delay: self.bootstrap.max_delay,
                max_attempts: self.bootstrap.max_attempts,
            },
        }
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or("info")
    }

    pub fn json_logs(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }
}

impl InstanceSettings {
    pub fn to_config(&self) -> InstanceConfig {
        InstanceConfig {
            if_index: self.if_index,
            vrid: self.vrid,
            priority: self.priority,
            advert_interval: self.advert_interval,
            preempt: self.preempt,
            accept_mode: self.accept_mode,
            virtual_ip: self.virtual_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level(), "info");
        assert!(!config.json_logs());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
server:
  channel_size: 256
  status_listen: "0.0.0.0:9112"

bootstrap:
  initial_delay: 250ms
  max_delay: 4s
  max_attempts: 10

logging:
  level: debug
  format: json

interfaces:
  - if_index: 3
    name: eth1
    address: 10.0.0.5

instances:
  - if_index: 3
    vrid: 1
    priority: 200
    virtual_ip: 10.0.0.254
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.channel_size, 256);
        assert_eq!(config.bootstrap.initial_delay, Duration::from_millis(250));
        assert!(config.json_logs());
        assert_eq!(config.interfaces[0].address, Some("10.0.0.5".parse().unwrap()));

        let instance = config.instances[0].to_config();
        assert_eq!(instance.priority, 200);
        assert_eq!(instance.advert_interval, 1);
        assert!(instance.preempt);

        let settings = config.engine_settings();
        assert_eq!(settings.channel_size, 256);
        assert_eq!(settings.retry.max_delay, Duration::from_secs(4));
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
logging:
  level: warn
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.status_listen, "127.0.0.1:9112");
        assert_eq!(config.bootstrap.initial_delay, Duration::from_millis(500));
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_invalid_vrid() {
        let yaml = r#"
instances:
  - if_index: 3
    vrid: 0  # Invalid: < 1
    virtual_ip: 10.0.0.254
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_invalid_priority() {
        let yaml = r#"
instances:
  - if_index: 3
    vrid: 1
    priority: 0  # Invalid: < 1
    virtual_ip: 10.0.0.254
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_interface_name() {
        let yaml = r#"
interfaces:
  - if_index: 3
    name: ""
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_listen_addr() {
        assert!(validate_listen_addr("127.0.0.1:9112").is_ok());
        assert!(validate_listen_addr("localhost").is_err());
    }

    #[test]
    fn test_invalid_retry_delay() {
        let yaml = r#"
bootstrap:
  initial_delay: 1ms  # Invalid: < 10ms
  max_delay: 4s
  max_attempts: 10
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            Config::from_yaml("instances: [ {vrid: }"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
