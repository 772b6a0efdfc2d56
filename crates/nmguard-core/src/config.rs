//! Daemon Configuration
//!
//! Loaded once at startup from TOML or JSON (picked by file extension).
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! virtual_device = "proton0"
//! max_attempts = 100
//! retry_delay_ms = 5000
//! killswitch = "hard"
//!
//! [metadata]
//! backend = "json_files"
//! dir = "/var/lib/nmguard"
//! ```

use crate::kill_switch::KillSwitchPolicy;
use crate::metadata::MetadataBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable holding the config file path
pub const CONFIG_ENV: &str = "NMGUARD_CONFIG";

/// A named dummy interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyInterface {
    /// NetworkManager connection id
    pub connection: String,
    /// Kernel interface name
    pub interface: String,
}

impl DummyInterface {
    pub fn new(connection: &str, interface: &str) -> Self {
        Self {
            connection: connection.to_string(),
            interface: interface.to_string(),
        }
    }
}

/// Names and addressing of the dummy interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default = "default_ipv4_address")]
    pub ipv4_address: String,
    #[serde(default = "default_ipv4_gateway")]
    pub ipv4_gateway: String,
    #[serde(default = "default_ipv6_address")]
    pub ipv6_address: String,
    #[serde(default = "default_ipv6_gateway")]
    pub ipv6_gateway: String,
    /// Negative: these DNS servers win over every other connection
    #[serde(default = "default_dns_priority")]
    pub dns_priority: i32,
    #[serde(default = "default_blocking_metric")]
    pub blocking_metric: u32,
    /// Below the blocking metric, above the tunnel's
    #[serde(default = "default_routed_metric")]
    pub routed_metric: u32,
    #[serde(default = "default_ipv6_metric")]
    pub ipv6_metric: u32,
    #[serde(default = "default_blocking")]
    pub blocking: DummyInterface,
    #[serde(default = "default_routed")]
    pub routed: DummyInterface,
    #[serde(default = "default_ipv6_guard")]
    pub ipv6_guard: DummyInterface,
}

fn default_blocking() -> DummyInterface {
    DummyInterface::new("pvpn-killswitch", "pvpnksintrf0")
}

fn default_routed() -> DummyInterface {
    DummyInterface::new("pvpn-routed-killswitch", "pvpnroutintrf0")
}

fn default_ipv6_guard() -> DummyInterface {
    DummyInterface::new("pvpn-ipv6leak-protection", "ipv6leakintrf0")
}

fn default_ipv4_address() -> String {
    "100.85.0.1/24".to_string()
}

fn default_ipv4_gateway() -> String {
    "100.85.0.1".to_string()
}

fn default_ipv6_address() -> String {
    "fdeb:446c:912d:08da::/64".to_string()
}

fn default_ipv6_gateway() -> String {
    "fdeb:446c:912d:08da::1".to_string()
}

fn default_dns_priority() -> i32 {
    -1400
}

fn default_blocking_metric() -> u32 {
    98
}

fn default_routed_metric() -> u32 {
    97
}

fn default_ipv6_metric() -> u32 {
    95
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            blocking: default_blocking(),
            routed: default_routed(),
            ipv6_guard: default_ipv6_guard(),
            ipv4_address: default_ipv4_address(),
            ipv4_gateway: default_ipv4_gateway(),
            ipv6_address: default_ipv6_address(),
            ipv6_gateway: default_ipv6_gateway(),
            dns_priority: default_dns_priority(),
            blocking_metric: default_blocking_metric(),
            routed_metric: default_routed_metric(),
            ipv6_metric: default_ipv6_metric(),
        }
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Virtual device the tunnel connection is bound to
    #[serde(default = "default_virtual_device")]
    pub virtual_device: String,
    /// Reconnect attempts before giving up (0 = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between reconnect attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub killswitch: KillSwitchPolicy,
    #[serde(default = "default_true")]
    pub ipv6_leak_protection: bool,
    /// Only select secure-core servers
    #[serde(default)]
    pub secure_core: bool,
    /// Subscription tier of the account
    #[serde(default)]
    pub user_tier: u8,
    /// Server list cache, used to resolve names when metadata lacks an IP
    #[serde(default)]
    pub server_cache: Option<PathBuf>,
    /// How long a foreground connect waits for the tunnel
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub metadata: MetadataBackend,
    #[serde(default)]
    pub interfaces: InterfaceConfig,
}

fn default_virtual_device() -> String {
    "proton0".to_string()
}

fn default_max_attempts() -> u32 {
    100
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            virtual_device: default_virtual_device(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            killswitch: KillSwitchPolicy::default(),
            ipv6_leak_protection: true,
            secure_core: false,
            user_tier: 0,
            metadata: MetadataBackend::default(),
            server_cache: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            interfaces: InterfaceConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load and validate, picking the format from the extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the path in `NMGUARD_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => {
                info!("{} not set, using default configuration", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_device.trim().is_empty() {
            return Err(ConfigError::Invalid("virtual_device is empty".into()));
        }
        if self.retry_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry_delay_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),
}
