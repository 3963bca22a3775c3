//! Ringmesh Configuration System
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./ringmesh.yaml` (current directory - highest priority)
//! 2. `~/.config/ringmesh/ringmesh.yaml` (user config directory)
//! 3. `/etc/ringmesh/ringmesh.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files.
//!
//! # YAML Structure
//!
//! ```yaml
//! node:
//!   address: "00112233445566778899aabbccddeeff00112232"
//! routing:
//!   max_ttl: 30
//!   max_uphill_hops: 1
//! status:
//!   max_neighbors: 4
//! transports:
//!   udp:
//!     port: 7740
//!     local_tas:
//!       - "ringmesh.udp://203.0.113.7:7740"
//! ```

use crate::address::{Address, AddressError};
use crate::router::{MAX_TTL, MAX_UPHILL_HOPS};
use crate::status::MAX_NEIGHBORS;
use crate::transport::{TaError, TransportAddress};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "ringmesh.yaml";

/// Default outbound queue bound before messages are dropped.
const DEFAULT_SEND_QUEUE_CAP: usize = 1024;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("address error: {0}")]
    Address(#[from] AddressError),

    #[error("transport address error: {0}")]
    Ta(#[from] TaError),
}

/// Node configuration (`node.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Ring address as 40 hex characters (`node.address`).
    /// If not specified, a random address is generated at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Routing knobs (`routing.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Hop limit before packets are dropped (`routing.max_ttl`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ttl: Option<u32>,

    /// Annealing uphill budget (`routing.max_uphill_hops`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uphill_hops: Option<u32>,
}

impl RoutingConfig {
    /// Hop limit, defaulting to 30.
    pub fn max_ttl(&self) -> u32 {
        self.max_ttl.unwrap_or(MAX_TTL)
    }

    /// Uphill budget, defaulting to 1.
    pub fn max_uphill_hops(&self) -> u32 {
        self.max_uphill_hops.unwrap_or(MAX_UPHILL_HOPS)
    }
}

/// Status-exchange knobs (`status.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Neighbor-list size in a status push (`status.max_neighbors`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_neighbors: Option<usize>,
}

impl StatusConfig {
    /// Neighbor-list size, defaulting to 4.
    pub fn max_neighbors(&self) -> usize {
        self.max_neighbors.unwrap_or(MAX_NEIGHBORS)
    }
}

/// UDP transport configuration (`transports.udp.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Bind host (`transports.udp.bind_host`), default all interfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<String>,

    /// Bind port (`transports.udp.port`), 0 picks an ephemeral port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Advertised address overrides (`transports.udp.local_tas`).
    /// When empty the bound socket address is advertised.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub local_tas: Vec<String>,

    /// Outbound queue bound (`transports.udp.send_queue_cap`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_queue_cap: Option<usize>,
}

impl UdpConfig {
    /// Socket bind address string.
    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.bind_host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(0)
        )
    }

    /// Send-queue bound, defaulting to 1024.
    pub fn send_queue_cap(&self) -> usize {
        self.send_queue_cap.unwrap_or(DEFAULT_SEND_QUEUE_CAP)
    }

    /// Parse the configured advertised addresses.
    pub fn parsed_local_tas(&self) -> Result<Vec<TransportAddress>, TaError> {
        self.local_tas.iter().map(|s| s.parse()).collect()
    }
}

/// Transport instances (`transports.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportsConfig {
    /// The UDP edge listener (`transports.udp`).
    #[serde(default)]
    pub udp: UdpConfig,
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Node configuration (`node.*`).
    #[serde(default)]
    pub node: NodeConfig,

    /// Routing knobs (`routing.*`).
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Status-exchange knobs (`status.*`).
    #[serde(default)]
    pub status: StatusConfig,

    /// Transport instances (`transports.*`).
    #[serde(default)]
    pub transports: TransportsConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns a
    /// tuple of (config, paths_loaded).
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let search_paths = Self::search_paths();
        Self::load_from_paths(&search_paths)
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier
    /// ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/ringmesh").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ringmesh").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.node.address.is_some() {
            self.node.address = other.node.address;
        }
        if other.routing.max_ttl.is_some() {
            self.routing.max_ttl = other.routing.max_ttl;
        }
        if other.routing.max_uphill_hops.is_some() {
            self.routing.max_uphill_hops = other.routing.max_uphill_hops;
        }
        if other.status.max_neighbors.is_some() {
            self.status.max_neighbors = other.status.max_neighbors;
        }
        if other.transports.udp.bind_host.is_some() {
            self.transports.udp.bind_host = other.transports.udp.bind_host;
        }
        if other.transports.udp.port.is_some() {
            self.transports.udp.port = other.transports.udp.port;
        }
        if !other.transports.udp.local_tas.is_empty() {
            self.transports.udp.local_tas = other.transports.udp.local_tas;
        }
        if other.transports.udp.send_queue_cap.is_some() {
            self.transports.udp.send_queue_cap = other.transports.udp.send_queue_cap;
        }
    }

    /// Create the node's ring address from this configuration.
    ///
    /// If an address is configured, parses it; otherwise generates a
    /// random one.
    pub fn create_address(&self) -> Result<Address, ConfigError> {
        match &self.node.address {
            Some(hex) => Ok(Address::from_hex(hex)?),
            None => Ok(Address::random()),
        }
    }

    /// Check if an address is configured (vs. will be generated).
    pub fn has_address(&self) -> bool {
        self.node.address.is_some()
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
