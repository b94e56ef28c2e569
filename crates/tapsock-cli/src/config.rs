//! Configuration system for the tapsock CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use tapsock_core::{NetworkId, StackConfig};
use tapsock_stack::{IpCidr, MacAddress, Route, TapConfig};

/// tapsock configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Buffering, limits and timers
    #[serde(default)]
    pub stack: StackConfig,
    /// The Tap joined by this node
    #[serde(default)]
    pub tap: TapSection,
    /// UDP transport carrying Ethernet frames between nodes
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapSection {
    /// Network id, 16 hex digits
    #[serde(default = "default_network")]
    pub network: NetworkId,
    /// Interface MAC; derived from the network id and a random node id when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
    /// IP-level MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Assigned addresses
    #[serde(default)]
    pub addresses: Vec<IpCidr>,
    /// Managed routes, in match order
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Local UDP address
    #[serde(default = "default_bridge_listen")]
    pub listen: String,
    /// Remote bridges every outbound frame is sent to
    #[serde(default)]
    pub peers: Vec<String>,
    /// Outbound frames buffered before new ones are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_network() -> NetworkId {
    NetworkId(0x8056_c2e2_1c00_0001)
}

fn default_mtu() -> usize {
    tapsock_core::MAX_MTU
}

fn default_bridge_listen() -> String {
    "0.0.0.0:9993".to_string()
}

fn default_queue_depth() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TapSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            mac: None,
            mtu: default_mtu(),
            addresses: Vec::new(),
            routes: Vec::new(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: default_bridge_listen(),
            peers: Vec::new(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TapSection {
    /// Build the Tap configuration, deriving a MAC if none is set
    pub fn to_tap_config(&self) -> TapConfig {
        let mac = self
            .mac
            .unwrap_or_else(|| MacAddress::from_network_and_node(self.network, rand::random()));
        let mut config = TapConfig::new(self.network, mac).with_mtu(self.mtu);
        config.addresses = self.addresses.clone();
        config.routes = self.routes.clone();
        config
    }
}

impl BridgeConfig {
    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listen.parse()?)
    }

    /// Parse the peer addresses
    ///
    /// # Errors
    ///
    /// Returns an error naming the first peer that cannot be parsed.
    pub fn peer_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.peers
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|_| anyhow::anyhow!("invalid bridge peer '{}'", p))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.stack.validate().map_err(|e| anyhow::anyhow!(e))?;
        self.tap.to_tap_config().validate()?;

        if self.tap.addresses.is_empty() {
            anyhow::bail!("tap has no addresses; add at least one to [tap] addresses");
        }

        self.bridge.listen_addr()?;
        self.bridge.peer_addrs()?;
        if self.bridge.queue_depth == 0 {
            anyhow::bail!("bridge queue depth must be at least 1");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
