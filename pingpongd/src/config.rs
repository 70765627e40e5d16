use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::{DEFAULT_ID_PREFIX, DEFAULT_PAYLOAD, DEFAULT_REQUEST_TIMEOUT_MS};
use crate::identity::SuffixSource;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub suffix: SuffixSource,
    /// Address the connection server binds to; the port is always OS-assigned
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Address put in the advertisement; detected automatically when unset
    #[serde(default)]
    pub advertise_address: Option<IpAddr>,
    #[serde(default = "default_payload")]
    pub payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Bound on connect, read and write for peer requests and served connections
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// Restrict mDNS to one interface, e.g. "eth0"
    #[serde(default)]
    pub interface: Option<String>,
    /// Browse the service type right away instead of waiting for it to be announced
    #[serde(default)]
    pub eager_browse: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub setup_command: Option<String>,
    #[serde(default)]
    pub teardown_command: Option<String>,
}

fn default_prefix() -> String {
    DEFAULT_ID_PREFIX.to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_payload() -> String {
    DEFAULT_PAYLOAD.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_api_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            suffix: SuffixSource::default(),
            bind_address: default_bind_address(),
            advertise_address: None,
            payload: default_payload(),
        }
    }
}

impl NodeConfig {
    pub fn advertise_addresses(&self) -> Vec<IpAddr> {
        self.advertise_address.into_iter().collect()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.request_timeout_ms == 0 {
            bail!("network.request_timeout_ms must be greater than zero");
        }
        if self.node.payload.is_empty() {
            bail!("node.payload must not be empty");
        }
        Ok(())
    }
}
