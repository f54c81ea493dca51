//! Configuration file for the Burrow CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_node::NodeConfig;

/// Burrow configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// NAT traversal configuration
    #[serde(default)]
    pub nat: NatConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Node id file path
    #[serde(default = "default_identity_file")]
    pub file: PathBuf,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// DHT bootstrap nodes
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    /// Seconds between topic announce rounds
    #[serde(default = "default_announce_secs")]
    pub announce_secs: u64,
}

/// NAT traversal configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NatConfig {
    /// STUN servers, host:port
    #[serde(default)]
    pub stun_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_identity_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("burrow/node.id")
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_announce_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            file: default_identity_file(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            announce_secs: default_announce_secs(),
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

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("burrow/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid listen_addr {:?}: {err}", self.network.listen_addr))
    }

    /// Build the node configuration this file describes.
    ///
    /// Bootstrap and STUN hostnames are resolved here so the node
    /// only ever sees socket addresses.
    ///
    /// # Errors
    ///
    /// Returns an error on an unparseable listen address or when a
    /// bootstrap or STUN host does not resolve.
    pub async fn to_node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut node = NodeConfig {
            listen_addr: self.parse_listen_addr()?,
            identity_path: Some(self.identity.file.clone()),
            ..NodeConfig::default()
        };
        node.discovery.announce_interval = Duration::from_secs(self.discovery.announce_secs);
        node.discovery.bootstrap_nodes = resolve_all(&self.discovery.bootstrap_nodes).await?;
        node.nat.stun_servers = resolve_all(&self.nat.stun_servers).await?;
        Ok(node)
    }
}

/// Resolve a list of host:port strings to socket addresses, keeping
/// the first address each host resolves to.
pub async fn resolve_all(hosts: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut out = Vec::with_capacity(hosts.len());
    for host in hosts {
        let mut addrs = tokio::net::lookup_host(host.as_str())
            .await
            .map_err(|err| anyhow::anyhow!("cannot resolve {host:?}: {err}"))?;
        let addr = addrs
            .next()
            .ok_or_else(|| anyhow::anyhow!("{host:?} resolved to no addresses"))?;
        out.push(addr);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.network.listen_addr = "127.0.0.1:4242".into();
        config.discovery.bootstrap_nodes = vec!["10.0.0.1:6881".into()];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.network.listen_addr, "127.0.0.1:4242");
        assert_eq!(loaded.discovery.bootstrap_nodes, vec!["10.0.0.1:6881"]);
        assert_eq!(loaded.discovery.announce_secs, 300);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[network]\nlisten_addr = \"0.0.0.0:7777\"\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.network.listen_addr, "0.0.0.0:7777");
        assert_eq!(loaded.logging.level, "info");
        assert!(loaded.nat.stun_servers.is_empty());
    }

    #[tokio::test]
    async fn test_to_node_config_resolves_literals() {
        let mut config = Config::default();
        config.network.listen_addr = "127.0.0.1:0".into();
        config.discovery.bootstrap_nodes = vec!["127.0.0.1:6881".into()];

        let node = config.to_node_config().await.unwrap();
        assert_eq!(
            node.discovery.bootstrap_nodes,
            vec!["127.0.0.1:6881".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_bad_listen_addr_rejected() {
        let mut config = Config::default();
        config.network.listen_addr = "not-an-address".into();
        assert!(config.parse_listen_addr().is_err());
    }
}
