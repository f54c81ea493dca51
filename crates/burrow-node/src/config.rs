//! Node configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use burrow_nat::PunchConfig;

/// Top-level node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Listen address. Port 0 binds an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Where the node id is persisted. `None` keeps the identity
    /// in memory only.
    pub identity_path: Option<PathBuf>,

    /// Rendezvous topic string. Peers sharing a topic find each
    /// other through the DHT.
    pub topic: Option<String>,

    /// Optional shared passphrase. When set, all sessions on the
    /// topic use one offline-derived group key instead of per-peer
    /// ephemeral exchange results.
    pub passphrase: Option<String>,

    /// Discovery settings.
    pub discovery: DiscoverySettings,

    /// NAT traversal settings.
    pub nat: NatSettings,

    /// Connection and session settings.
    pub connection: ConnectionSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            identity_path: None,
            topic: None,
            passphrase: None,
            discovery: DiscoverySettings::default(),
            nat: NatSettings::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

/// DHT discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Well-known peers used to join the network.
    pub bootstrap_nodes: Vec<SocketAddr>,

    /// Bucket capacity and lookup width.
    pub k: usize,

    /// How often the node re-announces and re-walks its topic.
    pub announce_interval: Duration,

    /// Routing entries and stored announcements older than this are
    /// evicted.
    pub peer_ttl: Duration,

    /// Per-query response timeout.
    pub query_timeout: Duration,

    /// Buckets untouched for this long are refreshed with a
    /// synthetic lookup.
    pub bucket_refresh: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            k: 8,
            announce_interval: Duration::from_secs(300),
            peer_ttl: Duration::from_secs(30 * 60),
            query_timeout: Duration::from_secs(3),
            bucket_refresh: Duration::from_secs(15 * 60),
        }
    }
}

/// NAT traversal settings.
#[derive(Debug, Clone)]
pub struct NatSettings {
    /// STUN servers tried in order at startup.
    pub stun_servers: Vec<SocketAddr>,

    /// STUN probe timeout per server.
    pub stun_timeout: Duration,

    /// Hole punch burst shape.
    pub punch: PunchConfig,
}

impl Default for NatSettings {
    fn default() -> Self {
        Self {
            stun_servers: Vec::new(),
            stun_timeout: Duration::from_secs(3),
            punch: PunchConfig::default(),
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// A handshake not finished within this window is reported as
    /// failed and the connection closed.
    pub handshake_timeout: Duration,

    /// Keepalive ping spacing on established connections.
    pub keepalive_interval: Duration,

    /// Silence beyond keepalive plus this grace marks the peer
    /// unreachable.
    pub keepalive_grace: Duration,

    /// Cap on concurrent in-flight handshakes and punches.
    pub max_inflight_handshakes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            keepalive_grace: Duration::from_secs(15),
            max_inflight_handshakes: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.discovery.bootstrap_nodes.is_empty());
        assert!(config.connection.handshake_timeout > Duration::ZERO);
        assert!(config.nat.punch.attempts >= 10);
    }
}
