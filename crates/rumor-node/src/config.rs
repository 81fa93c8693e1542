//! Node configuration.
//!
//! Read from a TOML file:
//!
//! ```toml
//! cluster_name = "production"
//! bind_address = "0.0.0.0"
//! udp_port = 7946
//! tcp_port = 7947
//! seeds = ["10.0.0.1:7946", "node-2.internal:7946"]
//!
//! [gossip]
//! gossip_interval_ms = 1000
//! fanout = 3
//!
//! [attributes]
//! role = "db"
//! ```

use crate::error::NodeError;
use rumor_core::GossipConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Gossip tunables, in milliseconds where they are durations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GossipTuning {
    /// Interval between gossip rounds.
    pub gossip_interval_ms: u64,
    /// Partners contacted per round.
    pub fanout: usize,
    /// Hop budget of our own snapshots.
    pub max_hops: u8,
    /// Full payload rounds after a local change.
    pub burst_rounds: u32,
    /// Interval between anti-entropy exchanges; 0 disables them.
    pub resync_interval_ms: u64,
    /// Delay before retrying a failed exchange.
    pub resync_retry_delay_ms: u64,
    /// Upper bound on one exchange.
    pub resync_timeout_ms: u64,
    /// Silence before a member is probed.
    pub probe_timeout_ms: u64,
    /// How long departed members are remembered.
    pub eviction_timeout_ms: u64,
    /// Interval between member table scans.
    pub prune_interval_ms: u64,
    /// Relayed snapshots per datagram.
    pub max_relay_batch: usize,
}

impl Default for GossipTuning {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 1_000,
            fanout: 3,
            max_hops: 3,
            burst_rounds: 5,
            resync_interval_ms: 30_000,
            resync_retry_delay_ms: 2_000,
            resync_timeout_ms: 5_000,
            probe_timeout_ms: 10_000,
            eviction_timeout_ms: 60_000,
            prune_interval_ms: 1_000,
            max_relay_batch: 32,
        }
    }
}

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Cluster to join.
    pub cluster_name: String,
    /// Address both sockets bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Gossip datagram port. 0 picks an ephemeral port.
    #[serde(default)]
    pub udp_port: u16,
    /// Resynchronisation stream port. 0 picks an ephemeral port.
    #[serde(default)]
    pub tcp_port: u16,
    /// Seed peers as `host:port`.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Refuse to merge members only heard of through third parties.
    #[serde(default)]
    pub prevent_indirect_discovery: bool,
    /// Gossip tunables.
    #[serde(default)]
    pub gossip: GossipTuning,
    /// Attributes advertised from startup.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl NodeConfig {
    /// Creates a config for `cluster_name` with defaults everywhere else.
    #[must_use]
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            bind_address: default_bind_address(),
            udp_port: 0,
            tcp_port: 0,
            seeds: Vec::new(),
            prevent_indirect_discovery: false,
            gossip: GossipTuning::default(),
            attributes: BTreeMap::new(),
        }
    }

    /// Sample configuration written by `rumord init-config`.
    #[must_use]
    pub fn sample() -> Self {
        Self {
            udp_port: 7946,
            tcp_port: 7947,
            seeds: vec!["127.0.0.1:7946".to_string()],
            attributes: BTreeMap::from([("role".to_string(), "worker".to_string())]),
            ..Self::new("default")
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, NodeError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, NodeError> {
        toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.cluster_name.is_empty() {
            return Err(NodeError::Config("cluster name cannot be empty".to_string()));
        }

        if self.gossip.fanout == 0 {
            return Err(NodeError::Config("fanout must be at least 1".to_string()));
        }

        for (name, value) in [
            ("gossip_interval_ms", self.gossip.gossip_interval_ms),
            ("prune_interval_ms", self.gossip.prune_interval_ms),
            ("resync_timeout_ms", self.gossip.resync_timeout_ms),
        ] {
            if value == 0 {
                return Err(NodeError::Config(format!("{name} must be non-zero")));
            }
        }

        for seed in &self.seeds {
            parse_seed(seed)?;
        }

        for key in self.attributes.keys() {
            if key.is_empty() {
                return Err(NodeError::Config("attribute keys cannot be empty".to_string()));
            }
        }

        Ok(())
    }

    /// Resolves the seed list, skipping names that do not resolve.
    pub async fn resolve_seeds(&self) -> Vec<SocketAddr> {
        let mut resolved = Vec::new();
        for seed in &self.seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addresses) => resolved.extend(addresses),
                Err(err) => tracing::warn!(seed = %seed, error = %err, "seed does not resolve"),
            }
        }
        resolved.sort_unstable();
        resolved.dedup();
        resolved
    }

    /// Builds the engine configuration for the given resolved seeds.
    #[must_use]
    pub fn gossip_config(&self, seeds: Vec<SocketAddr>) -> GossipConfig {
        let tuning = &self.gossip;
        let resync_interval = (tuning.resync_interval_ms > 0)
            .then(|| Duration::from_millis(tuning.resync_interval_ms));
        GossipConfig::new(self.cluster_name.clone())
            .with_seeds(seeds)
            .with_gossip_interval(Duration::from_millis(tuning.gossip_interval_ms))
            .with_fanout(tuning.fanout)
            .with_max_hops(tuning.max_hops)
            .with_burst_rounds(tuning.burst_rounds)
            .with_resync_interval(resync_interval)
            .with_resync_timing(
                Duration::from_millis(tuning.resync_retry_delay_ms),
                Duration::from_millis(tuning.resync_timeout_ms),
            )
            .with_failure_timeouts(
                Duration::from_millis(tuning.probe_timeout_ms),
                Duration::from_millis(tuning.eviction_timeout_ms),
            )
            .with_prune_interval(Duration::from_millis(tuning.prune_interval_ms))
            .with_max_relay_batch(tuning.max_relay_batch)
    }
}

/// Checks that a seed is `host:port` with a non-empty host and a valid port.
fn parse_seed(seed: &str) -> Result<(&str, u16), NodeError> {
    let invalid = || NodeError::Config(format!("invalid seed '{seed}', expected host:port"));
    let (host, port) = seed.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok((host, port))
}
