//! Gossip tunables and attribute rules.

use crate::error::{GossipError, Result};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for one gossip cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    /// Name of the cluster. Messages for other clusters are dropped.
    pub cluster_name: String,
    /// Seed peers contacted when no partner is known.
    pub seeds: Vec<SocketAddr>,
    /// Interval between gossip rounds.
    pub gossip_interval: Duration,
    /// Number of partners contacted per round.
    pub fanout: usize,
    /// Hop budget given to our own snapshots.
    pub max_hops: u8,
    /// Value the burst counter is reset to on a local change.
    ///
    /// Each round decrements the counter first and sends a full payload
    /// while it is still positive, so a change is followed by
    /// `burst_rounds - 1` payload rounds.
    pub burst_rounds: u32,
    /// Interval between anti-entropy exchanges. `None` disables them.
    pub resync_interval: Option<Duration>,
    /// Delay before the single retry of a failed exchange.
    pub resync_retry_delay: Duration,
    /// Upper bound on one anti-entropy exchange.
    pub resync_timeout: Duration,
    /// Silence after which a member is probed directly.
    pub probe_timeout: Duration,
    /// How long a closed member is kept before removal.
    pub eviction_timeout: Duration,
    /// Interval between member table scans.
    pub prune_interval: Duration,
    /// Maximum relayed snapshots per datagram. The encoded datagram size
    /// caps the batch further.
    pub max_relay_batch: usize,
    /// Rules for local attributes.
    pub attribute_limits: AttributeLimits,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            fanout: 3,
            max_hops: 3,
            burst_rounds: 5,
            resync_interval: Some(Duration::from_secs(30)),
            resync_retry_delay: Duration::from_secs(2),
            resync_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
            eviction_timeout: Duration::from_secs(60),
            prune_interval: Duration::from_secs(1),
            max_relay_batch: 32,
            attribute_limits: AttributeLimits::default(),
        }
    }
}

impl GossipConfig {
    /// Creates a default config for `cluster_name`.
    #[must_use]
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            ..Self::default()
        }
    }

    /// Sets the seed peers.
    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// Sets the round interval.
    #[must_use]
    pub const fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Sets the fanout.
    #[must_use]
    pub const fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout;
        self
    }

    /// Sets the hop budget.
    #[must_use]
    pub const fn with_max_hops(mut self, hops: u8) -> Self {
        self.max_hops = hops;
        self
    }

    /// Sets the burst length.
    #[must_use]
    pub const fn with_burst_rounds(mut self, rounds: u32) -> Self {
        self.burst_rounds = rounds;
        self
    }

    /// Sets or disables the anti-entropy interval.
    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Sets the retry delay and timeout of anti-entropy exchanges.
    #[must_use]
    pub const fn with_resync_timing(mut self, retry_delay: Duration, timeout: Duration) -> Self {
        self.resync_retry_delay = retry_delay;
        self.resync_timeout = timeout;
        self
    }

    /// Sets the probe and eviction timeouts.
    #[must_use]
    pub const fn with_failure_timeouts(mut self, probe: Duration, eviction: Duration) -> Self {
        self.probe_timeout = probe;
        self.eviction_timeout = eviction;
        self
    }

    /// Sets the member table scan interval.
    #[must_use]
    pub const fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Sets the relay batch cap.
    #[must_use]
    pub const fn with_max_relay_batch(mut self, max: usize) -> Self {
        self.max_relay_batch = max;
        self
    }

    /// Sets the attribute rules.
    #[must_use]
    pub const fn with_attribute_limits(mut self, limits: AttributeLimits) -> Self {
        self.attribute_limits = limits;
        self
    }

    /// Checks the config for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(GossipError::Config("cluster name cannot be empty".to_string()));
        }
        if self.cluster_name.len() > usize::from(u16::MAX) {
            return Err(GossipError::Config("cluster name too long".to_string()));
        }
        if self.fanout == 0 {
            return Err(GossipError::Config("fanout must be at least 1".to_string()));
        }
        if self.max_relay_batch == 0 {
            return Err(GossipError::Config("max_relay_batch must be at least 1".to_string()));
        }
        for (name, value) in [
            ("gossip_interval", self.gossip_interval),
            ("prune_interval", self.prune_interval),
            ("resync_timeout", self.resync_timeout),
        ] {
            if value.is_zero() {
                return Err(GossipError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.resync_interval.is_some_and(|d| d.is_zero()) {
            return Err(GossipError::Config("resync_interval must be non-zero".to_string()));
        }
        self.attribute_limits.validate()
    }
}

/// Size rules applied to local attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLimits {
    /// Values above this size are rejected.
    pub max_value_bytes: usize,
    /// Values above this size are accepted with a warning.
    pub warn_value_bytes: usize,
    /// Keys above this size are rejected.
    pub max_key_bytes: usize,
    /// Upper bound on the encoded size of the whole local map.
    pub max_total_bytes: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_value_bytes: 512,
            warn_value_bytes: 256,
            max_key_bytes: 255,
            max_total_bytes: 16 * 1024,
        }
    }
}

impl AttributeLimits {
    fn validate(&self) -> Result<()> {
        if self.warn_value_bytes > self.max_value_bytes {
            return Err(GossipError::Config(
                "warn_value_bytes exceeds max_value_bytes".to_string(),
            ));
        }
        if self.max_key_bytes == 0 || self.max_key_bytes > usize::from(u16::MAX) {
            return Err(GossipError::Config("max_key_bytes out of range".to_string()));
        }
        if self.max_value_bytes > usize::from(u16::MAX) {
            return Err(GossipError::Config("max_value_bytes out of range".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn defaults_are_valid() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fanout, 3);
        assert_eq!(config.burst_rounds, 5);
        assert_eq!(config.attribute_limits.max_value_bytes, 512);
    }

    #[test]
    fn builder_sets_fields() {
        let seed: SocketAddr = "10.0.0.1:7946".parse().expect("addr");
        let config = GossipConfig::new("alpha")
            .with_seeds(vec![seed])
            .with_fanout(5)
            .with_resync_interval(None)
            .with_max_relay_batch(4);

        assert_eq!(config.cluster_name, "alpha");
        assert_eq!(config.seeds, vec![seed]);
        assert_eq!(config.fanout, 5);
        assert!(config.resync_interval.is_none());
        assert_eq!(config.max_relay_batch, 4);
    }

    #[test_case(GossipConfig::new(""); "empty cluster name")]
    #[test_case(GossipConfig::new("a").with_fanout(0); "zero fanout")]
    #[test_case(GossipConfig::new("a").with_max_relay_batch(0); "zero relay batch")]
    #[test_case(GossipConfig::new("a").with_gossip_interval(Duration::ZERO); "zero interval")]
    #[test_case(GossipConfig::new("a").with_resync_interval(Some(Duration::ZERO)); "zero resync")]
    #[test_case(
        GossipConfig::new("a").with_attribute_limits(AttributeLimits {
            warn_value_bytes: 1024,
            ..AttributeLimits::default()
        });
        "warn above max"
    )]
    fn invalid_configs_are_rejected(config: GossipConfig) {
        assert!(matches!(config.validate(), Err(GossipError::Config(_))));
    }
}
