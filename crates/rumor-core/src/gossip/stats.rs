//! Gossip traffic statistics.

use chrono::{DateTime, Utc};

/// Counters maintained by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipStats {
    /// Completed gossip rounds.
    pub rounds: u64,
    /// Rounds that fell back to contacting a seed.
    pub first_contacts: u64,
    /// Datagrams handed to the transport.
    pub messages_sent: u64,
    /// Messages accepted for processing.
    pub messages_received: u64,
    /// Messages discarded as malformed or foreign.
    pub messages_dropped: u64,
    /// Anti-entropy exchanges that completed.
    pub resyncs_succeeded: u64,
    /// Anti-entropy exchanges that failed after the retry.
    pub resyncs_failed: u64,
    /// When the orchestrator started its periodic tasks.
    pub started_at: Option<DateTime<Utc>>,
}

impl GossipStats {
    /// Creates empty statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rounds: 0,
            first_contacts: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_dropped: 0,
            resyncs_succeeded: 0,
            resyncs_failed: 0,
            started_at: None,
        }
    }

    /// Time since the periodic tasks started.
    #[must_use]
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| Utc::now() - started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_stats_are_empty() {
        let stats = GossipStats::new();
        assert_eq!(stats, GossipStats::default());
        assert!(stats.uptime().is_none());
    }

    #[test]
    fn uptime_is_measured_from_start() {
        let stats = GossipStats {
            started_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            ..GossipStats::new()
        };
        let uptime = stats.uptime().expect("started");
        assert!(uptime >= chrono::Duration::seconds(5));
    }
}
