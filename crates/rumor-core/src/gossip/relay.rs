//! Snapshots waiting to be relayed in the next round.

use crate::protocol::MemberId;
use crate::snapshot::Snapshot;
use crate::wire;
use std::collections::HashMap;
use tracing::warn;

/// Pending relays, at most one per member.
#[derive(Debug, Default)]
pub struct RelayQueue {
    pending: HashMap<MemberId, Snapshot>,
}

impl RelayQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `snapshot` unless a newer one for the same member is pending.
    pub fn offer(&mut self, snapshot: Snapshot) {
        match self.pending.get(&snapshot.member()) {
            Some(existing) if snapshot.timestamp().delta(existing.timestamp()) < 0 => {}
            _ => {
                self.pending.insert(snapshot.member(), snapshot);
            }
        }
    }

    /// Queues `snapshot`, discarding whatever was pending for the member.
    pub fn replace(&mut self, snapshot: Snapshot) {
        self.pending.insert(snapshot.member(), snapshot);
    }

    /// Drops the pending relay for `member`.
    pub fn remove(&mut self, member: MemberId) -> Option<Snapshot> {
        self.pending.remove(&member)
    }

    /// Takes up to `max` pending snapshots whose encoded size adds up to at
    /// most `budget` bytes, leaving the rest queued.
    ///
    /// A snapshot larger than `budget` on its own can never be sent and is
    /// discarded.
    pub fn drain(&mut self, max: usize, budget: usize) -> Vec<Snapshot> {
        let mut taken = Vec::new();
        let mut used = 0;
        let members: Vec<MemberId> = self.pending.keys().copied().collect();
        for member in members {
            if taken.len() >= max {
                break;
            }
            let Some(len) = self.pending.get(&member).map(wire::snapshot_len) else {
                continue;
            };
            if len > budget {
                warn!(%member, size = len, budget, "relay too large for a datagram, dropping");
                self.pending.remove(&member);
                continue;
            }
            if used + len > budget {
                continue;
            }
            if let Some(snapshot) = self.pending.remove(&member) {
                used += len;
                taken.push(snapshot);
            }
        }
        taken
    }

    /// Number of pending snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
