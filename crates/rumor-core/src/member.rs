//! Per-member reconciliation state.
//!
//! A [`MemberInfo`] records the last accepted snapshot of one member and
//! decides, for every incoming snapshot, whether it is new information, a
//! liveness confirmation, stale, or evidence that a payload was missed.

use crate::listener::{ClusterAction, ClusterEvent, EventSink, Listeners};
use crate::protocol::{MemberId, Sequence, Timestamp};
use crate::snapshot::{AttributeDiff, Attributes, Snapshot, SnapshotKind};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Consecutive unreachable reports tolerated before a member is closed.
pub const UNREACHABLE_THRESHOLD: u32 = 5;

/// Outcome of merging a snapshot into a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Update {
    /// Nothing further to do.
    Consume,
    /// The snapshot was accepted and may be relayed onwards.
    Forward,
    /// The snapshot was stale; relay our own knowledge of the member instead.
    ForwardLocal,
    /// A payload change was missed; full state must be fetched.
    Resync,
}

/// Reconciliation state for one member.
#[derive(Debug)]
pub struct MemberInfo {
    id: MemberId,
    cluster: Arc<str>,
    udp_address: Option<SocketAddr>,
    tcp_port: u16,
    sequence: Sequence,
    timestamp: Timestamp,
    attributes: Attributes,
    last_update: Instant,
    unreachable_count: u32,
    initialised: bool,
    closed_at: Option<Instant>,
    listeners: Listeners,
    sink: EventSink,
}

impl MemberInfo {
    /// Creates state for a member seen for the first time.
    #[must_use]
    pub fn new(
        id: MemberId,
        cluster: Arc<str>,
        listeners: Listeners,
        sink: EventSink,
        now: Instant,
    ) -> Self {
        Self {
            id,
            cluster,
            udp_address: None,
            tcp_port: 0,
            sequence: Sequence::ZERO,
            timestamp: Timestamp::default(),
            attributes: Attributes::new(),
            last_update: now,
            unreachable_count: 0,
            initialised: false,
            closed_at: None,
            listeners,
            sink,
        }
    }

    /// Merges `snapshot` into this member.
    pub fn update(&mut self, snapshot: &Snapshot, now: Instant) -> Update {
        if self.is_closed() {
            return Update::Consume;
        }

        if self.udp_address.is_none() {
            match snapshot.udp_address() {
                Some(address) => self.udp_address = Some(address),
                None => return Update::Consume,
            }
        }

        if !self.initialised {
            if snapshot.kind() != SnapshotKind::PayloadUpdate {
                return Update::Resync;
            }
            self.adopt_version(snapshot, now);
            self.attributes = snapshot.attributes().clone();
            self.initialised = true;
            info!(
                member = %self.id,
                address = ?self.udp_address,
                keys = self.attributes.len(),
                "member joined"
            );
            self.emit(
                ClusterAction::Added,
                AttributeDiff {
                    added: self.attributes.keys().cloned().collect(),
                    ..AttributeDiff::default()
                },
            );
            return Update::Forward;
        }

        let seq_delta = snapshot.sequence().delta(self.sequence);
        let time_delta = snapshot.timestamp().delta(self.timestamp);
        if seq_delta < 0 || time_delta < 0 {
            debug!(
                member = %self.id,
                seq_delta,
                time_delta,
                "stale snapshot"
            );
            return Update::ForwardLocal;
        }

        self.unreachable_count = 0;
        self.last_update = now;
        if let Some(address) = snapshot.udp_address() {
            self.udp_address = Some(address);
        }
        if snapshot.tcp_port() != 0 {
            self.tcp_port = snapshot.tcp_port();
        }

        if seq_delta == 0 {
            self.timestamp = snapshot.timestamp();
            return Update::Forward;
        }

        if snapshot.kind() != SnapshotKind::PayloadUpdate {
            debug!(
                member = %self.id,
                known = %self.sequence,
                seen = %snapshot.sequence(),
                "missed payload update"
            );
            return Update::Resync;
        }

        let diff = AttributeDiff::between(&self.attributes, snapshot.attributes());
        self.adopt_version(snapshot, now);
        self.attributes = snapshot.attributes().clone();
        if !diff.is_empty() {
            debug!(
                member = %self.id,
                sequence = %self.sequence,
                added = diff.added.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                "member attributes changed"
            );
            self.emit(ClusterAction::Updated, diff);
        }
        Update::Forward
    }

    /// Records a failed reachability check.
    ///
    /// Returns true if this report closed the member.
    pub fn mark_unreachable(&mut self, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        self.unreachable_count += 1;
        debug!(member = %self.id, count = self.unreachable_count, "member unreachable");
        if self.unreachable_count > UNREACHABLE_THRESHOLD {
            info!(member = %self.id, "member unreachable too often, closing");
            return self.close(now);
        }
        false
    }

    /// Marks the member as departed. Idempotent.
    ///
    /// Returns true if the member was open before the call.
    pub fn close(&mut self, now: Instant) -> bool {
        if self.is_closed() {
            return false;
        }
        self.closed_at = Some(now);
        if self.initialised {
            info!(member = %self.id, "member removed");
            self.emit(
                ClusterAction::Removed,
                AttributeDiff {
                    removed: self.attributes.keys().cloned().collect(),
                    ..AttributeDiff::default()
                },
            );
        }
        true
    }

    /// Replaces the listener set for future events.
    pub fn set_listeners(&mut self, listeners: Listeners) {
        self.listeners = listeners;
    }

    /// Builds a snapshot of the stored state.
    #[must_use]
    pub fn snapshot(&self, kind: SnapshotKind, hops: u8) -> Snapshot {
        Snapshot::new(self.id, kind)
            .with_optional_address(self.udp_address)
            .with_tcp_port(self.tcp_port)
            .with_sequence(self.sequence)
            .with_timestamp(self.timestamp)
            .with_attributes(self.attributes.clone())
            .with_hops(hops)
    }

    /// Member identifier.
    #[must_use]
    pub const fn id(&self) -> MemberId {
        self.id
    }

    /// UDP address, once known.
    #[must_use]
    pub const fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_address
    }

    /// Overrides the UDP address.
    pub fn set_udp_address(&mut self, address: SocketAddr) {
        self.udp_address = Some(address);
    }

    /// TCP port for resynchronisation.
    #[must_use]
    pub const fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Last accepted sequence number.
    #[must_use]
    pub const fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Last accepted timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Stored attributes.
    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// A single stored attribute value.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<Bytes> {
        self.attributes.get(key).cloned()
    }

    /// Stored attribute keys.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        self.attributes.keys().cloned().collect()
    }

    /// When the member was last heard from.
    #[must_use]
    pub const fn last_update(&self) -> Instant {
        self.last_update
    }

    /// How long the member has been silent at `now`.
    #[must_use]
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_update)
    }

    /// Consecutive unreachable reports since the last accepted snapshot.
    #[must_use]
    pub const fn unreachable_count(&self) -> u32 {
        self.unreachable_count
    }

    /// True once the first full payload has been accepted.
    #[must_use]
    pub const fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// True once the member has left or been evicted.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// When the member was closed.
    #[must_use]
    pub const fn closed_at(&self) -> Option<Instant> {
        self.closed_at
    }

    /// True if the member is initialised and open.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.initialised && !self.is_closed()
    }

    fn adopt_version(&mut self, snapshot: &Snapshot, now: Instant) {
        self.sequence = snapshot.sequence();
        self.timestamp = snapshot.timestamp();
        if snapshot.tcp_port() != 0 {
            self.tcp_port = snapshot.tcp_port();
        }
        self.last_update = now;
        self.unreachable_count = 0;
    }

    fn emit(&self, action: ClusterAction, diff: AttributeDiff) {
        self.sink.emit(
            &self.listeners,
            ClusterEvent {
                cluster: self.cluster.to_string(),
                action,
                member: self.id,
                added: diff.added,
                removed: diff.removed,
                updated: diff.updated,
            },
        );
    }
}
