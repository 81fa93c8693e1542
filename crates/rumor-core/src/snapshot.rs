//! Versioned state snapshots exchanged between members.

use crate::protocol::{MemberId, Sequence, Timestamp};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Attribute map advertised by a member.
///
/// Values are immutable [`Bytes`], so handing one out never exposes the
/// stored copy to mutation.
pub type Attributes = BTreeMap<String, Bytes>;

/// What a snapshot carries beyond the member identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Identity, addressing and version only. Used by anti-entropy exchanges.
    Header,
    /// Identity and version, no payload. Cheap liveness signal.
    Heartbeat,
    /// Identity, version and the full attribute map.
    PayloadUpdate,
}

impl SnapshotKind {
    /// Wire ordinal of this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Header => 0,
            Self::Heartbeat => 1,
            Self::PayloadUpdate => 2,
        }
    }

    /// Parses a wire ordinal.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Header),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::PayloadUpdate),
            _ => None,
        }
    }

    /// Returns true if snapshots of this kind carry attributes.
    #[must_use]
    pub const fn has_payload(self) -> bool {
        matches!(self, Self::PayloadUpdate)
    }
}

/// Replicated state of one member at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    member: MemberId,
    udp_address: Option<SocketAddr>,
    tcp_port: u16,
    sequence: Sequence,
    timestamp: Timestamp,
    kind: SnapshotKind,
    attributes: Attributes,
    hops: u8,
}

impl Snapshot {
    /// Creates a snapshot for `member` with zeroed version fields.
    #[must_use]
    pub fn new(member: MemberId, kind: SnapshotKind) -> Self {
        Self {
            member,
            udp_address: None,
            tcp_port: 0,
            sequence: Sequence::ZERO,
            timestamp: Timestamp::default(),
            kind,
            attributes: Attributes::new(),
            hops: 0,
        }
    }

    /// Sets the UDP address.
    #[must_use]
    pub const fn with_address(mut self, address: SocketAddr) -> Self {
        self.udp_address = Some(address);
        self
    }

    /// Sets or clears the UDP address.
    #[must_use]
    pub const fn with_optional_address(mut self, address: Option<SocketAddr>) -> Self {
        self.udp_address = address;
        self
    }

    /// Sets the TCP port used for resynchronisation.
    #[must_use]
    pub const fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Sets the state sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    /// Sets the creation timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the attribute map. Ignored unless the kind carries a payload.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        if self.kind.has_payload() {
            self.attributes = attributes;
        }
        self
    }

    /// Sets the remaining hop count.
    #[must_use]
    pub const fn with_hops(mut self, hops: u8) -> Self {
        self.hops = hops;
        self
    }

    /// Returns a copy converted to `kind`, dropping the payload if needed.
    #[must_use]
    pub fn demote(&self, kind: SnapshotKind) -> Self {
        let mut copy = self.clone();
        copy.kind = kind;
        if !kind.has_payload() {
            copy.attributes.clear();
        }
        copy
    }

    /// Returns a copy with one hop consumed, or `None` if no hops remain.
    #[must_use]
    pub fn decrement_hops(&self) -> Option<Self> {
        if self.hops == 0 {
            return None;
        }
        Some(Self {
            hops: self.hops - 1,
            ..self.clone()
        })
    }

    /// The member this snapshot describes.
    #[must_use]
    pub const fn member(&self) -> MemberId {
        self.member
    }

    /// The member's UDP address, if carried.
    #[must_use]
    pub const fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_address
    }

    /// The member's TCP port.
    #[must_use]
    pub const fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// State sequence number.
    #[must_use]
    pub const fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Snapshot kind.
    #[must_use]
    pub const fn kind(&self) -> SnapshotKind {
        self.kind
    }

    /// Attribute map. Empty unless this is a payload update.
    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Remaining hop count.
    #[must_use]
    pub const fn hops(&self) -> u8 {
        self.hops
    }
}

/// Key-level difference between two attribute maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeDiff {
    /// Keys present only in the new map.
    pub added: BTreeSet<String>,
    /// Keys present only in the old map.
    pub removed: BTreeSet<String>,
    /// Keys present in both with different values.
    pub updated: BTreeSet<String>,
}

impl AttributeDiff {
    /// Computes the difference from `old` to `new`.
    #[must_use]
    pub fn between(old: &Attributes, new: &Attributes) -> Self {
        let mut diff = Self::default();
        for (key, value) in new {
            match old.get(key) {
                None => {
                    diff.added.insert(key.clone());
                }
                Some(previous) if previous != value => {
                    diff.updated.insert(key.clone());
                }
                Some(_) => {}
            }
        }
        diff.removed = old
            .keys()
            .filter(|key| !new.contains_key(*key))
            .cloned()
            .collect();
        diff
    }

    /// Returns true if the maps were identical.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}
