//! Gossip protocol message types.

use crate::protocol::MemberId;
use crate::snapshot::Snapshot;
use std::net::SocketAddr;

/// Wire ordinal of a gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Bootstrap request sent to a seed.
    FirstContactRequest,
    /// Seed reply to a bootstrap request.
    FirstContactResponse,
    /// Sender snapshot plus relayed third-party snapshots.
    Forwardable,
    /// Targeted liveness check.
    PingRequest,
    /// Reply to a liveness check.
    PingResponse,
    /// Graceful departure announcement.
    Disconnection,
    /// Anti-entropy request, stream transport only.
    ResyncRequest,
    /// Anti-entropy reply, stream transport only.
    ResyncResponse,
}

impl MessageKind {
    /// Wire ordinal of this kind.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::FirstContactRequest => 0,
            Self::FirstContactResponse => 1,
            Self::Forwardable => 2,
            Self::PingRequest => 3,
            Self::PingResponse => 4,
            Self::Disconnection => 5,
            Self::ResyncRequest => 6,
            Self::ResyncResponse => 7,
        }
    }

    /// Parses a wire ordinal.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::FirstContactRequest),
            1 => Some(Self::FirstContactResponse),
            2 => Some(Self::Forwardable),
            3 => Some(Self::PingRequest),
            4 => Some(Self::PingResponse),
            5 => Some(Self::Disconnection),
            6 => Some(Self::ResyncRequest),
            7 => Some(Self::ResyncResponse),
            _ => None,
        }
    }
}

/// Kind-specific content of a gossip message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Ask a seed to introduce us to the cluster.
    FirstContactRequest {
        /// The requester's own snapshot.
        sender: Snapshot,
    },

    /// Seed introduction.
    FirstContactResponse {
        /// The seed's own snapshot.
        sender: Snapshot,
        /// The identity the requester claimed.
        requester: MemberId,
        /// The source address the seed saw the request come from.
        observed: SocketAddr,
    },

    /// Regular gossip bundle.
    Forwardable {
        /// The sender's own snapshot.
        sender: Snapshot,
        /// Third-party snapshots being relayed.
        relayed: Vec<Snapshot>,
    },

    /// Direct liveness check.
    PingRequest {
        /// The pinging member's snapshot.
        sender: Snapshot,
    },

    /// Answer to a liveness check.
    PingResponse {
        /// The responding member's snapshot.
        sender: Snapshot,
    },

    /// The sender is leaving the cluster.
    Disconnection {
        /// The departing member's snapshot.
        sender: Snapshot,
    },

    /// Anti-entropy request.
    ResyncRequest {
        /// The initiator's full snapshot, with its UDP address filled in.
        sender: Snapshot,
        /// Header snapshots for every member the initiator knows.
        headers: Vec<Snapshot>,
    },

    /// Anti-entropy reply.
    ResyncResponse {
        /// Full snapshots the initiator is missing or has stale.
        updates: Vec<Snapshot>,
        /// Members for which the initiator holds newer state.
        wanted: Vec<MemberId>,
    },
}

impl MessageBody {
    /// Returns the wire kind of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::FirstContactRequest { .. } => MessageKind::FirstContactRequest,
            Self::FirstContactResponse { .. } => MessageKind::FirstContactResponse,
            Self::Forwardable { .. } => MessageKind::Forwardable,
            Self::PingRequest { .. } => MessageKind::PingRequest,
            Self::PingResponse { .. } => MessageKind::PingResponse,
            Self::Disconnection { .. } => MessageKind::Disconnection,
            Self::ResyncRequest { .. } => MessageKind::ResyncRequest,
            Self::ResyncResponse { .. } => MessageKind::ResyncResponse,
        }
    }
}

/// A gossip message addressed to one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// Name of the cluster this message belongs to.
    pub cluster: String,
    /// Message content.
    pub body: MessageBody,
}

impl GossipMessage {
    /// Creates a message for `cluster`.
    #[must_use]
    pub fn new(cluster: impl Into<String>, body: MessageBody) -> Self {
        Self {
            cluster: cluster.into(),
            body,
        }
    }

    /// Returns the wire kind.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Returns the sender snapshot for kinds that carry one.
    #[must_use]
    pub fn sender(&self) -> Option<&Snapshot> {
        match &self.body {
            MessageBody::FirstContactRequest { sender }
            | MessageBody::FirstContactResponse { sender, .. }
            | MessageBody::Forwardable { sender, .. }
            | MessageBody::PingRequest { sender }
            | MessageBody::PingResponse { sender }
            | MessageBody::Disconnection { sender }
            | MessageBody::ResyncRequest { sender, .. } => Some(sender),
            MessageBody::ResyncResponse { .. } => None,
        }
    }
}
