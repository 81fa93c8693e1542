//! # rumor-core
//!
//! Gossip-based cluster membership and metadata dissemination.
//!
//! Members periodically exchange compact versioned snapshots over datagrams,
//! repair divergence with point-to-point stream exchanges, and expose an
//! eventually consistent view of who is alive and which attributes they
//! advertise.
//!
//! ## Core Types
//!
//! - [`Snapshot`]: Versioned state of one member
//! - [`MemberInfo`]: Per-member reconciliation state machine
//! - [`ClusterManager`]: Member table, local attributes and listener hub
//! - [`Gossip`]: Round scheduling, message dispatch and anti-entropy
//! - [`Comms`]: Transport consumed by the orchestrator
//! - [`ClusterListener`]: Receiver of membership and attribute events
//!
//! The crate contains no socket code; see `rumor-node` for a UDP/TCP
//! transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod comms;
pub mod config;
pub mod error;
pub mod gossip;
pub mod listener;
pub mod member;
pub mod protocol;
pub mod snapshot;
pub mod wire;

pub use cluster::{ClusterManager, Freshness, Partner, PruneReport};
pub use comms::{BoxFuture, Comms};
pub use config::{AttributeLimits, GossipConfig};
pub use error::{GossipError, Result};
pub use gossip::{Gossip, GossipMessage, GossipStats, MessageBody, MessageKind, RelayQueue};
pub use listener::{ClusterAction, ClusterEvent, ClusterListener, Listeners};
pub use member::{MemberInfo, UNREACHABLE_THRESHOLD, Update};
pub use protocol::{MemberId, Sequence, Timestamp};
pub use snapshot::{AttributeDiff, Attributes, Snapshot, SnapshotKind};
