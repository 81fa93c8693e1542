//! Gossip protocol orchestration.
//!
//! ## Architecture
//!
//! - [`GossipMessage`]: Messages exchanged between members
//! - [`Gossip`]: Periodic rounds, message dispatch and anti-entropy
//! - [`RelayQueue`]: Third-party snapshots waiting to be forwarded
//! - [`GossipStats`]: Traffic counters

mod engine;
mod message;
mod relay;
mod stats;

pub use engine::Gossip;
pub use message::{GossipMessage, MessageBody, MessageKind};
pub use relay::RelayQueue;
pub use stats::GossipStats;
