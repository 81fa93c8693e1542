//! rumor-node - runnable gossip member
//!
//! Binds a UDP socket for gossip datagrams and a TCP listener for
//! anti-entropy exchanges, loads TOML configuration and drives a
//! [`rumor_core::Gossip`] engine over them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod node;
pub mod transport;

pub use config::{GossipTuning, NodeConfig};
pub use error::NodeError;
pub use node::RumorNode;
pub use transport::UdpTcpTransport;
