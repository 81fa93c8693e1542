//! Error types for rumor-node.

use rumor_core::GossipError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while configuring or running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A socket could not be bound.
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Membership engine error.
    #[error("gossip error: {0}")]
    Gossip(#[from] GossipError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = NodeError::Config("cluster name cannot be empty".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: cluster name cannot be empty"
        );
    }

    #[test]
    fn bind_error_names_address() {
        let address: SocketAddr = "127.0.0.1:7946".parse().expect("addr");
        let err = NodeError::Bind(
            address,
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(err.to_string().contains("127.0.0.1:7946"));
    }

    #[test]
    fn gossip_error_converts() {
        let err: NodeError = GossipError::Timeout.into();
        assert!(matches!(err, NodeError::Gossip(GossipError::Timeout)));
    }
}
