//! A complete gossip member: configuration, transport and engine wired
//! together.

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::transport::UdpTcpTransport;
use bytes::Bytes;
use rumor_core::{
    Attributes, ClusterListener, ClusterManager, Comms, Gossip, GossipStats, MemberId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// A running cluster member bound to real sockets.
///
/// Dropping the node stops gossip without waiting for the transport tasks;
/// prefer [`RumorNode::shutdown`].
pub struct RumorNode {
    cluster: Arc<ClusterManager>,
    gossip: Arc<Gossip>,
    transport: Arc<UdpTcpTransport>,
}

impl RumorNode {
    /// Binds the sockets and builds the engine. Nothing is sent until
    /// [`RumorNode::start`].
    ///
    /// Seeds that do not resolve are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a socket cannot be
    /// bound or an initial attribute is rejected.
    pub async fn new(config: &NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let seeds = config.resolve_seeds().await;
        let gossip_config = config.gossip_config(seeds);
        gossip_config.validate()?;

        let transport = UdpTcpTransport::bind(
            config.bind_address,
            config.udp_port,
            config.tcp_port,
            config.prevent_indirect_discovery,
            gossip_config.resync_timeout,
        )
        .await?;

        let runtime = Handle::current();
        let cluster = Arc::new(ClusterManager::new(
            MemberId::new(),
            &gossip_config,
            transport.bind_address(),
            transport.tcp_address().port(),
            &runtime,
        ));
        for (key, value) in &config.attributes {
            cluster.update_attribute(key, Some(Bytes::from(value.clone())))?;
        }

        let gossip = Gossip::new(
            gossip_config,
            Arc::clone(&cluster),
            Arc::clone(&transport) as Arc<dyn Comms>,
            runtime,
        );

        info!(
            cluster = %cluster.name(),
            member = %cluster.local_id(),
            udp = %transport.bind_address(),
            tcp = %transport.tcp_address(),
            "node created"
        );
        Ok(Self {
            cluster,
            gossip,
            transport,
        })
    }

    /// Starts receiving traffic and gossiping.
    pub fn start(&self) {
        self.transport.serve(&self.gossip);
        self.gossip.start();
    }

    /// Identifier of this member.
    #[must_use]
    pub fn id(&self) -> MemberId {
        self.cluster.local_id()
    }

    /// Cluster state view.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    /// The gossip engine.
    #[must_use]
    pub const fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    /// Bound UDP endpoint.
    #[must_use]
    pub fn udp_address(&self) -> SocketAddr {
        self.transport.bind_address()
    }

    /// Bound TCP endpoint.
    #[must_use]
    pub fn tcp_address(&self) -> SocketAddr {
        self.transport.tcp_address()
    }

    /// Subscribes `listener` to membership and attribute events.
    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        self.cluster.add_listener(listener);
    }

    /// Sets a local attribute. Returns false if the value was unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value breaks the attribute limits.
    pub fn set_attribute(&self, key: &str, value: impl Into<Bytes>) -> Result<bool, NodeError> {
        Ok(self.cluster.update_attribute(key, Some(value.into()))?)
    }

    /// Removes a local attribute. Returns false if it was not set.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid.
    pub fn remove_attribute(&self, key: &str) -> Result<bool, NodeError> {
        Ok(self.cluster.update_attribute(key, None)?)
    }

    /// Attributes another member advertises.
    #[must_use]
    pub fn member_attributes(&self, id: MemberId) -> Option<Attributes> {
        self.cluster.member_attributes(id)
    }

    /// Gossip counters.
    #[must_use]
    pub fn stats(&self) -> GossipStats {
        self.gossip.stats()
    }

    /// Announces our departure, stops every task and waits for the transport
    /// to wind down.
    pub async fn shutdown(&self) {
        self.gossip.destroy();
        self.transport.join().await;
        info!(member = %self.id(), "node stopped");
    }
}

impl Drop for RumorNode {
    fn drop(&mut self) {
        self.gossip.destroy();
    }
}

impl std::fmt::Debug for RumorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RumorNode")
            .field("id", &self.id())
            .field("cluster", &self.cluster.name())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> NodeConfig {
        NodeConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..NodeConfig::new("unit")
        }
    }

    #[tokio::test]
    async fn new_binds_and_registers_self() {
        let mut config = local_config();
        config.attributes.insert("role".to_string(), "db".to_string());
        let node = RumorNode::new(&config).await.expect("node");

        assert_ne!(node.udp_address().port(), 0);
        assert_eq!(node.cluster().known_members(), vec![node.id()]);
        assert_eq!(
            node.cluster().member_attribute(node.id(), "role"),
            Some(Bytes::from_static(b"db"))
        );
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = NodeConfig {
            cluster_name: String::new(),
            ..local_config()
        };
        assert!(matches!(
            RumorNode::new(&config).await,
            Err(NodeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn attribute_changes_report_effect() {
        let node = RumorNode::new(&local_config()).await.expect("node");
        assert!(node.set_attribute("zone", "eu-1").expect("set"));
        assert!(!node.set_attribute("zone", "eu-1").expect("set"));
        assert!(node.remove_attribute("zone").expect("remove"));
        assert!(!node.remove_attribute("zone").expect("remove"));
        assert!(node.set_attribute("", "x").is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let node = RumorNode::new(&local_config()).await.expect("node");
        node.start();
        node.shutdown().await;
        node.shutdown().await;
        assert!(node.gossip().is_destroyed());
    }
}
