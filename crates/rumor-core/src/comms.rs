//! Transport abstraction consumed by the gossip orchestrator.

use crate::error::Result;
use crate::gossip::GossipMessage;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Datagram and stream transport used by [`Gossip`](crate::Gossip).
///
/// Implementations deliver inbound datagrams to
/// [`Gossip::handle_datagram`](crate::Gossip::handle_datagram) and inbound
/// stream requests to [`Gossip::handle_stream`](crate::Gossip::handle_stream).
pub trait Comms: Send + Sync {
    /// Sends `message` to every destination. Best effort and unordered.
    fn publish(&self, message: &GossipMessage, destinations: &[SocketAddr]);

    /// Opens a stream to `target`, sends `request` and waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the exchange fails.
    fn replicate<'a>(
        &'a self,
        target: SocketAddr,
        request: GossipMessage,
    ) -> BoxFuture<'a, Result<GossipMessage>>;

    /// Local datagram endpoint.
    fn bind_address(&self) -> SocketAddr;

    /// True when hearsay about members never contacted directly must not be
    /// trusted.
    fn prevent_indirect_discovery(&self) -> bool;

    /// Releases the transport. Called once, after the final broadcast.
    fn close(&self);
}
