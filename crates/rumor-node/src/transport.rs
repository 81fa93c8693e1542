//! UDP datagram and TCP stream transport.
//!
//! Gossip traffic uses a single UDP socket for both directions, so the
//! source address of a datagram is the sender's gossip endpoint. Anti-entropy
//! exchanges use one TCP connection per exchange with length-delimited frames
//! holding exactly one encoded message each.

use crate::error::NodeError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rumor_core::wire::{self, MAX_DATAGRAM_BYTES};
use rumor_core::{BoxFuture, Comms, Gossip, GossipError, GossipMessage};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest accepted anti-entropy frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// [`Comms`] over a UDP socket and a TCP listener.
pub struct UdpTcpTransport {
    socket: Arc<UdpSocket>,
    listener: Mutex<Option<TcpListener>>,
    udp_address: SocketAddr,
    tcp_address: SocketAddr,
    prevent_indirect: bool,
    stream_timeout: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpTcpTransport {
    /// Binds both sockets. Port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Bind`] if either socket cannot be bound.
    pub async fn bind(
        ip: IpAddr,
        udp_port: u16,
        tcp_port: u16,
        prevent_indirect: bool,
        stream_timeout: Duration,
    ) -> Result<Arc<Self>, NodeError> {
        let requested = SocketAddr::new(ip, udp_port);
        let socket = UdpSocket::bind(requested)
            .await
            .map_err(|e| NodeError::Bind(requested, e))?;
        let udp_address = socket.local_addr()?;

        let requested = SocketAddr::new(ip, tcp_port);
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|e| NodeError::Bind(requested, e))?;
        let tcp_address = listener.local_addr()?;

        info!(udp = %udp_address, tcp = %tcp_address, "transport bound");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            listener: Mutex::new(Some(listener)),
            udp_address,
            tcp_address,
            prevent_indirect,
            stream_timeout,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Local TCP endpoint for anti-entropy exchanges.
    #[must_use]
    pub const fn tcp_address(&self) -> SocketAddr {
        self.tcp_address
    }

    /// Starts delivering inbound traffic to `gossip`. Only the first call
    /// has an effect.
    pub fn serve(&self, gossip: &Arc<Gossip>) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(receive_datagrams(
            Arc::clone(&self.socket),
            Arc::downgrade(gossip),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(accept_streams(
            listener,
            Arc::downgrade(gossip),
            self.cancel.clone(),
            self.stream_timeout,
        )));
    }

    /// Waits for the receive loops to finish after [`Comms::close`].
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    warn!(error = %err, "transport task panicked");
                }
            }
        }
    }

    /// Returns true once the transport has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Comms for UdpTcpTransport {
    fn publish(&self, message: &GossipMessage, destinations: &[SocketAddr]) {
        if self.is_closed() {
            return;
        }
        let datagram = match wire::encode_message(message) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!(kind = ?message.kind(), error = %err, "failed to encode message");
                return;
            }
        };
        if datagram.len() > MAX_DATAGRAM_BYTES {
            warn!(
                kind = ?message.kind(),
                size = datagram.len(),
                "message exceeds datagram size, dropping"
            );
            return;
        }
        for destination in destinations {
            if let Err(err) = self.socket.try_send_to(&datagram, *destination) {
                debug!(%destination, error = %err, "datagram not sent");
            }
        }
    }

    fn replicate<'a>(
        &'a self,
        target: SocketAddr,
        request: GossipMessage,
    ) -> BoxFuture<'a, Result<GossipMessage, GossipError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(target).await?;
            let mut framed = Framed::new(stream, frame_codec());
            framed.send(wire::encode_message(&request)?).await?;
            let frame = framed
                .next()
                .await
                .ok_or_else(|| GossipError::Transport(format!("{target} closed the stream")))??;
            wire::decode_message(&frame)
        })
    }

    fn bind_address(&self) -> SocketAddr {
        self.udp_address
    }

    fn prevent_indirect_discovery(&self) -> bool {
        self.prevent_indirect
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(udp = %self.udp_address, "closing transport");
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for UdpTcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTcpTransport")
            .field("udp_address", &self.udp_address)
            .field("tcp_address", &self.tcp_address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn receive_datagrams(socket: Arc<UdpSocket>, gossip: Weak<Gossip>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let received = tokio::select! {
            r = socket.recv_from(&mut buf) => r,
            () = cancel.cancelled() => break,
        };
        match received {
            Ok((len, source)) => {
                let Some(gossip) = gossip.upgrade() else {
                    break;
                };
                trace!(%source, len, "datagram received");
                gossip.handle_datagram(source, &buf[..len]);
            }
            Err(err) => {
                debug!(error = %err, "udp receive failed");
            }
        }
    }
    trace!("datagram receiver stopped");
}

async fn accept_streams(
    listener: TcpListener,
    gossip: Weak<Gossip>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            () = cancel.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let gossip = gossip.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        r = answer_stream(stream, peer, gossip, timeout) => r,
                        () = cancel.cancelled() => Ok(()),
                    };
                    if let Err(err) = outcome {
                        debug!(%peer, error = %err, "resync stream failed");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept resync stream");
            }
        }
    }
    trace!("stream acceptor stopped");
}

async fn answer_stream(
    stream: TcpStream,
    peer: SocketAddr,
    gossip: Weak<Gossip>,
    timeout: Duration,
) -> Result<(), GossipError> {
    let mut framed = Framed::new(stream, frame_codec());
    let frame = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| GossipError::Timeout)?
        .ok_or_else(|| GossipError::Transport(format!("{peer} closed before sending")))??;
    let request = wire::decode_message(&frame)?;

    let reply = {
        let Some(gossip) = gossip.upgrade() else {
            return Ok(());
        };
        gossip.handle_stream(peer, request)
    };
    let Some(reply) = reply else {
        return Ok(());
    };

    let encoded: Bytes = wire::encode_message(&reply)?;
    tokio::time::timeout(timeout, framed.send(encoded))
        .await
        .map_err(|_| GossipError::Timeout)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumor_core::{ClusterManager, GossipConfig, MemberId, MessageBody, MessageKind, Snapshot, SnapshotKind};
    use std::net::Ipv4Addr;
    use tokio::runtime::Handle;

    async fn transport() -> Arc<UdpTcpTransport> {
        UdpTcpTransport::bind(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            0,
            0,
            false,
            Duration::from_secs(1),
        )
        .await
        .expect("bind")
    }

    fn serve(transport: &Arc<UdpTcpTransport>) -> Arc<Gossip> {
        let config = GossipConfig::new("alpha");
        let cluster = Arc::new(ClusterManager::new(
            MemberId::new(),
            &config,
            transport.bind_address(),
            transport.tcp_address().port(),
            &Handle::current(),
        ));
        let gossip = Gossip::new(
            config,
            cluster,
            Arc::clone(transport) as Arc<dyn Comms>,
            Handle::current(),
        );
        transport.serve(&gossip);
        gossip
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn binds_ephemeral_ports() {
        let transport = transport().await;
        assert_ne!(transport.bind_address().port(), 0);
        assert_ne!(transport.tcp_address().port(), 0);
        assert!(!transport.prevent_indirect_discovery());
    }

    #[tokio::test]
    async fn datagrams_reach_gossip() {
        let a = transport().await;
        let b = transport().await;
        let gossip_a = serve(&a);
        let gossip_b = serve(&b);

        let ping = GossipMessage::new(
            "alpha",
            MessageBody::PingRequest {
                sender: gossip_a
                    .cluster()
                    .get_snapshot(SnapshotKind::PayloadUpdate, 0),
            },
        );
        a.publish(&ping, &[b.bind_address()]);

        let a_id = gossip_a.cluster().local_id();
        assert!(eventually(|| gossip_b.cluster().known_members().contains(&a_id)).await);
        assert_eq!(gossip_b.cluster().address_for(a_id), Some(a.bind_address()));

        // the ping response travels back to a
        let b_id = gossip_b.cluster().local_id();
        assert!(eventually(|| gossip_a.cluster().known_members().contains(&b_id)).await);
    }

    #[tokio::test]
    async fn replicate_round_trips_over_tcp() {
        let a = transport().await;
        let b = transport().await;
        let gossip_a = serve(&a);
        let _gossip_b = serve(&b);

        let sender: Snapshot = gossip_a
            .cluster()
            .get_snapshot(SnapshotKind::PayloadUpdate, 0)
            .with_address(a.bind_address());
        let request = GossipMessage::new(
            "alpha",
            MessageBody::ResyncRequest {
                sender,
                headers: vec![],
            },
        );
        let reply = a.replicate(b.tcp_address(), request).await.expect("reply");
        assert_eq!(reply.kind(), MessageKind::ResyncResponse);
        let MessageBody::ResyncResponse { updates, wanted } = reply.body else {
            panic!("expected resync response");
        };
        assert!(wanted.is_empty());
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn replicate_to_closed_port_fails() {
        let a = transport().await;
        let unused = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let target = unused.local_addr().expect("addr");
        drop(unused);

        let request = GossipMessage::new(
            "alpha",
            MessageBody::ResyncResponse {
                updates: vec![],
                wanted: vec![],
            },
        );
        assert!(a.replicate(target, request).await.is_err());
    }

    #[tokio::test]
    async fn close_stops_receive_loops() {
        let a = transport().await;
        let _gossip = serve(&a);
        a.close();
        a.close();
        assert!(a.is_closed());
        tokio::time::timeout(Duration::from_secs(1), a.join())
            .await
            .expect("loops stop");
    }
}
