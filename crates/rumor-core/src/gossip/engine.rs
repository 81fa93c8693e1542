//! The gossip orchestrator.
//!
//! [`Gossip`] drives three periodic tasks on the injected runtime:
//!
//! - the gossip round, which sends our snapshot and pending relays to a few
//!   random partners (or a seed while no partner is known),
//! - the anti-entropy round, which reconciles full member tables with one
//!   partner over a stream,
//! - the prune round, which probes silent members and evicts departed ones.
//!
//! Inbound traffic arrives through [`Gossip::handle_datagram`] and
//! [`Gossip::handle_stream`], called by the [`Comms`] implementation.

use super::message::{GossipMessage, MessageBody, MessageKind};
use super::relay::RelayQueue;
use super::stats::GossipStats;
use crate::cluster::{ClusterManager, Freshness, Partner};
use crate::comms::Comms;
use crate::config::GossipConfig;
use crate::error::{GossipError, Result};
use crate::member::Update;
use crate::protocol::MemberId;
use crate::snapshot::{Snapshot, SnapshotKind};
use crate::wire::{self, MAX_DATAGRAM_BYTES};
use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, trace, warn};

/// Protocol orchestrator for one cluster.
pub struct Gossip {
    config: GossipConfig,
    cluster: Arc<ClusterManager>,
    comms: Arc<dyn Comms>,
    runtime: Handle,
    burst: Arc<AtomicU32>,
    relay: Mutex<RelayQueue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
    stats: Mutex<GossipStats>,
}

impl Gossip {
    /// Creates the orchestrator. Periodic tasks start with [`Gossip::start`].
    ///
    /// Every effective local attribute change restarts the payload burst.
    pub fn new(
        config: GossipConfig,
        cluster: Arc<ClusterManager>,
        comms: Arc<dyn Comms>,
        runtime: Handle,
    ) -> Arc<Self> {
        let burst = Arc::new(AtomicU32::new(config.burst_rounds));
        let rounds = config.burst_rounds;
        let hook = Arc::clone(&burst);
        cluster.set_local_update_hook(move || hook.store(rounds, Ordering::Relaxed));

        Arc::new(Self {
            config,
            cluster,
            comms,
            runtime,
            burst,
            relay: Mutex::new(RelayQueue::new()),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            stats: Mutex::new(GossipStats::new()),
        })
    }

    /// Spawns the periodic tasks. Does nothing if already started or destroyed.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.is_destroyed() {
            return;
        }
        self.stats.lock().started_at = Some(Utc::now());

        let weak = Arc::downgrade(self);
        tasks.push(
            self.runtime
                .spawn(run_gossip_rounds(weak.clone(), self.config.gossip_interval)),
        );
        if let Some(period) = self.config.resync_interval {
            tasks.push(self.runtime.spawn(run_resync_rounds(weak.clone(), period)));
        }
        tasks.push(
            self.runtime
                .spawn(run_prune_rounds(weak, self.config.prune_interval)),
        );

        info!(
            cluster = %self.cluster.name(),
            member = %self.cluster.local_id(),
            bind = %self.comms.bind_address(),
            seeds = self.config.seeds.len(),
            "gossip started"
        );
    }

    /// The cluster state this orchestrator feeds.
    #[must_use]
    pub const fn cluster(&self) -> &Arc<ClusterManager> {
        &self.cluster
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> GossipStats {
        self.stats.lock().clone()
    }

    /// Number of snapshots waiting to be relayed.
    #[must_use]
    pub fn pending_relays(&self) -> usize {
        self.relay.lock().len()
    }

    /// Returns true once [`Gossip::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Runs one gossip round.
    pub fn gossip_round(&self) {
        if self.is_destroyed() {
            return;
        }
        let remaining = self
            .burst
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| {
                Some(b.saturating_sub(1))
            })
            .unwrap_or_else(|current| current)
            .saturating_sub(1);
        let kind = if remaining > 0 {
            SnapshotKind::PayloadUpdate
        } else {
            SnapshotKind::Heartbeat
        };
        self.stats.lock().rounds += 1;

        let partners = self.cluster.select_random_partners(self.config.fanout);
        if partners.is_empty() {
            let Some(seed) = self.random_seed() else {
                trace!("no partners and no seeds, skipping round");
                return;
            };
            debug!(%seed, "no known partners, contacting seed");
            self.stats.lock().first_contacts += 1;
            let own = self
                .cluster
                .get_snapshot(SnapshotKind::PayloadUpdate, self.config.max_hops);
            self.send(MessageBody::FirstContactRequest { sender: own }, &[seed]);
            return;
        }

        let own = self.cluster.get_snapshot(kind, self.config.max_hops);
        let budget = self.relay_budget(&own);
        let relayed = self.relay.lock().drain(self.config.max_relay_batch, budget);
        let mut destinations: Vec<SocketAddr> =
            partners.iter().map(|partner| partner.udp_address).collect();
        if let Some(seed) = self.random_seed() {
            if !destinations.contains(&seed) {
                destinations.push(seed);
            }
        }
        trace!(
            ?kind,
            partners = partners.len(),
            relayed = relayed.len(),
            "gossip round"
        );
        self.send(
            MessageBody::Forwardable {
                sender: own,
                relayed,
            },
            &destinations,
        );
    }

    /// Runs one anti-entropy exchange with a random partner.
    ///
    /// A failed exchange is retried once after the configured delay; a second
    /// failure counts against the partner's reachability.
    pub async fn resync_round(&self) {
        if self.is_destroyed() {
            return;
        }
        let Some(partner) = self.cluster.select_random_partners(1).pop() else {
            return;
        };
        let request = self.resync_request();

        let mut outcome = self.exchange(partner, request.clone()).await;
        if let Err(err) = &outcome {
            debug!(
                member = %partner.id,
                error = %err,
                "resync failed, retrying"
            );
            tokio::time::sleep(self.config.resync_retry_delay).await;
            outcome = self.exchange(partner, request).await;
        }

        match outcome {
            Ok(reply) => {
                self.stats.lock().resyncs_succeeded += 1;
                self.apply_resync_reply(partner, reply);
            }
            Err(err) => {
                warn!(
                    member = %partner.id,
                    address = %partner.tcp_address(),
                    error = %err,
                    "resync failed"
                );
                self.stats.lock().resyncs_failed += 1;
                self.cluster.mark_unreachable(partner.id);
            }
        }
    }

    /// Probes silent members and evicts departed ones.
    pub fn prune_round(&self) {
        if self.is_destroyed() {
            return;
        }
        let report = self.cluster.prune(Instant::now());
        for partner in &report.dark {
            debug!(member = %partner.id, address = %partner.udp_address, "probing dark member");
            self.ping(partner.udp_address);
        }
        if !report.evicted.is_empty() {
            debug!(evicted = report.evicted.len(), "evicted departed members");
        }
    }

    /// Decodes and handles one inbound datagram.
    pub fn handle_datagram(&self, source: SocketAddr, datagram: &[u8]) {
        match wire::decode_message(datagram) {
            Ok(message) => self.handle_message(source, message),
            Err(err) => {
                warn!(%source, error = %err, "dropping malformed datagram");
                self.stats.lock().messages_dropped += 1;
            }
        }
    }

    /// Handles one decoded datagram.
    pub fn handle_message(&self, source: SocketAddr, message: GossipMessage) {
        if self.is_destroyed() || !self.accepts(&message, source) {
            return;
        }
        let kind = message.kind();
        trace!(%source, ?kind, "gossip message");

        match message.body {
            MessageBody::FirstContactRequest { sender } => {
                let sender = with_source(sender, source);
                let requester = sender.member();
                self.merge_direct(sender);
                debug!(member = %requester, %source, "answering first contact");
                let own = self
                    .cluster
                    .get_snapshot(SnapshotKind::PayloadUpdate, self.config.max_hops);
                self.send(
                    MessageBody::FirstContactResponse {
                        sender: own,
                        requester,
                        observed: source,
                    },
                    &[source],
                );
            }
            MessageBody::FirstContactResponse {
                sender,
                requester,
                observed,
            } => {
                if requester != self.cluster.local_id() {
                    debug!(%requester, "first contact response addressed to another member");
                }
                info!(seed = %source, %observed, "first contact acknowledged");
                if self.comms.bind_address().ip().is_unspecified() {
                    self.cluster.set_local_address(observed);
                }
                self.merge_direct(with_source(sender, source));
            }
            MessageBody::Forwardable { sender, relayed } => {
                self.merge_direct(with_source(sender, source));
                for snapshot in relayed {
                    self.merge_relayed(snapshot);
                }
            }
            MessageBody::PingRequest { sender } => {
                self.merge_direct(with_source(sender, source));
                let own = self.cluster.get_snapshot(SnapshotKind::PayloadUpdate, 0);
                self.send(MessageBody::PingResponse { sender: own }, &[source]);
            }
            MessageBody::PingResponse { sender } => {
                self.merge_direct(with_source(sender, source));
            }
            MessageBody::Disconnection { sender } => {
                self.cluster.leaving_cluster(&sender);
                self.relay.lock().remove(sender.member());
            }
            MessageBody::ResyncRequest { .. } | MessageBody::ResyncResponse { .. } => {
                debug!(%source, ?kind, "stream message received as datagram");
                self.stats.lock().messages_dropped += 1;
            }
        }
    }

    /// Answers an inbound anti-entropy request.
    ///
    /// Returns `None` if the request must be dropped.
    pub fn handle_stream(&self, peer: SocketAddr, request: GossipMessage) -> Option<GossipMessage> {
        if self.is_destroyed() || !self.accepts(&request, peer) {
            return None;
        }
        let MessageBody::ResyncRequest { sender, headers } = request.body else {
            debug!(%peer, kind = ?request.kind(), "unexpected stream message");
            self.stats.lock().messages_dropped += 1;
            return None;
        };

        let sender = with_peer_ip(sender, peer.ip());
        let initiator = sender.member();
        self.merge_direct(sender);

        let mut mentioned: HashSet<MemberId> = HashSet::from([initiator]);
        let mut updates = Vec::new();
        let mut wanted = Vec::new();
        for header in &headers {
            let id = header.member();
            mentioned.insert(id);
            match self.cluster.freshness(header) {
                Freshness::Missing | Freshness::Behind => wanted.push(id),
                Freshness::Ahead => {
                    updates.extend(self.cluster.member_snapshot(id, SnapshotKind::PayloadUpdate, 0));
                }
                Freshness::Current | Freshness::Departed => {}
            }
        }
        updates.extend(
            self.cluster
                .member_snapshots(SnapshotKind::PayloadUpdate, 0)
                .into_iter()
                .filter(|snapshot| !mentioned.contains(&snapshot.member())),
        );

        debug!(
            member = %initiator,
            %peer,
            headers = headers.len(),
            updates = updates.len(),
            wanted = wanted.len(),
            "answered resync"
        );
        Some(GossipMessage::new(
            self.cluster.name(),
            MessageBody::ResyncResponse { updates, wanted },
        ))
    }

    /// Stops the periodic tasks, announces our departure and closes the
    /// transport. Idempotent.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let hosts = self.cluster.member_hosts();
        if !hosts.is_empty() {
            let own = self.cluster.get_snapshot(SnapshotKind::Header, 0);
            self.send(MessageBody::Disconnection { sender: own }, &hosts);
        }
        info!(
            cluster = %self.cluster.name(),
            member = %self.cluster.local_id(),
            notified = hosts.len(),
            "gossip stopped"
        );
        self.comms.close();
    }

    fn accepts(&self, message: &GossipMessage, source: SocketAddr) -> bool {
        if message.cluster != self.cluster.name() {
            debug!(%source, cluster = %message.cluster, "dropping message for another cluster");
            self.stats.lock().messages_dropped += 1;
            return false;
        }
        self.stats.lock().messages_received += 1;
        true
    }

    fn merge_direct(&self, snapshot: Snapshot) {
        if snapshot.member() == self.cluster.local_id() {
            return;
        }
        let update = self.cluster.merge_snapshot(&snapshot);
        self.act(snapshot, update);
    }

    fn merge_relayed(&self, snapshot: Snapshot) {
        let id = snapshot.member();
        if id == self.cluster.local_id() {
            return;
        }
        if self.comms.prevent_indirect_discovery() && !self.cluster.contains(id) {
            if let Some(address) = snapshot.udp_address() {
                debug!(member = %id, %address, "pinging member known only by hearsay");
                self.ping(address);
            }
            return;
        }
        let update = self.cluster.merge_snapshot(&snapshot);
        self.act(snapshot, update);
    }

    fn act(&self, snapshot: Snapshot, update: Update) {
        match update {
            Update::Consume => {}
            Update::Forward => {
                if let Some(next) = snapshot.decrement_hops() {
                    self.relay.lock().offer(next);
                }
            }
            Update::ForwardLocal => {
                let Some(local) = self.cluster.member_snapshot(
                    snapshot.member(),
                    SnapshotKind::PayloadUpdate,
                    snapshot.hops(),
                ) else {
                    return;
                };
                let local = if local.sequence() == snapshot.sequence() {
                    local.demote(SnapshotKind::Heartbeat)
                } else {
                    local
                };
                self.relay.lock().replace(local);
            }
            Update::Resync => {
                let address = snapshot
                    .udp_address()
                    .or_else(|| self.cluster.address_for(snapshot.member()));
                if let Some(address) = address {
                    debug!(member = %snapshot.member(), %address, "missing state, pinging member");
                    self.ping(address);
                }
                if let Some(next) = snapshot.decrement_hops() {
                    self.relay.lock().offer(next);
                }
            }
        }
    }

    fn ping(&self, address: SocketAddr) {
        let own = self.cluster.get_snapshot(SnapshotKind::PayloadUpdate, 0);
        self.send(MessageBody::PingRequest { sender: own }, &[address]);
    }

    fn send(&self, body: MessageBody, destinations: &[SocketAddr]) {
        if destinations.is_empty() {
            return;
        }
        let message = GossipMessage::new(self.cluster.name(), body);
        self.comms.publish(&message, destinations);
        self.stats.lock().messages_sent += destinations.len() as u64;
    }

    fn random_seed(&self) -> Option<SocketAddr> {
        let bind = self.comms.bind_address();
        let candidates: Vec<SocketAddr> = self
            .config
            .seeds
            .iter()
            .copied()
            .filter(|seed| *seed != bind)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    fn resync_request(&self) -> GossipMessage {
        let local_id = self.cluster.local_id();
        let sender = self
            .cluster
            .get_snapshot(SnapshotKind::PayloadUpdate, 0)
            .with_optional_address(self.cluster.address_for(local_id));
        let headers = self
            .cluster
            .member_snapshots(SnapshotKind::Header, 0)
            .into_iter()
            .filter(|snapshot| snapshot.member() != local_id)
            .collect();
        GossipMessage::new(
            self.cluster.name(),
            MessageBody::ResyncRequest { sender, headers },
        )
    }

    async fn exchange(&self, partner: Partner, request: GossipMessage) -> Result<GossipMessage> {
        let reply = tokio::time::timeout(
            self.config.resync_timeout,
            self.comms.replicate(partner.tcp_address(), request),
        )
        .await
        .map_err(|_| GossipError::Timeout)??;
        if reply.kind() != MessageKind::ResyncResponse {
            return Err(GossipError::Codec(format!(
                "expected resync response, got {:?}",
                reply.kind()
            )));
        }
        if reply.cluster != self.cluster.name() {
            return Err(GossipError::Codec(format!(
                "resync response for cluster {}",
                reply.cluster
            )));
        }
        Ok(reply)
    }

    fn apply_resync_reply(&self, partner: Partner, reply: GossipMessage) {
        let MessageBody::ResyncResponse { updates, wanted } = reply.body else {
            return;
        };
        debug!(
            member = %partner.id,
            updates = updates.len(),
            wanted = wanted.len(),
            "resync reply"
        );
        for snapshot in updates {
            self.merge_relayed(with_peer_ip(snapshot, partner.udp_address.ip()));
        }

        let payloads: Vec<Snapshot> = wanted
            .into_iter()
            .filter_map(|id| self.cluster.member_snapshot(id, SnapshotKind::PayloadUpdate, 0))
            .collect();
        if payloads.is_empty() {
            return;
        }
        let own = self.cluster.get_snapshot(SnapshotKind::Heartbeat, 0);
        let budget = self.relay_budget(&own);
        for batch in pack_batches(payloads, self.config.max_relay_batch, budget) {
            self.send(
                MessageBody::Forwardable {
                    sender: own.clone(),
                    relayed: batch,
                },
                &[partner.udp_address],
            );
        }
    }

    /// Bytes left for relayed snapshots in a FORWARDABLE datagram sent with
    /// `own` as the sender.
    fn relay_budget(&self, own: &Snapshot) -> usize {
        MAX_DATAGRAM_BYTES.saturating_sub(wire::forwardable_overhead(self.cluster.name(), own))
    }
}

/// Splits `snapshots` into batches of at most `max_count` entries and
/// `budget` encoded bytes. Snapshots larger than the whole budget are dropped.
fn pack_batches(snapshots: Vec<Snapshot>, max_count: usize, budget: usize) -> Vec<Vec<Snapshot>> {
    let max_count = max_count.max(1);
    let mut batches = Vec::new();
    let mut batch: Vec<Snapshot> = Vec::new();
    let mut used = 0;
    for snapshot in snapshots {
        let len = wire::snapshot_len(&snapshot);
        if len > budget {
            warn!(
                member = %snapshot.member(),
                size = len,
                budget,
                "snapshot too large for a datagram, not pushing"
            );
            continue;
        }
        if batch.len() == max_count || used + len > budget {
            batches.push(std::mem::take(&mut batch));
            used = 0;
        }
        used += len;
        batch.push(snapshot);
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

impl Drop for Gossip {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Gossip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gossip")
            .field("cluster", &self.cluster)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Fills in the sender address from the datagram source.
fn with_source(snapshot: Snapshot, source: SocketAddr) -> Snapshot {
    match snapshot.udp_address() {
        None => snapshot.with_address(source),
        Some(address) if address.ip().is_unspecified() => {
            snapshot.with_address(SocketAddr::new(source.ip(), address.port()))
        }
        Some(_) => snapshot,
    }
}

/// Replaces an unspecified advertised IP with the peer's.
fn with_peer_ip(snapshot: Snapshot, peer: IpAddr) -> Snapshot {
    match snapshot.udp_address() {
        Some(address) if address.ip().is_unspecified() => {
            snapshot.with_address(SocketAddr::new(peer, address.port()))
        }
        _ => snapshot,
    }
}

async fn run_gossip_rounds(gossip: Weak<Gossip>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(gossip) = gossip.upgrade() else {
            break;
        };
        gossip.gossip_round();
    }
}

async fn run_resync_rounds(gossip: Weak<Gossip>, period: Duration) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(gossip) = gossip.upgrade() else {
            break;
        };
        gossip.resync_round().await;
    }
}

async fn run_prune_rounds(gossip: Weak<Gossip>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(gossip) = gossip.upgrade() else {
            break;
        };
        gossip.prune_round();
    }
}
