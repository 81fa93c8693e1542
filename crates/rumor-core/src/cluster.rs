//! Authoritative membership state for one cluster.
//!
//! The [`ClusterManager`] owns the member table and the local attribute map.
//! Remote snapshots and local changes go through the same reconciliation
//! path: the local node always has an entry of its own in the table.

use crate::config::{AttributeLimits, GossipConfig};
use crate::error::{GossipError, Result};
use crate::listener::{self, ClusterListener, EventSink, Listeners};
use crate::member::{MemberInfo, Update};
use crate::protocol::{MemberId, Sequence, Timestamp};
use crate::snapshot::{Attributes, Snapshot, SnapshotKind};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

type LocalUpdateHook = Arc<dyn Fn() + Send + Sync>;

/// A member that can be contacted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partner {
    /// Member identifier.
    pub id: MemberId,
    /// Gossip endpoint.
    pub udp_address: SocketAddr,
    /// Port of the resynchronisation endpoint.
    pub tcp_port: u16,
}

impl Partner {
    /// Endpoint of the member's resynchronisation listener.
    #[must_use]
    pub const fn tcp_address(&self) -> SocketAddr {
        SocketAddr::new(self.udp_address.ip(), self.tcp_port)
    }
}

/// How our copy of a member compares with a remote header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// We do not know the member, or only know it by hearsay.
    Missing,
    /// The remote holds a newer state.
    Behind,
    /// Both sides hold the same state.
    Current,
    /// We hold a newer state.
    Ahead,
    /// We consider the member gone.
    Departed,
}

/// Result of one member table scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Members silent past the probe timeout that are still open.
    pub dark: Vec<Partner>,
    /// Members removed from the table.
    pub evicted: Vec<MemberId>,
}

#[derive(Debug)]
struct LocalState {
    sequence: Sequence,
    timestamp: Timestamp,
    attributes: Attributes,
    tcp_port: u16,
}

impl LocalState {
    /// Wall-clock timestamp that never goes backwards for this node.
    fn stamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        if now.delta(self.timestamp) > 0 {
            self.timestamp = now;
        }
        self.timestamp
    }
}

/// Owner of the member table and the local node's state.
pub struct ClusterManager {
    local_id: MemberId,
    name: Arc<str>,
    limits: AttributeLimits,
    probe_timeout: Duration,
    eviction_timeout: Duration,
    members: DashMap<MemberId, Arc<Mutex<MemberInfo>>>,
    local: RwLock<LocalState>,
    listeners: RwLock<Listeners>,
    registry: Mutex<Vec<Arc<dyn ClusterListener>>>,
    sink: EventSink,
    on_local_update: Mutex<Option<LocalUpdateHook>>,
}

impl ClusterManager {
    /// Creates the manager and registers the local member.
    ///
    /// Listener events are delivered by a task spawned on `runtime`.
    pub fn new(
        local_id: MemberId,
        config: &GossipConfig,
        local_address: SocketAddr,
        tcp_port: u16,
        runtime: &Handle,
    ) -> Self {
        let (sink, rx) = EventSink::channel();
        runtime.spawn(listener::dispatch(rx));

        let manager = Self {
            local_id,
            name: Arc::from(config.cluster_name.as_str()),
            limits: config.attribute_limits,
            probe_timeout: config.probe_timeout,
            eviction_timeout: config.eviction_timeout,
            members: DashMap::new(),
            local: RwLock::new(LocalState {
                sequence: Sequence::ZERO,
                timestamp: Timestamp::now(),
                attributes: Attributes::new(),
                tcp_port,
            }),
            listeners: RwLock::new(Listeners::default()),
            registry: Mutex::new(Vec::new()),
            sink,
            on_local_update: Mutex::new(None),
        };

        let initial = {
            let local = manager.local.read();
            Snapshot::new(local_id, SnapshotKind::PayloadUpdate)
                .with_address(local_address)
                .with_tcp_port(tcp_port)
                .with_sequence(local.sequence)
                .with_timestamp(local.timestamp)
        };
        manager.apply(&initial, Instant::now());
        info!(
            cluster = %manager.name,
            member = %local_id,
            address = %local_address,
            tcp_port,
            "cluster manager created"
        );
        manager
    }

    /// Identifier of the local member.
    #[must_use]
    pub const fn local_id(&self) -> MemberId {
        self.local_id
    }

    /// Name of the cluster.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Merges a snapshot received from the network.
    pub fn merge_snapshot(&self, snapshot: &Snapshot) -> Update {
        let _local = self.local.read();
        self.apply(snapshot, Instant::now())
    }

    /// Materialises the local node's current state.
    ///
    /// The address is omitted; receivers take it from the datagram source.
    pub fn get_snapshot(&self, kind: SnapshotKind, hops: u8) -> Snapshot {
        let mut local = self.local.write();
        let timestamp = local.stamp();
        let snapshot = Snapshot::new(self.local_id, kind)
            .with_tcp_port(local.tcp_port)
            .with_sequence(local.sequence)
            .with_timestamp(timestamp)
            .with_attributes(local.attributes.clone())
            .with_hops(hops);
        // keeps the local entry's clock moving between attribute changes
        self.apply(&snapshot.demote(SnapshotKind::Heartbeat), Instant::now());
        snapshot
    }

    /// Sets (`Some`) or removes (`None`) a local attribute.
    ///
    /// Returns `Ok(false)` if the map is unchanged.
    pub fn update_attribute(&self, key: &str, value: Option<Bytes>) -> Result<bool> {
        self.check_attribute(key, value.as_ref())?;

        let snapshot = {
            let mut local = self.local.write();
            if local.attributes.get(key) == value.as_ref() {
                return Ok(false);
            }

            let mut attributes = local.attributes.clone();
            match value {
                Some(value) => {
                    attributes.insert(key.to_string(), value);
                }
                None => {
                    attributes.remove(key);
                }
            }
            let total: usize = attributes.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
            if total > self.limits.max_total_bytes {
                return Err(GossipError::InvalidAttribute(format!(
                    "attribute map would be {total} bytes, limit is {}",
                    self.limits.max_total_bytes
                )));
            }

            local.sequence = local.sequence.next();
            local.attributes = attributes;
            let timestamp = local.stamp();
            let snapshot = Snapshot::new(self.local_id, SnapshotKind::PayloadUpdate)
                .with_tcp_port(local.tcp_port)
                .with_sequence(local.sequence)
                .with_timestamp(timestamp)
                .with_attributes(local.attributes.clone());
            self.apply(&snapshot, Instant::now());
            snapshot
        };

        debug!(
            member = %self.local_id,
            key,
            sequence = %snapshot.sequence(),
            "local attribute changed"
        );
        let hook = self.on_local_update.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
        Ok(true)
    }

    /// Registers the callback run after every effective local change.
    pub fn set_local_update_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_local_update.lock() = Some(Arc::new(hook));
    }

    /// Picks up to `n` distinct open remote members uniformly at random.
    pub fn select_random_partners(&self, n: usize) -> Vec<Partner> {
        if n == 0 {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        let mut chosen: Vec<Partner> = Vec::with_capacity(n);
        let mut eligible = 0usize;
        for entry in &self.members {
            if *entry.key() == self.local_id {
                continue;
            }
            let Some(partner) = Self::partner_of(&entry.value().lock()) else {
                continue;
            };
            eligible += 1;
            if chosen.len() < n {
                chosen.push(partner);
            } else {
                let slot = rng.gen_range(0..eligible);
                if slot < n {
                    chosen[slot] = partner;
                }
            }
        }
        chosen
    }

    /// Snapshots of every active member, the local one included.
    pub fn member_snapshots(&self, kind: SnapshotKind, hops: u8) -> Vec<Snapshot> {
        self.members
            .iter()
            .filter_map(|entry| {
                let member = entry.value().lock();
                member.is_active().then(|| member.snapshot(kind, hops))
            })
            .collect()
    }

    /// Snapshot of one active member.
    pub fn member_snapshot(&self, id: MemberId, kind: SnapshotKind, hops: u8) -> Option<Snapshot> {
        let member = self.entry(id)?;
        let member = member.lock();
        member.is_active().then(|| member.snapshot(kind, hops))
    }

    /// Compares our copy of a member with a remote header.
    pub fn freshness(&self, header: &Snapshot) -> Freshness {
        let Some(member) = self.entry(header.member()) else {
            return Freshness::Missing;
        };
        let member = member.lock();
        if member.is_closed() {
            return Freshness::Departed;
        }
        if !member.is_initialised() {
            return Freshness::Missing;
        }
        match header.sequence().delta(member.sequence()) {
            d if d > 0 => Freshness::Behind,
            d if d < 0 => Freshness::Ahead,
            _ => Freshness::Current,
        }
    }

    /// Handles an explicit departure announcement.
    ///
    /// Returns true if the member was open.
    pub fn leaving_cluster(&self, snapshot: &Snapshot) -> bool {
        let id = snapshot.member();
        if id == self.local_id {
            return false;
        }
        let Some(member) = self.entry(id) else {
            return false;
        };
        let closed = member.lock().close(Instant::now());
        if closed {
            info!(member = %id, "member left the cluster");
        }
        closed
    }

    /// Records a failed reachability check for a member.
    ///
    /// Returns true if the member was closed as a result.
    pub fn mark_unreachable(&self, id: MemberId) -> bool {
        if id == self.local_id {
            return false;
        }
        let Some(member) = self.entry(id) else {
            return false;
        };
        let mut member = member.lock();
        member.mark_unreachable(Instant::now())
    }

    /// Scans the member table.
    ///
    /// Members silent past the probe timeout count as unreachable once per
    /// scan and are reported for probing; members closed past the eviction
    /// timeout are removed.
    pub fn prune(&self, now: Instant) -> PruneReport {
        let mut silent = Vec::new();
        let mut expired = Vec::new();
        for entry in &self.members {
            if *entry.key() == self.local_id {
                continue;
            }
            let member = entry.value().lock();
            match member.closed_at() {
                Some(closed) => {
                    if now.saturating_duration_since(closed) >= self.eviction_timeout {
                        expired.push(member.id());
                    }
                }
                None => {
                    if member.silence(now) >= self.probe_timeout {
                        silent.push(member.id());
                    }
                }
            }
        }

        let mut report = PruneReport::default();
        for id in silent {
            let Some(member) = self.entry(id) else {
                continue;
            };
            let mut member = member.lock();
            member.mark_unreachable(now);
            if let Some(partner) = Self::partner_of(&member) {
                report.dark.push(partner);
            }
        }

        for id in expired {
            let removed = self.members.remove_if(&id, |_, member| {
                member
                    .lock()
                    .closed_at()
                    .is_some_and(|closed| now.saturating_duration_since(closed) >= self.eviction_timeout)
            });
            if removed.is_some() {
                debug!(member = %id, "evicted departed member");
                report.evicted.push(id);
            }
        }
        report
    }

    /// Subscribes a listener to every member, present and future.
    pub fn add_listener(&self, listener: Arc<dyn ClusterListener>) {
        let mut registry = self.registry.lock();
        registry.push(listener);
        self.publish_listeners(&registry);
    }

    /// Unsubscribes a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ClusterListener>) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|existing| !Arc::ptr_eq(existing, listener));
        if registry.len() == before {
            return false;
        }
        self.publish_listeners(&registry);
        true
    }

    /// Identifiers of members that are initialised and open, ours included.
    pub fn known_members(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|entry| entry.value().lock().is_active())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Gossip endpoints of the known remote members.
    pub fn member_hosts(&self) -> Vec<SocketAddr> {
        self.members
            .iter()
            .filter(|entry| *entry.key() != self.local_id)
            .filter_map(|entry| {
                let member = entry.value().lock();
                if member.is_active() {
                    member.udp_address()
                } else {
                    None
                }
            })
            .collect()
    }

    /// One attribute of an active member.
    pub fn member_attribute(&self, id: MemberId, key: &str) -> Option<Bytes> {
        let member = self.entry(id)?;
        let member = member.lock();
        if member.is_active() {
            member.attribute(key)
        } else {
            None
        }
    }

    /// All attributes of an active member.
    pub fn member_attributes(&self, id: MemberId) -> Option<Attributes> {
        let member = self.entry(id)?;
        let member = member.lock();
        member.is_active().then(|| member.attributes().clone())
    }

    /// Gossip endpoint of a member.
    pub fn address_for(&self, id: MemberId) -> Option<SocketAddr> {
        self.entry(id)?.lock().udp_address()
    }

    /// Contact details of an open member.
    pub fn partner(&self, id: MemberId) -> Option<Partner> {
        Self::partner_of(&self.entry(id)?.lock())
    }

    /// Returns true if the member has an entry, open or not.
    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    /// Replaces the local member's advertised address.
    pub fn set_local_address(&self, address: SocketAddr) {
        let _local = self.local.write();
        if let Some(member) = self.entry(self.local_id) {
            member.lock().set_udp_address(address);
        }
    }

    /// Current local sequence number.
    pub fn local_sequence(&self) -> Sequence {
        self.local.read().sequence
    }

    fn apply(&self, snapshot: &Snapshot, now: Instant) -> Update {
        let id = snapshot.member();
        let member = Arc::clone(&*self.members.entry(id).or_insert_with(|| {
            Arc::new(Mutex::new(MemberInfo::new(
                id,
                Arc::clone(&self.name),
                self.listeners.read().clone(),
                self.sink.clone(),
                now,
            )))
        }));
        let mut member = member.lock();
        member.update(snapshot, now)
    }

    fn entry(&self, id: MemberId) -> Option<Arc<Mutex<MemberInfo>>> {
        self.members.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn partner_of(member: &MemberInfo) -> Option<Partner> {
        if member.is_closed() {
            return None;
        }
        Some(Partner {
            id: member.id(),
            udp_address: member.udp_address()?,
            tcp_port: member.tcp_port(),
        })
    }

    fn publish_listeners(&self, registry: &[Arc<dyn ClusterListener>]) {
        let set = Listeners::new(registry.to_vec());
        *self.listeners.write() = set.clone();
        for entry in &self.members {
            entry.value().lock().set_listeners(set.clone());
        }
    }

    fn check_attribute(&self, key: &str, value: Option<&Bytes>) -> Result<()> {
        if key.is_empty() {
            return Err(GossipError::InvalidAttribute("empty key".to_string()));
        }
        if key.len() > self.limits.max_key_bytes {
            return Err(GossipError::InvalidAttribute(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.limits.max_key_bytes
            )));
        }
        if let Some(value) = value {
            if value.len() > self.limits.max_value_bytes {
                return Err(GossipError::InvalidAttribute(format!(
                    "value for {key} is {} bytes, limit is {}",
                    value.len(),
                    self.limits.max_value_bytes
                )));
            }
            if value.len() > self.limits.warn_value_bytes {
                warn!(
                    key,
                    size = value.len(),
                    "large attribute value slows down gossip"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("name", &self.name)
            .field("local_id", &self.local_id)
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ClusterAction, ClusterEvent};
    use proptest::prelude::*;
    use std::collections::{BTreeSet, HashSet};
    use tokio::sync::mpsc;

    const LOCAL: &str = "127.0.0.1:7000";

    fn manager(handle: &Handle) -> ClusterManager {
        manager_with(handle, GossipConfig::new("alpha"))
    }

    fn manager_with(handle: &Handle, config: GossipConfig) -> ClusterManager {
        ClusterManager::new(
            MemberId::new(),
            &config,
            LOCAL.parse().expect("addr"),
            7001,
            handle,
        )
    }

    fn recorder() -> (Arc<dyn ClusterListener>, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Arc<dyn ClusterListener> = Arc::new(move |e: &ClusterEvent| {
            let _ = tx.send(e.clone());
        });
        (listener, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> ClusterEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    fn remote(id: MemberId, port: u16, seq: i16, pairs: &[(&str, &[u8])]) -> Snapshot {
        let attributes = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Bytes::copy_from_slice(v)))
            .collect();
        Snapshot::new(id, SnapshotKind::PayloadUpdate)
            .with_address(SocketAddr::from(([10, 0, 0, 1], port)))
            .with_tcp_port(port + 1)
            .with_sequence(Sequence::new(seq))
            .with_timestamp(Timestamp::from_raw(1000 + seq as u32))
            .with_attributes(attributes)
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|k| (*k).to_string()).collect()
    }

    // ========== Local State Tests ==========

    #[tokio::test]
    async fn local_member_is_known() {
        let cluster = manager(&Handle::current());
        assert_eq!(cluster.known_members(), vec![cluster.local_id()]);
        assert!(cluster.member_hosts().is_empty());
        assert_eq!(cluster.name(), "alpha");
    }

    #[tokio::test]
    async fn update_attribute_is_visible_and_notifies() {
        let cluster = manager(&Handle::current());
        let (listener, mut rx) = recorder();
        cluster.add_listener(listener);

        let changed = cluster
            .update_attribute("foo", Some(Bytes::from_static(&[1, 2, 3, 4])))
            .expect("valid");
        assert!(changed);
        assert_eq!(
            cluster.member_attribute(cluster.local_id(), "foo").as_deref(),
            Some(&[1u8, 2, 3, 4][..])
        );
        assert_eq!(cluster.local_sequence(), Sequence::new(1));

        let event = next_event(&mut rx).await;
        assert_eq!(event.action, ClusterAction::Updated);
        assert_eq!(event.member, cluster.local_id());
        assert_eq!(event.added, keys(&["foo"]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_attribute_is_noop() {
        let cluster = manager(&Handle::current());
        let hits = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&hits);
        cluster.set_local_update_hook(move || *counter.lock() += 1);

        assert!(cluster.update_attribute("k", Some(Bytes::from_static(b"v"))).expect("ok"));
        assert!(!cluster.update_attribute("k", Some(Bytes::from_static(b"v"))).expect("ok"));
        assert!(!cluster.update_attribute("missing", None).expect("ok"));
        assert_eq!(cluster.local_sequence(), Sequence::new(1));
        assert_eq!(*hits.lock(), 1);

        assert!(cluster.update_attribute("k", None).expect("ok"));
        assert!(cluster.member_attribute(cluster.local_id(), "k").is_none());
        assert_eq!(*hits.lock(), 2);
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let cluster = manager(&Handle::current());
        let big = Bytes::from(vec![0u8; 513]);
        assert!(matches!(
            cluster.update_attribute("k", Some(big)),
            Err(GossipError::InvalidAttribute(_))
        ));
        assert!(matches!(
            cluster.update_attribute("", Some(Bytes::new())),
            Err(GossipError::InvalidAttribute(_))
        ));

        let large = Bytes::from(vec![0u8; 300]);
        assert!(cluster.update_attribute("k", Some(large)).expect("accepted with warning"));
        assert_eq!(cluster.local_sequence(), Sequence::new(1));
    }

    #[tokio::test]
    async fn total_size_limit_is_enforced() {
        let limits = AttributeLimits {
            max_total_bytes: 64,
            ..AttributeLimits::default()
        };
        let cluster = manager_with(
            &Handle::current(),
            GossipConfig::new("alpha").with_attribute_limits(limits),
        );
        assert!(cluster.update_attribute("a", Some(Bytes::from(vec![0u8; 40]))).expect("ok"));
        assert!(cluster.update_attribute("b", Some(Bytes::from(vec![0u8; 40]))).is_err());
        assert!(cluster.member_attribute(cluster.local_id(), "b").is_none());
    }

    #[tokio::test]
    async fn local_snapshot_omits_address() {
        let cluster = manager(&Handle::current());
        cluster.update_attribute("k", Some(Bytes::from_static(b"v"))).expect("ok");

        let payload = cluster.get_snapshot(SnapshotKind::PayloadUpdate, 3);
        assert!(payload.udp_address().is_none());
        assert_eq!(payload.tcp_port(), 7001);
        assert_eq!(payload.hops(), 3);
        assert_eq!(payload.sequence(), Sequence::new(1));
        assert_eq!(payload.attributes().len(), 1);

        let heartbeat = cluster.get_snapshot(SnapshotKind::Heartbeat, 0);
        assert!(heartbeat.attributes().is_empty());
        assert!(heartbeat.timestamp().delta(payload.timestamp()) >= 0);
    }

    // ========== Remote Member Tests ==========

    #[tokio::test]
    async fn first_payload_adds_member() {
        let cluster = manager(&Handle::current());
        let (listener, mut rx) = recorder();
        cluster.add_listener(listener);

        let c = MemberId::new();
        let update = cluster.merge_snapshot(&remote(c, 8000, 0, &[("x", &[9])]));
        assert_eq!(update, Update::Forward);
        assert!(cluster.known_members().contains(&c));

        let event = next_event(&mut rx).await;
        assert_eq!(event.action, ClusterAction::Added);
        assert_eq!(event.member, c);
        assert_eq!(event.cluster, "alpha");
        assert_eq!(event.added, keys(&["x"]));
        assert!(event.removed.is_empty() && event.updated.is_empty());
    }

    #[tokio::test]
    async fn missed_payload_requests_resync() {
        let cluster = manager(&Handle::current());
        let c = MemberId::new();
        cluster.merge_snapshot(&remote(c, 8000, 0, &[]));
        let heartbeat = remote(c, 8000, 1, &[]).demote(SnapshotKind::Heartbeat);
        assert_eq!(cluster.merge_snapshot(&heartbeat), Update::Resync);
    }

    #[tokio::test]
    async fn leaving_cluster_removes_synchronously() {
        let cluster = manager(&Handle::current());
        let (listener, mut rx) = recorder();
        cluster.add_listener(listener);

        let d = MemberId::new();
        let snapshot = remote(d, 8000, 0, &[("a", b"1"), ("b", b"2")]);
        cluster.merge_snapshot(&snapshot);
        next_event(&mut rx).await;

        assert!(cluster.leaving_cluster(&snapshot));
        assert!(!cluster.known_members().contains(&d));
        assert!(cluster.member_attributes(d).is_none());
        assert!(!cluster.leaving_cluster(&snapshot));

        let event = next_event(&mut rx).await;
        assert_eq!(event.action, ClusterAction::Removed);
        assert_eq!(event.removed, keys(&["a", "b"]));
    }

    #[tokio::test]
    async fn listener_added_later_sees_existing_members() {
        let cluster = manager(&Handle::current());
        let c = MemberId::new();
        cluster.merge_snapshot(&remote(c, 8000, 0, &[("a", b"1")]));

        let (listener, mut rx) = recorder();
        cluster.add_listener(Arc::clone(&listener));
        cluster.merge_snapshot(&remote(c, 8000, 1, &[("a", b"2")]));
        let event = next_event(&mut rx).await;
        assert_eq!(event.action, ClusterAction::Updated);
        assert_eq!(event.updated, keys(&["a"]));

        assert!(cluster.remove_listener(&listener));
        assert!(!cluster.remove_listener(&listener));
        cluster.merge_snapshot(&remote(c, 8000, 2, &[("a", b"3")]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn freshness_compares_sequences() {
        let cluster = manager(&Handle::current());
        let c = MemberId::new();
        cluster.merge_snapshot(&remote(c, 8000, 4, &[]));

        let header = |seq| remote(c, 8000, seq, &[]).demote(SnapshotKind::Header);
        assert_eq!(cluster.freshness(&header(5)), Freshness::Behind);
        assert_eq!(cluster.freshness(&header(4)), Freshness::Current);
        assert_eq!(cluster.freshness(&header(3)), Freshness::Ahead);
        assert_eq!(
            cluster.freshness(&remote(MemberId::new(), 8100, 0, &[]).demote(SnapshotKind::Header)),
            Freshness::Missing
        );

        cluster.leaving_cluster(&header(4));
        assert_eq!(cluster.freshness(&header(9)), Freshness::Departed);
    }

    // ========== Failure Detection Tests ==========

    #[tokio::test]
    async fn silent_member_is_probed_then_evicted() {
        let config = GossipConfig::new("alpha")
            .with_failure_timeouts(Duration::from_secs(10), Duration::from_secs(60));
        let cluster = manager_with(&Handle::current(), config);
        let c = MemberId::new();
        cluster.merge_snapshot(&remote(c, 8000, 0, &[("a", b"1")]));

        let start = Instant::now();
        let report = cluster.prune(start);
        assert!(report.dark.is_empty());

        let later = start + Duration::from_secs(11);
        let report = cluster.prune(later);
        assert_eq!(report.dark.len(), 1);
        assert_eq!(report.dark[0].id, c);

        for _ in 0..5 {
            cluster.prune(later);
        }
        assert!(!cluster.known_members().contains(&c));
        assert!(cluster.contains(c));

        let report = cluster.prune(later + Duration::from_secs(61));
        assert_eq!(report.evicted, vec![c]);
        assert!(!cluster.contains(c));
    }

    #[tokio::test]
    async fn mark_unreachable_closes_after_threshold() {
        let cluster = manager(&Handle::current());
        let c = MemberId::new();
        cluster.merge_snapshot(&remote(c, 8000, 0, &[]));
        for _ in 0..5 {
            assert!(!cluster.mark_unreachable(c));
        }
        assert!(cluster.mark_unreachable(c));
        assert!(!cluster.mark_unreachable(cluster.local_id()));
    }

    // ========== Partner Selection Tests ==========

    #[tokio::test]
    async fn partners_exclude_self_and_closed() {
        let cluster = manager(&Handle::current());
        let open = MemberId::new();
        let gone = MemberId::new();
        cluster.merge_snapshot(&remote(open, 8000, 0, &[]));
        let snapshot = remote(gone, 8002, 0, &[]);
        cluster.merge_snapshot(&snapshot);
        cluster.leaving_cluster(&snapshot);

        let partners = cluster.select_random_partners(10);
        assert_eq!(partners.len(), 1);
        assert_eq!(partners[0].id, open);
        assert_eq!(partners[0].tcp_address(), SocketAddr::from(([10, 0, 0, 1], 8001)));
        assert!(cluster.select_random_partners(0).is_empty());
    }

    proptest! {
        #[test]
        fn partner_selection_is_distinct_and_bounded(count in 0usize..20, n in 0usize..25) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let cluster = manager(runtime.handle());
            for i in 0..count {
                cluster.merge_snapshot(&remote(MemberId::new(), 9000 + 2 * i as u16, 0, &[]));
            }

            let partners = cluster.select_random_partners(n);
            prop_assert_eq!(partners.len(), n.min(count));
            let ids: HashSet<MemberId> = partners.iter().map(|p| p.id).collect();
            prop_assert_eq!(ids.len(), partners.len());
            prop_assert!(!ids.contains(&cluster.local_id()));
        }
    }
}
