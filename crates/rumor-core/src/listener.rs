//! Cluster event notification.
//!
//! Subscribers implement [`ClusterListener`] and are registered on the
//! [`ClusterManager`](crate::ClusterManager). Events are produced while a
//! member's lock is held and queued on an unbounded channel; a dispatcher task
//! delivers them off the merging thread, preserving per-member order.

use crate::protocol::MemberId;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// What happened to a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterAction {
    /// The member completed its first full payload.
    Added,
    /// The member's attributes changed.
    Updated,
    /// The member left or was declared unreachable.
    Removed,
}

impl fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// A single membership or attribute transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    /// Name of the cluster the member belongs to.
    pub cluster: String,
    /// The transition.
    pub action: ClusterAction,
    /// The member concerned.
    pub member: MemberId,
    /// Attribute keys that appeared.
    pub added: BTreeSet<String>,
    /// Attribute keys that disappeared.
    pub removed: BTreeSet<String>,
    /// Attribute keys whose value changed.
    pub updated: BTreeSet<String>,
}

/// Receives cluster events.
///
/// Called from the dispatcher task. Implementations should return quickly.
pub trait ClusterListener: Send + Sync {
    /// Handles one event.
    fn cluster_event(&self, event: &ClusterEvent);
}

impl<F> ClusterListener for F
where
    F: Fn(&ClusterEvent) + Send + Sync,
{
    fn cluster_event(&self, event: &ClusterEvent) {
        self(event);
    }
}

/// Immutable set of listeners interested in a member.
#[derive(Clone, Default)]
pub struct Listeners(Arc<[Arc<dyn ClusterListener>]>);

impl Listeners {
    /// Builds a set from a list of listeners.
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn ClusterListener>>) -> Self {
        Self(listeners.into())
    }

    /// Returns true if nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.0.len()).finish()
    }
}

/// An event paired with the listeners it must reach.
#[derive(Debug)]
pub struct Delivery {
    listeners: Listeners,
    event: ClusterEvent,
}

impl Delivery {
    /// The event being delivered.
    #[must_use]
    pub const fn event(&self) -> &ClusterEvent {
        &self.event
    }

    /// Hands the event to every listener, isolating panics.
    pub fn deliver(&self) {
        for listener in self.listeners.0.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.cluster_event(&self.event)));
            if outcome.is_err() {
                error!(
                    member = %self.event.member,
                    action = %self.event.action,
                    "cluster listener panicked"
                );
            }
        }
    }
}

/// Sending half of the event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl EventSink {
    /// Creates a sink and the receiver to drain it.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues an event for `listeners`. No-op when the set is empty.
    pub fn emit(&self, listeners: &Listeners, event: ClusterEvent) {
        if listeners.is_empty() {
            return;
        }
        trace!(member = %event.member, action = %event.action, "queueing cluster event");
        let delivery = Delivery {
            listeners: listeners.clone(),
            event,
        };
        if self.tx.send(delivery).is_err() {
            trace!("event dispatcher stopped, dropping cluster event");
        }
    }
}

/// Delivers queued events until every sink is dropped.
pub async fn dispatch(mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        delivery.deliver();
    }
}
