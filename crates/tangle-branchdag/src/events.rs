//! Typed event routing.
//!
//! Events are fanned out to filtered subscribers over
//! `tokio::sync::broadcast` channels. Receivers can be drained synchronously
//! with `try_recv`, so no runtime is needed to consume them.

use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tangle_types::BranchId;

/// An event that can be routed by kind.
pub trait RoutedEvent: Clone + Send + 'static {
    type Kind: Copy + PartialEq + fmt::Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// Filter for subscribing to a subset of events.
#[derive(Clone, Debug)]
pub struct EventFilter<K> {
    /// If set, only events of these kinds are delivered.
    pub kinds: Option<Vec<K>>,
}

impl<K: PartialEq> EventFilter<K> {
    /// Deliver every event.
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Deliver only events of the given kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = K>) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    /// Returns `true` if an event of `kind` matches this filter.
    pub fn matches(&self, kind: &K) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(kind),
            None => true,
        }
    }
}

impl<K: PartialEq> Default for EventFilter<K> {
    fn default() -> Self {
        Self::all()
    }
}

/// A broadcast channel receiver for routed events.
pub type EventStream<E> = broadcast::Receiver<E>;

struct Subscriber<E: RoutedEvent> {
    filter: EventFilter<E::Kind>,
    sender: broadcast::Sender<E>,
}

/// Fan-out router that delivers events to matching subscribers.
pub struct EventRouter<E: RoutedEvent> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
    capacity: usize,
}

impl<E: RoutedEvent> EventRouter<E> {
    /// Create a router whose subscriber channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber with the given filter.
    /// Returns a broadcast receiver for the matching events.
    pub fn subscribe(&self, filter: EventFilter<E::Kind>) -> EventStream<E> {
        let (tx, rx) = broadcast::channel(self.capacity);
        self.subscribers
            .write()
            .expect("router lock poisoned")
            .push(Subscriber { filter, sender: tx });
        rx
    }

    /// Route an event to all matching subscribers.
    /// Subscribers whose channels are closed are pruned.
    pub fn route(&self, event: &E) {
        let kind = event.kind();
        let mut subs = self.subscribers.write().expect("router lock poisoned");
        subs.retain(|sub| {
            if sub.filter.matches(&kind) {
                sub.sender.send(event.clone()).is_ok()
            } else {
                sub.sender.receiver_count() > 0
            }
        });
    }

    /// Route a batch of events in order.
    pub fn route_all(&self, events: &[E]) {
        for event in events {
            self.route(event);
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("router lock poisoned")
            .len()
    }
}

/// What happened to a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchEventKind {
    Preferred,
    Unpreferred,
    Liked,
    Disliked,
    Finalized,
    Unfinalized,
    Confirmed,
    Rejected,
    Pending,
}

impl fmt::Display for BranchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preferred => "branch_preferred",
            Self::Unpreferred => "branch_unpreferred",
            Self::Liked => "branch_liked",
            Self::Disliked => "branch_disliked",
            Self::Finalized => "branch_finalized",
            Self::Unfinalized => "branch_unfinalized",
            Self::Confirmed => "branch_confirmed",
            Self::Rejected => "branch_rejected",
            Self::Pending => "branch_pending",
        };
        write!(f, "{name}")
    }
}

/// A change of the opinion on a branch, emitted after the change that
/// caused it was fully applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchDagEvent {
    pub kind: BranchEventKind,
    pub branch_id: BranchId,
}

impl BranchDagEvent {
    pub fn new(kind: BranchEventKind, branch_id: BranchId) -> Self {
        Self { kind, branch_id }
    }
}

impl RoutedEvent for BranchDagEvent {
    type Kind = BranchEventKind;

    fn kind(&self) -> BranchEventKind {
        self.kind
    }
}

/// Drain every event currently buffered in `stream`.
pub fn drain<E: RoutedEvent>(stream: &mut EventStream<E>) -> Vec<E> {
    let mut events = Vec::new();
    loop {
        match stream.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
