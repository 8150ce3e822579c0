// router.rs — Subscription table from event kinds to subscribers.
//
// The router is generic over the subscriber key so this crate does not need
// to know what a goal node is; the goal engine uses its NodeId.

use std::collections::{BTreeMap, BTreeSet};

use crate::event::{EntityId, EventKind, WorldEvent};

/// Maps event kinds to the set of subscribers interested in them.
#[derive(Debug, Clone)]
pub struct EventRouter<S> {
    subscriptions: BTreeMap<EventKind, BTreeSet<S>>,
}

impl<S: Ord + Clone> EventRouter<S> {
    pub fn new() -> Self {
        Self {
            subscriptions: BTreeMap::new(),
        }
    }

    /// Subscribe `subscriber` to `kind`. Returns false if already subscribed.
    pub fn subscribe(&mut self, kind: EventKind, subscriber: S) -> bool {
        self.subscriptions
            .entry(kind)
            .or_default()
            .insert(subscriber)
    }

    /// Remove one subscription. Returns false if it did not exist.
    pub fn unsubscribe(&mut self, kind: &EventKind, subscriber: &S) -> bool {
        let removed = match self.subscriptions.get_mut(kind) {
            Some(set) => set.remove(subscriber),
            None => false,
        };
        if removed && self.subscriptions.get(kind).is_some_and(|s| s.is_empty()) {
            self.subscriptions.remove(kind);
        }
        removed
    }

    /// Remove every subscription held by `subscriber`.
    pub fn unsubscribe_all(&mut self, subscriber: &S) {
        self.subscriptions.retain(|_, set| {
            set.remove(subscriber);
            !set.is_empty()
        });
    }

    pub fn is_subscribed(&self, kind: &EventKind, subscriber: &S) -> bool {
        self.subscriptions
            .get(kind)
            .is_some_and(|set| set.contains(subscriber))
    }

    /// Subscribers of one kind, in key order.
    pub fn subscribers(&self, kind: &EventKind) -> Vec<S> {
        self.subscriptions
            .get(kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Kinds a subscriber currently listens to.
    pub fn kinds_of(&self, subscriber: &S) -> Vec<EventKind> {
        self.subscriptions
            .iter()
            .filter(|(_, set)| set.contains(subscriber))
            .map(|(kind, _)| kind.clone())
            .collect()
    }

    /// Total number of (kind, subscriber) pairs.
    pub fn len(&self) -> usize {
        self.subscriptions.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Fan a batch of events out to subscribers.
    ///
    /// Each subscriber appears once, with the set of entities the batch
    /// touched for it. `None` in the set means "no specific entity".
    pub fn route(&self, events: &[WorldEvent]) -> BTreeMap<S, BTreeSet<Option<EntityId>>> {
        let mut out: BTreeMap<S, BTreeSet<Option<EntityId>>> = BTreeMap::new();
        for event in events {
            if let Some(set) = self.subscriptions.get(&event.kind) {
                for subscriber in set {
                    out.entry(subscriber.clone())
                        .or_default()
                        .insert(event.entity.clone());
                }
            }
        }
        out
    }
}

impl<S: Ord + Clone> Default for EventRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}
