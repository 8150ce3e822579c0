// bridge.rs — EventBridge: the tree's link to the world event source.
//
// Owns the three pieces of event plumbing for one tree:
//   - the EventBus the world fires into (cloneable, handed out to callers)
//   - the EventRouter mapping event kinds to subscribed node ids
//   - the PollScheduler for nodes that ask to be polled and for tracking
//     wait deadlines
//
// Only live nodes (enabled, with every ancestor enabled) are attached.
// `collect` turns everything that happened since the last pass into one
// trigger map: node id → the entities named by its events, where `None`
// means "no particular entity" (a poll, a deadline or an entity-less event).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use mc_events::{EntityId, EventBus, EventKind, EventRouter, PollScheduler, SimTime};

use crate::config::PollDefaults;
use crate::error::GoalError;
use crate::state::NodeId;
use crate::tree::GoalTree;

/// Re-check requests gathered for one pass.
pub type Triggers = BTreeMap<NodeId, BTreeSet<Option<EntityId>>>;

/// Subscription router, inbound queue and poll scheduler of one tree.
#[derive(Debug, Default)]
pub struct EventBridge {
    bus: EventBus,
    router: EventRouter<NodeId>,
    scheduler: PollScheduler<NodeId>,
}

impl EventBridge {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            router: EventRouter::new(),
            scheduler: PollScheduler::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn router(&self) -> &EventRouter<NodeId> {
        &self.router
    }

    pub fn scheduler(&self) -> &PollScheduler<NodeId> {
        &self.scheduler
    }

    /// Subscribe every live node in the subtree of `id`.
    ///
    /// Nodes declaring a poll are registered with the scheduler; tracking
    /// groups with a running wait get their deadline back. Returns the
    /// number of nodes attached.
    pub fn attach(
        &mut self,
        tree: &GoalTree,
        id: NodeId,
        defaults: &PollDefaults,
        wall_now: DateTime<Utc>,
        sim_now: SimTime,
    ) -> Result<usize, GoalError> {
        let mut attached = 0;
        for node_id in tree.pre_order(id) {
            if !tree.is_live(node_id) {
                continue;
            }
            let node = tree.get(node_id)?;
            let kinds = node.kind.event_kinds();
            for kind in &kinds {
                self.router.subscribe(kind.clone(), node_id);
            }
            if let Some(poll) = node.kind.poll() {
                self.scheduler
                    .register(node_id, poll.interval(defaults)?, wall_now, sim_now)?;
            }
            if let Ok(group) = tree.tracking(node_id) {
                if let Some(deadline) = group.wait_deadline {
                    self.scheduler.schedule_deadline(node_id, deadline);
                }
            }
            if !kinds.is_empty() || node.kind.poll().is_some() {
                attached += 1;
                tracing::debug!(node = %node_id, kinds = kinds.len(), "attached");
            }
        }
        Ok(attached)
    }

    /// Drop every subscription, poll and deadline in the subtree of `id`.
    pub fn detach(&mut self, tree: &GoalTree, id: NodeId) {
        self.detach_ids(&tree.pre_order(id));
    }

    /// Like [`detach`](Self::detach) for nodes that may already be gone
    /// from the tree.
    pub fn detach_ids(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.router.unsubscribe_all(id);
            self.scheduler.unregister(id);
        }
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        !self.router.kinds_of(&id).is_empty() || self.scheduler.is_registered(&id)
    }

    /// Drain the bus and the scheduler into one trigger map.
    pub fn collect(&mut self, wall_now: DateTime<Utc>, sim_now: SimTime) -> Triggers {
        let events = self.bus.drain();
        let mut triggers = self.router.route(&events);
        for id in self.scheduler.due(wall_now, sim_now) {
            triggers.entry(id).or_default().insert(None);
        }
        if !triggers.is_empty() {
            tracing::debug!(
                events = events.len(),
                nodes = triggers.len(),
                "collected triggers"
            );
        }
        triggers
    }

    /// Nodes listening for goal-changed notifications.
    pub fn goal_change_subscribers(&self) -> Vec<NodeId> {
        self.router.subscribers(&EventKind::GoalChanged)
    }

    /// Mirror a tracking group's wait deadline into the scheduler.
    pub fn sync_deadline(&mut self, group: NodeId, deadline: Option<SimTime>) {
        match deadline {
            Some(at) => self.scheduler.schedule_deadline(group, at),
            None => self.scheduler.cancel_deadline(&group),
        }
    }
}
