// engine.rs — GoalEngine: one goal tree wired to the world.
//
// The engine owns a tree, its EventBridge and the notification sinks, and
// runs evaluation passes:
//
//   1. collect triggers: routed world events, due polls and deadlines, and
//      re-checks requested since the last pass
//   2. evaluate the triggered nodes deepest first (then in tree order); a
//      node that changes schedules its parent, and a SequenceStep sibling
//      further along whose guard may have opened
//   3. deliver goal-changed notifications to Reference subscribers, in
//      bounded rounds, at most once per subscriber per pass and never to a
//      node whose own change is the only news
//   4. freeze nodes that reached a terminal state with disable_on_terminal,
//      recompute sequence concealment, report predicate errors, apply
//      mutations queued during the pass, mirror wait deadlines
//
// Triggers aimed at filters go to their FilterGroup; triggers aimed inside
// a tracking group go to the group, which re-runs candidate selection with
// the entities named by the events as incoming candidates. Everything
// outside a tracking group is evaluated against the world's active entity.
//
// A pass holds the bus's pass guard: events fired while it runs (by a
// predicate or a sink) are handled by the next pass.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use mc_events::{EntityId, EventBus, SimTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::{EventBridge, Triggers};
use crate::codec::{self, LoadReport};
use crate::combinator;
use crate::config::EngineConfig;
use crate::definition::TreeDefinition;
use crate::error::GoalError;
use crate::eval::{self, Evaluator, Overlay};
use crate::events::{EventDispatcher, GoalEvent, NotificationSink};
use crate::node::{NodeKind, NodeSpec};
use crate::outline;
use crate::state::{NodeId, NodeState};
use crate::store::SavedTree;
use crate::tracking::{self, TrackingNote, TrackingOutcome};
use crate::tree::{GoalTree, Mutation, MutationQueue};
use crate::world::{PredicateRegistry, World};

/// A change reported upward after a pass.
///
/// A tracking group switching subject commits many descendants at once; it
/// is reported as one change of the group with the committed descendants
/// in `batched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub root: NodeId,
    pub changed: NodeId,
    pub from: NodeState,
    pub to: NodeState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batched: Vec<NodeId>,
}

/// Nodes waiting to be evaluated in this pass, deepest first.
#[derive(Debug, Default)]
struct Worklist {
    queue: BTreeSet<(Reverse<usize>, Vec<usize>, NodeId)>,
    hints: Triggers,
}

impl Worklist {
    /// Queue `id`, redirected to the node that actually evaluates it.
    fn schedule(&mut self, tree: &GoalTree, id: NodeId, hints: &BTreeSet<Option<EntityId>>) {
        let Some(node) = tree.node(id) else {
            return;
        };
        let target = if let Some(group) = tree.tracking_ancestor(id) {
            group
        } else if node.kind.is_filter() {
            match node.parent() {
                Some(parent) => parent,
                None => return,
            }
        } else {
            id
        };
        if !tree.is_live(target) {
            return;
        }
        let Some(path) = tree.path_of(target) else {
            return;
        };
        self.queue.insert((Reverse(path.depth()), path.0, target));
        let entry = self.hints.entry(target).or_default();
        if hints.is_empty() {
            entry.insert(None);
        } else {
            entry.extend(hints.iter().cloned());
        }
    }

    fn pop(&mut self) -> Option<(NodeId, BTreeSet<Option<EntityId>>)> {
        let (_, _, id) = self.queue.pop_first()?;
        let hints = self.hints.remove(&id).unwrap_or_default();
        Some((id, hints))
    }
}

/// What one pass produced.
#[derive(Debug, Default)]
struct PassOutput {
    changes: Vec<StateChange>,
    events: Vec<GoalEvent>,
    /// Nodes whose stored state changed since the last delivery round.
    origins: BTreeSet<NodeId>,
}

/// A goal tree with its event plumbing and sinks.
pub struct GoalEngine {
    tree_id: Uuid,
    name: String,
    definition_digest: Option<String>,
    tree: GoalTree,
    bridge: EventBridge,
    dispatcher: EventDispatcher,
    config: EngineConfig,
    mutations: MutationQueue,
    active: bool,
    rechecks: Triggers,
    clock: (DateTime<Utc>, SimTime),
    pending_repairs: Vec<String>,
}

impl GoalEngine {
    pub fn new(name: impl Into<String>, tree: GoalTree, config: EngineConfig) -> Self {
        Self {
            tree_id: Uuid::new_v4(),
            name: name.into(),
            definition_digest: None,
            tree,
            bridge: EventBridge::new(EventBus::new()),
            dispatcher: EventDispatcher::new(),
            config,
            mutations: MutationQueue::new(),
            active: false,
            rechecks: Triggers::new(),
            clock: (Utc::now(), SimTime::default()),
            pending_repairs: Vec::new(),
        }
    }

    /// Build the tree described by `definition`.
    pub fn from_definition(
        definition: &TreeDefinition,
        registry: &PredicateRegistry,
        config: EngineConfig,
    ) -> Result<Self, GoalError> {
        let tree = definition.build(registry)?;
        let mut engine = Self::new(definition.name.clone(), tree, config);
        engine.definition_digest = Some(definition.digest()?);
        tracing::info!(
            tree_id = %engine.tree_id,
            name = %engine.name,
            nodes = engine.tree.len(),
            "goal tree built"
        );
        Ok(engine)
    }

    /// Rebuild an engine from a saved tree. Repairs are reported by the
    /// returned LoadReport and, once the engine is activated, as a
    /// LoadRepaired event.
    pub fn restore(
        saved: &SavedTree,
        registry: &PredicateRegistry,
        config: EngineConfig,
    ) -> (Self, LoadReport) {
        let (tree, report) = codec::load_tree(&saved.root, registry);
        let mut engine = Self::new(saved.name.clone(), tree, config);
        engine.tree_id = saved.tree_id;
        engine.definition_digest = saved.definition_digest.clone();
        engine.pending_repairs = report.repairs.clone();
        tracing::info!(
            tree_id = %engine.tree_id,
            nodes = engine.tree.len(),
            repairs = report.repairs.len(),
            "goal tree restored"
        );
        (engine, report)
    }

    /// The persisted form of the tree as it stands.
    pub fn snapshot(&self) -> Result<SavedTree, GoalError> {
        Ok(SavedTree {
            tree_id: self.tree_id,
            name: self.name.clone(),
            definition_digest: self.definition_digest.clone(),
            saved_at: Utc::now(),
            root: codec::save_tree(&self.tree)?,
        })
    }

    pub fn tree_id(&self) -> Uuid {
        self.tree_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &GoalTree {
        &self.tree
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle the world fires events into.
    pub fn bus(&self) -> EventBus {
        self.bridge.bus().clone()
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    /// Handle for requesting structural changes from inside a pass.
    pub fn mutations(&self) -> MutationQueue {
        self.mutations.clone()
    }

    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.dispatcher.add_sink(sink);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Effective root state.
    pub fn state(&self) -> NodeState {
        self.tree.state()
    }

    pub fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.tree.node(id).map(|n| n.effective_state())
    }

    /// The candidate a tracking group is following.
    pub fn tracked(&self, group: NodeId) -> Result<Option<EntityId>, GoalError> {
        Ok(self.tree.tracking(group)?.tracked.clone())
    }

    pub fn outline(&self) -> String {
        outline::render_outline(&self.tree)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Subscribe the tree and schedule a full re-check for the next pass.
    pub fn activate(&mut self, wall_now: DateTime<Utc>, sim_now: SimTime) -> Result<(), GoalError> {
        if self.active {
            return Ok(());
        }
        self.clock = (wall_now, sim_now);
        let attached = self.bridge.attach(
            &self.tree,
            self.tree.root(),
            &self.config.poll,
            wall_now,
            sim_now,
        )?;
        self.active = true;
        self.recheck_all();
        tracing::info!(tree_id = %self.tree_id, attached, "goal tree activated");

        if !self.pending_repairs.is_empty() {
            let repairs = std::mem::take(&mut self.pending_repairs);
            self.dispatcher
                .dispatch(&GoalEvent::load_repaired(self.tree_id, repairs));
        }
        Ok(())
    }

    /// Drop every subscription, poll and deadline. State is kept.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.bridge.detach(&self.tree, self.tree.root());
        self.active = false;
        self.rechecks.clear();
        tracing::info!(tree_id = %self.tree_id, "goal tree deactivated");
    }

    /// Schedule every live node for the next pass.
    pub fn recheck_all(&mut self) {
        let ids: Vec<NodeId> = self.tree.ids().collect();
        for id in ids {
            self.request(id, None);
        }
    }

    /// Schedule one node for the next pass.
    pub fn evaluate_node(&mut self, id: NodeId) -> Result<(), GoalError> {
        self.tree.get(id)?;
        self.request(id, None);
        Ok(())
    }

    /// Offer `candidate` to tracking group `group` on the next pass.
    pub fn update_candidate(&mut self, group: NodeId, candidate: impl Into<EntityId>) -> Result<(), GoalError> {
        self.tree.tracking(group)?;
        self.request(group, Some(candidate.into()));
        Ok(())
    }

    fn request(&mut self, id: NodeId, hint: Option<EntityId>) {
        self.rechecks.entry(id).or_default().insert(hint);
    }

    /// Run passes until nothing is left to do or the pass budget is spent.
    ///
    /// Returns every change reported upward, in order.
    pub fn process(&mut self, world: &dyn World, wall_now: DateTime<Utc>) -> Result<Vec<StateChange>, GoalError> {
        if !self.active {
            tracing::debug!(tree_id = %self.tree_id, "process called on inactive tree");
            return Ok(Vec::new());
        }
        self.clock = (wall_now, world.sim_time());

        let mut changes = Vec::new();
        for pass in 0..self.config.max_event_passes.max(1) {
            let mut triggers = self.bridge.collect(wall_now, world.sim_time());
            for (id, hints) in std::mem::take(&mut self.rechecks) {
                triggers.entry(id).or_default().extend(hints);
            }
            if triggers.is_empty() {
                break;
            }
            tracing::debug!(tree_id = %self.tree_id, pass, nodes = triggers.len(), "evaluation pass");
            changes.extend(self.run_pass(world, triggers)?);
        }

        if self.bridge.bus().pending() > 0 {
            tracing::debug!(
                tree_id = %self.tree_id,
                pending = self.bridge.bus().pending(),
                "events left for the next call"
            );
        }
        Ok(changes)
    }

    fn run_pass(&mut self, world: &dyn World, triggers: Triggers) -> Result<Vec<StateChange>, GoalError> {
        let bus = self.bridge.bus().clone();
        let guard = bus.begin_pass()?;
        let mut eval = Evaluator::new(world);
        let mut out = PassOutput::default();
        let root_before = self.tree.state();

        let mut work = Worklist::default();
        for (id, hints) in &triggers {
            work.schedule(&self.tree, *id, hints);
        }
        self.drain(&mut work, &mut eval, &mut out)?;

        let mut delivered = BTreeSet::new();
        for round in 0..self.config.max_goal_change_rounds {
            if out.origins.is_empty() {
                break;
            }
            let targets: Vec<NodeId> = self
                .bridge
                .goal_change_subscribers()
                .into_iter()
                .filter(|s| !delivered.contains(s))
                .filter(|s| out.origins.iter().any(|o| o != s))
                .collect();
            if targets.is_empty() {
                break;
            }
            out.origins.clear();
            tracing::debug!(round, subscribers = targets.len(), "delivering goal changes");
            let none = BTreeSet::from([None]);
            for target in targets {
                delivered.insert(target);
                work.schedule(&self.tree, target, &none);
            }
            self.drain(&mut work, &mut eval, &mut out)?;
        }
        // Changes made after a subscriber already heard this pass reach it
        // on the next one.
        if !out.origins.is_empty() {
            for subscriber in self.bridge.goal_change_subscribers() {
                if out.origins.iter().any(|o| *o != subscriber) {
                    tracing::debug!(node = %subscriber, "goal change carried to the next pass");
                    self.request(subscriber, None);
                }
            }
        }

        self.freeze_terminal_nodes();
        self.update_concealment();
        for (node, error) in eval.take_errors() {
            tracing::warn!(node = %node, predicate = %error.predicate, "{}", error.message);
            out.events.push(GoalEvent::PredicateFailed {
                tree_id: self.tree_id,
                node,
                predicate: error.predicate,
                message: error.message,
                timestamp: Utc::now(),
            });
        }
        drop(guard);

        for mutation in self.mutations.drain() {
            if let Err(e) = self.apply(mutation) {
                tracing::warn!("queued mutation rejected: {}", e);
            }
        }

        let root_after = self.tree.state();
        if root_after != root_before {
            tracing::info!(
                tree_id = %self.tree_id,
                from = %root_before,
                to = %root_after,
                "goal tree state changed"
            );
        }
        for event in &out.events {
            self.dispatcher.dispatch(event);
        }
        Ok(out.changes)
    }

    fn drain(&mut self, work: &mut Worklist, eval: &mut Evaluator<'_>, out: &mut PassOutput) -> Result<(), GoalError> {
        while let Some((id, hints)) = work.pop() {
            let Some(node) = self.tree.node(id) else {
                continue;
            };
            if matches!(node.kind, NodeKind::Tracking(_)) {
                let outcome = tracking::update_group(&mut self.tree, eval, id, &hints)?;
                self.bridge.sync_deadline(id, outcome.wait_deadline);
                if self.record_tracking(id, outcome, out) {
                    self.schedule_dependents(work, id);
                }
                continue;
            }

            let subject = eval.world().active_entity();
            let mut overlay = Overlay::default();
            eval.evaluate(&self.tree, &mut overlay, id, subject.as_ref());
            let mut memos = overlay.into_memos();
            let own = memos.remove(&id);
            for (child, memo) in memos {
                if let Some((from, to)) = self.tree.set_state(child, memo) {
                    self.record(child, from, to, out);
                }
            }
            if let Some((from, to)) = own.and_then(|memo| self.tree.set_state(id, memo)) {
                self.record(id, from, to, out);
                self.schedule_dependents(work, id);
            }
        }
        Ok(())
    }

    /// The parent of a changed node, and later steps of a sequence whose
    /// guard may now pass.
    fn schedule_dependents(&self, work: &mut Worklist, id: NodeId) {
        let Some(parent) = self.tree.node(id).and_then(|n| n.parent()) else {
            return;
        };
        let none = BTreeSet::from([None]);
        work.schedule(&self.tree, parent, &none);
        if let Some(p) = self.tree.node(parent) {
            if matches!(p.kind, NodeKind::Sequence(_)) {
                for sibling in p.children().iter().skip_while(|c| **c != id).skip(1) {
                    if matches!(self.tree.node(*sibling).map(|n| &n.kind), Some(NodeKind::SequenceStep)) {
                        work.schedule(&self.tree, *sibling, &none);
                    }
                }
            }
        }
    }

    fn record(&self, id: NodeId, from: NodeState, to: NodeState, out: &mut PassOutput) {
        let label = self.tree.node(id).map(|n| n.label().to_string()).unwrap_or_default();
        tracing::debug!(node = %id, %from, %to, "state changed");
        out.origins.insert(id);
        out.events
            .push(GoalEvent::state_changed(self.tree_id, id, &label, from, to));
        out.changes.push(StateChange {
            root: self.tree.root(),
            changed: id,
            from,
            to,
            batched: Vec::new(),
        });
    }

    /// Report a tracking update. Returns true if the group's own state
    /// changed.
    fn record_tracking(&self, group: NodeId, outcome: TrackingOutcome, out: &mut PassOutput) -> bool {
        let TrackingOutcome {
            group_change,
            committed,
            notes,
            ..
        } = outcome;
        let switched = notes.iter().any(|n| matches!(n, TrackingNote::Tracked { .. }));

        for (id, from, to) in &committed {
            let label = self.tree.node(*id).map(|n| n.label().to_string()).unwrap_or_default();
            out.origins.insert(*id);
            out.events
                .push(GoalEvent::state_changed(self.tree_id, *id, &label, *from, *to));
        }
        if let Some((from, to)) = group_change {
            let label = self.tree.node(group).map(|n| n.label().to_string()).unwrap_or_default();
            out.origins.insert(group);
            out.events
                .push(GoalEvent::state_changed(self.tree_id, group, &label, from, to));
        }
        if group_change.is_some() || switched || !committed.is_empty() {
            let state = self.tree.state_of(group).unwrap_or_default();
            let (from, to) = group_change.unwrap_or((state, state));
            out.changes.push(StateChange {
                root: self.tree.root(),
                changed: group,
                from,
                to,
                batched: committed.iter().map(|(id, _, _)| *id).collect(),
            });
        }

        for note in notes {
            let timestamp = Utc::now();
            let tree_id = self.tree_id;
            out.events.push(match note {
                TrackingNote::Tracked { previous, candidate } => GoalEvent::CandidateTracked {
                    tree_id,
                    group,
                    previous,
                    candidate,
                    timestamp,
                },
                TrackingNote::WaitStarted { candidate, deadline } => GoalEvent::WaitStarted {
                    tree_id,
                    group,
                    candidate,
                    deadline,
                    timestamp,
                },
                TrackingNote::WaitCancelled { candidate } => GoalEvent::WaitCancelled {
                    tree_id,
                    group,
                    candidate,
                    timestamp,
                },
                TrackingNote::WaitElapsed { candidate } => GoalEvent::WaitElapsed {
                    tree_id,
                    group,
                    candidate,
                    timestamp,
                },
            });
        }
        group_change.is_some()
    }

    fn freeze_terminal_nodes(&mut self) {
        let frozen: Vec<NodeId> = self
            .tree
            .ids()
            .filter(|id| {
                self.tree.node(*id).is_some_and(|n| {
                    n.flags.disable_on_terminal && n.is_enabled() && n.effective_state().is_terminal()
                })
            })
            .collect();
        for id in frozen {
            if let Ok(true) = self.tree.set_enabled(id, false) {
                self.bridge.detach(&self.tree, id);
                tracing::info!(node = %id, state = %self.tree.state_of(id).unwrap_or_default(), "node frozen");
            }
        }
    }

    fn update_concealment(&mut self) {
        let sequences: Vec<NodeId> = self
            .tree
            .ids()
            .filter(|id| matches!(self.tree.node(*id).map(|n| &n.kind), Some(NodeKind::Sequence(_))))
            .collect();
        for seq in sequences {
            let Some(node) = self.tree.node(seq) else {
                continue;
            };
            let views = eval::child_views(&self.tree, &Overlay::default(), seq);
            let hidden = combinator::concealed_indices(&views, node.effective_state())
                .into_iter()
                .filter_map(|i| node.children().get(i).copied())
                .collect();
            self.tree.set_concealed(seq, hidden);
        }
    }

    // ── Runtime binding ─────────────────────────────────────────

    /// Insert a subtree under `parent` at `index` (or last).
    pub fn add_child(&mut self, parent: NodeId, spec: NodeSpec, index: Option<usize>) -> Result<NodeId, GoalError> {
        let id = self.tree.add_subtree(parent, spec, index)?;
        if self.active {
            let (wall, sim) = self.clock;
            self.bridge.attach(&self.tree, id, &self.config.poll, wall, sim)?;
            for node in self.tree.pre_order(id) {
                self.request(node, None);
            }
        }
        tracing::info!(parent = %parent, node = %id, "child added");
        Ok(id)
    }

    /// Remove `id` and its subtree. The parent is re-checked.
    pub fn remove_child(&mut self, id: NodeId) -> Result<Vec<NodeId>, GoalError> {
        let parent = self.tree.get(id)?.parent();
        let removed = self.tree.remove_subtree(id)?;
        self.bridge.detach_ids(&removed);
        for gone in &removed {
            self.rechecks.remove(gone);
        }
        if let Some(parent) = parent {
            self.request(parent, None);
        }
        tracing::info!(node = %id, removed = removed.len(), "child removed");
        Ok(removed)
    }

    /// Resume evaluating `id` and its subtree.
    pub fn enable(&mut self, id: NodeId) -> Result<(), GoalError> {
        if self.tree.set_enabled(id, true)? && self.active {
            let (wall, sim) = self.clock;
            self.bridge.attach(&self.tree, id, &self.config.poll, wall, sim)?;
            for node in self.tree.pre_order(id) {
                self.request(node, None);
            }
        }
        Ok(())
    }

    /// Stop evaluating `id` and its subtree. Parents keep seeing its last
    /// state.
    pub fn disable(&mut self, id: NodeId) -> Result<(), GoalError> {
        if self.tree.set_enabled(id, false)? {
            self.bridge.detach(&self.tree, id);
        }
        Ok(())
    }

    /// Replace a tracking group's allow-list and re-run its selection.
    pub fn set_candidate_keys(&mut self, group: NodeId, keys: Vec<EntityId>) -> Result<(), GoalError> {
        self.tree.set_candidate_keys(group, keys)?;
        let deadline = self.tree.tracking(group)?.wait_deadline;
        self.bridge.sync_deadline(group, deadline);
        self.request(group, None);
        Ok(())
    }

    fn apply(&mut self, mutation: Mutation) -> Result<(), GoalError> {
        tracing::debug!(?mutation, "applying queued mutation");
        match mutation {
            Mutation::AddChild { parent, spec, index } => self.add_child(parent, spec, index).map(|_| ()),
            Mutation::RemoveChild(id) => self.remove_child(id).map(|_| ()),
            Mutation::Enable(id) => self.enable(id),
            Mutation::Disable(id) => self.disable(id),
            Mutation::SetCandidateKeys { group, keys } => self.set_candidate_keys(group, keys),
        }
    }
}

impl std::fmt::Debug for GoalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoalEngine")
            .field("tree_id", &self.tree_id)
            .field("name", &self.name)
            .field("nodes", &self.tree.len())
            .field("active", &self.active)
            .finish()
    }
}
