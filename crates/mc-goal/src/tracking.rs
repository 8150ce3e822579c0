// tracking.rs — Candidate tracking groups.
//
// A tracking group asks "does some *one* entity satisfy all of these
// sub-goals at once?" (e.g. "a craft in orbit above 70 km with two crew and a
// docking port, for 30 seconds"). The group's subtree is evaluated once per
// candidate entity as a check-only probe; the probe of the winning candidate
// is committed to the tree so the subtree presents that entity's progress.
//
// Selection on every update:
//   1. incoming candidates outside a non-empty allow-list are ignored
//   2. while the group is Complete or waiting, the tracked candidate is
//      re-verified first and keeps priority if it still qualifies
//   3. incoming candidates are probed; the first one satisfying every
//      required child wins
//   4. otherwise remembered candidates with partial success are re-probed
//   5. failing all that, the active entity (if allowed) becomes the subject
//      for presentation, unsatisfied
//
// With a `wait` configured, a winner must keep qualifying for that many
// simulated seconds before the group completes. Regressing cancels the wait;
// switching subject resets it.

use std::collections::{BTreeMap, BTreeSet};

use mc_events::{EntityId, EventKind, SimTime};
use serde::{Deserialize, Serialize};

use crate::error::GoalError;
use crate::eval::{Evaluator, Probe};
use crate::node::PollSpec;
use crate::state::{Memo, NodeId, NodeState};
use crate::tree::GoalTree;

/// What a group remembers about one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMemo {
    /// Satisfied every required child when last probed.
    #[serde(default)]
    pub satisfied: bool,

    /// Descendant memos as evaluated against this candidate.
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Memo>,
}

impl CandidateMemo {
    /// Worth re-probing: satisfied before, or some descendant was Complete.
    pub fn has_partial_success(&self) -> bool {
        self.satisfied || self.nodes.values().any(|m| m.state == NodeState::Complete)
    }
}

/// Tracking group payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackingGroup {
    /// Allow-list; empty means any entity may be considered.
    pub candidate_keys: Vec<EntityId>,
    pub tracked: Option<EntityId>,
    pub per_candidate: BTreeMap<EntityId, CandidateMemo>,
    /// Simulated seconds the winner must keep qualifying.
    pub wait: Option<f64>,
    pub wait_deadline: Option<SimTime>,
    /// Extra event kinds on top of the entity population events.
    pub events: Vec<EventKind>,
    pub poll: Option<PollSpec>,
}

impl TrackingGroup {
    pub fn new(candidate_keys: Vec<EntityId>, wait: Option<f64>) -> Self {
        Self {
            candidate_keys,
            wait,
            ..Self::default()
        }
    }

    pub fn allows(&self, entity: &EntityId) -> bool {
        self.candidate_keys.is_empty() || self.candidate_keys.contains(entity)
    }

    pub fn is_waiting(&self) -> bool {
        self.wait_deadline.is_some()
    }

    pub fn tracked(&self) -> Option<&EntityId> {
        self.tracked.as_ref()
    }
}

/// Something a tracking update wants reported.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrackingNote {
    Tracked {
        previous: Option<EntityId>,
        candidate: Option<EntityId>,
    },
    WaitStarted {
        candidate: Option<EntityId>,
        deadline: SimTime,
    },
    WaitCancelled {
        candidate: Option<EntityId>,
    },
    WaitElapsed {
        candidate: Option<EntityId>,
    },
}

/// Outcome of one tracking update.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackingOutcome {
    /// The group's own state change, if any.
    pub group_change: Option<(NodeState, NodeState)>,
    /// Descendants whose stored state changed while committing the subject.
    pub committed: Vec<(NodeId, NodeState, NodeState)>,
    pub notes: Vec<TrackingNote>,
    pub wait_deadline: Option<SimTime>,
}

/// Re-run candidate selection for `group_id`.
///
/// `hints` are the entities named by the triggering events; `None` means
/// "no particular entity" and stands for the tracked candidate plus the
/// world's active entity.
pub(crate) fn update_group(
    tree: &mut GoalTree,
    eval: &mut Evaluator<'_>,
    group_id: NodeId,
    hints: &BTreeSet<Option<EntityId>>,
) -> Result<TrackingOutcome, GoalError> {
    let world = eval.world();
    let now = world.sim_time();
    let mut group = tree.tracking(group_id)?.clone();
    let group_state = tree.get(group_id)?.state();
    let mut notes = Vec::new();

    let previous = group.tracked.clone();
    group.per_candidate.retain(|e, _| world.contains(e));
    if let Some(tracked) = &group.tracked {
        if !world.contains(tracked) {
            tracing::info!(group = %group_id, candidate = %tracked, "tracked candidate left the world");
            group.tracked = None;
        }
    }

    let mut probes: BTreeMap<EntityId, Probe> = BTreeMap::new();
    let mut winner: Option<EntityId> = None;

    // Tracked candidate priority while complete or waiting.
    if let Some(tracked) = group.tracked.clone() {
        if group_state == NodeState::Complete || group.is_waiting() {
            let probe = probe_candidate(tree, eval, &mut group, group_id, &tracked);
            if probe.satisfied {
                winner = Some(tracked.clone());
            }
            probes.insert(tracked, probe);
        }
    }

    if winner.is_none() {
        let mut incoming: Vec<EntityId> = Vec::new();
        for hint in hints {
            match hint {
                Some(entity) => incoming.push(entity.clone()),
                None => {
                    incoming.extend(group.tracked.clone());
                    incoming.extend(world.active_entity());
                }
            }
        }
        let mut seen = BTreeSet::new();
        incoming.retain(|e| seen.insert(e.clone()) && group.allows(e) && world.contains(e));

        for candidate in incoming {
            if probes.contains_key(&candidate) {
                continue;
            }
            let probe = probe_candidate(tree, eval, &mut group, group_id, &candidate);
            if probe.satisfied && winner.is_none() {
                winner = Some(candidate.clone());
            }
            probes.insert(candidate, probe);
        }
    }

    if winner.is_none() {
        let mut remembered: Vec<EntityId> = group
            .per_candidate
            .iter()
            .filter(|(e, memo)| memo.has_partial_success() && !probes.contains_key(*e) && group.allows(e))
            .map(|(e, _)| e.clone())
            .collect();
        if let Some(tracked) = &group.tracked {
            if let Some(pos) = remembered.iter().position(|e| e == tracked) {
                let t = remembered.remove(pos);
                remembered.insert(0, t);
            }
        }
        for candidate in remembered {
            let probe = probe_candidate(tree, eval, &mut group, group_id, &candidate);
            let satisfied = probe.satisfied;
            probes.insert(candidate.clone(), probe);
            if satisfied {
                winner = Some(candidate);
                break;
            }
        }
    }

    let subject = winner.clone().or_else(|| {
        world
            .active_entity()
            .filter(|e| group.allows(e) && world.contains(e))
            .or_else(|| group.tracked.clone())
    });

    if subject != previous {
        tracing::info!(
            group = %group_id,
            from = ?previous.as_ref().map(EntityId::as_str),
            to = ?subject.as_ref().map(EntityId::as_str),
            "tracked candidate changed"
        );
        if group.wait_deadline.take().is_some() {
            notes.push(TrackingNote::WaitCancelled {
                candidate: previous.clone(),
            });
        }
        notes.push(TrackingNote::Tracked {
            previous: previous.clone(),
            candidate: subject.clone(),
        });
    }
    group.tracked = subject.clone();

    // Commit the subject's probe, children before parents.
    let mut committed = Vec::new();
    let (satisfied, failed) = match &subject {
        Some(s) => {
            let probe = match probes.remove(s) {
                Some(p) => p,
                None => probe_candidate(tree, eval, &mut group, group_id, s),
            };
            for id in tree.post_order(group_id) {
                if id == group_id {
                    continue;
                }
                if let Some(memo) = probe.overlay.get(id) {
                    if let Some((from, to)) = tree.set_state(id, memo) {
                        committed.push((id, from, to));
                    }
                }
            }
            (probe.satisfied, probe.failed)
        }
        None => (false, false),
    };

    let switched = subject != previous;
    let state = if satisfied {
        match group.wait {
            Some(wait) if wait > 0.0 => {
                if group_state == NodeState::Complete && !switched {
                    NodeState::Complete
                } else {
                    match group.wait_deadline {
                        Some(deadline) if now >= deadline => {
                            group.wait_deadline = None;
                            tracing::info!(group = %group_id, "wait elapsed");
                            notes.push(TrackingNote::WaitElapsed {
                                candidate: subject.clone(),
                            });
                            NodeState::Complete
                        }
                        Some(_) => NodeState::Incomplete,
                        None => {
                            let deadline = now + wait;
                            group.wait_deadline = Some(deadline);
                            tracing::info!(group = %group_id, %deadline, "wait started");
                            notes.push(TrackingNote::WaitStarted {
                                candidate: subject.clone(),
                                deadline,
                            });
                            NodeState::Incomplete
                        }
                    }
                }
            }
            _ => NodeState::Complete,
        }
    } else {
        if group.wait_deadline.take().is_some() {
            tracing::info!(group = %group_id, "wait cancelled");
            notes.push(TrackingNote::WaitCancelled {
                candidate: subject.clone(),
            });
        }
        if failed {
            NodeState::Failed
        } else {
            NodeState::Incomplete
        }
    };

    let wait_deadline = group.wait_deadline;
    *tree.tracking_mut(group_id)? = group;
    let group_change = tree.set_state(group_id, Memo::new(state));

    Ok(TrackingOutcome {
        group_change,
        committed,
        notes,
        wait_deadline,
    })
}

/// Probe one candidate and remember the result.
fn probe_candidate(
    tree: &GoalTree,
    eval: &mut Evaluator<'_>,
    group: &mut TrackingGroup,
    group_id: NodeId,
    candidate: &EntityId,
) -> Probe {
    let seed = group
        .per_candidate
        .get(candidate)
        .map(|m| m.nodes.clone())
        .unwrap_or_default();
    let probe = eval.probe(tree, group_id, candidate, &seed);
    tracing::debug!(group = %group_id, %candidate, satisfied = probe.satisfied, "probed candidate");
    let nodes = tree
        .post_order(group_id)
        .into_iter()
        .filter(|id| *id != group_id)
        .filter_map(|id| probe.overlay.get(id).map(|m| (id, m)))
        .collect();
    group.per_candidate.insert(
        candidate.clone(),
        CandidateMemo {
            satisfied: probe.satisfied,
            nodes,
        },
    );
    probe
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ConditionNode, NodeKind, NodeSpec};
    use crate::world::{MemoryWorld, PredicateRegistry, World};

    fn condition(key: &str) -> NodeSpec {
        NodeSpec::new(NodeKind::Condition(ConditionNode {
            predicate: PredicateRegistry::new().resolve_entity(key).unwrap(),
            fail_on_false: false,
            events: Vec::new(),
            poll: None,
        }))
    }

    fn group_tree(keys: Vec<EntityId>, wait: Option<f64>) -> GoalTree {
        GoalTree::new(
            NodeSpec::new(NodeKind::Tracking(TrackingGroup::new(keys, wait)))
                .child(condition("attr:orbit>=1"))
                .child(condition("attr:crew>=2")),
        )
        .unwrap()
    }

    fn fleet() -> MemoryWorld {
        let mut world = MemoryWorld::new();
        for (craft, orbit, crew) in [("a", 1.0, 0.0), ("b", 1.0, 3.0), ("c", 0.0, 2.0)] {
            world.add_entity(craft);
            world.set_attribute(craft, "orbit", orbit);
            world.set_attribute(craft, "crew", crew);
        }
        world
    }

    fn update(tree: &mut GoalTree, world: &dyn World, hint: Option<&str>) -> TrackingOutcome {
        let mut eval = Evaluator::new(world);
        let hints = [hint.map(EntityId::new)].into_iter().collect();
        let root = tree.root();
        update_group(tree, &mut eval, root, &hints).unwrap()
    }

    fn tracked(tree: &GoalTree) -> Option<String> {
        tree.tracking(tree.root())
            .unwrap()
            .tracked()
            .map(|e| e.as_str().to_string())
    }

    #[test]
    fn converges_on_the_single_satisfying_candidate() {
        let world = fleet();
        let mut tree = group_tree(Vec::new(), None);

        update(&mut tree, &world, Some("a"));
        assert_eq!(tree.state(), NodeState::Incomplete);
        update(&mut tree, &world, Some("c"));
        assert_eq!(tree.state(), NodeState::Incomplete);
        let outcome = update(&mut tree, &world, Some("b"));
        assert_eq!(tracked(&tree).as_deref(), Some("b"));
        assert_eq!(tree.state(), NodeState::Complete);
        assert!(outcome.notes.iter().any(|n| matches!(n, TrackingNote::Tracked { .. })));
        // Descendants present b's progress.
        assert_eq!(tree.state_of(NodeId(2)), Some(NodeState::Complete));

        for other in ["a", "c", "a"] {
            update(&mut tree, &world, Some(other));
            assert_eq!(tracked(&tree).as_deref(), Some("b"));
            assert_eq!(tree.state(), NodeState::Complete);
        }
    }

    #[test]
    fn allow_list_excludes_candidates() {
        let world = fleet();
        let mut tree = group_tree(vec![EntityId::new("a"), EntityId::new("c")], None);
        update(&mut tree, &world, Some("b"));
        assert_eq!(tracked(&tree), None);
        assert_eq!(tree.state(), NodeState::Incomplete);
    }

    #[test]
    fn remembered_partial_candidate_is_retried() {
        let mut world = fleet();
        let mut tree = group_tree(Vec::new(), None);
        // a has orbit but not crew: partial success remembered.
        update(&mut tree, &world, Some("a"));
        world.set_attribute("a", "crew", 2.0);
        // An event about c alone still finds a.
        update(&mut tree, &world, Some("c"));
        assert_eq!(tracked(&tree).as_deref(), Some("a"));
        assert_eq!(tree.state(), NodeState::Complete);
    }

    #[test]
    fn active_entity_is_the_fallback_subject() {
        let mut world = fleet();
        world.set_active(Some(EntityId::new("c")));
        let mut tree = group_tree(Vec::new(), None);
        update(&mut tree, &world, Some("a"));
        assert_eq!(tracked(&tree).as_deref(), Some("c"));
        assert_eq!(tree.state(), NodeState::Incomplete);
        // c's crew condition is presented.
        assert_eq!(tree.state_of(NodeId(2)), Some(NodeState::Complete));
        assert_eq!(tree.state_of(NodeId(1)), Some(NodeState::Incomplete));
    }

    #[test]
    fn wait_is_cancelled_by_regression_and_restarts_fresh() {
        let mut world = fleet();
        let mut tree = group_tree(Vec::new(), Some(30.0));

        let outcome = update(&mut tree, &world, Some("b"));
        assert_eq!(tree.state(), NodeState::Incomplete);
        assert_eq!(outcome.wait_deadline, Some(SimTime(30.0)));

        world.advance(10.0);
        world.set_attribute("b", "crew", 1.0);
        let outcome = update(&mut tree, &world, Some("b"));
        assert_eq!(outcome.wait_deadline, None);
        assert!(outcome
            .notes
            .iter()
            .any(|n| matches!(n, TrackingNote::WaitCancelled { .. })));
        assert_eq!(tree.state(), NodeState::Incomplete);

        world.advance(5.0);
        world.set_attribute("b", "crew", 3.0);
        let outcome = update(&mut tree, &world, Some("b"));
        assert_eq!(outcome.wait_deadline, Some(SimTime(45.0)));

        world.advance(29.0);
        update(&mut tree, &world, None);
        assert_eq!(tree.state(), NodeState::Incomplete);

        world.advance(1.0);
        let outcome = update(&mut tree, &world, None);
        assert_eq!(tree.state(), NodeState::Complete);
        assert!(outcome
            .notes
            .iter()
            .any(|n| matches!(n, TrackingNote::WaitElapsed { .. })));

        // Stays complete while still satisfied.
        world.advance(100.0);
        update(&mut tree, &world, None);
        assert_eq!(tree.state(), NodeState::Complete);
    }

    #[test]
    fn destroyed_tracked_candidate_is_dropped() {
        let mut world = fleet();
        let mut tree = group_tree(Vec::new(), None);
        update(&mut tree, &world, Some("b"));
        assert_eq!(tracked(&tree).as_deref(), Some("b"));

        world.remove_entity(&EntityId::new("b"));
        update(&mut tree, &world, Some("b"));
        assert_eq!(tracked(&tree), None);
        assert_eq!(tree.state(), NodeState::Incomplete);
        assert!(!tree
            .tracking(tree.root())
            .unwrap()
            .per_candidate
            .contains_key(&EntityId::new("b")));
    }
}
