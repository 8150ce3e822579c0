// eval.rs — Per-node evaluation against the live world.
//
// Evaluation never writes to the tree directly. It reads memos through an
// Overlay (proposed memos layered over the committed ones) and writes its
// proposals back into the overlay. The engine commits an overlay with
// `GoalTree::set_state`; a tracking group keeps the overlay of a
// non-tracked candidate as a check-only probe and never commits it.

use std::collections::BTreeMap;

use mc_events::EntityId;

use crate::combinator::{self, ChildView};
use crate::error::PredicateError;
use crate::filter::{run_filters, FilterChild};
use crate::node::{effective, ConditionNode, FilterGroupNode, NodeKind, ReferenceNode, ReferenceTarget};
use crate::state::{Memo, NodeId, NodeState};
use crate::tree::GoalTree;
use crate::world::{ItemId, World};

/// Proposed memos on top of a tree's committed ones.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overlay {
    memos: BTreeMap<NodeId, Memo>,
}

impl Overlay {
    pub(crate) fn from_memos(memos: BTreeMap<NodeId, Memo>) -> Self {
        Self { memos }
    }

    pub(crate) fn memo(&self, tree: &GoalTree, id: NodeId) -> Memo {
        self.memos
            .get(&id)
            .copied()
            .or_else(|| tree.node(id).map(|n| n.memo()))
            .unwrap_or_default()
    }

    pub(crate) fn effective(&self, tree: &GoalTree, id: NodeId) -> NodeState {
        match tree.node(id) {
            Some(node) => effective(&node.flags, self.memo(tree, id).state),
            None => NodeState::Incomplete,
        }
    }

    pub(crate) fn set(&mut self, id: NodeId, memo: Memo) {
        self.memos.insert(id, memo);
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<Memo> {
        self.memos.get(&id).copied()
    }

    pub(crate) fn into_memos(self) -> BTreeMap<NodeId, Memo> {
        self.memos
    }
}

/// The SequenceStep guard: every earlier non-optional sibling is Complete.
/// Always true for other kinds.
pub(crate) fn step_ready(tree: &GoalTree, overlay: &Overlay, id: NodeId) -> bool {
    let Some(node) = tree.node(id) else {
        return true;
    };
    if !matches!(node.kind, NodeKind::SequenceStep) {
        return true;
    }
    let Some(parent) = node.parent().and_then(|p| tree.node(p)) else {
        return true;
    };
    parent
        .children()
        .iter()
        .take_while(|c| **c != id)
        .filter_map(|c| tree.node(*c))
        .filter(|c| !c.is_optional())
        .all(|c| overlay.effective(tree, c.id()) == NodeState::Complete)
}

/// Child views of `id` as seen through `overlay`.
pub(crate) fn child_views(tree: &GoalTree, overlay: &Overlay, id: NodeId) -> Vec<ChildView> {
    let Some(node) = tree.node(id) else {
        return Vec::new();
    };
    node.children()
        .iter()
        .filter_map(|c| tree.node(*c))
        .map(|c| ChildView::new(overlay.effective(tree, c.id()), c.is_optional()))
        .collect()
}

/// Result of probing a tracking group's subtree against one candidate.
#[derive(Debug, Clone)]
pub(crate) struct Probe {
    pub overlay: Overlay,
    /// Every non-optional direct child Complete.
    pub satisfied: bool,
    /// Some non-optional direct child effectively Failed.
    pub failed: bool,
}

/// Evaluates nodes for one pass. Item snapshots are fetched at most once per
/// (entity, collection) per pass.
pub(crate) struct Evaluator<'w> {
    world: &'w dyn World,
    items: BTreeMap<(EntityId, String), Option<Vec<ItemId>>>,
    errors: Vec<(NodeId, PredicateError)>,
}

impl<'w> Evaluator<'w> {
    pub(crate) fn new(world: &'w dyn World) -> Self {
        Self {
            world,
            items: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn world(&self) -> &'w dyn World {
        self.world
    }

    /// Predicate errors seen so far, deduplicated per node.
    pub(crate) fn take_errors(&mut self) -> Vec<(NodeId, PredicateError)> {
        let mut errors = std::mem::take(&mut self.errors);
        errors.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        errors
    }

    fn items(&mut self, entity: &EntityId, source: &str) -> Option<Vec<ItemId>> {
        let world = self.world;
        self.items
            .entry((entity.clone(), source.to_string()))
            .or_insert_with(|| world.items(entity, source))
            .clone()
    }

    /// Evaluate `id` against `subject`, writing proposals into `overlay`.
    ///
    /// Filters and tracking groups are skipped: filters are written by their
    /// group, tracking groups are handled by the tracking module. Nodes that
    /// are not live keep their memo.
    pub(crate) fn evaluate(
        &mut self,
        tree: &GoalTree,
        overlay: &mut Overlay,
        id: NodeId,
        subject: Option<&EntityId>,
    ) {
        let Some(node) = tree.node(id) else {
            return;
        };
        if !tree.is_live(id) {
            return;
        }
        let previous = overlay.memo(tree, id);
        let latch = !node.flags.soft_failure;

        let proposed = match &node.kind {
            NodeKind::All {
                fail_on_child_failure,
            } => Memo::new(combinator::all(
                &child_views(tree, overlay, id),
                *fail_on_child_failure,
            )),
            NodeKind::Any => Memo::new(combinator::any(&child_views(tree, overlay, id))),
            NodeKind::AtLeast { count } => {
                Memo::new(combinator::at_least(&child_views(tree, overlay, id), *count))
            }
            NodeKind::AtMost { count } => Memo::new(combinator::at_most(
                &child_views(tree, overlay, id),
                *count,
                previous.state,
                latch,
            )),
            NodeKind::NoneOf => Memo::new(combinator::none_of(
                &child_views(tree, overlay, id),
                previous.state,
                latch,
            )),
            NodeKind::Sequence(_) => {
                combinator::sequence(&child_views(tree, overlay, id), previous, latch)
            }
            NodeKind::SequenceStep => {
                Memo::new(combinator::all(&child_views(tree, overlay, id), false))
            }
            NodeKind::Condition(condition) => self.condition(id, condition, subject),
            NodeKind::Reference(reference) => reference_memo(tree, overlay, reference),
            NodeKind::FilterGroup(group) => self.filter_group(tree, overlay, id, group, subject),
            NodeKind::Filter(_) | NodeKind::CountFilter(_) | NodeKind::Tracking(_) => return,
            NodeKind::Unresolved(_) => Memo::default(),
        };

        let proposed = if proposed.state == NodeState::Complete && !step_ready(tree, overlay, id) {
            Memo {
                state: previous.state,
                progress: proposed.progress,
            }
        } else {
            proposed
        };
        overlay.set(id, proposed);
    }

    fn condition(&mut self, id: NodeId, condition: &ConditionNode, subject: Option<&EntityId>) -> Memo {
        let Some(subject) = subject else {
            return Memo::default();
        };
        match condition.predicate.test(self.world, subject) {
            Ok(true) => Memo::new(NodeState::Complete),
            Ok(false) if condition.fail_on_false => Memo::new(NodeState::Failed),
            Ok(false) => Memo::default(),
            Err(e) => {
                self.errors.push((id, e));
                Memo::default()
            }
        }
    }

    fn filter_group(
        &mut self,
        tree: &GoalTree,
        overlay: &mut Overlay,
        id: NodeId,
        group: &FilterGroupNode,
        subject: Option<&EntityId>,
    ) -> Memo {
        let snapshot = subject.and_then(|s| self.items(s, &group.source));
        let children: Vec<(NodeId, FilterChild<'_>)> = tree
            .get(id)
            .map(|n| n.children().to_vec())
            .unwrap_or_default()
            .into_iter()
            .filter(|c| tree.is_live(*c))
            .filter_map(|c| match tree.node(c).map(|n| &n.kind) {
                Some(NodeKind::Filter(f)) => Some((c, FilterChild::Match(f))),
                Some(NodeKind::CountFilter(f)) => Some((c, FilterChild::Count(f))),
                _ => None,
            })
            .collect();

        let run = run_filters(self.world, snapshot.as_deref(), &children);
        for (child, verdict) in run.verdicts {
            overlay.set(child, Memo::new(verdict));
        }
        self.errors.extend(run.errors);
        if run.satisfied {
            Memo::new(NodeState::Complete)
        } else {
            Memo::default()
        }
    }

    /// Check-only evaluation of every descendant of tracking group `group`
    /// against `candidate`, starting from `seed` (the candidate's remembered
    /// memos). Nodes missing from the seed start Incomplete, so one
    /// candidate's progress never leaks into another's.
    pub(crate) fn probe(
        &mut self,
        tree: &GoalTree,
        group: NodeId,
        candidate: &EntityId,
        seed: &BTreeMap<NodeId, Memo>,
    ) -> Probe {
        let mut order = tree.post_order(group);
        order.pop();

        let mut overlay = Overlay::default();
        for id in &order {
            let start = if tree.is_live(*id) {
                seed.get(id).copied().unwrap_or_default()
            } else {
                tree.node(*id).map(|n| n.memo()).unwrap_or_default()
            };
            overlay.set(*id, start);
        }
        for id in &order {
            self.evaluate(tree, &mut overlay, *id, Some(candidate));
        }

        let children = child_views(tree, &overlay, group);
        let satisfied = combinator::all(&children, false) == NodeState::Complete;
        let failed = children
            .iter()
            .any(|c| !c.optional && c.state == NodeState::Failed);
        Probe {
            overlay,
            satisfied,
            failed,
        }
    }
}

fn reference_memo(tree: &GoalTree, overlay: &Overlay, reference: &ReferenceNode) -> Memo {
    let target = match &reference.target {
        ReferenceTarget::Id(id) => Some(*id),
        ReferenceTarget::Path(path) => tree.resolve_path(path),
    };
    match target {
        Some(t) if tree.contains(t) && overlay.effective(tree, t) == reference.require => {
            Memo::new(NodeState::Complete)
        }
        _ => Memo::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{CountFilter, DelegateFilter, MatchPolicy};
    use crate::node::NodeSpec;
    use crate::world::{MemoryWorld, PredicateRegistry};

    fn condition(key: &str) -> NodeSpec {
        NodeSpec::new(NodeKind::Condition(ConditionNode {
            predicate: PredicateRegistry::new().resolve_entity(key).unwrap(),
            fail_on_false: false,
            events: Vec::new(),
            poll: None,
        }))
    }

    fn world() -> MemoryWorld {
        let mut world = MemoryWorld::new();
        world.add_entity("ship");
        world.set_attribute("ship", "altitude", 80_000.0);
        world.set_items(
            "ship",
            "parts",
            vec![ItemId::new("dock"), ItemId::new("antenna")],
        );
        world.set_attribute("dock", "ports", 1.0);
        world
    }

    #[test]
    fn condition_uses_subject() {
        let tree = GoalTree::new(condition("attr:altitude>70000")).unwrap();
        let world = world();
        let mut eval = Evaluator::new(&world);

        let mut overlay = Overlay::default();
        eval.evaluate(&tree, &mut overlay, tree.root(), Some(&EntityId::new("ship")));
        assert_eq!(overlay.get(tree.root()).unwrap().state, NodeState::Complete);

        let mut overlay = Overlay::default();
        eval.evaluate(&tree, &mut overlay, tree.root(), None);
        assert_eq!(overlay.get(tree.root()).unwrap().state, NodeState::Incomplete);
    }

    #[test]
    fn predicate_errors_are_collected_and_incomplete() {
        let mut registry = PredicateRegistry::new();
        registry.entity_fn("broken", |_, _| Err(PredicateError::new("broken", "no telemetry")));
        let tree = GoalTree::new(NodeSpec::new(NodeKind::Condition(ConditionNode {
            predicate: registry.resolve_entity("broken").unwrap(),
            fail_on_false: true,
            events: Vec::new(),
            poll: None,
        })))
        .unwrap();
        let world = world();
        let mut eval = Evaluator::new(&world);
        let mut overlay = Overlay::default();
        eval.evaluate(&tree, &mut overlay, tree.root(), Some(&EntityId::new("ship")));
        assert_eq!(overlay.get(tree.root()).unwrap().state, NodeState::Incomplete);
        let errors = eval.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].1.predicate, "broken");
    }

    #[test]
    fn filter_group_writes_every_filter_child() {
        let registry = PredicateRegistry::new();
        let tree = GoalTree::new(
            NodeSpec::new(NodeKind::FilterGroup(FilterGroupNode {
                source: "parts".into(),
                filters: Vec::new(),
                events: Vec::new(),
                poll: None,
            }))
            .child(NodeSpec::new(NodeKind::Filter(DelegateFilter::new(
                registry.resolve_item("attr:ports>=1").unwrap(),
                MatchPolicy::FilterAndRequireNonEmpty,
            ))))
            .child(NodeSpec::new(NodeKind::CountFilter(CountFilter::new(1, 1)))),
        )
        .unwrap();
        let world = world();
        let mut eval = Evaluator::new(&world);
        let mut overlay = Overlay::default();
        eval.evaluate(&tree, &mut overlay, tree.root(), Some(&EntityId::new("ship")));
        assert_eq!(overlay.get(NodeId(0)).unwrap().state, NodeState::Complete);
        assert_eq!(overlay.get(NodeId(1)).unwrap().state, NodeState::Complete);
        assert_eq!(overlay.get(NodeId(2)).unwrap().state, NodeState::Complete);

        // Unknown entity: no snapshot, everything Incomplete.
        let mut overlay = Overlay::default();
        eval.evaluate(&tree, &mut overlay, tree.root(), Some(&EntityId::new("rock")));
        assert_eq!(overlay.get(NodeId(0)).unwrap().state, NodeState::Incomplete);
        assert_eq!(overlay.get(NodeId(2)).unwrap().state, NodeState::Incomplete);
    }

    #[test]
    fn probe_does_not_touch_the_tree() {
        use crate::tracking::TrackingGroup;

        let tree = GoalTree::new(
            NodeSpec::new(NodeKind::Tracking(TrackingGroup::default()))
                .child(condition("attr:altitude>70000"))
                .child(condition("attr:crew>=1").optional()),
        )
        .unwrap();
        let world = world();
        let mut eval = Evaluator::new(&world);
        let probe = eval.probe(&tree, tree.root(), &EntityId::new("ship"), &BTreeMap::new());
        assert!(probe.satisfied);
        assert!(!probe.failed);
        assert_eq!(probe.overlay.get(NodeId(1)).unwrap().state, NodeState::Complete);
        assert_eq!(tree.state_of(NodeId(1)), Some(NodeState::Incomplete));

        let probe = eval.probe(&tree, tree.root(), &EntityId::new("rock"), &BTreeMap::new());
        assert!(!probe.satisfied);
    }
}
