// tree.rs — GoalTree: an arena of goal nodes indexed by stable id.
//
// Nodes never hold references to each other. A node knows its parent id and
// its ordered child ids; everything else (depth, path, ancestors, the
// tracking group a node belongs to) is computed by walking the arena.
//
// Structural rules enforced on every insertion:
//   - filter leaves sit directly under a FilterGroup, and a FilterGroup owns
//     nothing else
//   - tracking groups do not nest
//
// Runtime changes that may be requested while a pass is running go through
// a MutationQueue and are applied by the engine once the traversal ends.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use mc_events::EntityId;

use crate::error::GoalError;
use crate::eval::{self, Overlay};
use crate::node::{GoalNode, NodeFlags, NodeKind, NodeSpec, ReferenceTarget};
use crate::state::{Memo, NodeId, NodePath, NodeState};
use crate::tracking::TrackingGroup;

/// An arena-backed goal tree.
#[derive(Debug, Clone)]
pub struct GoalTree {
    nodes: BTreeMap<NodeId, GoalNode>,
    root: NodeId,
    next_id: u32,
}

impl GoalTree {
    /// Build a tree from a resolved spec.
    ///
    /// Reference targets given as paths are resolved to ids; a path that
    /// does not lead anywhere is an invalid definition.
    pub fn new(spec: NodeSpec) -> Result<Self, GoalError> {
        validate_spec(&spec, Placement::Root)?;
        let mut tree = Self::empty();
        tree.root = tree.insert(None, spec, None);
        tree.resolve_reference_paths(tree.root, true)?;
        Ok(tree)
    }

    pub(crate) fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
            root: NodeId(0),
            next_id: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Root state as parents would see it.
    pub fn state(&self) -> NodeState {
        self.effective_state(self.root)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&GoalNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut GoalNode> {
        self.nodes.get_mut(&id)
    }

    /// Like [`node`](Self::node) but an unknown id is an error.
    pub fn get(&self, id: NodeId) -> Result<&GoalNode, GoalError> {
        self.nodes.get(&id).ok_or(GoalError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.get(&id).map(GoalNode::state)
    }

    /// Effective state (soft failures read as Incomplete). Unknown ids are
    /// Incomplete.
    pub fn effective_state(&self, id: NodeId) -> NodeState {
        self.nodes
            .get(&id)
            .map(GoalNode::effective_state)
            .unwrap_or_default()
    }

    /// The tracking group payload of `id`.
    pub fn tracking(&self, id: NodeId) -> Result<&TrackingGroup, GoalError> {
        match &self.get(id)?.kind {
            NodeKind::Tracking(group) => Ok(group),
            other => Err(GoalError::InvalidDefinition(format!(
                "node {} is a {}, not a tracking group",
                id,
                other.type_name()
            ))),
        }
    }

    pub(crate) fn tracking_mut(&mut self, id: NodeId) -> Result<&mut TrackingGroup, GoalError> {
        let node = self.nodes.get_mut(&id).ok_or(GoalError::UnknownNode(id))?;
        match &mut node.kind {
            NodeKind::Tracking(group) => Ok(group),
            other => Err(GoalError::InvalidDefinition(format!(
                "node {} is a {}, not a tracking group",
                id,
                other.type_name()
            ))),
        }
    }

    // ── Navigation ──────────────────────────────────────────────

    /// Parent chain from the immediate parent up to the root.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(p) = current {
            out.push(p);
            current = self.nodes.get(&p).and_then(|n| n.parent);
        }
        out
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.ancestors(id).len()
    }

    /// Child indices from the root to `id`.
    pub fn path_of(&self, id: NodeId) -> Option<NodePath> {
        let mut steps = Vec::new();
        let mut current = self.nodes.get(&id)?;
        while let Some(parent_id) = current.parent {
            let parent = self.nodes.get(&parent_id)?;
            let index = parent.children.iter().position(|c| *c == current.id)?;
            steps.push(index);
            current = parent;
        }
        steps.reverse();
        Some(NodePath(steps))
    }

    pub fn resolve_path(&self, path: &NodePath) -> Option<NodeId> {
        let mut current = self.root;
        for index in &path.0 {
            current = *self.nodes.get(&current)?.children.get(*index)?;
        }
        Some(current)
    }

    /// Subtree of `id`, children before parents, siblings in order.
    pub fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_post(id, &mut out);
        out
    }

    fn walk_post(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        for child in &node.children {
            self.walk_post(*child, out);
        }
        out.push(id);
    }

    /// Subtree of `id`, parents before children.
    pub fn pre_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// The tracking group `id` is evaluated under, if any (never `id` itself).
    pub fn tracking_ancestor(&self, id: NodeId) -> Option<NodeId> {
        self.ancestors(id).into_iter().find(|a| {
            self.nodes
                .get(a)
                .is_some_and(|n| matches!(n.kind, NodeKind::Tracking(_)))
        })
    }

    /// A node evaluates only while it and every ancestor are enabled.
    pub fn is_live(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        node.enabled
            && self
                .ancestors(id)
                .iter()
                .all(|a| self.nodes.get(a).is_some_and(|n| n.enabled))
    }

    /// Presentation visibility: not hidden itself or through an ancestor, not
    /// concealed by an enclosing sequence.
    pub fn is_visible(&self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        if node.flags.hidden {
            return false;
        }
        let mut child = id;
        for ancestor in self.ancestors(id) {
            let Some(a) = self.nodes.get(&ancestor) else {
                return false;
            };
            if a.flags.hidden {
                return false;
            }
            if let NodeKind::Sequence(seq) = &a.kind {
                if seq.hidden_until_ready.contains(&child) {
                    return false;
                }
            }
            child = ancestor;
        }
        true
    }

    // ── State ───────────────────────────────────────────────────

    /// The only state mutator.
    ///
    /// No-op for disabled nodes and unchanged memos. A SequenceStep whose
    /// earlier siblings are not all Complete refuses to become Complete.
    /// Returns `(from, to)` when the stored state changed.
    pub(crate) fn set_state(&mut self, id: NodeId, memo: Memo) -> Option<(NodeState, NodeState)> {
        if memo.state == NodeState::Complete && !eval::step_ready(self, &Overlay::default(), id) {
            return None;
        }
        let node = self.nodes.get_mut(&id)?;
        if !node.enabled || node.memo == memo {
            return None;
        }
        let from = node.memo.state;
        node.memo = memo;
        (from != memo.state).then_some((from, memo.state))
    }

    pub(crate) fn set_concealed(&mut self, sequence: NodeId, hidden: BTreeSet<NodeId>) -> bool {
        match self.nodes.get_mut(&sequence).map(|n| &mut n.kind) {
            Some(NodeKind::Sequence(seq)) if seq.hidden_until_ready != hidden => {
                seq.hidden_until_ready = hidden;
                true
            }
            _ => false,
        }
    }

    // ── Structure ───────────────────────────────────────────────

    pub(crate) fn allocate(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Insert an already validated spec. Returns the new subtree's root.
    fn insert(&mut self, parent: Option<NodeId>, spec: NodeSpec, index: Option<usize>) -> NodeId {
        let id = self.allocate();
        let NodeSpec {
            flags,
            kind,
            children,
        } = spec;
        self.nodes.insert(id, GoalNode::new(id, parent, flags, kind));
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            match index {
                Some(i) if i <= p.children.len() => p.children.insert(i, id),
                _ => p.children.push(id),
            }
        }
        for child in children {
            self.insert(Some(id), child, None);
        }
        id
    }

    /// Place a node restored from a save. The caller guarantees ids are
    /// unique and parents are restored first.
    pub(crate) fn restore_node(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        flags: NodeFlags,
        kind: NodeKind,
        memo: Memo,
        enabled: bool,
    ) {
        let mut node = GoalNode::new(id, parent, flags, kind);
        node.memo = memo;
        node.enabled = enabled;
        self.nodes.insert(id, node);
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(p) => p.children.push(id),
            None => self.root = id,
        }
        self.next_id = self.next_id.max(id.0 + 1);
    }

    /// Insert a spec built at runtime under `parent`, at `index` or last.
    pub(crate) fn add_subtree(
        &mut self,
        parent: NodeId,
        spec: NodeSpec,
        index: Option<usize>,
    ) -> Result<NodeId, GoalError> {
        let placement = self.placement_under(parent)?;
        validate_spec(&spec, placement)?;
        let id = self.insert(Some(parent), spec, index);
        self.resolve_reference_paths(id, false)?;
        Ok(id)
    }

    /// Remove `id` and its subtree. Returns every removed id, children first.
    ///
    /// Sequence concealment and per-candidate memories naming removed nodes
    /// are scrubbed. References to removed nodes stay and read Incomplete.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) -> Result<Vec<NodeId>, GoalError> {
        let node = self.get(id)?;
        let Some(parent) = node.parent else {
            return Err(GoalError::InvalidDefinition(
                "the root node cannot be removed".into(),
            ));
        };
        if self.get(parent)?.kind.is_filter_group() && node.kind.is_filter() {
            return Err(GoalError::InvalidDefinition(format!(
                "filter {} is derived from its group and cannot be removed on its own",
                id
            )));
        }
        let removed = self.post_order(id);
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != id);
        }
        let gone: BTreeSet<NodeId> = removed.iter().copied().collect();
        for r in &removed {
            self.nodes.remove(r);
        }
        for node in self.nodes.values_mut() {
            match &mut node.kind {
                NodeKind::Sequence(seq) => seq.hidden_until_ready.retain(|h| !gone.contains(h)),
                NodeKind::Tracking(group) => {
                    for memo in group.per_candidate.values_mut() {
                        memo.nodes.retain(|n, _| !gone.contains(n));
                    }
                }
                NodeKind::Reference(r) => {
                    if let ReferenceTarget::Id(target) = r.target {
                        if gone.contains(&target) {
                            tracing::warn!(reference = %node.id, %target, "reference target removed");
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(removed)
    }

    /// Returns true if the flag changed.
    pub(crate) fn set_enabled(&mut self, id: NodeId, enabled: bool) -> Result<bool, GoalError> {
        let node = self.nodes.get_mut(&id).ok_or(GoalError::UnknownNode(id))?;
        if node.enabled == enabled {
            return Ok(false);
        }
        node.enabled = enabled;
        Ok(true)
    }

    /// Replace a tracking group's allow-list. A tracked candidate that is no
    /// longer allowed is dropped along with its wait.
    pub(crate) fn set_candidate_keys(&mut self, group: NodeId, keys: Vec<EntityId>) -> Result<(), GoalError> {
        let tracking = self.tracking_mut(group)?;
        tracking.candidate_keys = keys;
        let allowed: Vec<EntityId> = tracking
            .per_candidate
            .keys()
            .filter(|e| tracking.allows(e))
            .cloned()
            .collect();
        tracking.per_candidate.retain(|e, _| allowed.contains(e));
        if let Some(tracked) = tracking.tracked.clone() {
            if !tracking.allows(&tracked) {
                tracing::info!(group = %group, candidate = %tracked, "tracked candidate no longer allowed");
                tracking.tracked = None;
                tracking.wait_deadline = None;
            }
        }
        Ok(())
    }

    fn placement_under(&self, parent: NodeId) -> Result<Placement, GoalError> {
        let node = self.get(parent)?;
        let under_tracking =
            matches!(node.kind, NodeKind::Tracking(_)) || self.tracking_ancestor(parent).is_some();
        Ok(if node.kind.is_filter_group() {
            Placement::FilterGroup
        } else if under_tracking {
            Placement::UnderTracking
        } else {
            Placement::Free
        })
    }

    /// Turn path targets inside the subtree of `id` into ids.
    fn resolve_reference_paths(&mut self, id: NodeId, strict: bool) -> Result<(), GoalError> {
        let mut resolved = Vec::new();
        for node_id in self.pre_order(id) {
            if let Some(NodeKind::Reference(r)) = self.nodes.get(&node_id).map(|n| &n.kind) {
                if let ReferenceTarget::Path(path) = &r.target {
                    match self.resolve_path(path) {
                        Some(target) => resolved.push((node_id, target)),
                        None if strict => {
                            return Err(GoalError::InvalidDefinition(format!(
                                "reference {} points at {}, which does not exist",
                                node_id, path
                            )))
                        }
                        None => {
                            tracing::warn!(reference = %node_id, %path, "reference path does not resolve")
                        }
                    }
                }
            }
        }
        for (node_id, target) in resolved {
            if let Some(NodeKind::Reference(r)) = self.nodes.get_mut(&node_id).map(|n| &mut n.kind) {
                r.target = ReferenceTarget::Id(target);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Root,
    Free,
    UnderTracking,
    FilterGroup,
}

fn validate_spec(spec: &NodeSpec, placement: Placement) -> Result<(), GoalError> {
    let kind = &spec.kind;
    match placement {
        Placement::FilterGroup if !kind.is_filter() => {
            return Err(GoalError::InvalidDefinition(format!(
                "a filter group may only own filters, found {}",
                kind.type_name()
            )))
        }
        Placement::Root | Placement::Free | Placement::UnderTracking if kind.is_filter() => {
            return Err(GoalError::InvalidDefinition(format!(
                "{} must sit directly under a filter group",
                kind.type_name()
            )))
        }
        Placement::UnderTracking if matches!(kind, NodeKind::Tracking(_)) => {
            return Err(GoalError::InvalidDefinition(
                "tracking groups cannot be nested".into(),
            ))
        }
        _ => {}
    }
    let child_placement = match kind {
        NodeKind::FilterGroup(_) => Placement::FilterGroup,
        NodeKind::Tracking(_) => Placement::UnderTracking,
        _ if placement == Placement::UnderTracking => Placement::UnderTracking,
        _ => Placement::Free,
    };
    for child in &spec.children {
        validate_spec(child, child_placement)?;
    }
    Ok(())
}

/// A structural change requested at runtime.
#[derive(Debug, Clone)]
pub enum Mutation {
    AddChild {
        parent: NodeId,
        spec: NodeSpec,
        index: Option<usize>,
    },
    RemoveChild(NodeId),
    Enable(NodeId),
    Disable(NodeId),
    SetCandidateKeys {
        group: NodeId,
        keys: Vec<EntityId>,
    },
}

/// Cloneable handle for requesting mutations from inside a pass (from a
/// predicate or sink side effect). The engine applies them once the current
/// traversal is finished.
#[derive(Debug, Clone, Default)]
pub struct MutationQueue {
    queue: Rc<RefCell<VecDeque<Mutation>>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mutation: Mutation) {
        self.queue.borrow_mut().push_back(mutation);
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    pub(crate) fn drain(&self) -> Vec<Mutation> {
        self.queue.borrow_mut().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CountFilter;
    use crate::node::{FilterGroupNode, ReferenceNode, SequenceNode};

    fn sample() -> GoalTree {
        // all
        // ├── any
        // │   ├── none
        // │   └── at_least(1)
        // └── sequence
        //     ├── step
        //     └── step
        GoalTree::new(
            NodeSpec::new(NodeKind::All {
                fail_on_child_failure: false,
            })
            .child(
                NodeSpec::new(NodeKind::Any)
                    .child(NodeSpec::new(NodeKind::NoneOf))
                    .child(NodeSpec::new(NodeKind::AtLeast { count: 1 })),
            )
            .child(
                NodeSpec::new(NodeKind::Sequence(SequenceNode::default()))
                    .child(NodeSpec::new(NodeKind::SequenceStep))
                    .child(NodeSpec::new(NodeKind::SequenceStep)),
            ),
        )
        .unwrap()
    }

    #[test]
    fn ids_follow_pre_order_and_paths_resolve() {
        let tree = sample();
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.pre_order(tree.root()), (0..7).map(NodeId).collect::<Vec<_>>());
        assert_eq!(tree.path_of(NodeId(6)), Some(NodePath(vec![1, 1])));
        assert_eq!(tree.resolve_path(&NodePath(vec![0, 1])), Some(NodeId(3)));
        assert_eq!(tree.resolve_path(&NodePath(vec![2])), None);
        assert_eq!(tree.depth(NodeId(3)), 2);
    }

    #[test]
    fn post_order_visits_children_first() {
        let tree = sample();
        let order = tree.post_order(tree.root());
        assert_eq!(order.last(), Some(&tree.root()));
        let pos = |id: u32| order.iter().position(|n| *n == NodeId(id)).unwrap();
        assert!(pos(2) < pos(1));
        assert!(pos(5) < pos(6));
        assert!(pos(6) < pos(4));
    }

    #[test]
    fn step_refuses_complete_until_earlier_siblings_complete() {
        let mut tree = sample();
        assert_eq!(tree.set_state(NodeId(6), Memo::new(NodeState::Complete)), None);
        assert_eq!(
            tree.set_state(NodeId(5), Memo::new(NodeState::Complete)),
            Some((NodeState::Incomplete, NodeState::Complete))
        );
        assert!(tree.set_state(NodeId(6), Memo::new(NodeState::Complete)).is_some());
    }

    #[test]
    fn disabled_nodes_keep_their_state() {
        let mut tree = sample();
        tree.set_enabled(NodeId(2), false).unwrap();
        assert_eq!(tree.set_state(NodeId(2), Memo::new(NodeState::Complete)), None);
        assert!(!tree.is_live(NodeId(2)));

        tree.set_enabled(NodeId(1), false).unwrap();
        assert!(!tree.is_live(NodeId(3)));
    }

    #[test]
    fn filters_only_under_filter_groups() {
        let stray = NodeSpec::new(NodeKind::All {
            fail_on_child_failure: false,
        })
        .child(NodeSpec::new(NodeKind::CountFilter(CountFilter::new(1, 2))));
        assert!(matches!(GoalTree::new(stray), Err(GoalError::InvalidDefinition(_))));

        let group = NodeSpec::new(NodeKind::FilterGroup(FilterGroupNode {
            source: "parts".into(),
            filters: Vec::new(),
            events: Vec::new(),
            poll: None,
        }))
        .child(NodeSpec::new(NodeKind::Any));
        assert!(matches!(GoalTree::new(group), Err(GoalError::InvalidDefinition(_))));
    }

    #[test]
    fn nested_tracking_groups_are_rejected() {
        let nested = NodeSpec::new(NodeKind::Tracking(TrackingGroup::default())).child(
            NodeSpec::new(NodeKind::All {
                fail_on_child_failure: false,
            })
            .child(NodeSpec::new(NodeKind::Tracking(TrackingGroup::default()))),
        );
        assert!(matches!(GoalTree::new(nested), Err(GoalError::InvalidDefinition(_))));

        let mut tree = GoalTree::new(
            NodeSpec::new(NodeKind::Any).child(NodeSpec::new(NodeKind::Tracking(TrackingGroup::default()))),
        )
        .unwrap();
        let err = tree
            .add_subtree(NodeId(1), NodeSpec::new(NodeKind::Tracking(TrackingGroup::default())), None)
            .unwrap_err();
        assert!(matches!(err, GoalError::InvalidDefinition(_)));
    }

    #[test]
    fn reference_paths_become_ids() {
        let tree = GoalTree::new(
            NodeSpec::new(NodeKind::Any)
                .child(NodeSpec::new(NodeKind::NoneOf))
                .child(NodeSpec::new(NodeKind::Reference(ReferenceNode {
                    target: ReferenceTarget::Path(NodePath(vec![0])),
                    require: NodeState::Complete,
                }))),
        )
        .unwrap();
        match &tree.node(NodeId(2)).unwrap().kind {
            NodeKind::Reference(r) => assert_eq!(r.target, ReferenceTarget::Id(NodeId(1))),
            other => panic!("unexpected {:?}", other),
        }

        let dangling = NodeSpec::new(NodeKind::Any).child(NodeSpec::new(NodeKind::Reference(ReferenceNode {
            target: ReferenceTarget::Path(NodePath(vec![5])),
            require: NodeState::Complete,
        })));
        assert!(GoalTree::new(dangling).is_err());
    }

    #[test]
    fn add_and_remove_keep_order_and_scrub() {
        let mut tree = sample();
        let added = tree
            .add_subtree(NodeId(4), NodeSpec::new(NodeKind::SequenceStep), Some(0))
            .unwrap();
        assert_eq!(added, NodeId(7));
        assert_eq!(tree.get(NodeId(4)).unwrap().children(), &[NodeId(7), NodeId(5), NodeId(6)]);

        tree.set_concealed(NodeId(4), [NodeId(5), NodeId(6)].into_iter().collect());
        let removed = tree.remove_subtree(NodeId(6)).unwrap();
        assert_eq!(removed, vec![NodeId(6)]);
        match &tree.node(NodeId(4)).unwrap().kind {
            NodeKind::Sequence(seq) => assert_eq!(seq.hidden_until_ready, [NodeId(5)].into_iter().collect()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tree.remove_subtree(tree.root()).is_err());
    }

    #[test]
    fn visibility_cascades_and_follows_concealment() {
        let mut tree = sample();
        assert!(tree.is_visible(NodeId(6)));
        tree.set_concealed(NodeId(4), [NodeId(6)].into_iter().collect());
        assert!(!tree.is_visible(NodeId(6)));
        assert!(tree.is_visible(NodeId(5)));

        tree.nodes.get_mut(&NodeId(1)).unwrap().flags.hidden = true;
        assert!(!tree.is_visible(NodeId(3)));
    }

    #[test]
    fn mutation_queue_is_shared() {
        let queue = MutationQueue::new();
        let handle = queue.clone();
        handle.push(Mutation::Disable(NodeId(3)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain().len(), 1);
        assert!(handle.is_empty());
    }
}
