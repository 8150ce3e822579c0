// node.rs — GoalNode: shared fields plus a kind-specific payload.
//
// Every node in a tree has the same envelope (id, parent, ordered children,
// memo, enabled flag, presentation flags). What the node *does* lives in
// `NodeKind`, a closed enum the evaluator dispatches on:
//
//   combinators   All, Any, AtLeast, AtMost, None, Sequence, SequenceStep
//   leaves        Condition (entity predicate), Reference (another node)
//   filters       FilterGroup owning Filter / CountFilter children
//   tracking      TrackingGroup, evaluated once per candidate entity
//   unresolved    a record that could not be understood on load

use std::collections::BTreeSet;

use mc_events::{EntityId, EventError, EventKind, PollInterval};
use serde::{Deserialize, Serialize};

use crate::config::PollDefaults;
use crate::filter::{CountFilter, DelegateFilter, FilterSpec};
use crate::state::{Memo, NodeId, NodePath, NodeState};
use crate::tracking::TrackingGroup;
use crate::world::PredicateRef;

/// Per-node flags shared by every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Display title. Presentation only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Excluded from "every child complete" checks.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,

    /// Hides this node and its whole subtree. Presentation only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub hidden: bool,

    /// Reaching Complete or Failed freezes the node.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_on_terminal: bool,

    /// A Failed state is reported to parents and presentation as Incomplete
    /// and may recover on a later pass.
    #[serde(default, skip_serializing_if = "is_false")]
    pub soft_failure: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Poll registration of a node without discrete events.
///
/// A spec with neither period set falls back to the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PollSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_secs: Option<f64>,
}

impl PollSpec {
    /// Resolve against `defaults`. Fails on periods that are not positive,
    /// not finite, or too large to schedule.
    pub fn interval(&self, defaults: &PollDefaults) -> Result<PollInterval, EventError> {
        if self.wall_ms.is_none() && self.sim_secs.is_none() {
            return defaults.interval();
        }
        PollInterval::from_units(self.wall_ms, self.sim_secs)
    }
}

/// Sequence payload: which children are concealed until reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceNode {
    pub hidden_until_ready: BTreeSet<NodeId>,
}

/// Entity-level predicate leaf.
#[derive(Debug, Clone)]
pub struct ConditionNode {
    pub predicate: PredicateRef<EntityId>,
    /// A false predicate is Failed instead of Incomplete.
    pub fail_on_false: bool,
    pub events: Vec<EventKind>,
    pub poll: Option<PollSpec>,
}

/// Where a reference points. Definitions name targets by path; the tree
/// turns paths into ids once built, since ids survive later insertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferenceTarget {
    Id(NodeId),
    Path(NodePath),
}

/// Mirrors another node of the same tree.
///
/// Complete while the target's effective state equals `require`. A target
/// that no longer exists leaves the reference Incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceNode {
    pub target: ReferenceTarget,
    pub require: NodeState,
}

/// Owner of filter children; fetches one item snapshot per evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGroupNode {
    /// Item collection to query on the subject entity, e.g. "parts".
    pub source: String,
    pub filters: Vec<FilterSpec>,
    pub events: Vec<EventKind>,
    pub poll: Option<PollSpec>,
}

/// A persisted node that could not be understood. Kept verbatim so a later
/// save writes it back unchanged; always Incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedNode {
    pub type_name: String,
    pub fields: serde_json::Value,
}

/// What a node does.
#[derive(Debug, Clone)]
pub enum NodeKind {
    All { fail_on_child_failure: bool },
    Any,
    AtLeast { count: usize },
    AtMost { count: usize },
    NoneOf,
    Sequence(SequenceNode),
    SequenceStep,
    Condition(ConditionNode),
    Reference(ReferenceNode),
    FilterGroup(FilterGroupNode),
    Filter(DelegateFilter),
    CountFilter(CountFilter),
    Tracking(TrackingGroup),
    Unresolved(UnresolvedNode),
}

impl NodeKind {
    /// Stable type name, used in saved records and outlines.
    pub fn type_name(&self) -> &str {
        match self {
            NodeKind::All { .. } => "all",
            NodeKind::Any => "any",
            NodeKind::AtLeast { .. } => "at_least",
            NodeKind::AtMost { .. } => "at_most",
            NodeKind::NoneOf => "none",
            NodeKind::Sequence(_) => "sequence",
            NodeKind::SequenceStep => "sequence_step",
            NodeKind::Condition(_) => "condition",
            NodeKind::Reference(_) => "reference",
            NodeKind::FilterGroup(_) => "filter_group",
            NodeKind::Filter(_) => "filter",
            NodeKind::CountFilter(_) => "count_filter",
            NodeKind::Tracking(_) => "tracking",
            NodeKind::Unresolved(u) => &u.type_name,
        }
    }

    /// World event kinds this node subscribes to while active.
    pub fn event_kinds(&self) -> Vec<EventKind> {
        match self {
            NodeKind::Condition(c) if c.events.is_empty() => {
                vec![EventKind::EntityModified, EventKind::ActiveEntityChanged]
            }
            NodeKind::Condition(c) => c.events.clone(),
            NodeKind::FilterGroup(g) if g.events.is_empty() => vec![
                EventKind::ItemsChanged,
                EventKind::CrewChanged,
                EventKind::ActiveEntityChanged,
            ],
            NodeKind::FilterGroup(g) => g.events.clone(),
            NodeKind::Tracking(t) => {
                let mut kinds = EventKind::population();
                for kind in &t.events {
                    if !kinds.contains(kind) {
                        kinds.push(kind.clone());
                    }
                }
                kinds
            }
            NodeKind::Reference(_) => vec![EventKind::GoalChanged],
            _ => Vec::new(),
        }
    }

    pub fn poll(&self) -> Option<&PollSpec> {
        match self {
            NodeKind::Condition(c) => c.poll.as_ref(),
            NodeKind::FilterGroup(g) => g.poll.as_ref(),
            NodeKind::Tracking(t) => t.poll.as_ref(),
            _ => None,
        }
    }

    /// Filters are evaluated by their owning group, never on their own.
    pub fn is_filter(&self) -> bool {
        matches!(self, NodeKind::Filter(_) | NodeKind::CountFilter(_))
    }

    pub fn is_filter_group(&self) -> bool {
        matches!(self, NodeKind::FilterGroup(_))
    }

    /// AtMost, None and Sequence failures latch unless the node is soft.
    pub fn latches_failure(&self) -> bool {
        matches!(
            self,
            NodeKind::AtMost { .. } | NodeKind::NoneOf | NodeKind::Sequence(_)
        )
    }
}

/// One node of a goal tree.
#[derive(Debug, Clone)]
pub struct GoalNode {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) memo: Memo,
    pub(crate) enabled: bool,
    pub flags: NodeFlags,
    pub kind: NodeKind,
}

impl GoalNode {
    pub(crate) fn new(id: NodeId, parent: Option<NodeId>, flags: NodeFlags, kind: NodeKind) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            memo: Memo::default(),
            enabled: true,
            flags,
            kind,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Stored state, as persisted.
    pub fn state(&self) -> NodeState {
        self.memo.state
    }

    pub fn memo(&self) -> Memo {
        self.memo
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_optional(&self) -> bool {
        self.flags.optional
    }

    /// State as parents and presentation see it: a soft failure reads as
    /// Incomplete.
    pub fn effective_state(&self) -> NodeState {
        effective(&self.flags, self.memo.state)
    }

    /// Title if set, otherwise the type name.
    pub fn label(&self) -> &str {
        self.flags
            .title
            .as_deref()
            .unwrap_or_else(|| self.kind.type_name())
    }
}

/// Map a stored state through the soft-failure flag.
pub fn effective(flags: &NodeFlags, state: NodeState) -> NodeState {
    if flags.soft_failure && state == NodeState::Failed {
        NodeState::Incomplete
    } else {
        state
    }
}

/// A node to insert: flags, resolved kind and children.
///
/// Built by [`NodeDef::resolve`](crate::definition::NodeDef::resolve) or by
/// hand in tests.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub flags: NodeFlags,
    pub kind: NodeKind,
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            flags: NodeFlags::default(),
            kind,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<NodeSpec>) -> Self {
        self.children = children;
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.flags.title = Some(title.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.flags.optional = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.flags.hidden = true;
        self
    }

    pub fn soft(mut self) -> Self {
        self.flags.soft_failure = true;
        self
    }

    pub fn freeze_on_terminal(mut self) -> Self {
        self.flags.disable_on_terminal = true;
        self
    }
}
