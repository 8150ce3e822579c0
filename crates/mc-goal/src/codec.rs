// codec.rs — Saving and restoring a goal tree with its runtime state.
//
// A saved tree is a nested JSON record per node:
//
//   { "id": 3, "type": "tracking", "state": "incomplete",
//     "fields": { "wait": 30.0, "candidate": "kestrel",
//                 "wait_deadline": 112.5, "per_candidate": { ... } },
//     "title": "Crewed craft in orbit",
//     "children": [ ... ] }
//
// `fields` carries the kind's configuration (the same keys a definition
// uses) plus the runtime memory the kind needs to resume: a sequence's
// concealed children, a tracking group's candidate, wait deadline and
// per-candidate memories.
//
// Loading never fails. Every record is read field by field; anything that
// cannot be understood is repaired (fresh id, default value) or kept as an
// Unresolved node, and the repair is written to the LoadReport. Filter
// children are always regenerated from their group's specs.

use std::collections::{BTreeMap, BTreeSet};

use mc_events::{EntityId, SimTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::{filter_children, KindDef};
use crate::error::GoalError;
use crate::filter::FilterSpec;
use crate::node::{NodeFlags, NodeKind, ReferenceTarget, UnresolvedNode};
use crate::state::{Memo, NodeId, NodePath, NodeState};
use crate::tracking::CandidateMemo;
use crate::tree::GoalTree;
use crate::world::PredicateRegistry;

const HIDDEN_UNTIL_READY: &str = "hidden_until_ready";
const CANDIDATE: &str = "candidate";
const PER_CANDIDATE: &str = "per_candidate";
const WAIT_DEADLINE: &str = "wait_deadline";

/// The persisted form of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default, skip_serializing_if = "is_empty_object")]
    pub fields: Value,

    #[serde(default)]
    pub state: NodeState,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub progress: u32,

    #[serde(default = "enabled", skip_serializing_if = "is_enabled")]
    pub enabled: bool,

    #[serde(flatten)]
    pub flags: NodeFlags,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Value>,
}

fn is_empty_object(v: &Value) -> bool {
    v.is_null() || v.as_object().is_some_and(Map::is_empty)
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn enabled() -> bool {
    true
}

fn is_enabled(v: &bool) -> bool {
    *v
}

/// What had to be repaired while loading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub repairs: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
    }

    fn repair(&mut self, message: String) {
        tracing::warn!(repair = %message, "goal tree load repaired");
        self.repairs.push(message);
    }
}

// ── Save ────────────────────────────────────────────────────────

/// Serialize the whole tree, runtime state included.
pub fn save_tree(tree: &GoalTree) -> Result<Value, GoalError> {
    save_node(tree, tree.root())
}

fn save_node(tree: &GoalTree, id: NodeId) -> Result<Value, GoalError> {
    let node = tree.get(id)?;
    let (type_name, fields) = match &node.kind {
        NodeKind::Unresolved(u) => (u.type_name.clone(), u.fields.clone()),
        NodeKind::Filter(f) => (
            "filter".to_string(),
            serde_json::json!({
                "predicate": f.predicate.key(),
                "policy": f.policy,
                "trivial": f.trivial,
            }),
        ),
        NodeKind::CountFilter(c) => (
            "count_filter".to_string(),
            serde_json::json!({ "min": c.min, "max": c.max }),
        ),
        kind => {
            let def = KindDef::of(kind).ok_or_else(|| {
                GoalError::InvalidDefinition(format!("{} has no saved form", kind.type_name()))
            })?;
            let mut fields = match serde_json::to_value(def)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            fields.remove("type");
            save_runtime(kind, &mut fields)?;
            (kind.type_name().to_string(), Value::Object(fields))
        }
    };

    let children = node
        .children()
        .iter()
        .map(|c| save_node(tree, *c))
        .collect::<Result<Vec<_>, _>>()?;

    let memo = node.memo();
    let record = NodeRecord {
        id: Some(id),
        type_name,
        fields,
        state: memo.state,
        progress: memo.progress,
        enabled: node.is_enabled(),
        flags: node.flags.clone(),
        children,
    };
    Ok(serde_json::to_value(record)?)
}

fn save_runtime(kind: &NodeKind, fields: &mut Map<String, Value>) -> Result<(), GoalError> {
    match kind {
        NodeKind::Sequence(seq) if !seq.hidden_until_ready.is_empty() => {
            fields.insert(
                HIDDEN_UNTIL_READY.into(),
                serde_json::to_value(&seq.hidden_until_ready)?,
            );
        }
        NodeKind::Tracking(group) => {
            if let Some(tracked) = &group.tracked {
                fields.insert(CANDIDATE.into(), serde_json::to_value(tracked)?);
            }
            if let Some(deadline) = group.wait_deadline {
                fields.insert(WAIT_DEADLINE.into(), serde_json::to_value(deadline)?);
            }
            if !group.per_candidate.is_empty() {
                fields.insert(PER_CANDIDATE.into(), serde_json::to_value(&group.per_candidate)?);
            }
        }
        _ => {}
    }
    Ok(())
}

// ── Load ────────────────────────────────────────────────────────

/// A node read from a record, before ids are settled.
struct Loaded {
    id: Option<NodeId>,
    at: NodePath,
    flags: NodeFlags,
    kind: NodeKind,
    memo: Memo,
    enabled: bool,
    /// Saved filter children of a filter group: id, type and memo. The
    /// filters themselves are rebuilt from the group's specs.
    saved_filters: Vec<(Option<NodeId>, String, Memo)>,
    children: Vec<Loaded>,
}

/// Restore a tree saved by [`save_tree`].
///
/// Never fails: whatever cannot be restored is repaired and reported.
pub fn load_tree(root: &Value, registry: &PredicateRegistry) -> (GoalTree, LoadReport) {
    let mut report = LoadReport::default();
    let loaded = read_node(root, NodePath::root(), false, registry, &mut report);

    let mut tree = GoalTree::empty();
    let mut next = highest_id(&loaded).map_or(0, |id| id.0 + 1);
    let mut claimed = BTreeSet::new();
    place(&mut tree, None, loaded, &mut claimed, &mut next, registry, &mut report);

    fix_up(&mut tree, &mut report);
    (tree, report)
}

/// Highest saved id anywhere in the record tree. Fresh ids start above it.
fn highest_id(node: &Loaded) -> Option<NodeId> {
    let own = node
        .id
        .into_iter()
        .chain(node.saved_filters.iter().filter_map(|(id, _, _)| *id));
    own.chain(node.children.iter().filter_map(highest_id)).max()
}

fn place(
    tree: &mut GoalTree,
    parent: Option<NodeId>,
    node: Loaded,
    claimed: &mut BTreeSet<NodeId>,
    next: &mut u32,
    registry: &PredicateRegistry,
    report: &mut LoadReport,
) {
    let id = match node.id {
        Some(id) if claimed.insert(id) => id,
        other => {
            let fresh = NodeId(*next);
            *next += 1;
            claimed.insert(fresh);
            match other {
                Some(dup) => report.repair(format!(
                    "node at {} reuses id {}; assigned {}",
                    node.at, dup, fresh
                )),
                None => report.repair(format!("node at {} has no id; assigned {}", node.at, fresh)),
            }
            fresh
        }
    };

    let filters = match &node.kind {
        NodeKind::FilterGroup(g) => Some(g.filters.clone()),
        _ => None,
    };
    tree.restore_node(id, parent, node.flags, node.kind, node.memo, node.enabled);

    if let Some(filters) = filters {
        regenerate_filters(tree, id, &filters, &node.saved_filters, next, claimed, registry, report);
    }
    for child in node.children {
        place(tree, Some(id), child, claimed, next, registry, report);
    }
}

#[allow(clippy::too_many_arguments)]
fn regenerate_filters(
    tree: &mut GoalTree,
    group: NodeId,
    filters: &[FilterSpec],
    saved: &[(Option<NodeId>, String, Memo)],
    next: &mut u32,
    claimed: &mut BTreeSet<NodeId>,
    registry: &PredicateRegistry,
    report: &mut LoadReport,
) {
    let specs = match filter_children(filters, registry, true) {
        Ok(specs) => specs,
        Err(e) => {
            report.repair(format!("filters of {} could not be rebuilt: {}", group, e));
            return;
        }
    };
    for (index, spec) in specs.into_iter().enumerate() {
        // A saved child of the same kind at the same position keeps its id
        // and memo, so per-candidate memories naming it stay valid.
        let matching = saved
            .get(index)
            .filter(|(_, type_name, _)| type_name == spec.kind.type_name());
        let id = match matching.and_then(|(id, _, _)| *id) {
            Some(id) if claimed.insert(id) => id,
            _ => {
                let fresh = NodeId(*next);
                *next += 1;
                claimed.insert(fresh);
                fresh
            }
        };
        let memo = matching.map(|(_, _, memo)| *memo).unwrap_or_default();
        tree.restore_node(id, Some(group), spec.flags, spec.kind, memo, true);
    }
}

fn read_node(
    value: &Value,
    at: NodePath,
    under_tracking: bool,
    registry: &PredicateRegistry,
    report: &mut LoadReport,
) -> Loaded {
    let Some(obj) = value.as_object() else {
        report.repair(format!("node at {} is not a record; kept as unresolved", at));
        return Loaded {
            id: None,
            at,
            flags: NodeFlags::default(),
            kind: NodeKind::Unresolved(UnresolvedNode {
                type_name: "unknown".into(),
                fields: value.clone(),
            }),
            memo: Memo::default(),
            enabled: true,
            saved_filters: Vec::new(),
            children: Vec::new(),
        };
    };

    let id = match obj.get("id") {
        None => None,
        Some(v) => serde_json::from_value::<NodeId>(v.clone()).ok(),
    };
    let type_name = obj
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let fields = obj.get("fields").cloned().unwrap_or(Value::Null);
    let state: NodeState = field(obj, "state", &at, report);
    let progress: u32 = field(obj, "progress", &at, report);
    let enabled = match obj.get("enabled") {
        None => true,
        Some(v) => v.as_bool().unwrap_or_else(|| {
            report.repair(format!("node at {}: `enabled` is not a boolean", at));
            true
        }),
    };
    let flags = match serde_json::from_value::<NodeFlags>(value.clone()) {
        Ok(flags) => flags,
        Err(e) => {
            report.repair(format!("node at {}: flags reset ({})", at, e));
            NodeFlags::default()
        }
    };

    let mut kind = match read_kind(&type_name, &fields, under_tracking, registry) {
        Ok(kind) => kind,
        Err(reason) => {
            report.repair(format!(
                "node at {} ({}) kept as unresolved: {}",
                at, type_name, reason
            ));
            NodeKind::Unresolved(UnresolvedNode {
                type_name: type_name.clone(),
                fields: fields.clone(),
            })
        }
    };
    read_runtime(&mut kind, &fields, &at, report);

    let memo = if matches!(kind, NodeKind::Unresolved(_)) {
        Memo::default()
    } else {
        Memo { state, progress }
    };

    let raw_children: &[Value] = match obj.get("children") {
        None => &[],
        Some(Value::Array(items)) => items,
        Some(_) => {
            report.repair(format!("node at {}: `children` is not a list", at));
            &[]
        }
    };

    let mut saved_filters = Vec::new();
    let mut children = Vec::new();
    let child_tracking = under_tracking || matches!(kind, NodeKind::Tracking(_));
    if kind.is_filter_group() {
        for raw in raw_children {
            let saved_id = raw
                .get("id")
                .and_then(|v| serde_json::from_value::<NodeId>(v.clone()).ok());
            let saved_type = raw.get("type").and_then(Value::as_str).unwrap_or_default();
            let saved_state = raw
                .get("state")
                .and_then(|s| serde_json::from_value::<NodeState>(s.clone()).ok())
                .unwrap_or_default();
            saved_filters.push((saved_id, saved_type.to_string(), Memo::new(saved_state)));
        }
    } else {
        for (index, raw) in raw_children.iter().enumerate() {
            children.push(read_node(raw, at.child(index), child_tracking, registry, report));
        }
    }

    Loaded {
        id,
        at,
        flags,
        kind,
        memo,
        enabled,
        saved_filters,
        children,
    }
}

/// A record field, or its default when absent or malformed.
fn field<T: DeserializeOwned + Default>(
    obj: &Map<String, Value>,
    key: &str,
    at: &NodePath,
    report: &mut LoadReport,
) -> T {
    match obj.get(key) {
        None => T::default(),
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            report.repair(format!("node at {}: `{}` reset ({})", at, key, e));
            T::default()
        }),
    }
}

fn read_kind(
    type_name: &str,
    fields: &Value,
    under_tracking: bool,
    registry: &PredicateRegistry,
) -> Result<NodeKind, String> {
    if matches!(type_name, "filter" | "count_filter") {
        return Err("filter outside a filter group".into());
    }
    let mut map = match fields {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        _ => return Err("`fields` is not a record".into()),
    };
    for runtime in [HIDDEN_UNTIL_READY, CANDIDATE, PER_CANDIDATE, WAIT_DEADLINE] {
        map.remove(runtime);
    }
    map.insert("type".into(), Value::String(type_name.to_string()));
    let def: KindDef = serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())?;
    let kind = def.build(registry, true).map_err(|e| e.to_string())?;
    if under_tracking && matches!(kind, NodeKind::Tracking(_)) {
        return Err("tracking groups cannot be nested".into());
    }
    Ok(kind)
}

fn read_runtime(kind: &mut NodeKind, fields: &Value, at: &NodePath, report: &mut LoadReport) {
    let Some(obj) = fields.as_object() else {
        return;
    };
    match kind {
        NodeKind::Sequence(seq) => {
            seq.hidden_until_ready = field(obj, HIDDEN_UNTIL_READY, at, report);
        }
        NodeKind::Tracking(group) => {
            group.tracked = field::<Option<EntityId>>(obj, CANDIDATE, at, report);
            group.wait_deadline = field::<Option<SimTime>>(obj, WAIT_DEADLINE, at, report);
            group.per_candidate = field::<BTreeMap<EntityId, CandidateMemo>>(obj, PER_CANDIDATE, at, report);
        }
        _ => {}
    }
}

/// Cross-node checks once every id is settled.
fn fix_up(tree: &mut GoalTree, report: &mut LoadReport) {
    enum Fix {
        Conceal(NodeId, BTreeSet<NodeId>),
        Forget(NodeId, BTreeSet<NodeId>),
        Target(NodeId, NodeId),
    }

    let mut fixes = Vec::new();
    for id in tree.ids() {
        let Some(node) = tree.node(id) else {
            continue;
        };
        match &node.kind {
            NodeKind::Sequence(seq) => {
                let kept: BTreeSet<NodeId> = seq
                    .hidden_until_ready
                    .iter()
                    .copied()
                    .filter(|h| node.children().contains(h))
                    .collect();
                if kept.len() != seq.hidden_until_ready.len() {
                    report.repair(format!("sequence {} conceals nodes it does not own", id));
                    fixes.push(Fix::Conceal(id, kept));
                }
            }
            NodeKind::Tracking(group) => {
                let subtree: BTreeSet<NodeId> =
                    tree.post_order(id).into_iter().filter(|n| *n != id).collect();
                let stray = group
                    .per_candidate
                    .values()
                    .any(|memo| memo.nodes.keys().any(|n| !subtree.contains(n)));
                if stray {
                    report.repair(format!("tracking group {} remembers nodes outside its subtree", id));
                    fixes.push(Fix::Forget(id, subtree));
                }
            }
            NodeKind::Reference(r) => match &r.target {
                ReferenceTarget::Id(target) if !tree.contains(*target) => {
                    report.repair(format!("reference {} points at missing node {}", id, target));
                }
                ReferenceTarget::Path(path) => match tree.resolve_path(path) {
                    Some(target) => fixes.push(Fix::Target(id, target)),
                    None => report.repair(format!("reference {} points at missing path {}", id, path)),
                },
                _ => {}
            },
            _ => {}
        }
    }

    for fix in fixes {
        match fix {
            Fix::Conceal(id, kept) => {
                tree.set_concealed(id, kept);
            }
            Fix::Forget(id, subtree) => {
                if let Ok(group) = tree.tracking_mut(id) {
                    for memo in group.per_candidate.values_mut() {
                        memo.nodes.retain(|n, _| subtree.contains(n));
                    }
                }
            }
            Fix::Target(id, target) => {
                if let Some(NodeKind::Reference(r)) = tree.node_mut(id).map(|n| &mut n.kind) {
                    r.target = ReferenceTarget::Id(target);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MatchPolicy;
    use crate::node::{FilterGroupNode, NodeSpec, ReferenceNode, SequenceNode};
    use crate::tracking::TrackingGroup;

    fn registry() -> PredicateRegistry {
        let mut registry = PredicateRegistry::new();
        registry.item_fn("docking_port", |_, item| Ok(item.as_str().starts_with("port")));
        registry
    }

    fn sample() -> GoalTree {
        // sequence
        // ├── step
        // │   └── tracking(wait 30)
        // │       └── filter_group(parts)
        // │           ├── filter(docking_port)
        // │           └── count_filter(1..)
        // └── step
        //     └── reference -> tracking
        GoalTree::new(
            NodeSpec::new(NodeKind::Sequence(SequenceNode::default()))
                .child(
                    NodeSpec::new(NodeKind::SequenceStep).child(
                        NodeSpec::new(NodeKind::Tracking(TrackingGroup::new(Vec::new(), Some(30.0))))
                            .titled("Docked craft")
                            .child(NodeSpec::new(NodeKind::FilterGroup(FilterGroupNode {
                                source: "parts".into(),
                                filters: vec![
                                    FilterSpec::Match {
                                        predicate: "docking_port".into(),
                                        policy: MatchPolicy::FilterAndRequireNonEmpty,
                                        trivial: false,
                                        title: None,
                                    },
                                    FilterSpec::Count {
                                        min: 1,
                                        max: usize::MAX,
                                        title: None,
                                    },
                                ],
                                events: Vec::new(),
                                poll: None,
                            })).with_children(
                                filter_children(
                                    &[
                                        FilterSpec::Match {
                                            predicate: "docking_port".into(),
                                            policy: MatchPolicy::FilterAndRequireNonEmpty,
                                            trivial: false,
                                            title: None,
                                        },
                                        FilterSpec::Count {
                                            min: 1,
                                            max: usize::MAX,
                                            title: None,
                                        },
                                    ],
                                    &registry(),
                                    false,
                                )
                                .unwrap(),
                            )),
                    ),
                )
                .child(NodeSpec::new(NodeKind::SequenceStep).child(NodeSpec::new(
                    NodeKind::Reference(ReferenceNode {
                        target: ReferenceTarget::Path(NodePath(vec![0, 0])),
                        require: NodeState::Complete,
                    }),
                ))),
        )
        .unwrap()
    }

    #[test]
    fn runtime_state_survives_a_round_trip() {
        let mut tree = sample();
        tree.set_state(NodeId(3), Memo::new(NodeState::Complete));
        tree.set_concealed(NodeId(0), [NodeId(6)].into_iter().collect());
        {
            let group = tree.tracking_mut(NodeId(2)).unwrap();
            group.tracked = Some(EntityId::new("kestrel"));
            group.wait_deadline = Some(SimTime(42.5));
            group.per_candidate.insert(
                EntityId::new("kestrel"),
                CandidateMemo {
                    satisfied: true,
                    nodes: [(NodeId(3), Memo::new(NodeState::Complete))].into_iter().collect(),
                },
            );
        }
        tree.set_enabled(NodeId(7), false).unwrap();

        let saved = save_tree(&tree).unwrap();
        let (restored, report) = load_tree(&saved, &registry());
        assert!(report.is_clean(), "{:?}", report.repairs);
        assert_eq!(restored.len(), tree.len());
        assert_eq!(restored.state_of(NodeId(3)), Some(NodeState::Complete));
        assert!(!restored.get(NodeId(7)).unwrap().is_enabled());

        let group = restored.tracking(NodeId(2)).unwrap();
        assert_eq!(group.tracked(), Some(&EntityId::new("kestrel")));
        assert_eq!(group.wait_deadline.map(SimTime::seconds), Some(42.5));
        assert!(group.per_candidate[&EntityId::new("kestrel")].satisfied);

        match &restored.node(NodeId(0)).unwrap().kind {
            NodeKind::Sequence(seq) => assert!(seq.hidden_until_ready.contains(&NodeId(6))),
            other => panic!("unexpected {:?}", other),
        }
        match &restored.node(NodeId(7)).unwrap().kind {
            NodeKind::Reference(r) => assert_eq!(r.target, ReferenceTarget::Id(NodeId(2))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            restored.get(NodeId(2)).unwrap().flags.title.as_deref(),
            Some("Docked craft")
        );
    }

    #[test]
    fn filter_children_are_regenerated_with_their_memos() {
        let mut tree = sample();
        tree.set_state(NodeId(4), Memo::new(NodeState::Complete));
        let saved = save_tree(&tree).unwrap();

        let (restored, _) = load_tree(&saved, &registry());
        let group = restored.get(NodeId(3)).unwrap();
        assert_eq!(group.children().len(), 2);
        let first = restored.get(group.children()[0]).unwrap();
        assert_eq!(first.kind.type_name(), "filter");
        assert_eq!(first.state(), NodeState::Complete);
    }

    #[test]
    fn unknown_type_is_kept_and_saved_back() {
        let saved = serde_json::json!({
            "id": 0, "type": "any",
            "children": [
                { "id": 1, "type": "orbit_resonance", "state": "complete",
                  "fields": { "ratio": "3:2" } },
                { "id": 2, "type": "none" }
            ]
        });
        let (tree, report) = load_tree(&saved, &registry());
        assert_eq!(report.repairs.len(), 1);
        let node = tree.get(NodeId(1)).unwrap();
        assert_eq!(node.kind.type_name(), "orbit_resonance");
        assert_eq!(node.state(), NodeState::Incomplete);

        let again = save_tree(&tree).unwrap();
        assert_eq!(again["children"][0]["fields"]["ratio"], "3:2");
        assert_eq!(again["children"][0]["type"], "orbit_resonance");
    }

    #[test]
    fn missing_and_duplicate_ids_are_reassigned() {
        let saved = serde_json::json!({
            "id": 0, "type": "all",
            "children": [
                { "id": 4, "type": "none" },
                { "id": 4, "type": "any" },
                { "type": "sequence_step" }
            ]
        });
        let (tree, report) = load_tree(&saved, &registry());
        assert_eq!(report.repairs.len(), 2);
        assert_eq!(tree.len(), 4);
        let children = tree.get(NodeId(0)).unwrap().children().to_vec();
        assert_eq!(children[0], NodeId(4));
        assert!(children[1].0 > 4 && children[2].0 > 4);
        assert_ne!(children[1], children[2]);
    }

    #[test]
    fn malformed_fields_are_reset_not_fatal() {
        let saved = serde_json::json!({
            "id": 0, "type": "sequence", "state": "exploded", "progress": 1,
            "fields": { "hidden_until_ready": [9] },
            "children": [
                { "id": 1, "type": "sequence_step", "state": "complete" },
                { "id": 2, "type": "at_least", "fields": { "count": "two" } },
                { "id": 3, "type": "reference", "fields": { "target": 99 } }
            ]
        });
        let (tree, report) = load_tree(&saved, &registry());
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.state_of(NodeId(0)), Some(NodeState::Incomplete));
        assert_eq!(tree.state_of(NodeId(1)), Some(NodeState::Complete));
        assert!(matches!(tree.node(NodeId(2)).unwrap().kind, NodeKind::Unresolved(_)));
        match &tree.node(NodeId(0)).unwrap().kind {
            NodeKind::Sequence(seq) => assert!(seq.hidden_until_ready.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        // bad state, unresolved at_least, foreign concealment, dangling reference
        assert_eq!(report.repairs.len(), 4, "{:?}", report.repairs);
    }

    #[test]
    fn stray_filter_and_nested_tracking_become_unresolved() {
        let saved = serde_json::json!({
            "id": 0, "type": "tracking",
            "children": [
                { "id": 1, "type": "tracking" },
                { "id": 2, "type": "count_filter", "fields": { "min": 1 } }
            ]
        });
        let (tree, report) = load_tree(&saved, &registry());
        assert_eq!(report.repairs.len(), 2);
        assert!(matches!(tree.node(NodeId(1)).unwrap().kind, NodeKind::Unresolved(_)));
        assert!(matches!(tree.node(NodeId(2)).unwrap().kind, NodeKind::Unresolved(_)));
    }

    #[test]
    fn unschedulable_poll_becomes_unresolved() {
        let saved = serde_json::json!({
            "id": 0, "type": "any",
            "children": [
                { "id": 1, "type": "tracking", "fields": { "poll": { "wall_ms": u64::MAX } } },
                { "id": 2, "type": "tracking", "fields": { "poll": { "sim_secs": 2.0 } } }
            ]
        });
        let (tree, report) = load_tree(&saved, &registry());
        assert_eq!(report.repairs.len(), 1, "{:?}", report.repairs);
        assert!(matches!(tree.node(NodeId(1)).unwrap().kind, NodeKind::Unresolved(_)));
        assert!(matches!(tree.node(NodeId(2)).unwrap().kind, NodeKind::Tracking(_)));
    }

    #[test]
    fn records_omit_defaults() {
        let tree = GoalTree::new(NodeSpec::new(NodeKind::Any)).unwrap();
        let saved = save_tree(&tree).unwrap();
        assert_eq!(saved, serde_json::json!({ "id": 0, "type": "any", "state": "incomplete" }));
    }
}
