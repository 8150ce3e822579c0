// definition.rs — Declarative tree definitions.
//
// A definition is the static description of a goal tree, written by hand in
// TOML, YAML or JSON:
//
//   name = "Station crew rotation"
//
//   [root]
//   type = "sequence"
//
//   [[root.children]]
//   type = "tracking"
//   title = "A crewed craft in orbit"
//   wait = 30.0
//
//   [[root.children.children]]
//   type = "condition"
//   predicate = "attr:altitude>=70000"
//
// Predicates are named by key and resolved through a PredicateRegistry when
// the tree is built. Filter groups list their filters as specs; the filter
// nodes themselves are generated from those specs and never written out.

use std::path::Path;

use mc_events::{EntityId, EventKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PollDefaults;
use crate::error::GoalError;
use crate::filter::{CountFilter, DelegateFilter, FilterSpec};
use crate::node::{
    ConditionNode, FilterGroupNode, NodeFlags, NodeKind, NodeSpec, PollSpec, ReferenceNode,
    ReferenceTarget, SequenceNode,
};
use crate::state::NodeState;
use crate::tracking::TrackingGroup;
use crate::tree::GoalTree;
use crate::world::PredicateRegistry;

/// The definable node kinds and their configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KindDef {
    All {
        #[serde(default, skip_serializing_if = "is_false")]
        fail_on_child_failure: bool,
    },
    Any,
    AtLeast {
        count: usize,
    },
    AtMost {
        count: usize,
    },
    #[serde(rename = "none")]
    NoneOf,
    Sequence,
    SequenceStep,
    Condition {
        predicate: String,
        #[serde(default, skip_serializing_if = "is_false")]
        fail_on_false: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        events: Vec<EventKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll: Option<PollSpec>,
    },
    Reference {
        target: ReferenceTarget,
        #[serde(default = "complete")]
        require: NodeState,
    },
    FilterGroup {
        source: String,
        #[serde(default)]
        filters: Vec<FilterSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        events: Vec<EventKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll: Option<PollSpec>,
    },
    Tracking {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        candidate_keys: Vec<EntityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait: Option<f64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        events: Vec<EventKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll: Option<PollSpec>,
    },
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn complete() -> NodeState {
    NodeState::Complete
}

/// Poll periods are checked against the built-in defaults; the engine's
/// own defaults are validated when its config is loaded.
fn check_poll(poll: &Option<PollSpec>) -> Result<(), GoalError> {
    if let Some(poll) = poll {
        poll.interval(&PollDefaults::default())
            .map_err(|e| GoalError::InvalidDefinition(e.to_string()))?;
    }
    Ok(())
}

impl KindDef {
    /// Build the runtime kind. Unknown predicate keys fail unless `lenient`,
    /// in which case they stay unresolved and the node stays Incomplete.
    /// Unschedulable poll periods always fail.
    pub(crate) fn build(&self, registry: &PredicateRegistry, lenient: bool) -> Result<NodeKind, GoalError> {
        if let KindDef::Condition { poll, .. }
        | KindDef::FilterGroup { poll, .. }
        | KindDef::Tracking { poll, .. } = self
        {
            check_poll(poll)?;
        }
        Ok(match self {
            KindDef::All {
                fail_on_child_failure,
            } => NodeKind::All {
                fail_on_child_failure: *fail_on_child_failure,
            },
            KindDef::Any => NodeKind::Any,
            KindDef::AtLeast { count } => NodeKind::AtLeast { count: *count },
            KindDef::AtMost { count } => NodeKind::AtMost { count: *count },
            KindDef::NoneOf => NodeKind::NoneOf,
            KindDef::Sequence => NodeKind::Sequence(SequenceNode::default()),
            KindDef::SequenceStep => NodeKind::SequenceStep,
            KindDef::Condition {
                predicate,
                fail_on_false,
                events,
                poll,
            } => NodeKind::Condition(ConditionNode {
                predicate: if lenient {
                    registry.resolve_entity_lenient(predicate)
                } else {
                    registry.resolve_entity(predicate)?
                },
                fail_on_false: *fail_on_false,
                events: events.clone(),
                poll: *poll,
            }),
            KindDef::Reference { target, require } => NodeKind::Reference(ReferenceNode {
                target: target.clone(),
                require: *require,
            }),
            KindDef::FilterGroup {
                source,
                filters,
                events,
                poll,
            } => NodeKind::FilterGroup(FilterGroupNode {
                source: source.clone(),
                filters: filters.clone(),
                events: events.clone(),
                poll: *poll,
            }),
            KindDef::Tracking {
                candidate_keys,
                wait,
                events,
                poll,
            } => NodeKind::Tracking(TrackingGroup {
                events: events.clone(),
                poll: *poll,
                ..TrackingGroup::new(candidate_keys.clone(), *wait)
            }),
        })
    }

    /// The definable form of a runtime kind. Filters and unresolved nodes
    /// have none.
    pub(crate) fn of(kind: &NodeKind) -> Option<KindDef> {
        Some(match kind {
            NodeKind::All {
                fail_on_child_failure,
            } => KindDef::All {
                fail_on_child_failure: *fail_on_child_failure,
            },
            NodeKind::Any => KindDef::Any,
            NodeKind::AtLeast { count } => KindDef::AtLeast { count: *count },
            NodeKind::AtMost { count } => KindDef::AtMost { count: *count },
            NodeKind::NoneOf => KindDef::NoneOf,
            NodeKind::Sequence(_) => KindDef::Sequence,
            NodeKind::SequenceStep => KindDef::SequenceStep,
            NodeKind::Condition(c) => KindDef::Condition {
                predicate: c.predicate.key().to_string(),
                fail_on_false: c.fail_on_false,
                events: c.events.clone(),
                poll: c.poll,
            },
            NodeKind::Reference(r) => KindDef::Reference {
                target: r.target.clone(),
                require: r.require,
            },
            NodeKind::FilterGroup(g) => KindDef::FilterGroup {
                source: g.source.clone(),
                filters: g.filters.clone(),
                events: g.events.clone(),
                poll: g.poll,
            },
            NodeKind::Tracking(t) => KindDef::Tracking {
                candidate_keys: t.candidate_keys.clone(),
                wait: t.wait,
                events: t.events.clone(),
                poll: t.poll,
            },
            NodeKind::Filter(_) | NodeKind::CountFilter(_) | NodeKind::Unresolved(_) => return None,
        })
    }
}

/// Generate the filter children of a filter group from its specs.
pub(crate) fn filter_children(
    filters: &[FilterSpec],
    registry: &PredicateRegistry,
    lenient: bool,
) -> Result<Vec<NodeSpec>, GoalError> {
    filters
        .iter()
        .map(|spec| {
            let kind = match spec {
                FilterSpec::Match {
                    predicate,
                    policy,
                    trivial,
                    ..
                } => {
                    let predicate = if lenient {
                        registry.resolve_item_lenient(predicate)
                    } else {
                        registry.resolve_item(predicate)?
                    };
                    NodeKind::Filter(DelegateFilter {
                        predicate,
                        policy: *policy,
                        trivial: *trivial,
                    })
                }
                FilterSpec::Count { min, max, .. } => NodeKind::CountFilter(CountFilter::new(*min, *max)),
            };
            let mut node = NodeSpec::new(kind);
            node.flags.title = spec.title().map(str::to_string);
            Ok(node)
        })
        .collect()
}

/// One node of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(flatten)]
    pub kind: KindDef,

    #[serde(flatten)]
    pub flags: NodeFlags,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDef>,
}

impl NodeDef {
    pub fn new(kind: KindDef) -> Self {
        Self {
            kind,
            flags: NodeFlags::default(),
            children: Vec::new(),
        }
    }

    /// Resolve predicates and generate filter children.
    pub fn resolve(&self, registry: &PredicateRegistry) -> Result<NodeSpec, GoalError> {
        let kind = self.kind.build(registry, false)?;
        let children = match &self.kind {
            KindDef::FilterGroup { filters, .. } => {
                if !self.children.is_empty() {
                    return Err(GoalError::InvalidDefinition(
                        "filter groups take `filters`, not `children`".into(),
                    ));
                }
                filter_children(filters, registry, false)?
            }
            _ => self
                .children
                .iter()
                .map(|c| c.resolve(registry))
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(NodeSpec {
            flags: self.flags.clone(),
            kind,
            children,
        })
    }
}

/// Supported definition file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Toml,
    Yaml,
    Json,
}

impl DefinitionFormat {
    /// Guess from a file extension; anything unknown is read as TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => DefinitionFormat::Yaml,
            Some("json") => DefinitionFormat::Json,
            _ => DefinitionFormat::Toml,
        }
    }
}

/// A named tree definition, as stored in a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub root: NodeDef,
}

impl TreeDefinition {
    pub fn parse(content: &str, format: DefinitionFormat) -> Result<Self, GoalError> {
        let parsed = match format {
            DefinitionFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            DefinitionFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
            DefinitionFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        };
        parsed.map_err(GoalError::InvalidDefinition)
    }

    pub fn load(path: &Path) -> Result<Self, GoalError> {
        let content = std::fs::read_to_string(path).map_err(|source| GoalError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, DefinitionFormat::from_path(path)).map_err(|e| match e {
            GoalError::InvalidDefinition(reason) => {
                GoalError::InvalidDefinition(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    /// Build a fresh tree, every node Incomplete.
    pub fn build(&self, registry: &PredicateRegistry) -> Result<GoalTree, GoalError> {
        GoalTree::new(self.root.resolve(registry)?)
    }

    /// SHA-256 of the canonical JSON form of the root, hex encoded.
    ///
    /// Stored with saved trees so a load can tell whether the definition
    /// changed since the save.
    pub fn digest(&self) -> Result<String, GoalError> {
        let canonical = serde_json::to_vec(&self.root)?;
        Ok(format!("{:x}", Sha256::digest(&canonical)))
    }
}
