// state.rs — Node identity and the tri-state verdict.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a goal node within its tree.
///
/// Assigned once at creation and kept across save/load, so sequence
/// back-references and per-candidate memories can refer to nodes by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state of a goal node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Incomplete,
    Complete,
    Failed,
}

impl NodeState {
    /// Complete and Failed are terminal; only frozen nodes stay there.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Incomplete)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Incomplete => write!(f, "incomplete"),
            NodeState::Complete => write!(f, "complete"),
            NodeState::Failed => write!(f, "failed"),
        }
    }
}

/// Everything an evaluation needs to remember about one node.
///
/// `progress` is only used by sequences: how many children have completed
/// in order so far. Probes against non-tracked candidates keep their own
/// memos so they never touch the committed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    pub state: NodeState,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub progress: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl Memo {
    pub fn new(state: NodeState) -> Self {
        Self { state, progress: 0 }
    }
}

/// Location of a node as child indices from the root.
///
/// Replaces identity lookups across the tree: a path resolves against the
/// arena in one walk and survives save/load unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut steps = self.0.clone();
        steps.push(index);
        Self(steps)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for step in &self.0 {
            write!(f, "/{}", step)?;
        }
        Ok(())
    }
}
