// combinator.rs — Aggregation rules for combinator nodes.
//
// Every combinator's state is a function of its children's *effective*
// states (a soft-failed child counts as Incomplete) plus, for the
// history-dependent ones, the node's own previous memo:
//
//   All        Complete iff every non-optional child is Complete
//              (Failed on a non-optional Failed child if configured)
//   Any        Complete iff at least one child is Complete
//   AtLeast(n) Complete iff #Complete >= n
//   AtMost(n)  Failed iff #Complete > n, otherwise Complete
//   None       Failed iff any child is Complete, otherwise Complete
//   Sequence   Complete iff every non-optional child completed, in index
//              order; a later child completing ahead of an earlier
//              non-optional one is Failed
//
// AtMost, None and Sequence failures latch: once Failed they stay Failed,
// unless the node is soft-failing, in which case they are recomputed each
// pass and may recover.
//
// These are free functions over plain slices so they can be tested without
// building a tree.

use crate::state::{Memo, NodeState};

/// What a combinator sees of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildView {
    /// Effective state (soft failures already mapped to Incomplete).
    pub state: NodeState,
    pub optional: bool,
}

impl ChildView {
    pub fn new(state: NodeState, optional: bool) -> Self {
        Self { state, optional }
    }

    fn is_complete(&self) -> bool {
        self.state == NodeState::Complete
    }
}

/// Number of children currently Complete (optional ones included).
pub fn count_complete(children: &[ChildView]) -> usize {
    children.iter().filter(|c| c.is_complete()).count()
}

pub fn all(children: &[ChildView], fail_on_child_failure: bool) -> NodeState {
    if fail_on_child_failure
        && children
            .iter()
            .any(|c| !c.optional && c.state == NodeState::Failed)
    {
        return NodeState::Failed;
    }
    let required_complete = children
        .iter()
        .filter(|c| !c.optional)
        .all(ChildView::is_complete);
    if required_complete {
        NodeState::Complete
    } else {
        NodeState::Incomplete
    }
}

pub fn any(children: &[ChildView]) -> NodeState {
    if children.iter().any(ChildView::is_complete) {
        NodeState::Complete
    } else {
        NodeState::Incomplete
    }
}

pub fn at_least(children: &[ChildView], count: usize) -> NodeState {
    if count_complete(children) >= count {
        NodeState::Complete
    } else {
        NodeState::Incomplete
    }
}

/// Complete by default; Failed only on overshoot.
pub fn at_most(children: &[ChildView], count: usize, previous: NodeState, latch: bool) -> NodeState {
    if latch && previous == NodeState::Failed {
        return NodeState::Failed;
    }
    if count_complete(children) > count {
        NodeState::Failed
    } else {
        NodeState::Complete
    }
}

pub fn none_of(children: &[ChildView], previous: NodeState, latch: bool) -> NodeState {
    at_most(children, 0, previous, latch)
}

/// Sequence aggregation. `previous.progress` is how many children had
/// completed in order before this pass.
///
/// Children completing together in one pass count as in order.
pub fn sequence(children: &[ChildView], previous: Memo, latch: bool) -> Memo {
    if latch && previous.state == NodeState::Failed {
        return previous;
    }

    let n = children.len();
    let mut reached = (previous.progress as usize).min(n);
    let start = reached;
    for idx in start..n {
        if !children[idx].is_complete() {
            continue;
        }
        let skipped_required = children[reached..idx]
            .iter()
            .any(|c| !c.optional && !c.is_complete());
        if skipped_required {
            return Memo {
                state: NodeState::Failed,
                progress: reached as u32,
            };
        }
        reached = idx + 1;
    }

    // Ordering was checked above; optional children left behind do not
    // hold the sequence open.
    let done = children
        .iter()
        .filter(|c| !c.optional)
        .all(ChildView::is_complete);
    Memo {
        state: if done {
            NodeState::Complete
        } else {
            NodeState::Incomplete
        },
        progress: reached as u32,
    }
}

/// Indices of sequence children that should stay concealed: everything
/// after the first required child that is not yet Complete. Optional
/// children may be skipped, so they never conceal what follows them. A
/// finished or failed sequence conceals nothing.
pub fn concealed_indices(children: &[ChildView], state: NodeState) -> Vec<usize> {
    if state.is_terminal() {
        return Vec::new();
    }
    match children.iter().position(|c| !c.optional && !c.is_complete()) {
        Some(first) => ((first + 1)..children.len()).collect(),
        None => Vec::new(),
    }
}
