// outline.rs — Plain-text rendering of a goal tree for display.
//
//   [ ] Station crew rotation (sequence)
//     [x] Crewed craft in orbit (tracking) <- kestrel
//       [x] condition
//     [!] At most one lander (at_most)
//
// Only visible nodes are shown (hidden flags cascade, sequences conceal
// what is not reached yet), states are effective states, and trivial
// filters are left out.

use std::fmt::Write;

use crate::node::NodeKind;
use crate::state::{NodeId, NodeState};
use crate::tree::GoalTree;

fn marker(state: NodeState) -> &'static str {
    match state {
        NodeState::Incomplete => "[ ]",
        NodeState::Complete => "[x]",
        NodeState::Failed => "[!]",
    }
}

/// Render every visible node, one per line, indented by depth.
pub fn render_outline(tree: &GoalTree) -> String {
    let mut out = String::new();
    render(tree, tree.root(), 0, &mut out);
    out
}

fn render(tree: &GoalTree, id: NodeId, indent: usize, out: &mut String) {
    let Some(node) = tree.node(id) else {
        return;
    };
    if !tree.is_visible(id) {
        return;
    }
    if let NodeKind::Filter(filter) = &node.kind {
        if filter.trivial {
            return;
        }
    }

    let _ = write!(
        out,
        "{:indent$}{} {}",
        "",
        marker(node.effective_state()),
        node.label(),
        indent = indent * 2
    );
    if node.flags.title.is_some() {
        let _ = write!(out, " ({})", node.kind.type_name());
    }
    if let NodeKind::Tracking(group) = &node.kind {
        if let Some(candidate) = group.tracked() {
            let _ = write!(out, " <- {}", candidate);
        }
        if let Some(deadline) = group.wait_deadline {
            let _ = write!(out, " waiting until {}", deadline);
        }
    }
    if node.is_optional() {
        out.push_str(" (optional)");
    }
    if !node.is_enabled() {
        out.push_str(" (frozen)");
    }
    out.push('\n');

    for child in node.children() {
        render(tree, *child, indent + 1, out);
    }
}
