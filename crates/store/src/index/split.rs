//! Node splitting, merging, and fill analysis for the index.
//!
//! # Algorithm Overview
//!
//! ## Splitting (insertion path)
//!
//! Nodes are rebuilt rather than edited in place, so a split simply cuts
//! the rebuilt entry or child list into pieces:
//!
//! 1. **Leaf split** (`split_leaf`): A leaf above the byte ceiling (with more
//!    than one entry) or above [`MAX_LEAF_ENTRIES`] is cut at its byte
//!    midpoint. Each half is split again until it fits. The first key of every
//!    right piece becomes the separator promoted to the parent.
//!
//! 2. **Branch split** (`split_branch`): A branch above [`MAX_BRANCH_CHILDREN`]
//!    is cut at its middle child. The separator between the halves moves up
//!    to the parent instead of being copied.
//!
//! The parent splices the pieces in place of the old child and may split in
//! turn. When the root produces more than one piece, a new root is built
//! above them.
//!
//! ## Merging (removal path)
//!
//! A node that falls below a quarter of its capacity is merged with a
//! sibling (`merge_nodes`). The merged node is then split again if it is too
//! large, which has the effect of redistributing entries between the two.

use std::sync::Arc;

use bytes::Bytes;

use super::{Branch, Entry, IndexLayout, Leaf, MAX_BRANCH_CHILDREN, MAX_LEAF_ENTRIES, Node};

/// Result of rebuilding a node: one or more siblings and the separators
/// between them.
#[derive(Debug, Default)]
pub struct Pieces {
    /// Sibling nodes in key order.
    pub nodes: Vec<Arc<Node>>,
    /// `separators[i]` separates `nodes[i]` from `nodes[i + 1]`.
    pub separators: Vec<Bytes>,
}

impl Pieces {
    /// Wraps a node that did not need splitting.
    pub fn single(node: Node) -> Self {
        Self { nodes: vec![Arc::new(node)], separators: Vec::new() }
    }
}

/// Whether a leaf must be split.
fn leaf_overfull(leaf: &Leaf, layout: &IndexLayout) -> bool {
    leaf.entries.len() > MAX_LEAF_ENTRIES
        || (leaf.bytes > layout.max_page_size && leaf.entries.len() > 1)
}

/// Whether a node is small enough to merge with a sibling.
pub fn is_underfull(node: &Node, layout: &IndexLayout) -> bool {
    match node {
        Node::Leaf(leaf) => {
            leaf.entries.len() < MAX_LEAF_ENTRIES / 4 && leaf.bytes < layout.max_page_size / 4
        },
        Node::Branch(branch) => branch.children.len() < MAX_BRANCH_CHILDREN / 4,
    }
}

/// Splits sorted entries into as many leaves as needed.
pub fn split_leaf(entries: Vec<Entry>, layout: &IndexLayout) -> Pieces {
    let mut pieces = Pieces::default();
    push_leaf(Leaf::new(entries, layout), layout, &mut pieces);
    pieces
}

fn push_leaf(leaf: Leaf, layout: &IndexLayout, out: &mut Pieces) {
    if !leaf_overfull(&leaf, layout) {
        if !out.nodes.is_empty() {
            if let Some(first) = leaf.entries.first() {
                out.separators.push(first.sort_key.clone());
            }
        }
        out.nodes.push(Arc::new(Node::Leaf(leaf)));
        return;
    }

    let at = byte_midpoint(&leaf.entries, leaf.bytes, layout);
    let mut left = leaf.entries;
    let right = left.split_off(at);
    push_leaf(Leaf::new(left, layout), layout, out);
    push_leaf(Leaf::new(right, layout), layout, out);
}

/// Index that divides `entries` into two halves of similar byte size.
/// Always leaves at least one entry on each side.
fn byte_midpoint(entries: &[Entry], total: usize, layout: &IndexLayout) -> usize {
    let half = total / 2;
    let mut acc = 0;
    let mut at = entries.len();
    for (i, entry) in entries.iter().enumerate() {
        if acc >= half {
            at = i;
            break;
        }
        acc += layout.footprint(entry);
    }
    at.clamp(1, entries.len().saturating_sub(1).max(1))
}

/// Splits a branch's children into as many branches as needed.
pub fn split_branch(keys: Vec<Bytes>, children: Vec<Arc<Node>>) -> Pieces {
    if children.len() <= MAX_BRANCH_CHILDREN {
        return Pieces::single(Node::Branch(Branch::new(keys, children)));
    }

    let mid = children.len() / 2;
    let mut left_children = children;
    let right_children = left_children.split_off(mid);
    let mut left_keys = keys;
    let mut right_keys = left_keys.split_off(mid - 1);
    let separator = right_keys.remove(0);

    let mut out = split_branch(left_keys, left_children);
    let right = split_branch(right_keys, right_children);
    out.separators.push(separator);
    out.separators.extend(right.separators);
    out.nodes.extend(right.nodes);
    out
}

/// Merges two adjacent siblings separated by `separator`, re-splitting the
/// result if it is too large.
pub fn merge_nodes(left: &Node, right: &Node, separator: &Bytes, layout: &IndexLayout) -> Pieces {
    match (left, right) {
        (Node::Leaf(l), Node::Leaf(r)) => {
            let mut entries = Vec::with_capacity(l.entries.len() + r.entries.len());
            entries.extend(l.entries.iter().cloned());
            entries.extend(r.entries.iter().cloned());
            split_leaf(entries, layout)
        },
        (Node::Branch(l), Node::Branch(r)) => {
            let mut keys = Vec::with_capacity(l.keys.len() + r.keys.len() + 1);
            keys.extend(l.keys.iter().cloned());
            keys.push(separator.clone());
            keys.extend(r.keys.iter().cloned());
            let mut children = Vec::with_capacity(l.children.len() + r.children.len());
            children.extend(l.children.iter().cloned());
            children.extend(r.children.iter().cloned());
            split_branch(keys, children)
        },
        // Siblings always sit at the same depth. Keep both if that ever fails.
        _ => Pieces {
            nodes: vec![Arc::new(left.clone()), Arc::new(right.clone())],
            separators: vec![separator.clone()],
        },
    }
}
