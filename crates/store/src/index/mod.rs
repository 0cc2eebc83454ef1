//! Persistent copy-on-write B+ tree.
//!
//! Every committed version of the store is an [`Index`] value. Nodes are
//! shared through `Arc`, so cloning an index is O(1) and a mutation copies
//! only the root-to-leaf path it touches. Older roots stay valid for as long
//! as somebody (a scan, a copy stream, the version history) holds them.
//!
//! ## Structure
//!
//! - `cursor.rs`: Positioned iteration and bounded range queries
//! - `split.rs`: Node splitting, merging, and fill analysis
//!
//! ## Node layout
//!
//! ```text
//!                 Branch { keys: [k1, k2], children: [c0, c1, c2] }
//!                   /               |                \
//!        keys < k1          k1 <= keys < k2        keys >= k2
//! ```
//!
//! Separators are lower bounds of their right subtree. After deletions a
//! separator may be smaller than the actual minimum of that subtree, which
//! is still a valid partition.
//!
//! Branches cache the entry count, byte footprint, and node count of their
//! subtree, so statistics are O(1) on any snapshot.

/// Cursor and range query support for index iteration.
pub mod cursor;
/// Node splitting and merging for leaf and branch nodes.
pub mod split;

use std::{ops::Bound, sync::Arc};

use bytes::Bytes;
pub use cursor::{Cursor, RangeIter};
use split::{Pieces, is_underfull, merge_nodes, split_branch, split_leaf};

/// Fixed per-entry bookkeeping charged against the node size ceiling.
pub const ENTRY_OVERHEAD: usize = 32;

/// Size charged for a value stored by reference instead of inline.
pub const VALUE_REF_SIZE: usize = 16;

/// Per-child bookkeeping charged to a branch node.
pub const CHILD_REF_SIZE: usize = 16;

/// Maximum number of entries in a single leaf, independent of byte size.
pub const MAX_LEAF_ENTRIES: usize = 256;

/// Maximum fanout of a branch node.
pub const MAX_BRANCH_CHILDREN: usize = 64;

/// A single key-value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Normalized key used for ordering.
    pub sort_key: Bytes,
    /// Key as supplied by the caller.
    pub key: Bytes,
    /// Stored value.
    pub value: Bytes,
    /// Sequence number of the mutation that last wrote this entry.
    pub seq: u64,
}

/// Size accounting parameters shared by every node of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLayout {
    /// Elastic byte ceiling per node. A node above it splits, unless it
    /// holds a single entry.
    pub max_page_size: usize,
    /// Whether values count their full length or a fixed reference size.
    pub store_data_inline: bool,
}

impl IndexLayout {
    /// Bytes an entry contributes to its leaf.
    #[inline]
    pub fn footprint(&self, entry: &Entry) -> usize {
        let value = if self.store_data_inline { entry.value.len() } else { VALUE_REF_SIZE };
        ENTRY_OVERHEAD + entry.sort_key.len() + entry.key.len() + value
    }
}

impl Default for IndexLayout {
    fn default() -> Self {
        Self { max_page_size: 8 * 1024, store_data_inline: true }
    }
}

/// Leaf node: sorted entries.
#[derive(Debug, Clone, Default)]
pub struct Leaf {
    /// Entries sorted by `sort_key`.
    pub entries: Vec<Entry>,
    /// Sum of entry footprints.
    pub bytes: usize,
}

impl Leaf {
    /// Builds a leaf from already-sorted entries.
    pub fn new(entries: Vec<Entry>, layout: &IndexLayout) -> Self {
        let bytes = entries.iter().map(|e| layout.footprint(e)).sum();
        Self { entries, bytes }
    }

    /// Binary search for `sort_key` within this leaf.
    #[inline]
    pub fn search(&self, sort_key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.sort_key.as_ref().cmp(sort_key))
    }
}

/// Branch node: separators and children with cached subtree aggregates.
#[derive(Debug, Clone)]
pub struct Branch {
    /// `keys[i]` separates `children[i]` from `children[i + 1]`.
    pub keys: Vec<Bytes>,
    /// Child subtrees. Always `keys.len() + 1` of them.
    pub children: Vec<Arc<Node>>,
    /// Entries in this subtree.
    pub len: usize,
    /// Byte footprint of this subtree.
    pub bytes: usize,
    /// Nodes in this subtree, this one included.
    pub nodes: usize,
}

impl Branch {
    /// Builds a branch and computes its aggregates.
    pub fn new(keys: Vec<Bytes>, children: Vec<Arc<Node>>) -> Self {
        let mut len = 0;
        let mut bytes = children.len() * CHILD_REF_SIZE;
        let mut nodes = 1;
        for child in &children {
            len += child.len();
            bytes += child.byte_size();
            nodes += child.node_count();
        }
        bytes += keys.iter().map(Bytes::len).sum::<usize>();
        Self { keys, children, len, bytes, nodes }
    }

    /// Index of the child whose key range contains `sort_key`.
    #[inline]
    pub fn child_index(&self, sort_key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_ref() <= sort_key)
    }
}

/// A B+ tree node.
#[derive(Debug, Clone)]
pub enum Node {
    /// Leaf holding entries.
    Leaf(Leaf),
    /// Interior node.
    Branch(Branch),
}

impl Node {
    /// Entries in this subtree.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Branch(branch) => branch.len,
        }
    }

    /// Whether this subtree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte footprint of this subtree.
    pub fn byte_size(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.bytes,
            Node::Branch(branch) => branch.bytes,
        }
    }

    /// Nodes in this subtree.
    pub fn node_count(&self) -> usize {
        match self {
            Node::Leaf(_) => 1,
            Node::Branch(branch) => branch.nodes,
        }
    }

    /// Greatest entry in this subtree.
    fn last_entry(&self) -> Option<&Entry> {
        match self {
            Node::Leaf(leaf) => leaf.entries.last(),
            Node::Branch(branch) => branch.children.iter().rev().find_map(|c| c.last_entry()),
        }
    }
}

/// An immutable snapshot of the ordered key space.
#[derive(Debug, Clone)]
pub struct Index {
    root: Arc<Node>,
    layout: IndexLayout,
}

impl Index {
    /// Creates an empty index.
    pub fn new(layout: IndexLayout) -> Self {
        Self { root: Arc::new(Node::Leaf(Leaf::default())), layout }
    }

    /// Builds an index from entries in any order. Later duplicates replace
    /// earlier ones.
    pub fn from_entries(layout: IndexLayout, entries: impl IntoIterator<Item = Entry>) -> Self {
        let mut index = Self::new(layout);
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    /// Size accounting parameters.
    pub fn layout(&self) -> IndexLayout {
        self.layout
    }

    /// Root node of this snapshot.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.root.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Number of nodes (pages).
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Total byte footprint.
    pub fn byte_size(&self) -> usize {
        self.root.byte_size()
    }

    /// Whether two indexes share the same root.
    pub fn ptr_eq(&self, other: &Index) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    /// Looks up an entry by sort key.
    pub fn get(&self, sort_key: &[u8]) -> Option<&Entry> {
        let mut node = self.root.as_ref();
        loop {
            match node {
                Node::Branch(branch) => node = branch.children[branch.child_index(sort_key)].as_ref(),
                Node::Leaf(leaf) => return leaf.search(sort_key).ok().map(|i| &leaf.entries[i]),
            }
        }
    }

    /// Bytes held by the nodes on the root-to-leaf path towards `sort_key`,
    /// excluding their other subtrees. A mutation of that key copies these
    /// nodes, so the version it replaces keeps them alive on its own.
    pub fn path_bytes(&self, sort_key: &[u8]) -> usize {
        let mut node = self.root.as_ref();
        let mut bytes = 0;
        loop {
            match node {
                Node::Branch(branch) => {
                    bytes += branch.children.len() * CHILD_REF_SIZE
                        + branch.keys.iter().map(Bytes::len).sum::<usize>();
                    node = branch.children[branch.child_index(sort_key)].as_ref();
                },
                Node::Leaf(leaf) => return bytes + leaf.bytes,
            }
        }
    }

    /// Greatest entry whose sort key is strictly less than `sort_key`.
    pub fn predecessor(&self, sort_key: &[u8]) -> Option<&Entry> {
        predecessor_in(&self.root, sort_key)
    }

    /// Inserts or replaces an entry, returning the replaced one.
    pub fn insert(&mut self, entry: Entry) -> Option<Entry> {
        let (pieces, replaced) = insert_into(&self.root, entry, &self.layout);
        self.root = grow_root(pieces);
        replaced
    }

    /// Removes an entry by sort key, returning it.
    pub fn remove(&mut self, sort_key: &[u8]) -> Option<Entry> {
        let (new_root, removed) = remove_from(&self.root, sort_key, &self.layout)?;
        self.root = collapse_root(new_root);
        Some(removed)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.root = Arc::new(Node::Leaf(Leaf::default()));
    }

    /// Cursor positioned at the first entry satisfying `bound`.
    pub fn seek(&self, bound: Bound<&[u8]>) -> Cursor {
        Cursor::seek(Arc::clone(&self.root), bound)
    }

    /// Iterates every entry in order.
    pub fn iter(&self) -> RangeIter {
        self.range(None, None, None)
    }

    /// Iterates entries with `lower_exclusive < sort_key <= upper_inclusive`
    /// whose sort key starts with `prefix`. Any bound may be absent.
    pub fn range(
        &self,
        lower_exclusive: Option<&[u8]>,
        upper_inclusive: Option<&[u8]>,
        prefix: Option<&[u8]>,
    ) -> RangeIter {
        let start = match (lower_exclusive, prefix) {
            (Some(lower), Some(prefix)) if lower < prefix => Bound::Included(prefix),
            (Some(lower), _) => Bound::Excluded(lower),
            (None, Some(prefix)) => Bound::Included(prefix),
            (None, None) => Bound::Unbounded,
        };
        RangeIter::new(
            self.seek(start),
            upper_inclusive.map(Bytes::copy_from_slice),
            prefix.map(Bytes::copy_from_slice),
        )
    }

    /// Verifies ordering, separators, and cached aggregates.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        check_node(&self.root, None, None, &self.layout)
    }
}

fn predecessor_in<'a>(node: &'a Node, sort_key: &[u8]) -> Option<&'a Entry> {
    match node {
        Node::Leaf(leaf) => {
            let idx = leaf.entries.partition_point(|e| e.sort_key.as_ref() < sort_key);
            idx.checked_sub(1).map(|i| &leaf.entries[i])
        },
        Node::Branch(branch) => {
            let idx = branch.keys.partition_point(|sep| sep.as_ref() < sort_key);
            predecessor_in(&branch.children[idx], sort_key)
                .or_else(|| branch.children[..idx].iter().rev().find_map(|c| c.last_entry()))
        },
    }
}

fn insert_into(node: &Node, entry: Entry, layout: &IndexLayout) -> (Pieces, Option<Entry>) {
    match node {
        Node::Leaf(leaf) => {
            let mut entries = leaf.entries.clone();
            let replaced = match leaf.search(&entry.sort_key) {
                Ok(i) => Some(std::mem::replace(&mut entries[i], entry)),
                Err(i) => {
                    entries.insert(i, entry);
                    None
                },
            };
            (split_leaf(entries, layout), replaced)
        },
        Node::Branch(branch) => {
            let idx = branch.child_index(&entry.sort_key);
            let (child_pieces, replaced) = insert_into(&branch.children[idx], entry, layout);
            let (keys, children) = splice(branch, idx, 1, child_pieces);
            (split_branch(keys, children), replaced)
        },
    }
}

/// Returns `None` when the key is absent, leaving the tree untouched.
fn remove_from(node: &Node, sort_key: &[u8], layout: &IndexLayout) -> Option<(Node, Entry)> {
    match node {
        Node::Leaf(leaf) => {
            let idx = leaf.search(sort_key).ok()?;
            let mut entries = leaf.entries.clone();
            let removed = entries.remove(idx);
            Some((Node::Leaf(Leaf::new(entries, layout)), removed))
        },
        Node::Branch(branch) => {
            let idx = branch.child_index(sort_key);
            let (child, removed) = remove_from(&branch.children[idx], sort_key, layout)?;

            if !is_underfull(&child, layout) || branch.children.len() == 1 {
                let (keys, children) = splice(branch, idx, 1, Pieces::single(child));
                return Some((Node::Branch(Branch::new(keys, children)), removed));
            }

            // Merge with the left sibling when there is one, else the right.
            let (left_idx, merged) = if idx > 0 {
                let left = &branch.children[idx - 1];
                (idx - 1, merge_nodes(left, &child, &branch.keys[idx - 1], layout))
            } else {
                let right = &branch.children[idx + 1];
                (idx, merge_nodes(&child, right, &branch.keys[idx], layout))
            };
            let (keys, children) = splice(branch, left_idx, 2, merged);
            Some((Node::Branch(Branch::new(keys, children)), removed))
        },
    }
}

/// Replaces `count` children starting at `idx` with `pieces`, fixing up the
/// separators around them.
fn splice(branch: &Branch, idx: usize, count: usize, pieces: Pieces) -> (Vec<Bytes>, Vec<Arc<Node>>) {
    let mut children = Vec::with_capacity(branch.children.len() + pieces.nodes.len());
    children.extend(branch.children[..idx].iter().cloned());
    children.extend(pieces.nodes);
    children.extend(branch.children[idx + count..].iter().cloned());

    // Separators before the spliced run and after it are kept. The run's
    // internal separators come from the pieces.
    let mut keys = Vec::with_capacity(children.len().saturating_sub(1));
    keys.extend(branch.keys[..idx].iter().cloned());
    keys.extend(pieces.separators);
    keys.extend(branch.keys[idx + count - 1..].iter().cloned());
    (keys, children)
}

fn grow_root(mut pieces: Pieces) -> Arc<Node> {
    while pieces.nodes.len() > 1 {
        pieces = split_branch(pieces.separators, pieces.nodes);
    }
    pieces.nodes.pop().unwrap_or_else(|| Arc::new(Node::Leaf(Leaf::default())))
}

fn collapse_root(mut root: Node) -> Arc<Node> {
    loop {
        match root {
            Node::Branch(mut branch) if branch.children.len() == 1 => {
                let only = branch.children.swap_remove(0);
                root = Arc::unwrap_or_clone(only);
            },
            other => return Arc::new(other),
        }
    }
}

fn check_node(
    node: &Node,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    layout: &IndexLayout,
) -> std::result::Result<(), String> {
    let in_bounds = |key: &[u8]| {
        lower.is_none_or(|lo| key >= lo) && upper.is_none_or(|hi| key < hi)
    };
    match node {
        Node::Leaf(leaf) => {
            for pair in leaf.entries.windows(2) {
                if pair[0].sort_key >= pair[1].sort_key {
                    return Err(format!("leaf keys out of order at {:?}", pair[1].sort_key));
                }
            }
            if let Some(bad) = leaf.entries.iter().find(|e| !in_bounds(e.sort_key.as_ref())) {
                return Err(format!("leaf key {:?} outside separator bounds", bad.sort_key));
            }
            let bytes: usize = leaf.entries.iter().map(|e| layout.footprint(e)).sum();
            if bytes != leaf.bytes {
                return Err(format!("leaf byte count {} != actual {bytes}", leaf.bytes));
            }
            Ok(())
        },
        Node::Branch(branch) => {
            if branch.children.len() != branch.keys.len() + 1 {
                return Err(format!(
                    "branch has {} children for {} separators",
                    branch.children.len(),
                    branch.keys.len()
                ));
            }
            if branch.children.len() > MAX_BRANCH_CHILDREN {
                return Err(format!("branch fanout {} exceeds cap", branch.children.len()));
            }
            for pair in branch.keys.windows(2) {
                if pair[0] >= pair[1] {
                    return Err(format!("separators out of order at {:?}", pair[1]));
                }
            }
            if let Some(bad) = branch.keys.iter().find(|k| !in_bounds(&k[..])) {
                return Err(format!("separator {bad:?} outside parent bounds"));
            }
            for (i, child) in branch.children.iter().enumerate() {
                let lo = if i == 0 { lower } else { Some(branch.keys[i - 1].as_ref()) };
                let hi = if i == branch.keys.len() { upper } else { Some(branch.keys[i].as_ref()) };
                check_node(child, lo, hi, layout)?;
            }
            let expected = Branch::new(branch.keys.clone(), branch.children.clone());
            if expected.len != branch.len
                || expected.bytes != branch.bytes
                || expected.nodes != branch.nodes
            {
                return Err("branch aggregates are stale".to_string());
            }
            Ok(())
        },
    }
}
