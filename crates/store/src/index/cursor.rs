//! Index cursor for iteration and range scans.
//!
//! A cursor holds the root-to-leaf path of the snapshot it was created on,
//! as a stack of `(node, index)` pairs. Because every node on the path is an
//! `Arc`, a cursor keeps its snapshot alive and never observes later commits.

use std::{ops::Bound, sync::Arc};

use bytes::Bytes;

use super::{Entry, Node};

/// Position within an index snapshot.
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Root at index 0, leaf last. Branch indexes name the child being
    /// visited; the leaf index names the current entry.
    stack: Vec<(Arc<Node>, usize)>,
}

impl Cursor {
    /// Positions a cursor at the first entry satisfying `bound`:
    /// the first entry at all, the first `>= key`, or the first `> key`.
    pub fn seek(root: Arc<Node>, bound: Bound<&[u8]>) -> Self {
        let mut stack = Vec::new();
        let mut node = root;
        loop {
            let (idx, next) = match node.as_ref() {
                Node::Branch(branch) => {
                    let idx = match bound {
                        Bound::Unbounded => 0,
                        Bound::Included(key) | Bound::Excluded(key) => branch.child_index(key),
                    };
                    (idx, Some(Arc::clone(&branch.children[idx])))
                },
                Node::Leaf(leaf) => {
                    let idx = match bound {
                        Bound::Unbounded => 0,
                        Bound::Included(key) => {
                            leaf.entries.partition_point(|e| e.sort_key.as_ref() < key)
                        },
                        Bound::Excluded(key) => {
                            leaf.entries.partition_point(|e| e.sort_key.as_ref() <= key)
                        },
                    };
                    (idx, None)
                },
            };
            stack.push((node, idx));
            match next {
                Some(child) => node = child,
                None => break,
            }
        }

        let mut cursor = Self { stack };
        cursor.settle();
        cursor
    }

    /// Entry under the cursor, or `None` once past the end.
    pub fn current(&self) -> Option<&Entry> {
        let (node, idx) = self.stack.last()?;
        match node.as_ref() {
            Node::Leaf(leaf) => leaf.entries.get(*idx),
            Node::Branch(_) => None,
        }
    }

    /// Moves to the next entry.
    pub fn advance(&mut self) {
        if let Some((_, idx)) = self.stack.last_mut() {
            *idx += 1;
            self.settle();
        }
    }

    /// Whether the cursor has run past the last entry.
    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }

    /// Walks forward until the top of the stack is a valid leaf entry, or
    /// empties the stack at the end of the tree.
    fn settle(&mut self) {
        loop {
            let step = match self.stack.last() {
                None => return,
                Some((node, idx)) => match node.as_ref() {
                    Node::Leaf(leaf) if *idx < leaf.entries.len() => return,
                    Node::Branch(branch) if *idx < branch.children.len() => {
                        Some(Arc::clone(&branch.children[*idx]))
                    },
                    _ => None,
                },
            };
            match step {
                Some(child) => self.stack.push((child, 0)),
                None => {
                    self.stack.pop();
                    match self.stack.last_mut() {
                        Some((_, idx)) => *idx += 1,
                        None => return,
                    }
                },
            }
        }
    }
}

/// Bounded forward iteration over an index snapshot.
///
/// Yields entries until one is greater than the inclusive upper bound or no
/// longer matches the prefix. Cloning a `RangeIter` forks an independent
/// position over the same snapshot.
#[derive(Debug, Clone)]
pub struct RangeIter {
    cursor: Cursor,
    upper_inclusive: Option<Bytes>,
    prefix: Option<Bytes>,
    done: bool,
}

impl RangeIter {
    /// Creates a range iterator starting at `cursor`.
    pub fn new(cursor: Cursor, upper_inclusive: Option<Bytes>, prefix: Option<Bytes>) -> Self {
        Self { cursor, upper_inclusive, prefix, done: false }
    }

    /// Next entry without advancing.
    pub fn peek(&self) -> Option<&Entry> {
        if self.done {
            return None;
        }
        self.cursor.current().filter(|e| self.in_range(e))
    }

    fn in_range(&self, entry: &Entry) -> bool {
        let below_upper = self.upper_inclusive.as_ref().is_none_or(|hi| entry.sort_key <= *hi);
        let matches_prefix =
            self.prefix.as_ref().is_none_or(|p| entry.sort_key.starts_with(p.as_ref()));
        below_upper && matches_prefix
    }
}

impl Iterator for RangeIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let Some(entry) = self.peek().cloned() else {
            self.done = true;
            return None;
        };
        self.cursor.advance();
        Some(entry)
    }
}
