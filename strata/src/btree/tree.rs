//! Concurrent B+Tree over a buffer pool, rooted at page 0.

use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, trace};

use super::cursor::Cursor;
use super::node::{InternalNode, LeafNode, Node, INTERNAL_MAX_KEYS, LEAF_MAX_ENTRIES};
use crate::buffer_pool::{BufferPool, PageGuard, ReadLatch, WriteLatch};
use crate::error::{Result, StrataError};
use crate::index::Index;
use crate::{Key, PageId, Value};

/// The root never moves.
pub const ROOT_PAGE_ID: PageId = 0;

const MIN_CAPACITY: usize = 2;

/// Node capacities. Defaults are the page-derived maximums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    pub leaf_capacity: usize,
    pub internal_capacity: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            leaf_capacity: LEAF_MAX_ENTRIES,
            internal_capacity: INTERNAL_MAX_KEYS,
        }
    }
}

impl TreeOptions {
    /// Smaller nodes, clamped to what a page can hold.
    pub fn with_capacities(leaf_capacity: usize, internal_capacity: usize) -> Self {
        Self {
            leaf_capacity: leaf_capacity.clamp(MIN_CAPACITY, LEAF_MAX_ENTRIES),
            internal_capacity: internal_capacity.clamp(MIN_CAPACITY, INTERNAL_MAX_KEYS),
        }
    }

    fn capacity(&self, node: &Node) -> usize {
        match node {
            Node::Internal(_) => self.internal_capacity,
            Node::Leaf(_) => self.leaf_capacity,
        }
    }

    /// A full node splits if one more entry arrives.
    fn is_full(&self, node: &Node) -> bool {
        node.len() >= self.capacity(node)
    }

    fn overflows(&self, node: &Node) -> bool {
        node.len() > self.capacity(node)
    }
}

/// A page held under a shared latch. The latch is declared first so it is
/// released before the pin.
pub(crate) struct ReadNode {
    latch: ReadLatch,
    _pin: PageGuard,
}

impl ReadNode {
    pub(crate) fn fetch(pool: &Arc<BufferPool>, page_id: PageId) -> Result<Self> {
        let pin = pool.fetch_page(page_id)?;
        let latch = pin.read_owned();
        Ok(Self { latch, _pin: pin })
    }

    pub(crate) fn decode(&self) -> Result<Node> {
        Node::decode(&self.latch.data)
    }
}

/// A page held under an exclusive latch together with its decoded node.
struct WriteNode {
    latch: WriteLatch,
    pin: PageGuard,
    node: Node,
}

impl WriteNode {
    fn fetch(pool: &Arc<BufferPool>, page_id: PageId) -> Result<Self> {
        let pin = pool.fetch_page(page_id)?;
        let latch = pin.write_owned();
        let node = Node::decode(&latch.data)?;
        Ok(Self { latch, pin, node })
    }

    fn page_id(&self) -> PageId {
        self.pin.page_id()
    }

    fn store(&mut self) -> Result<()> {
        self.node.encode(&mut self.latch.data)
    }
}

pub struct BPlusTree {
    pool: Arc<BufferPool>,
    options: TreeOptions,
}

impl BPlusTree {
    /// Opens the tree stored in `pool`, creating an empty root leaf on page 0
    /// for a fresh file.
    pub fn open(pool: Arc<BufferPool>, options: TreeOptions) -> Result<Self> {
        if pool.num_pages() == 0 {
            let root = pool.new_page()?;
            if root.page_id() != ROOT_PAGE_ID {
                return Err(StrataError::Corrupted(format!(
                    "fresh tree got root page {}",
                    root.page_id()
                )));
            }
            Node::empty_leaf().encode(&mut root.write().data)?;
            debug!("initialised empty tree");
        }
        Ok(Self { pool, options })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn options(&self) -> TreeOptions {
        self.options
    }

    /// Descends with shared latches, taking each child before releasing its parent.
    fn descend_read(&self, pick: impl Fn(&InternalNode) -> PageId) -> Result<(ReadNode, LeafNode)> {
        let mut current = ReadNode::fetch(&self.pool, ROOT_PAGE_ID)?;
        loop {
            match current.decode()? {
                Node::Leaf(leaf) => return Ok((current, leaf)),
                Node::Internal(inner) => {
                    let child = ReadNode::fetch(&self.pool, pick(&inner))?;
                    current = child;
                }
            }
        }
    }

    /// Descends with exclusive latches, holding only the parent-child pair.
    fn descend_write(&self, key: Key) -> Result<WriteNode> {
        let mut current = WriteNode::fetch(&self.pool, ROOT_PAGE_ID)?;
        loop {
            let child_id = match &current.node {
                Node::Leaf(_) => return Ok(current),
                Node::Internal(inner) => inner.child_for(key),
            };
            let child = WriteNode::fetch(&self.pool, child_id)?;
            current = child;
        }
    }

    pub fn find(&self, key: Key) -> Result<Option<Value>> {
        let (_latched, leaf) = self.descend_read(|inner| inner.child_for(key))?;
        Ok(leaf.get(key))
    }

    pub fn insert(&self, key: Key, value: Value) -> Result<()> {
        // Ancestors stay latched only while everything below them is full.
        let mut path: Vec<WriteNode> = Vec::new();
        let mut page_id = ROOT_PAGE_ID;
        loop {
            let current = WriteNode::fetch(&self.pool, page_id)?;
            if !self.options.is_full(&current.node) {
                path.clear();
            }
            let next = match &current.node {
                Node::Internal(inner) => Some(inner.child_for(key)),
                Node::Leaf(_) => None,
            };
            path.push(current);
            match next {
                Some(child) => page_id = child,
                None => break,
            }
        }

        let Some(Node::Leaf(leaf)) = path.last().map(|n| &n.node) else {
            return Err(StrataError::Corrupted("insert path ended above a leaf".to_string()));
        };
        let slot = match leaf.search(key) {
            Ok(_) => return Err(StrataError::DuplicateKey(key)),
            Err(slot) => slot,
        };

        // Allocate every page the splits need before touching a node.
        let splits = path.iter().filter(|n| self.options.is_full(&n.node)).count();
        let root_splits = path
            .first()
            .is_some_and(|n| n.page_id() == ROOT_PAGE_ID && self.options.is_full(&n.node));
        let needed = splits + usize::from(root_splits);
        let mut fresh = (0..needed)
            .map(|_| self.pool.new_page())
            .collect::<Result<Vec<_>>>()?;

        if let Some(Node::Leaf(leaf)) = path.last_mut().map(|n| &mut n.node) {
            leaf.entries.insert(slot, (key, value));
        }

        let mut pending: Option<(Key, PageId)> = None;
        while let Some(mut current) = path.pop() {
            if let Some((separator, right_id)) = pending.take() {
                match &mut current.node {
                    Node::Internal(inner) => inner.insert_child(separator, right_id),
                    Node::Leaf(_) => {
                        return Err(StrataError::Corrupted(format!(
                            "leaf {} above a split child",
                            current.page_id()
                        )))
                    }
                }
            }
            if !self.options.overflows(&current.node) {
                return current.store();
            }
            if current.page_id() == ROOT_PAGE_ID {
                return self.split_root(current, &mut fresh);
            }

            let right = take_fresh(&mut fresh)?;
            let (separator, right_node) = current.node.split(right.page_id());
            right_node.encode(&mut right.write().data)?;
            current.store()?;
            trace!(
                "split page {} at {} into new page {}",
                current.page_id(),
                separator,
                right.page_id()
            );
            pending = Some((separator, right.page_id()));
        }

        Err(StrataError::Corrupted(
            "split propagated above the latched path".to_string(),
        ))
    }

    /// Moves both halves of the root to fresh pages and turns page 0 into
    /// an internal node over them.
    fn split_root(&self, mut root: WriteNode, fresh: &mut Vec<PageGuard>) -> Result<()> {
        let left = take_fresh(fresh)?;
        let right = take_fresh(fresh)?;

        let mut left_node = std::mem::replace(&mut root.node, Node::empty_leaf());
        let (separator, right_node) = left_node.split(right.page_id());
        right_node.encode(&mut right.write().data)?;
        left_node.encode(&mut left.write().data)?;

        root.node = Node::Internal(InternalNode {
            keys: vec![separator],
            children: vec![left.page_id(), right.page_id()],
        });
        root.store()?;
        debug!(
            "root split at {}: children {} and {}",
            separator,
            left.page_id(),
            right.page_id()
        );
        Ok(())
    }

    /// Replaces the value of an existing key and returns the previous one.
    pub fn update(&self, key: Key, value: Value) -> Result<Value> {
        let mut leaf_node = self.descend_write(key)?;
        let Node::Leaf(leaf) = &mut leaf_node.node else {
            return Err(StrataError::Corrupted("descent ended above a leaf".to_string()));
        };
        let idx = leaf.search(key).map_err(|_| StrataError::KeyNotFound(key))?;
        let old = std::mem::replace(&mut leaf.entries[idx].1, value);
        leaf_node.store()?;
        Ok(old)
    }

    /// Removes `key`; returns whether an entry was removed. Nodes are never merged.
    pub fn delete(&self, key: Key) -> Result<bool> {
        let mut leaf_node = self.descend_write(key)?;
        let Node::Leaf(leaf) = &mut leaf_node.node else {
            return Err(StrataError::Corrupted("descent ended above a leaf".to_string()));
        };
        match leaf.search(key) {
            Ok(idx) => {
                leaf.entries.remove(idx);
                leaf_node.store()?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn cursor_at_start(&self) -> Result<Cursor> {
        let (latched, leaf) = self.descend_read(|inner| inner.children[0])?;
        Ok(Cursor::new(Arc::clone(&self.pool), latched, leaf, 0))
    }

    /// Cursor positioned at the first entry with a key `>= key`.
    pub fn cursor_at(&self, key: Key) -> Result<Cursor> {
        let (latched, leaf) = self.descend_read(|inner| inner.child_for(key))?;
        let position = leaf.lower_bound(key);
        Ok(Cursor::new(Arc::clone(&self.pool), latched, leaf, position))
    }

    pub fn scan_all(&self) -> Result<Vec<(Key, Value)>> {
        self.cursor_at_start()?.collect()
    }

    /// Entries with `lo <= key <= hi`, in key order.
    pub fn scan_range(&self, lo: Key, hi: Key) -> Result<Vec<(Key, Value)>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in self.cursor_at(lo)? {
            let (key, value) = entry?;
            if key > hi {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    /// Verifies ordering, separator bounds, equal leaf depth and the sibling
    /// chain. Returns the number of entries. Meant for a quiescent tree.
    pub fn check_invariants(&self) -> Result<usize> {
        let mut walk = InvariantWalk::default();
        self.check_node(ROOT_PAGE_ID, None, None, 0, &mut walk)?;

        for pair in walk.leaves.windows(2) {
            if pair[0].1 != Some(pair[1].0) {
                return Err(StrataError::Corrupted(format!(
                    "leaf {} links to {:?}, expected {}",
                    pair[0].0, pair[0].1, pair[1].0
                )));
            }
        }
        if let Some((last, next)) = walk.leaves.last() {
            if next.is_some() {
                return Err(StrataError::Corrupted(format!(
                    "rightmost leaf {last} has sibling {next:?}"
                )));
            }
        }
        Ok(walk.entries)
    }

    fn check_node(
        &self,
        page_id: PageId,
        lower: Option<Key>,
        upper: Option<Key>,
        depth: usize,
        walk: &mut InvariantWalk,
    ) -> Result<()> {
        let node = ReadNode::fetch(&self.pool, page_id)?.decode()?;
        let in_bounds = |key: Key| lower.map_or(true, |lo| key >= lo) && upper.map_or(true, |hi| key < hi);
        let bad = |what: String| Err(StrataError::Corrupted(format!("page {page_id}: {what}")));

        match node {
            Node::Leaf(leaf) => {
                if leaf.entries.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return bad("leaf keys not strictly ascending".to_string());
                }
                if let Some((key, _)) = leaf.entries.iter().find(|(k, _)| !in_bounds(*k)) {
                    return bad(format!("key {key} outside [{lower:?}, {upper:?})"));
                }
                match walk.leaf_depth {
                    Some(expected) if expected != depth => {
                        return bad(format!("leaf at depth {depth}, expected {expected}"));
                    }
                    _ => walk.leaf_depth = Some(depth),
                }
                walk.entries += leaf.entries.len();
                walk.leaves.push((page_id, leaf.next));
            }
            Node::Internal(inner) => {
                if inner.keys.windows(2).any(|w| w[0] >= w[1]) {
                    return bad("separators not strictly ascending".to_string());
                }
                if let Some(key) = inner.keys.iter().find(|k| !in_bounds(**k)) {
                    return bad(format!("separator {key} outside [{lower:?}, {upper:?})"));
                }
                for (i, child) in inner.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(inner.keys[i - 1]) };
                    let child_upper = inner.keys.get(i).copied().or(upper);
                    self.check_node(*child, child_lower, child_upper, depth + 1, walk)?;
                }
            }
        }
        Ok(())
    }

    /// Human-readable dump of the tree, one node per line.
    pub fn pretty(&self) -> Result<String> {
        let mut out = String::new();
        self.pretty_node(ROOT_PAGE_ID, 0, &mut out)?;
        Ok(out)
    }

    fn pretty_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let node = ReadNode::fetch(&self.pool, page_id)?.decode()?;
        let indent = "  ".repeat(depth);
        match node {
            Node::Internal(inner) => {
                let _ = writeln!(out, "{indent}[{page_id}] internal {:?}", inner.keys);
                for child in inner.children {
                    self.pretty_node(child, depth + 1, out)?;
                }
            }
            Node::Leaf(leaf) => {
                let entries: Vec<String> = leaf
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{k}:{v}"))
                    .collect();
                let _ = write!(out, "{indent}[{page_id}] leaf [{}]", entries.join(", "));
                match leaf.next {
                    Some(next) => {
                        let _ = writeln!(out, " -> {next}");
                    }
                    None => out.push('\n'),
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct InvariantWalk {
    entries: usize,
    leaf_depth: Option<usize>,
    leaves: Vec<(PageId, Option<PageId>)>,
}

fn take_fresh(fresh: &mut Vec<PageGuard>) -> Result<PageGuard> {
    fresh
        .pop()
        .ok_or_else(|| StrataError::Corrupted("split ran out of preallocated pages".to_string()))
}

impl Index for BPlusTree {
    fn find(&self, key: Key) -> Result<Option<Value>> {
        BPlusTree::find(self, key)
    }

    fn insert(&self, key: Key, value: Value) -> Result<()> {
        BPlusTree::insert(self, key, value)
    }

    fn update(&self, key: Key, value: Value) -> Result<Value> {
        BPlusTree::update(self, key, value)
    }

    fn delete(&self, key: Key) -> Result<bool> {
        BPlusTree::delete(self, key)
    }

    fn scan_range(&self, lo: Key, hi: Key) -> Result<Vec<(Key, Value)>> {
        BPlusTree::scan_range(self, lo, hi)
    }
}
