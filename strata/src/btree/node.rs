//! On-page encoding of B+Tree nodes.
//!
//! Layout (big-endian): `u8` tag, `u16` count, then
//! - internal: `count` keys (`i64`) followed by `count + 1` children (`u32`);
//! - leaf: `u32` right sibling (0 = none) followed by `count` `(i64, i64)` pairs.

use bytes::{Buf, BufMut};

use crate::error::{Result, StrataError};
use crate::page::INVALID_PAGE_ID;
use crate::{Key, PageId, Value, PAGE_SIZE};

const TAG_INTERNAL: u8 = 1;
const TAG_LEAF: u8 = 2;

const HEADER_SIZE: usize = 1 + 2;
const LEAF_HEADER_SIZE: usize = HEADER_SIZE + 4;
const LEAF_SLOT_SIZE: usize = 8 + 8;
const KEY_SIZE: usize = 8;
const CHILD_SIZE: usize = 4;

/// Entries that fit in one leaf page.
pub const LEAF_MAX_ENTRIES: usize = (PAGE_SIZE - LEAF_HEADER_SIZE) / LEAF_SLOT_SIZE;
/// Separator keys that fit in one internal page, next to `keys + 1` children.
pub const INTERNAL_MAX_KEYS: usize = (PAGE_SIZE - HEADER_SIZE - CHILD_SIZE) / (KEY_SIZE + CHILD_SIZE);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<Key>,
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Index of the child whose range contains `key`: child `i` covers
    /// `[keys[i-1], keys[i])`.
    pub fn child_index(&self, key: Key) -> usize {
        self.keys.partition_point(|sep| *sep <= key)
    }

    pub fn child_for(&self, key: Key) -> PageId {
        self.children[self.child_index(key)]
    }

    /// Adds the separator and right child produced by splitting a child.
    pub fn insert_child(&mut self, separator: Key, right: PageId) {
        let idx = self.child_index(separator);
        self.keys.insert(idx, separator);
        self.children.insert(idx + 1, right);
    }

    /// Keeps the lower half and returns the promoted key and the upper half.
    /// The promoted key moves up and stays in neither half.
    fn split(&mut self) -> (Key, InternalNode) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let promoted = self.keys.pop().unwrap_or_default();
        let right_children = self.children.split_off(mid + 1);
        (
            promoted,
            InternalNode {
                keys: right_keys,
                children: right_children,
            },
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub entries: Vec<(Key, Value)>,
    pub next: Option<PageId>,
}

impl LeafNode {
    pub fn search(&self, key: Key) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by_key(&key, |(k, _)| *k)
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        self.search(key).ok().map(|idx| self.entries[idx].1)
    }

    /// Position of the first entry with a key `>= key`.
    pub fn lower_bound(&self, key: Key) -> usize {
        self.entries.partition_point(|(k, _)| *k < key)
    }

    /// Upper half moves to a new right sibling that inherits the old sibling link.
    fn split(&mut self, right_id: PageId) -> (Key, LeafNode) {
        let right_entries = self.entries.split_off(self.entries.len() / 2);
        let separator = right_entries.first().map(|(k, _)| *k).unwrap_or_default();
        let right = LeafNode {
            entries: right_entries,
            next: self.next.replace(right_id),
        };
        (separator, right)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf(LeafNode::default())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Keys for an internal node, entries for a leaf.
    pub fn len(&self) -> usize {
        match self {
            Node::Internal(inner) => inner.keys.len(),
            Node::Leaf(leaf) => leaf.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits an overflowing node. `self` keeps the lower half; the returned
    /// node belongs on page `right_id` and the key is the separator for the parent.
    pub fn split(&mut self, right_id: PageId) -> (Key, Node) {
        match self {
            Node::Internal(inner) => {
                let (promoted, right) = inner.split();
                (promoted, Node::Internal(right))
            }
            Node::Leaf(leaf) => {
                let (separator, right) = leaf.split(right_id);
                (separator, Node::Leaf(right))
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Node> {
        let mut buf = data;
        if buf.remaining() < HEADER_SIZE {
            return Err(StrataError::Corrupted("node header truncated".to_string()));
        }
        let tag = buf.get_u8();
        let count = buf.get_u16() as usize;
        match tag {
            TAG_INTERNAL => {
                if count > INTERNAL_MAX_KEYS {
                    return Err(StrataError::Corrupted(format!(
                        "internal node claims {count} keys"
                    )));
                }
                let keys = (0..count).map(|_| buf.get_i64()).collect();
                let children = (0..=count).map(|_| buf.get_u32()).collect();
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            TAG_LEAF => {
                if count > LEAF_MAX_ENTRIES {
                    return Err(StrataError::Corrupted(format!(
                        "leaf node claims {count} entries"
                    )));
                }
                let next = match buf.get_u32() {
                    INVALID_PAGE_ID => None,
                    page_id => Some(page_id),
                };
                let entries = (0..count).map(|_| (buf.get_i64(), buf.get_i64())).collect();
                Ok(Node::Leaf(LeafNode { entries, next }))
            }
            other => Err(StrataError::Corrupted(format!("unknown node tag {other}"))),
        }
    }

    pub fn encode(&self, data: &mut [u8]) -> Result<()> {
        data.fill(0);
        let mut buf = data;
        match self {
            Node::Internal(inner) => {
                if inner.keys.len() > INTERNAL_MAX_KEYS
                    || inner.children.len() != inner.keys.len() + 1
                {
                    return Err(StrataError::Corrupted(format!(
                        "cannot encode internal node with {} keys and {} children",
                        inner.keys.len(),
                        inner.children.len()
                    )));
                }
                buf.put_u8(TAG_INTERNAL);
                buf.put_u16(inner.keys.len() as u16);
                for key in &inner.keys {
                    buf.put_i64(*key);
                }
                for child in &inner.children {
                    buf.put_u32(*child);
                }
            }
            Node::Leaf(leaf) => {
                if leaf.entries.len() > LEAF_MAX_ENTRIES {
                    return Err(StrataError::Corrupted(format!(
                        "cannot encode leaf with {} entries",
                        leaf.entries.len()
                    )));
                }
                buf.put_u8(TAG_LEAF);
                buf.put_u16(leaf.entries.len() as u16);
                buf.put_u32(leaf.next.unwrap_or(INVALID_PAGE_ID));
                for (key, value) in &leaf.entries {
                    buf.put_i64(*key);
                    buf.put_i64(*value);
                }
            }
        }
        Ok(())
    }
}
