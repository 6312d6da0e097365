use std::sync::Arc;

use super::node::{LeafNode, Node};
use super::tree::ReadNode;
use crate::buffer_pool::BufferPool;
use crate::error::{Result, StrataError};
use crate::{Key, Value};

/// Forward iterator over leaf entries in key order.
///
/// Holds a shared latch on the current leaf; moving to the right sibling
/// latches the sibling before the current leaf is released. Writers to that
/// leaf block until the cursor moves on or is dropped, so a thread must not
/// mutate the tree while it holds a cursor.
pub struct Cursor {
    pool: Arc<BufferPool>,
    current: Option<(ReadNode, LeafNode)>,
    position: usize,
}

impl Cursor {
    pub(crate) fn new(pool: Arc<BufferPool>, latched: ReadNode, leaf: LeafNode, position: usize) -> Self {
        Self {
            pool,
            current: Some((latched, leaf)),
            position,
        }
    }

    fn advance_leaf(&mut self, next_id: crate::PageId) -> Result<()> {
        let latched = ReadNode::fetch(&self.pool, next_id)?;
        let Node::Leaf(leaf) = latched.decode()? else {
            return Err(StrataError::Corrupted(format!(
                "sibling link points at internal page {next_id}"
            )));
        };
        self.current = Some((latched, leaf));
        self.position = 0;
        Ok(())
    }
}

impl Iterator for Cursor {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (_, leaf) = self.current.as_ref()?;
            if let Some(entry) = leaf.entries.get(self.position) {
                self.position += 1;
                return Some(Ok(*entry));
            }
            // Empty leaves left behind by deletes are skipped here.
            let Some(next_id) = leaf.next else {
                self.current = None;
                return None;
            };
            if let Err(e) = self.advance_leaf(next_id) {
                self.current = None;
                return Some(Err(e));
            }
        }
    }
}
