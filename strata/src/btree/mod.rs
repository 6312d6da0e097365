//! B+Tree index with latch crabbing. Nodes split but never merge.
mod cursor;
pub mod node;
mod tree;

pub use cursor::Cursor;
pub use node::{Node, INTERNAL_MAX_KEYS, LEAF_MAX_ENTRIES};
pub use tree::{BPlusTree, TreeOptions, ROOT_PAGE_ID};
