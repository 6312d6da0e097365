//! The in-memory image of a disk page.
use std::fmt;

use crate::{PageId, PAGE_SIZE};

/// Page 0 always holds the B+Tree root, so no other node can point at it as a
/// sibling; it doubles as the "no page" marker in node links.
pub const INVALID_PAGE_ID: PageId = 0;

/// A page is a fixed-size block of data that is read from and written to disk.
#[derive(Clone)]
pub struct Page {
    pub id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// Creates a zeroed page.
    pub fn new(id: PageId) -> Self {
        Page {
            id,
            data: [0; PAGE_SIZE],
        }
    }

    /// Rebinds the page to `id` and zeroes its contents.
    pub fn reset(&mut self, id: PageId) {
        self.id = id;
        self.data.fill(0);
    }

    /// Byte offset of this page inside its file.
    pub fn file_offset(&self) -> u64 {
        self.id as u64 * PAGE_SIZE as u64
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("tag", &self.data[0])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_zeroes_data() {
        let mut page = Page::new(3);
        page.data[10] = 0xAB;
        page.reset(9);
        assert_eq!(page.id, 9);
        assert!(page.data.iter().all(|b| *b == 0));
        assert_eq!(page.file_offset(), 9 * PAGE_SIZE as u64);
    }
}
