//! The Pager reads and writes whole pages at `page_id * PAGE_SIZE`.
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::Result;
use crate::{Page, PageId, PAGE_SIZE};

/// Raw page file I/O. Only the buffer pool talks to a pager.
pub struct Pager {
    file: File,
    path: PathBuf,
    pages_on_disk: u32,
}

impl Pager {
    /// Opens the page file, creating it and its parent directories if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_size = file.metadata()?.len();
        let pages_on_disk = (file_size / PAGE_SIZE as u64) as u32;
        debug!(
            "opened page file {:?}: {} bytes, {} pages",
            path, file_size, pages_on_disk
        );

        Ok(Self {
            file,
            path: path.to_path_buf(),
            pages_on_disk,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently stored in the file.
    pub fn pages_on_disk(&self) -> u32 {
        self.pages_on_disk
    }

    /// Reads page `page_id` into `page`. A page that was allocated but never
    /// written back reads as zeroes.
    pub fn read_page(&mut self, page_id: PageId, page: &mut Page) -> Result<()> {
        page.reset(page_id);
        if page_id >= self.pages_on_disk {
            trace!("page {} is past the end of {:?}", page_id, self.path);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(page.file_offset()))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            let n = self.file.read(&mut page.data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        trace!("read page {} ({} bytes)", page_id, filled);
        Ok(())
    }

    /// Writes a page at its offset. Durability requires a later [`Pager::sync`].
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        self.file.seek(SeekFrom::Start(page.file_offset()))?;
        self.file.write_all(&page.data)?;
        if page.id >= self.pages_on_disk {
            self.pages_on_disk = page.id + 1;
        }
        trace!("wrote page {} to {:?}", page.id, self.path);
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
