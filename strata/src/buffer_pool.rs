//! Manages the buffer pool, a collection of in-memory frames that cache disk pages.
//!
//! Every frame is in exactly one of three places: the free list (never used
//! since startup), the unpinned list (resident, pin count zero, ordered from
//! least to most recently released) or the pinned set. Eviction takes the head
//! of the unpinned list and writes it back first if it is dirty; that is the
//! only implicit write-back. The pool mutex only guards this bookkeeping and is
//! released around every disk access.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{
    Condvar, Mutex, MutexGuard, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::error::{Result, StrataError};
use crate::pager::Pager;
use crate::{Page, PageId};

/// An owned shared latch on a page's content.
pub type ReadLatch = ArcRwLockReadGuard<RawRwLock, Page>;
/// An owned exclusive latch on a page's content.
pub type WriteLatch = ArcRwLockWriteGuard<RawRwLock, Page>;

type FrameId = usize;

const NIL: usize = usize::MAX;

/// A single frame in the buffer pool.
struct Frame {
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
}

/// Doubly linked list of frame ids, threaded through index arrays.
struct LruList {
    prev: Vec<usize>,
    next: Vec<usize>,
    linked: Vec<bool>,
    head: usize,
    tail: usize,
    len: usize,
}

impl LruList {
    fn new(capacity: usize) -> Self {
        Self {
            prev: vec![NIL; capacity],
            next: vec![NIL; capacity],
            linked: vec![false; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    fn push_back(&mut self, id: usize) {
        debug_assert!(!self.linked[id]);
        self.prev[id] = self.tail;
        self.next[id] = NIL;
        if self.tail == NIL {
            self.head = id;
        } else {
            self.next[self.tail] = id;
        }
        self.tail = id;
        self.linked[id] = true;
        self.len += 1;
    }

    fn unlink(&mut self, id: usize) {
        if !self.linked[id] {
            return;
        }
        let (prev, next) = (self.prev[id], self.next[id]);
        if prev == NIL {
            self.head = next;
        } else {
            self.next[prev] = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.prev[next] = prev;
        }
        self.prev[id] = NIL;
        self.next[id] = NIL;
        self.linked[id] = false;
        self.len -= 1;
    }

    fn front(&self) -> Option<usize> {
        (self.head != NIL).then_some(self.head)
    }

    fn next_of(&self, id: usize) -> Option<usize> {
        let next = self.next[id];
        (next != NIL).then_some(next)
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.front(), move |id| self.next_of(*id))
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    meta: Vec<FrameMeta>,
    free: Vec<FrameId>,
    unpinned: LruList,
    pinned: HashSet<FrameId>,
    /// Number of allocated page numbers; the next new page gets this number.
    num_pages: u32,
    /// Evicted pages whose write-back has not finished yet.
    in_flight: HashSet<PageId>,
}

impl PoolState {
    fn pin(&mut self, frame_id: FrameId) {
        let meta = &mut self.meta[frame_id];
        if meta.pin_count == 0 {
            self.unpinned.unlink(frame_id);
            self.pinned.insert(frame_id);
        }
        meta.pin_count += 1;
    }

    fn bind(&mut self, frame_id: FrameId, page_id: PageId) {
        self.meta[frame_id] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
        };
        self.pinned.insert(frame_id);
        self.page_table.insert(page_id, frame_id);
    }
}

/// The buffer pool manager for one page file.
pub struct BufferPool {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    write_back_done: Condvar,
    pager: Mutex<Pager>,
}

/// An RAII pin on a resident page. Dropping it releases the pin.
pub struct PageGuard {
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    fn frame(&self) -> &Frame {
        &self.pool.frames[self.frame_id]
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.frame().page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let latch = self.frame().page.write();
        self.frame().dirty.store(true, Ordering::Release);
        latch
    }

    /// Shared latch that does not borrow the guard. The caller must keep the
    /// guard alive for as long as the latch.
    pub fn read_owned(&self) -> ReadLatch {
        self.frame().page.read_arc()
    }

    /// Exclusive latch that does not borrow the guard; marks the page dirty.
    pub fn write_owned(&self) -> WriteLatch {
        let latch = self.frame().page.write_arc();
        self.frame().dirty.store(true, Ordering::Release);
        latch
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_id);
    }
}

impl BufferPool {
    pub fn new(pager: Pager, num_frames: usize) -> Self {
        let frames = (0..num_frames)
            .map(|_| Frame {
                page: Arc::new(RwLock::new(Page::new(0))),
                dirty: AtomicBool::new(false),
            })
            .collect();
        // Pop order hands out frame 0 first.
        let free = (0..num_frames).rev().collect();
        let num_pages = pager.pages_on_disk();
        Self {
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::new(),
                meta: vec![FrameMeta::default(); num_frames],
                free,
                unpinned: LruList::new(num_frames),
                pinned: HashSet::new(),
                num_pages,
                in_flight: HashSet::new(),
            }),
            write_back_done: Condvar::new(),
            pager: Mutex::new(pager),
        }
    }

    /// Allocates the next page number and returns it pinned, zeroed and dirty.
    pub fn new_page(self: &Arc<Self>) -> Result<PageGuard> {
        let mut state = self.state.lock();
        let (frame_id, mut latch) = self.claim_frame(&mut state)?;
        let page_id = state.num_pages;
        state.num_pages += 1;
        state.bind(frame_id, page_id);
        drop(state);

        latch.reset(page_id);
        self.frames[frame_id].dirty.store(true, Ordering::Release);
        drop(latch);
        trace!("allocated page {} in frame {}", page_id, frame_id);

        Ok(PageGuard {
            pool: Arc::clone(self),
            frame_id,
            page_id,
        })
    }

    /// Pins page `page_id`, reading it from disk if it is not resident.
    pub fn fetch_page(self: &Arc<Self>, page_id: PageId) -> Result<PageGuard> {
        let mut state = self.state.lock();
        if page_id >= state.num_pages {
            return Err(StrataError::InvalidPageNumber {
                page_id,
                num_pages: state.num_pages,
            });
        }

        loop {
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                state.pin(frame_id);
                return Ok(PageGuard {
                    pool: Arc::clone(self),
                    frame_id,
                    page_id,
                });
            }
            if state.in_flight.contains(&page_id) {
                self.write_back_done.wait(&mut state);
                continue;
            }

            let (frame_id, mut latch) = self.claim_frame(&mut state)?;
            // The pool lock may have been released for a write-back.
            if state.page_table.contains_key(&page_id) || state.in_flight.contains(&page_id) {
                drop(latch);
                state.free.push(frame_id);
                continue;
            }
            state.bind(frame_id, page_id);
            drop(state);

            let loaded = self.pager.lock().read_page(page_id, &mut latch);
            self.frames[frame_id].dirty.store(false, Ordering::Release);
            drop(latch);

            if let Err(e) = loaded {
                self.discard(frame_id, page_id);
                return Err(e);
            }
            trace!("loaded page {} into frame {}", page_id, frame_id);
            return Ok(PageGuard {
                pool: Arc::clone(self),
                frame_id,
                page_id,
            });
        }
    }

    /// Takes a frame from the free list, or evicts the least recently released
    /// page. Returns the frame exclusively latched and unreachable from the
    /// page table.
    fn claim_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<(FrameId, WriteLatch)> {
        if let Some(frame_id) = state.free.pop() {
            let latch = self.frames[frame_id].page.write_arc();
            return Ok((frame_id, latch));
        }

        let mut candidate = state.unpinned.front();
        while let Some(frame_id) = candidate {
            candidate = state.unpinned.next_of(frame_id);
            let frame = &self.frames[frame_id];
            let Some(latch) = frame.page.try_write_arc() else {
                continue;
            };

            state.unpinned.unlink(frame_id);
            let Some(old_page) = state.meta[frame_id].page_id.take() else {
                return Ok((frame_id, latch));
            };
            state.page_table.remove(&old_page);

            if frame.dirty.swap(false, Ordering::AcqRel) {
                state.in_flight.insert(old_page);
                let written = MutexGuard::unlocked(state, || self.pager.lock().write_page(&latch));
                state.in_flight.remove(&old_page);
                self.write_back_done.notify_all();

                if let Err(e) = written {
                    frame.dirty.store(true, Ordering::Release);
                    state.meta[frame_id].page_id = Some(old_page);
                    state.page_table.insert(old_page, frame_id);
                    state.unpinned.push_back(frame_id);
                    return Err(e);
                }
                debug!("evicted dirty page {} from frame {}", old_page, frame_id);
            } else {
                trace!("evicted clean page {} from frame {}", old_page, frame_id);
            }
            return Ok((frame_id, latch));
        }

        Err(StrataError::BufferExhausted {
            frames: self.frames.len(),
        })
    }

    /// Undoes a `bind` after a failed load.
    fn discard(&self, frame_id: FrameId, page_id: PageId) {
        let mut state = self.state.lock();
        let meta = &mut state.meta[frame_id];
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            meta.page_id = None;
            state.pinned.remove(&frame_id);
            state.page_table.remove(&page_id);
            state.free.push(frame_id);
        }
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let meta = &mut state.meta[frame_id];
        debug_assert!(meta.pin_count > 0, "unpin of unpinned frame {frame_id}");
        meta.pin_count = meta.pin_count.saturating_sub(1);
        if meta.pin_count == 0 {
            state.pinned.remove(&frame_id);
            state.unpinned.push_back(frame_id);
        }
    }

    /// Writes page `page_id` back if it is resident and dirty.
    pub fn flush_page(self: &Arc<Self>, page_id: PageId) -> Result<()> {
        let frame_id = {
            let mut state = self.state.lock();
            // An evicted page is only on disk once its write-back finishes.
            while state.in_flight.contains(&page_id) {
                self.write_back_done.wait(&mut state);
            }
            match state.page_table.get(&page_id) {
                Some(&frame_id) => {
                    state.pin(frame_id);
                    frame_id
                }
                None => return Ok(()),
            }
        };
        let guard = PageGuard {
            pool: Arc::clone(self),
            frame_id,
            page_id,
        };

        let frame = guard.frame();
        let page = frame.page.read();
        if frame.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.pager.lock().write_page(&page) {
                frame.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flushes every resident page, pinned or not, and syncs the file.
    pub fn flush_all(self: &Arc<Self>) -> Result<()> {
        let resident: Vec<PageId> = self.state.lock().page_table.keys().copied().collect();
        for page_id in resident {
            self.flush_page(page_id)?;
        }
        {
            let mut state = self.state.lock();
            while !state.in_flight.is_empty() {
                self.write_back_done.wait(&mut state);
            }
        }
        self.pager.lock().sync()?;
        debug!("flushed all pages of {:?}", self.pager.lock().path());
        Ok(())
    }

    /// Number of allocated pages, resident or not.
    pub fn num_pages(&self) -> u32 {
        self.state.lock().num_pages
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn unpinned_count(&self) -> usize {
        self.state.lock().unpinned.len
    }

    pub fn pinned_count(&self) -> usize {
        self.state.lock().pinned.len()
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Pin count of a resident page, `None` when not resident.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.meta[frame_id].pin_count)
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .is_some_and(|&frame_id| self.frames[frame_id].dirty.load(Ordering::Acquire))
    }

    /// Resident unpinned pages from next eviction victim to most recently released.
    pub fn eviction_order(&self) -> Vec<PageId> {
        let state = self.state.lock();
        state
            .unpinned
            .iter()
            .filter_map(|frame_id| state.meta[frame_id].page_id)
            .collect()
    }
}
