use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

const DEFAULT_BUCKET_SIZE: usize = 8;

/// Per-frame bookkeeping, guarded by the pool latch
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolInner {
    page_table: ExtendibleHashTable<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
    meta: Vec<FrameMeta>,
    next_page_id: PageId,
}

/// Fixed-size cache of disk pages. Handles returned by `fetch_page` and
/// `new_page` are pinned; callers unpin them (passing the dirty flag) when
/// done. Frame metadata, the page table, the free list and the replacer are
/// all serialized under one pool latch; page contents sit behind per-frame
/// reader/writer latches that callers hold while reading or writing bytes.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<PagePtr>,
    inner: Mutex<PoolInner>,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        Self::with_bucket_size(pool_size, replacer_k, DEFAULT_BUCKET_SIZE, db_path)
    }

    pub fn with_bucket_size(
        pool_size: usize,
        replacer_k: usize,
        bucket_size: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);

        let mut frames = Vec::with_capacity(pool_size);
        let mut meta = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            frames.push(Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID))));
            meta.push(FrameMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(i as FrameId);
        }

        // Page ids are allocated monotonically and never reused; start the
        // counter past whatever the file already contains. Page 0 is the
        // header page and is never handed out by new_page.
        let next_page_id = disk_manager.num_pages()?.max(1) as PageId;

        Ok(Self {
            pool_size,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: ExtendibleHashTable::new(bucket_size),
                free_list,
                replacer: LruKReplacer::new(pool_size, replacer_k),
                meta,
                next_page_id,
            }),
            disk_manager,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id and pin it into a frame with zeroed data.
    /// Allocation and registration happen atomically under the pool latch,
    /// so the new id cannot race with a concurrent delete.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let inner = &mut *self.inner.lock();
        let frame_id = self.acquire_frame(inner)?;

        let page_id = inner.next_page_id;
        inner.next_page_id += 1;

        {
            let mut page = self.frames[frame_id as usize].write();
            page.reset(page_id);
        }
        self.install_frame(inner, frame_id, page_id);

        Ok((Arc::clone(&self.frames[frame_id as usize]), page_id))
    }

    /// Fetch a page, from the pool if resident or from disk otherwise
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page id".to_string(),
            ));
        }

        let inner = &mut *self.inner.lock();

        if let Some(frame_id) = inner.page_table.get(&page_id) {
            inner.meta[frame_id as usize].pin_count += 1;
            inner.replacer.record_access(frame_id);
            inner.replacer.set_evictable(frame_id, false);
            return Ok(Arc::clone(&self.frames[frame_id as usize]));
        }

        let frame_id = self.acquire_frame(inner)?;
        {
            let mut page = self.frames[frame_id as usize].write();
            page.page_id = page_id;
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page.data) {
                page.reset(INVALID_PAGE_ID);
                inner.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }
        self.install_frame(inner, frame_id, page_id);

        Ok(Arc::clone(&self.frames[frame_id as usize]))
    }

    /// Drop one pin on a page, ORing `is_dirty` into the frame's flag.
    /// The frame becomes evictable when its pin count reaches zero.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let inner = &mut *self.inner.lock();
        let frame_id = inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let meta = &mut inner.meta[frame_id as usize];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        let unpinned = meta.pin_count == 0;

        if unpinned {
            inner.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write a page's contents to disk and clear its dirty flag. The frame
    /// is pinned for the duration so the I/O can run outside the pool latch
    /// without racing an eviction.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = {
            let inner = &mut *self.inner.lock();
            let frame_id = inner
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?;
            inner.meta[frame_id as usize].pin_count += 1;
            inner.replacer.set_evictable(frame_id, false);
            frame_id
        };

        let result = {
            let page = self.frames[frame_id as usize].read();
            self.disk_manager.write_page(page_id, &page.data)
        };

        let inner = &mut *self.inner.lock();
        let meta = &mut inner.meta[frame_id as usize];
        meta.pin_count -= 1;
        if result.is_ok() {
            meta.is_dirty = false;
        }
        let unpinned = meta.pin_count == 0;
        if unpinned {
            inner.replacer.set_evictable(frame_id, true);
        }

        result.map_err(Into::into)
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let resident: Vec<PageId> = {
            let inner = self.inner.lock();
            inner
                .meta
                .iter()
                .filter(|m| m.page_id != INVALID_PAGE_ID)
                .map(|m| m.page_id)
                .collect()
        };
        for page_id in resident {
            match self.flush_page(page_id) {
                Ok(()) => {}
                // Evicted between the snapshot and the flush; already on disk
                Err(BufferPoolError::PageNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and free its frame. Absent pages succeed;
    /// pinned pages fail. The disk page id is not reused.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let inner = &mut *self.inner.lock();
        let frame_id = match inner.page_table.get(&page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(()),
        };

        if inner.meta[frame_id as usize].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        inner.page_table.remove(&page_id);
        inner.replacer.remove(frame_id);
        {
            let mut page = self.frames[frame_id as usize].write();
            page.reset(INVALID_PAGE_ID);
        }
        let meta = &mut inner.meta[frame_id as usize];
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;
        inner.free_list.push_back(frame_id);

        Ok(())
    }

    /// Take a frame from the free list, or evict a victim. Dirty victims
    /// are written back before the frame is reused.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let victim = inner
            .replacer
            .evict()
            .ok_or(BufferPoolError::BufferPoolFull)?;

        let old_page_id = inner.meta[victim as usize].page_id;
        debug_assert_eq!(inner.meta[victim as usize].pin_count, 0);

        if inner.meta[victim as usize].is_dirty {
            trace!("writing back dirty page {} from frame {}", old_page_id, victim);
            // Nobody holds this page's latch: its pin count is zero
            let page = self.frames[victim as usize].read();
            self.disk_manager.write_page(old_page_id, &page.data)?;
        }

        inner.page_table.remove(&old_page_id);
        let meta = &mut inner.meta[victim as usize];
        meta.page_id = INVALID_PAGE_ID;
        meta.is_dirty = false;

        Ok(victim)
    }

    /// Register a freshly loaded page: pinned once, clean, non-evictable
    fn install_frame(&self, inner: &mut PoolInner, frame_id: FrameId, page_id: PageId) {
        let meta = &mut inner.meta[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        inner.page_table.insert(page_id, frame_id);
        inner.replacer.record_access(frame_id);
        inner.replacer.set_evictable(frame_id, false);
    }
}
