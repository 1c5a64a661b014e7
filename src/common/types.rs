use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Page 0 stores the index header records
pub const HEADER_PAGE_ID: PageId = 0;

/// Transaction ID type
pub type TxnId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Table identifier type
pub type TableOid = u32;

/// Record ID: physical position of a tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

/// Page structure: identity plus raw bytes. Pin count and dirty flag live
/// in the buffer pool's frame metadata, under the pool latch.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
        }
    }

    /// Rebind the page to a new identity and zero its contents
    pub fn reset(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.data.fill(0);
    }
}

/// Per-frame content latch
pub type PageLatch = RwLock<Page>;

/// Smart pointer to a latched page
pub type PagePtr = Arc<PageLatch>;

/// Owned shared guard on a page. Owned guards can outlive the fetch call
/// that produced them, which is what latch crabbing and iterators need.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned exclusive guard on a page
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
