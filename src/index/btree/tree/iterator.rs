use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::codec::deserialize_node;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{LeafNode, Node};
use crate::storage::buffer::BufferPoolManager;
use super::base::BPlusTree;

/// Forward iterator over `(key, rid)` pairs in key order. The iterator owns
/// a pin and a shared latch on its current leaf; both are released before
/// the next leaf is latched (so it never holds two page latches) and on
/// drop. Each leaf reflects its state at the moment it is latched.
pub struct TreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<LeafPosition<K>>,
}

struct LeafPosition<K> {
    leaf_id: PageId,
    _guard: PageReadGuard,
    leaf: LeafNode<K>,
    index: usize,
}

impl<K> TreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        start: Option<(PageId, PageReadGuard, LeafNode<K>, usize)>,
    ) -> Self {
        Self {
            buffer_pool,
            position: start.map(|(leaf_id, guard, leaf, index)| LeafPosition {
                leaf_id,
                _guard: guard,
                leaf,
                index,
            }),
        }
    }

    /// Drop the latch and pin on the current leaf
    fn release_current(&mut self) {
        if let Some(position) = self.position.take() {
            let leaf_id = position.leaf_id;
            drop(position);
            if let Err(e) = self.buffer_pool.unpin_page(leaf_id, false) {
                warn!("iterator failed to unpin leaf {}: {}", leaf_id, e);
            }
        }
    }

    /// Latch the next leaf in the sibling chain, after the current one has
    /// been released
    fn advance_to(&mut self, next_id: PageId) {
        if next_id == INVALID_PAGE_ID {
            return;
        }
        let ptr = match self.buffer_pool.fetch_page(next_id) {
            Ok(ptr) => ptr,
            Err(e) => {
                warn!("iterator failed to fetch leaf {}: {}", next_id, e);
                return;
            }
        };
        let guard = ptr.read_arc();
        match deserialize_node::<K>(&guard) {
            Ok(Node::Leaf(leaf)) => {
                self.position = Some(LeafPosition {
                    leaf_id: next_id,
                    _guard: guard,
                    leaf,
                    index: 0,
                });
            }
            Ok(Node::Internal(_)) | Err(_) => {
                warn!("iterator hit a non-leaf page {} in the sibling chain", next_id);
                drop(guard);
                let _ = self.buffer_pool.unpin_page(next_id, false);
            }
        }
    }
}

impl<K> Iterator for TreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let position = self.position.as_mut()?;
            if position.index < position.leaf.entries.len() {
                let (key, rid) = position.leaf.entries[position.index].clone();
                position.index += 1;
                return Some((key, rid));
            }

            let next_id = position.leaf.next_page_id;
            self.release_current();
            self.advance_to(next_id);
            if self.position.is_none() {
                return None;
            }
        }
    }
}

impl<K> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if let Some(position) = self.position.take() {
            let leaf_id = position.leaf_id;
            drop(position);
            let _ = self.buffer_pool.unpin_page(leaf_id, false);
        }
    }
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate from the smallest key
    pub fn begin(&self) -> Result<TreeIterator<K>, BTreeError> {
        let start = self
            .find_leaf_read(None)?
            .map(|(leaf_id, guard, leaf)| (leaf_id, guard, leaf, 0));
        Ok(TreeIterator::new(Arc::clone(&self.buffer_pool), start))
    }

    /// Iterate from the first key greater than or equal to `key`
    pub fn begin_at(&self, key: &K) -> Result<TreeIterator<K>, BTreeError> {
        let start = self.find_leaf_read(Some(key))?.map(|(leaf_id, guard, leaf)| {
            // First entry >= key; when the whole leaf is smaller the first
            // call to next() rolls over to the sibling
            let index = leaf.entries.partition_point(|(k, _)| k < key);
            (leaf_id, guard, leaf, index)
        });
        Ok(TreeIterator::new(Arc::clone(&self.buffer_pool), start))
    }
}
