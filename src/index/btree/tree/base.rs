use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, PageReadGuard, PageWriteGuard, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::codec::{deserialize_node, serialize_node};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header::HeaderPage;
use crate::index::btree::node::{InternalNode, LeafNode, Node};
use crate::storage::buffer::BufferPoolManager;

/// A write descent retains this per ancestor that might still be touched by
/// a split or merge: the exclusive page latch, the decoded node and the
/// child slot the descent took.
pub(crate) struct Ancestor<K> {
    pub page_id: PageId,
    pub guard: PageWriteGuard,
    pub node: InternalNode<K>,
    pub child_pos: usize,
}

pub(crate) struct WritePath<'a, K> {
    /// Held iff no node on the path was safe, i.e. the root may change
    pub root_guard: Option<RwLockWriteGuard<'a, PageId>>,
    /// Unsafe ancestors, outermost first
    pub ancestors: Vec<Ancestor<K>>,
    pub leaf_id: PageId,
    pub leaf_guard: PageWriteGuard,
    pub leaf: LeafNode<K>,
}

pub(crate) enum WriteDescent<'a, K> {
    /// The tree has no root; the caller still holds the root latch
    Empty(RwLockWriteGuard<'a, PageId>),
    Path(WritePath<'a, K>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Insert,
    Remove,
}

/// B+ tree index over the buffer pool: an ordered `K → Rid` map with unique
/// keys and forward iteration. The root page id is guarded by a tree-level
/// latch and persisted in the header page under the index name; traversal
/// uses latch crabbing on the per-page reader/writer latches.
pub struct BPlusTree<K> {
    pub(crate) name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) root_latch: RwLock<PageId>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    pub(crate) _phantom: PhantomData<fn() -> K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Open the index named `name`, adopting its recorded root from the
    /// header page if one exists
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 2, "leaf max size too small");
        assert!(internal_max_size >= 3, "internal max size too small");
        let name = name.into();

        let header_ptr = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let (root_page_id, dirtied) = {
            let mut guard = header_ptr.write();
            let mut header = HeaderPage::load(&guard)?;
            match header.get_record(&name) {
                Some(root) => (root, false),
                None => {
                    header.insert_record(&name, INVALID_PAGE_ID);
                    header.save(&mut guard)?;
                    (INVALID_PAGE_ID, true)
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, dirtied)?;

        Ok(Self {
            name,
            buffer_pool,
            root_latch: RwLock::new(root_page_id),
            leaf_max_size,
            internal_max_size,
            _phantom: PhantomData,
        })
    }

    /// Current root page id, for debugging
    pub fn root_page_id(&self) -> PageId {
        *self.root_latch.read()
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            None => Ok(None),
            Some((leaf_id, guard, leaf)) => {
                let value = leaf.lookup(key);
                drop(guard);
                self.buffer_pool.unpin_page(leaf_id, false)?;
                Ok(value)
            }
        }
    }

    /// Shared-latch descent to the leaf covering `key`, or to the leftmost
    /// leaf when no key is given. Returns None on an empty tree. The caller
    /// owns a pin and a read latch on the returned leaf.
    pub(crate) fn find_leaf_read(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageId, PageReadGuard, LeafNode<K>)>, BTreeError> {
        let root_guard = self.root_latch.read();
        let mut page_id = *root_guard;
        if page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let ptr = self.buffer_pool.fetch_page(page_id)?;
        let mut guard = ptr.read_arc();
        drop(root_guard);

        loop {
            let node: Node<K> = match deserialize_node(&guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.buffer_pool.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            match node {
                Node::Leaf(leaf) => return Ok(Some((page_id, guard, leaf))),
                Node::Internal(internal) => {
                    let child_id = match key {
                        Some(key) => internal.child_at(internal.child_index(key)),
                        None => internal.child_at(0),
                    };
                    let child_ptr = match self.buffer_pool.fetch_page(child_id) {
                        Ok(ptr) => ptr,
                        Err(e) => {
                            drop(guard);
                            let _ = self.buffer_pool.unpin_page(page_id, false);
                            return Err(e.into());
                        }
                    };
                    // Latch the child before releasing the parent
                    let child_guard = child_ptr.read_arc();
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false)?;
                    page_id = child_id;
                    guard = child_guard;
                }
            }
        }
    }

    /// Exclusive-latch descent for a structural operation. Ancestor latches
    /// (and the root latch) are dropped as soon as a node is safe for the
    /// operation, so only the subtree that can still change stays locked.
    pub(crate) fn crab_to_leaf_write(
        &self,
        key: &K,
        op: WriteOp,
    ) -> Result<WriteDescent<'_, K>, BTreeError> {
        let root_guard = self.root_latch.write();
        let first_page_id = *root_guard;
        if first_page_id == INVALID_PAGE_ID {
            return Ok(WriteDescent::Empty(root_guard));
        }

        let mut root_guard = Some(root_guard);
        let mut ancestors: Vec<Ancestor<K>> = Vec::new();
        let mut page_id = first_page_id;
        let ptr = self.buffer_pool.fetch_page(page_id)?;
        let mut guard = ptr.write_arc();

        loop {
            let node: Node<K> = match deserialize_node(&guard) {
                Ok(node) => node,
                Err(e) => {
                    drop(guard);
                    let _ = self.buffer_pool.unpin_page(page_id, false);
                    self.abandon_ancestors(&mut ancestors);
                    return Err(e);
                }
            };

            if self.is_write_safe(&node, op) {
                root_guard = None;
                self.release_ancestors(&mut ancestors)?;
            }

            match node {
                Node::Leaf(leaf) => {
                    return Ok(WriteDescent::Path(WritePath {
                        root_guard,
                        ancestors,
                        leaf_id: page_id,
                        leaf_guard: guard,
                        leaf,
                    }));
                }
                Node::Internal(internal) => {
                    let child_pos = internal.child_index(key);
                    let child_id = internal.child_at(child_pos);
                    let child_ptr = match self.buffer_pool.fetch_page(child_id) {
                        Ok(ptr) => ptr,
                        Err(e) => {
                            drop(guard);
                            let _ = self.buffer_pool.unpin_page(page_id, false);
                            self.abandon_ancestors(&mut ancestors);
                            return Err(e.into());
                        }
                    };
                    let child_guard = child_ptr.write_arc();
                    ancestors.push(Ancestor {
                        page_id,
                        guard,
                        node: internal,
                        child_pos,
                    });
                    page_id = child_id;
                    guard = child_guard;
                }
            }
        }
    }

    /// A node is safe when the operation cannot propagate past it
    fn is_write_safe(&self, node: &Node<K>, op: WriteOp) -> bool {
        match op {
            WriteOp::Insert => match node {
                Node::Leaf(leaf) => leaf.size() < leaf.max_size - 1,
                Node::Internal(internal) => internal.size() < internal.max_size,
            },
            WriteOp::Remove => match node {
                Node::Leaf(leaf) => {
                    let min = if leaf.parent_page_id == INVALID_PAGE_ID {
                        1
                    } else {
                        leaf.min_size()
                    };
                    leaf.size() > min
                }
                Node::Internal(internal) => {
                    let min = if internal.parent_page_id == INVALID_PAGE_ID {
                        2
                    } else {
                        internal.min_size()
                    };
                    internal.size() > min
                }
            },
        }
    }

    /// Drop ancestor latches and pins without writing anything back
    pub(crate) fn release_ancestors(
        &self,
        ancestors: &mut Vec<Ancestor<K>>,
    ) -> Result<(), BTreeError> {
        for ancestor in ancestors.drain(..) {
            drop(ancestor.guard);
            self.buffer_pool.unpin_page(ancestor.page_id, false)?;
        }
        Ok(())
    }

    /// Error-path variant of release_ancestors that swallows unpin failures
    fn abandon_ancestors(&self, ancestors: &mut Vec<Ancestor<K>>) {
        for ancestor in ancestors.drain(..) {
            drop(ancestor.guard);
            let _ = self.buffer_pool.unpin_page(ancestor.page_id, false);
        }
    }

    /// Rewrite a child's parent pointer through the buffer pool
    pub(crate) fn set_parent(&self, child_id: PageId, parent_id: PageId) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = ptr.write();
            let mut node: Node<K> = deserialize_node(&guard)?;
            match &mut node {
                Node::Leaf(leaf) => leaf.parent_page_id = parent_id,
                Node::Internal(internal) => internal.parent_page_id = parent_id,
            }
            serialize_node(&node, &mut guard)?;
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }

    /// Persist a root change into the header page record for this index
    pub(crate) fn update_header_root(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = ptr.write();
            let mut header = HeaderPage::load(&guard)?;
            if !header.update_record(&self.name, root_page_id) {
                header.insert_record(&self.name, root_page_id);
            }
            header.save(&mut guard)?;
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }
}
