use log::debug;
use parking_lot::RwLockWriteGuard;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid};
use crate::index::btree::codec::serialize_node;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{InternalNode, LeafNode, Node, Side};
use super::base::{Ancestor, BPlusTree, WriteDescent, WriteOp, WritePath};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/value pair; false if the key already exists
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        match self.crab_to_leaf_write(&key, WriteOp::Insert)? {
            WriteDescent::Empty(root_guard) => self.start_new_tree(root_guard, key, rid),
            WriteDescent::Path(path) => self.insert_into_leaf(path, key, rid),
        }
    }

    /// First insert into an empty tree: the new leaf becomes the root
    fn start_new_tree(
        &self,
        mut root_guard: RwLockWriteGuard<'_, PageId>,
        key: K,
        rid: Rid,
    ) -> Result<bool, BTreeError> {
        let (ptr, page_id) = self.buffer_pool.new_page()?;
        let mut leaf = LeafNode::new(page_id, self.leaf_max_size);
        leaf.insert(key, rid);
        {
            let mut guard = ptr.write();
            serialize_node(&Node::Leaf(leaf), &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;

        *root_guard = page_id;
        self.update_header_root(page_id)?;
        debug!("index {}: created root leaf {}", self.name, page_id);
        Ok(true)
    }

    fn insert_into_leaf(
        &self,
        path: WritePath<'_, K>,
        key: K,
        rid: Rid,
    ) -> Result<bool, BTreeError> {
        let WritePath {
            root_guard,
            mut ancestors,
            leaf_id,
            mut leaf_guard,
            mut leaf,
        } = path;

        if !leaf.insert(key, rid) {
            // Duplicate key: nothing changed
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(false);
        }

        if leaf.size() < self.leaf_max_size {
            serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(true);
        }

        // The leaf transiently reached max_size: split and propagate. Every
        // node the split can touch is still latched in `ancestors`.
        let (sibling_ptr, sibling_id) = self.buffer_pool.new_page()?;
        let mut sibling = LeafNode::new(sibling_id, self.leaf_max_size);
        leaf.move_half_to(&mut sibling, Side::Right);
        sibling.next_page_id = leaf.next_page_id;
        sibling.parent_page_id = leaf.parent_page_id;
        leaf.next_page_id = sibling_id;

        let separator = sibling.first_key().clone();
        let leaf_low = leaf.first_key().clone();

        {
            let mut guard = sibling_ptr.write();
            serialize_node(&Node::Leaf(sibling), &mut guard)?;
        }
        self.buffer_pool.unpin_page(sibling_id, true)?;

        serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
        drop(leaf_guard);
        self.buffer_pool.unpin_page(leaf_id, true)?;

        self.insert_into_parent(root_guard, ancestors, leaf_id, leaf_low, separator, sibling_id)?;
        Ok(true)
    }

    /// Record a split in the parent: `separator` bounds the fresh right
    /// sibling `right_id`. Splits cascade up the retained ancestors; if the
    /// stack runs out the root itself split and a new root is installed.
    fn insert_into_parent(
        &self,
        root_guard: Option<RwLockWriteGuard<'_, PageId>>,
        mut ancestors: Vec<Ancestor<K>>,
        left_id: PageId,
        left_low: K,
        separator: K,
        right_id: PageId,
    ) -> Result<(), BTreeError> {
        let Some(Ancestor {
            page_id: parent_id,
            guard: mut parent_guard,
            node: mut parent,
            ..
        }) = ancestors.pop()
        else {
            // `left_id` was the root; grow the tree by one level
            let mut root_guard = root_guard.expect("root latch retained across a root split");
            let (ptr, new_root_id) = self.buffer_pool.new_page()?;
            let mut root = InternalNode::new(new_root_id, self.internal_max_size);
            root.entries.push((left_low, left_id));
            root.entries.push((separator, right_id));
            {
                let mut guard = ptr.write();
                serialize_node(&Node::Internal(root), &mut guard)?;
            }
            self.buffer_pool.unpin_page(new_root_id, true)?;

            self.set_parent(left_id, new_root_id)?;
            self.set_parent(right_id, new_root_id)?;
            *root_guard = new_root_id;
            self.update_header_root(new_root_id)?;
            debug!("index {}: root split, new root {}", self.name, new_root_id);
            return Ok(());
        };

        let inserted = parent.insert(separator, right_id);
        debug_assert!(inserted, "separator already present in parent");
        self.set_parent(right_id, parent_id)?;

        if parent.size() <= self.internal_max_size {
            serialize_node(&Node::Internal(parent), &mut parent_guard)?;
            drop(parent_guard);
            self.buffer_pool.unpin_page(parent_id, true)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(());
        }

        // Parent overflowed in turn
        let (sibling_ptr, sibling_id) = self.buffer_pool.new_page()?;
        let mut sibling = InternalNode::new(sibling_id, self.internal_max_size);
        let moved = parent.move_half_to(&mut sibling, Side::Right);
        sibling.parent_page_id = parent.parent_page_id;

        let promoted = sibling.key_at(0).clone();
        let parent_low = parent.key_at(0).clone();

        {
            let mut guard = sibling_ptr.write();
            serialize_node(&Node::Internal(sibling), &mut guard)?;
        }
        for child in moved {
            self.set_parent(child, sibling_id)?;
        }
        self.buffer_pool.unpin_page(sibling_id, true)?;

        serialize_node(&Node::Internal(parent), &mut parent_guard)?;
        drop(parent_guard);
        self.buffer_pool.unpin_page(parent_id, true)?;

        self.insert_into_parent(root_guard, ancestors, parent_id, parent_low, promoted, sibling_id)
    }
}
