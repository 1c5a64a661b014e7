use log::debug;
use parking_lot::RwLockWriteGuard;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, PageWriteGuard, INVALID_PAGE_ID};
use crate::index::btree::codec::{deserialize_node, serialize_node};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{InternalNode, LeafNode, Node, Side};
use super::base::{Ancestor, BPlusTree, WriteDescent, WriteOp, WritePath};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key; false if it was not present
    pub fn remove(&self, key: &K) -> Result<bool, BTreeError> {
        match self.crab_to_leaf_write(key, WriteOp::Remove)? {
            WriteDescent::Empty(_) => Ok(false),
            WriteDescent::Path(path) => self.remove_from_leaf(path, key),
        }
    }

    fn remove_from_leaf(&self, path: WritePath<'_, K>, key: &K) -> Result<bool, BTreeError> {
        let WritePath {
            root_guard,
            mut ancestors,
            leaf_id,
            mut leaf_guard,
            mut leaf,
        } = path;

        if !leaf.remove(key) {
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, false)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(false);
        }

        if leaf.parent_page_id == INVALID_PAGE_ID {
            // Root leaf: never redistributes; an emptied root unroots the tree
            if leaf.entries.is_empty() {
                let mut root_guard =
                    root_guard.expect("root latch retained when the root may empty");
                *root_guard = INVALID_PAGE_ID;
                self.update_header_root(INVALID_PAGE_ID)?;
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                let _ = self.buffer_pool.delete_page(leaf_id);
                debug!("index {}: last key removed, tree is empty", self.name);
            } else {
                serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                drop(root_guard);
            }
            return Ok(true);
        }

        if leaf.size() >= leaf.min_size() {
            serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(true);
        }

        self.fix_leaf_underflow(root_guard, ancestors, leaf_id, leaf_guard, leaf)?;
        Ok(true)
    }

    /// Repair an underflowed leaf by borrowing from or merging with the
    /// sibling chosen by the parent's separator position
    fn fix_leaf_underflow(
        &self,
        root_guard: Option<RwLockWriteGuard<'_, PageId>>,
        mut ancestors: Vec<Ancestor<K>>,
        leaf_id: PageId,
        mut leaf_guard: PageWriteGuard,
        mut leaf: LeafNode<K>,
    ) -> Result<(), BTreeError> {
        let Ancestor {
            page_id: parent_id,
            guard: mut parent_guard,
            node: mut parent,
            child_pos: pos,
        } = ancestors.pop().expect("underflowed non-root leaf has a retained parent");

        if pos > 0 {
            // Left sibling
            let sibling_id = parent.child_at(pos - 1);
            let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_ptr.write_arc();
            let mut sibling = match deserialize_node::<K>(&sibling_guard)? {
                Node::Leaf(leaf) => leaf,
                Node::Internal(_) => return Err(BTreeError::InvalidPageFormat),
            };

            if sibling.size() + leaf.size() >= 2 * leaf.min_size() {
                sibling.move_half_to(&mut leaf, Side::Right);
                parent.set_key_at(pos, leaf.first_key().clone());

                serialize_node(&Node::Leaf(sibling), &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                serialize_node(&Node::Internal(parent), &mut parent_guard)?;
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                self.release_ancestors(&mut ancestors)?;
                drop(root_guard);
                return Ok(());
            }

            // Merge the leaf into its left sibling
            let separator = parent.key_at(pos).clone();
            leaf.move_all_to(&mut sibling);
            sibling.next_page_id = leaf.next_page_id;
            let removed = parent.remove(&separator);
            debug_assert!(removed, "separator missing from parent");

            serialize_node(&Node::Leaf(sibling), &mut sibling_guard)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            // A racing iterator may still pin the dead page; ids are never
            // reused, so skipping the delete is harmless
            let _ = self.buffer_pool.delete_page(leaf_id);

            self.fix_parent_after_merge(root_guard, ancestors, parent_id, parent_guard, parent)
        } else {
            // Leftmost child: use the right sibling
            let sibling_id = parent.child_at(pos + 1);
            let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_ptr.write_arc();
            let mut sibling = match deserialize_node::<K>(&sibling_guard)? {
                Node::Leaf(leaf) => leaf,
                Node::Internal(_) => return Err(BTreeError::InvalidPageFormat),
            };

            if sibling.size() + leaf.size() >= 2 * leaf.min_size() {
                sibling.move_half_to(&mut leaf, Side::Left);
                parent.set_key_at(pos + 1, sibling.first_key().clone());

                serialize_node(&Node::Leaf(sibling), &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
                drop(leaf_guard);
                self.buffer_pool.unpin_page(leaf_id, true)?;
                serialize_node(&Node::Internal(parent), &mut parent_guard)?;
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                self.release_ancestors(&mut ancestors)?;
                drop(root_guard);
                return Ok(());
            }

            // Merge the right sibling into this leaf
            let separator = parent.key_at(pos + 1).clone();
            sibling.move_all_to(&mut leaf);
            leaf.next_page_id = sibling.next_page_id;
            let removed = parent.remove(&separator);
            debug_assert!(removed, "separator missing from parent");

            serialize_node(&Node::Leaf(leaf), &mut leaf_guard)?;
            drop(leaf_guard);
            self.buffer_pool.unpin_page(leaf_id, true)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            let _ = self.buffer_pool.delete_page(sibling_id);

            self.fix_parent_after_merge(root_guard, ancestors, parent_id, parent_guard, parent)
        }
    }

    /// A merge removed one separator from `node`. Shrink the root, stop, or
    /// keep repairing upward.
    fn fix_parent_after_merge(
        &self,
        root_guard: Option<RwLockWriteGuard<'_, PageId>>,
        mut ancestors: Vec<Ancestor<K>>,
        node_id: PageId,
        mut node_guard: PageWriteGuard,
        node: InternalNode<K>,
    ) -> Result<(), BTreeError> {
        if node.parent_page_id == INVALID_PAGE_ID {
            if node.size() == 1 {
                // Root internal down to one child: that child is the new root
                let child_id = node.child_at(0);
                let mut root_guard =
                    root_guard.expect("root latch retained when the root may collapse");
                self.set_parent(child_id, INVALID_PAGE_ID)?;
                *root_guard = child_id;
                self.update_header_root(child_id)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                let _ = self.buffer_pool.delete_page(node_id);
                debug!("index {}: root collapsed to {}", self.name, child_id);
            } else {
                serialize_node(&Node::Internal(node), &mut node_guard)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                drop(root_guard);
            }
            return Ok(());
        }

        if node.size() >= node.min_size() {
            serialize_node(&Node::Internal(node), &mut node_guard)?;
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            self.release_ancestors(&mut ancestors)?;
            drop(root_guard);
            return Ok(());
        }

        self.fix_internal_underflow(root_guard, ancestors, node_id, node_guard, node)
    }

    /// Internal-node counterpart of `fix_leaf_underflow`; reseated children
    /// get their parent pointers rewritten
    fn fix_internal_underflow(
        &self,
        root_guard: Option<RwLockWriteGuard<'_, PageId>>,
        mut ancestors: Vec<Ancestor<K>>,
        node_id: PageId,
        mut node_guard: PageWriteGuard,
        mut node: InternalNode<K>,
    ) -> Result<(), BTreeError> {
        let Ancestor {
            page_id: parent_id,
            guard: mut parent_guard,
            node: mut parent,
            child_pos: pos,
        } = ancestors.pop().expect("underflowed non-root node has a retained parent");

        if pos > 0 {
            let sibling_id = parent.child_at(pos - 1);
            let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_ptr.write_arc();
            let mut sibling = match deserialize_node::<K>(&sibling_guard)? {
                Node::Internal(node) => node,
                Node::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };

            if sibling.size() + node.size() >= 2 * node.min_size() {
                let moved = sibling.move_half_to(&mut node, Side::Right);
                parent.set_key_at(pos, node.key_at(0).clone());
                for child in &moved {
                    self.set_parent(*child, node_id)?;
                }

                serialize_node(&Node::Internal(sibling), &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                serialize_node(&Node::Internal(node), &mut node_guard)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                serialize_node(&Node::Internal(parent), &mut parent_guard)?;
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                self.release_ancestors(&mut ancestors)?;
                drop(root_guard);
                return Ok(());
            }

            let separator = parent.key_at(pos).clone();
            let moved = node.move_all_to(&mut sibling);
            let removed = parent.remove(&separator);
            debug_assert!(removed, "separator missing from parent");
            for child in &moved {
                self.set_parent(*child, sibling_id)?;
            }

            serialize_node(&Node::Internal(sibling), &mut sibling_guard)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            let _ = self.buffer_pool.delete_page(node_id);

            self.fix_parent_after_merge(root_guard, ancestors, parent_id, parent_guard, parent)
        } else {
            let sibling_id = parent.child_at(pos + 1);
            let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_ptr.write_arc();
            let mut sibling = match deserialize_node::<K>(&sibling_guard)? {
                Node::Internal(node) => node,
                Node::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };

            if sibling.size() + node.size() >= 2 * node.min_size() {
                let moved = sibling.move_half_to(&mut node, Side::Left);
                parent.set_key_at(pos + 1, sibling.key_at(0).clone());
                for child in &moved {
                    self.set_parent(*child, node_id)?;
                }

                serialize_node(&Node::Internal(sibling), &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                serialize_node(&Node::Internal(node), &mut node_guard)?;
                drop(node_guard);
                self.buffer_pool.unpin_page(node_id, true)?;
                serialize_node(&Node::Internal(parent), &mut parent_guard)?;
                drop(parent_guard);
                self.buffer_pool.unpin_page(parent_id, true)?;
                self.release_ancestors(&mut ancestors)?;
                drop(root_guard);
                return Ok(());
            }

            let separator = parent.key_at(pos + 1).clone();
            let moved = sibling.move_all_to(&mut node);
            let removed = parent.remove(&separator);
            debug_assert!(removed, "separator missing from parent");
            for child in &moved {
                self.set_parent(*child, node_id)?;
            }

            serialize_node(&Node::Internal(node), &mut node_guard)?;
            drop(node_guard);
            self.buffer_pool.unpin_page(node_id, true)?;
            drop(sibling_guard);
            self.buffer_pool.unpin_page(sibling_id, true)?;
            let _ = self.buffer_pool.delete_page(sibling_id);

            self.fix_parent_after_merge(root_guard, ancestors, parent_id, parent_guard, parent)
        }
    }
}
