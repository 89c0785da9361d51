//! A monotonic, append-only B+ tree: an ordered map from strictly
//! increasing `u64` keys to small `Copy` values.
//!
//! # Design
//!
//! Unlike a conventional B+ tree, a full leaf is never split by moving
//! half its keys to a new sibling. Because keys only ever increase,
//! every insert either lands in the rightmost ("last") leaf or, once
//! that leaf is full, starts a brand new rightmost leaf with nothing but
//! the new key in it. This trades a little extra tree depth for never
//! having to shuffle existing entries: each leaf fills to capacity
//! exactly once and is never touched again. Internal nodes still split
//! the conventional way (move the upper half of keys/children to a new
//! sibling, propagate the midpoint key upward), since no monotonicity
//! is available to exploit there.
//!
//! There is one writer at a time and any number of concurrent readers,
//! enforced by [`lock::LockWord`], a non-blocking exclusive|shared gate.
//! No entry is ever deleted or updated, which is what makes representing
//! the tree as a single growable node arena ([`node::NodeId`] indices
//! instead of pointers) sound: an id is valid for the life of the tree.

mod lock;
mod node;

use std::cell::UnsafeCell;

use crate::error::{Error, Result};
use lock::LockWord;
use node::{Data, Node, NodeId};

struct Inner<V> {
    nodes: Vec<Node<V>>,
    root: NodeId,
    last_leaf: NodeId,
}

/// A monotonic B+ tree keyed by `u64`. `V` is typically a small `Copy`
/// handle (an index into the caller's own segment table), never the
/// segment itself.
pub struct MonotonicIndex<V> {
    branch_factor: usize,
    lock: LockWord,
    inner: UnsafeCell<Inner<V>>,
}

// SAFETY: all access to `inner` is gated by `lock`, which admits either
// one writer or any number of readers, never both.
unsafe impl<V: Send> Send for MonotonicIndex<V> {}
unsafe impl<V: Send> Sync for MonotonicIndex<V> {}

impl<V: Copy> MonotonicIndex<V> {
    pub fn new(branch_factor: usize) -> Self {
        assert!(branch_factor >= 3, "branch factor must be at least 3");
        let root = Node::new_leaf(None);
        Self {
            branch_factor,
            lock: LockWord::new(),
            inner: UnsafeCell::new(Inner {
                nodes: vec![root],
                root: NodeId(0),
                last_leaf: NodeId(0),
            }),
        }
    }

    fn node_full(&self, inner: &Inner<V>, id: NodeId) -> bool {
        inner.nodes[id.0 as usize].size() >= self.branch_factor - 1
    }

    fn alloc(inner: &mut Inner<V>, node: Node<V>) -> NodeId {
        inner.nodes.push(node);
        NodeId((inner.nodes.len() - 1) as u32)
    }

    /// Appends `(key, value)`. `key` must be strictly greater than every
    /// key already in the tree.
    pub fn append(&self, key: u64, value: V) -> Result<()> {
        let _guard = self.lock.try_acquire_write()?;
        // SAFETY: the write guard proves exclusive access to `inner`.
        let inner = unsafe { &mut *self.inner.get() };
        self.try_append(inner, key, value)
    }

    fn try_append(&self, inner: &mut Inner<V>, key: u64, value: V) -> Result<()> {
        let leaf_id = inner.last_leaf;

        if let Data::Leaf { keys, .. } = &inner.nodes[leaf_id.0 as usize].data {
            if let Some(&last) = keys.last() {
                if key <= last {
                    return Err(Error::IndexNotMonotonic);
                }
            }
        }

        if !self.node_full(inner, leaf_id) {
            if let Data::Leaf { keys, values, .. } = &mut inner.nodes[leaf_id.0 as usize].data {
                keys.push(key);
                values.push(value);
            }
            return Ok(());
        }

        let existing_parent = inner.nodes[leaf_id.0 as usize].parent;
        let (parent_id, created_root) = match existing_parent {
            Some(p) => (p, false),
            None => {
                let new_root = Self::alloc(inner, Node::new_internal(None));
                inner.nodes[leaf_id.0 as usize].parent = Some(new_root);
                (new_root, true)
            }
        };

        let new_leaf_id = Self::alloc(inner, Node::new_leaf(Some(parent_id)));
        if let Data::Leaf { next, .. } = &mut inner.nodes[leaf_id.0 as usize].data {
            *next = Some(new_leaf_id);
        }
        if let Data::Leaf { keys, values, .. } = &mut inner.nodes[new_leaf_id.0 as usize].data {
            keys.push(key);
            values.push(value);
        }

        if created_root {
            if let Data::Internal { keys, children } = &mut inner.nodes[parent_id.0 as usize].data
            {
                children.push(leaf_id);
                keys.push(key);
                children.push(new_leaf_id);
            }
            inner.root = parent_id;
            inner.last_leaf = new_leaf_id;
            return Ok(());
        }

        let root = self.append_leaf(inner, leaf_id, new_leaf_id)?;
        inner.root = root;
        inner.last_leaf = new_leaf_id;
        Ok(())
    }

    /// Links `new_leaf` into the tree as the successor of `old_leaf`,
    /// splitting internal nodes upward as needed. `old_leaf`'s parent is
    /// read before `last_leaf` is reassigned by the caller.
    fn append_leaf(&self, inner: &mut Inner<V>, old_leaf: NodeId, new_leaf: NodeId) -> Result<NodeId> {
        let parent_id = inner.nodes[old_leaf.0 as usize]
            .parent
            .expect("leaf being split always has a parent by this point");
        let separator = inner.nodes[new_leaf.0 as usize].first_key();
        self.append_node(inner, separator, parent_id, new_leaf)
    }

    /// Inserts `(key, child)` into `parent`, splitting `parent` (and
    /// recursively its own parent) if it is full.
    fn append_node(
        &self,
        inner: &mut Inner<V>,
        key: u64,
        parent_id: NodeId,
        child: NodeId,
    ) -> Result<NodeId> {
        if !self.node_full(inner, parent_id) {
            if let Data::Internal { keys, children } = &mut inner.nodes[parent_id.0 as usize].data
            {
                keys.push(key);
                children.push(child);
            }
            return Ok(inner.root);
        }

        if inner.nodes[parent_id.0 as usize].parent.is_none() {
            self.split_root(inner, parent_id, key, child)
        } else {
            self.split_node(inner, parent_id, key, child)
        }
    }

    /// Splits `node_id`, a full non-root internal node, moving its upper
    /// half into a new sibling and propagating the separator key into
    /// `node_id`'s own parent (splitting further up if needed).
    fn split_node(
        &self,
        inner: &mut Inner<V>,
        node_id: NodeId,
        key: u64,
        child: NodeId,
    ) -> Result<NodeId> {
        let grandparent = inner.nodes[node_id.0 as usize]
            .parent
            .expect("split_node is only called on non-root nodes");
        let new_sibling = Self::alloc(inner, Node::new_internal(Some(grandparent)));
        let mid_key = self.move_half_node(inner, node_id, new_sibling);

        if let Data::Internal { keys, children } = &mut inner.nodes[new_sibling.0 as usize].data {
            keys.push(key);
            children.push(child);
        }
        inner.nodes[child.0 as usize].parent = Some(new_sibling);

        self.append_node(inner, mid_key, grandparent, new_sibling)
    }

    fn wrap_new_root(
        &self,
        inner: &mut Inner<V>,
        left: NodeId,
        key: u64,
        right: NodeId,
    ) -> Result<NodeId> {
        let new_root = Self::alloc(inner, Node::new_internal(None));
        inner.nodes[left.0 as usize].parent = Some(new_root);
        inner.nodes[right.0 as usize].parent = Some(new_root);
        if let Data::Internal { keys, children } = &mut inner.nodes[new_root.0 as usize].data {
            children.push(left);
            keys.push(key);
            children.push(right);
        }
        inner.root = new_root;
        Ok(new_root)
    }

    fn split_root(
        &self,
        inner: &mut Inner<V>,
        root_id: NodeId,
        key: u64,
        child: NodeId,
    ) -> Result<NodeId> {
        let new_sibling = Self::alloc(inner, Node::new_internal(None));
        let mid_key = self.move_half_node(inner, root_id, new_sibling);

        if let Data::Internal { keys, children } = &mut inner.nodes[new_sibling.0 as usize].data {
            keys.push(key);
            children.push(child);
        }
        inner.nodes[child.0 as usize].parent = Some(new_sibling);

        self.wrap_new_root(inner, root_id, mid_key, new_sibling)
    }

    /// Moves the upper half of `lhs`'s keys and children to `rhs`
    /// (internal nodes only; leaves never redistribute). Returns the
    /// separator key that propagates to the parent.
    fn move_half_node(&self, inner: &mut Inner<V>, lhs: NodeId, rhs: NodeId) -> u64 {
        let mid = self.branch_factor >> 1;
        let (mid_key, moved_keys, moved_children) = {
            let lhs_node = &mut inner.nodes[lhs.0 as usize];
            match &mut lhs_node.data {
                Data::Internal { keys, children } => {
                    let mid_key = keys[mid];
                    let moved_keys = keys.split_off(mid + 1);
                    keys.truncate(mid);
                    let moved_children = children.split_off(mid + 1);
                    (mid_key, moved_keys, moved_children)
                }
                Data::Leaf { .. } => unreachable!("only internal nodes redistribute on split"),
            }
        };
        for &child in &moved_children {
            inner.nodes[child.0 as usize].parent = Some(rhs);
        }
        if let Data::Internal { keys, children } = &mut inner.nodes[rhs.0 as usize].data {
            *keys = moved_keys;
            *children = moved_children;
        }
        mid_key
    }

    fn find_leaf(inner: &Inner<V>, key: u64) -> NodeId {
        let mut current = inner.root;
        loop {
            let node = &inner.nodes[current.0 as usize];
            match &node.data {
                Data::Leaf { .. } => return current,
                Data::Internal { keys, children } => {
                    let mut next = *children.last().unwrap();
                    for (i, &k) in keys.iter().enumerate() {
                        if key < k {
                            next = children[i];
                            break;
                        }
                    }
                    current = next;
                }
            }
        }
    }

    /// The greatest key `<= key` and its value, or `None` if every key
    /// in the tree is greater than `key` (or the tree is empty).
    pub fn floor(&self, key: u64) -> Result<Option<(u64, V)>> {
        let _guard = self.lock.try_acquire_read()?;
        // SAFETY: the read guard excludes any concurrent writer.
        let inner = unsafe { &*self.inner.get() };
        let leaf_id = Self::find_leaf(inner, key);
        let leaf = &inner.nodes[leaf_id.0 as usize];
        let Data::Leaf { keys, values, .. } = &leaf.data else {
            unreachable!("find_leaf always returns a leaf");
        };
        let mut found = None;
        for (i, &k) in keys.iter().enumerate() {
            if k <= key {
                found = Some((k, values[i]));
            } else {
                break;
            }
        }
        Ok(found)
    }

    /// The greatest key in the tree and its value.
    pub fn last(&self) -> Result<Option<(u64, V)>> {
        let _guard = self.lock.try_acquire_read()?;
        // SAFETY: the read guard excludes any concurrent writer.
        let inner = unsafe { &*self.inner.get() };
        let leaf = &inner.nodes[inner.last_leaf.0 as usize];
        let Data::Leaf { keys, values, .. } = &leaf.data else {
            unreachable!("last_leaf is always a leaf");
        };
        Ok(keys.last().copied().zip(values.last().copied()))
    }

    /// Every `(key, value)` pair in ascending key order. Walks the leaf
    /// linked list under a single read acquisition.
    pub fn entries(&self) -> Result<Vec<(u64, V)>> {
        let _guard = self.lock.try_acquire_read()?;
        // SAFETY: the read guard excludes any concurrent writer.
        let inner = unsafe { &*self.inner.get() };
        let mut out = Vec::new();
        let mut current = Some(Self::find_leaf(inner, 0));
        while let Some(id) = current {
            let Data::Leaf { keys, values, next } = &inner.nodes[id.0 as usize].data else {
                unreachable!("leaf linked list only ever points at leaves");
            };
            for (k, v) in keys.iter().zip(values.iter()) {
                out.push((*k, *v));
            }
            current = *next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_monotonic_key() {
        let tree = MonotonicIndex::<u64>::new(3);
        tree.append(5, 50).unwrap();
        tree.append(10, 100).unwrap();
        let err = tree.append(8, 80).unwrap_err();
        assert!(matches!(err, Error::IndexNotMonotonic));
        // the tree is unchanged
        assert_eq!(tree.last().unwrap(), Some((10, 100)));
    }

    #[test]
    fn floor_and_last_after_many_splits() {
        let tree = MonotonicIndex::<u64>::new(3);
        for key in [1u64, 2, 5, 6, 10, 12, 15, 20, 22] {
            tree.append(key, key * 10).unwrap();
        }
        assert_eq!(tree.floor(0).unwrap(), None);
        assert_eq!(tree.floor(1).unwrap(), Some((1, 10)));
        assert_eq!(tree.floor(4).unwrap(), Some((2, 20)));
        assert_eq!(tree.floor(22).unwrap(), Some((22, 220)));
        assert_eq!(tree.floor(1000).unwrap(), Some((22, 220)));
        assert_eq!(tree.last().unwrap(), Some((22, 220)));

        // inserting a non-monotonic key after the splits is still rejected
        assert!(matches!(
            tree.append(8, 0),
            Err(Error::IndexNotMonotonic)
        ));
    }

    #[test]
    fn entries_enumerates_every_key_in_order() {
        let tree = MonotonicIndex::<u64>::new(3);
        let keys = [1u64, 2, 5, 6, 10, 12, 15, 20, 22];
        for key in keys {
            tree.append(key, key).unwrap();
        }
        let collected: Vec<u64> = tree.entries().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(collected, keys.to_vec());
    }

    #[test]
    fn single_leaf_does_not_split() {
        let tree = MonotonicIndex::<u32>::new(7);
        for key in 0..5u64 {
            tree.append(key, key as u32).unwrap();
        }
        assert_eq!(tree.entries().unwrap().len(), 5);
    }

    #[test]
    fn writer_lock_excludes_concurrent_append() {
        let tree = MonotonicIndex::<u64>::new(3);
        tree.append(1, 1).unwrap();
        // a read guard taken out manually should make a concurrent
        // append report IndexLocked rather than block.
        let guard = tree.lock.try_acquire_read().unwrap();
        assert!(matches!(tree.append(2, 2), Err(Error::IndexLocked)));
        drop(guard);
        assert!(tree.append(2, 2).is_ok());
    }
}
