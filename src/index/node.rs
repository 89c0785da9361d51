//! Arena-indexed nodes for the monotonic B+ tree.
//!
//! Parent pointers and child/sibling links form a cyclic reference graph
//! once splits start happening, so nodes are never linked by raw or
//! owning pointers. Instead every node lives in one growable arena
//! (`Vec<Node<V>>`) owned by the tree, and all cross-node references are
//! [`NodeId`] indices into that arena -- `Copy`, trivially comparable,
//! and never dangling for the life of the tree (there is no delete).

/// An index into a tree's node arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId(pub(crate) u32);

pub(crate) enum Data<V> {
    Leaf {
        keys: Vec<u64>,
        values: Vec<V>,
        /// Linked-list pointer to the next leaf, mirroring the original
        /// design's use of a leaf's final data slot to chain leaves.
        next: Option<NodeId>,
    },
    Internal {
        keys: Vec<u64>,
        /// Always `keys.len() + 1` entries.
        children: Vec<NodeId>,
    },
}

pub(crate) struct Node<V> {
    pub(crate) parent: Option<NodeId>,
    pub(crate) data: Data<V>,
}

impl<V> Node<V> {
    pub(crate) fn new_leaf(parent: Option<NodeId>) -> Self {
        Node {
            parent,
            data: Data::Leaf {
                keys: Vec::new(),
                values: Vec::new(),
                next: None,
            },
        }
    }

    pub(crate) fn new_internal(parent: Option<NodeId>) -> Self {
        Node {
            parent,
            data: Data::Internal {
                keys: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    pub(crate) fn size(&self) -> usize {
        match &self.data {
            Data::Leaf { keys, .. } => keys.len(),
            Data::Internal { keys, .. } => keys.len(),
        }
    }

    pub(crate) fn first_key(&self) -> u64 {
        match &self.data {
            Data::Leaf { keys, .. } => keys[0],
            Data::Internal { keys, .. } => keys[0],
        }
    }
}
