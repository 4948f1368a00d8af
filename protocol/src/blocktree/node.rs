//! A single indexed block inside the tree arena.
//!
//! Nodes never point at each other directly. Parent and children are stored
//! as [`BlockHash`] handles into the arena owned by
//! [`BlockTree`](super::BlockTree), so there are no ownership cycles and a
//! node can be cloned out of the tree as plain data.

use std::collections::HashMap;

use serde::Serialize;

use super::error::{BlockTreeError, BlockTreeResult};
use crate::storage::{Block, BlockHash, BlockId, BlockStore};

/// Arena of live nodes keyed by hash.
pub(crate) type Nodes = HashMap<BlockHash, Node>;

/// One block's position in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub(crate) hash: BlockHash,
    pub(crate) number: u64,
    pub(crate) depth: u64,
    pub(crate) arrival_time: u64,
    pub(crate) parent: Option<BlockHash>,
    pub(crate) children: Vec<BlockHash>,
}

impl Node {
    /// A detached node with no parent and no children.
    pub(crate) fn new(hash: BlockHash, number: u64, depth: u64, arrival_time: u64) -> Self {
        Self {
            hash,
            number,
            depth,
            arrival_time,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Distance from the current tree root.
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Local arrival time in unix milliseconds.
    pub fn arrival_time(&self) -> u64 {
        self.arrival_time
    }

    /// Parent handle. `None` for the root.
    pub fn parent(&self) -> Option<BlockHash> {
        self.parent
    }

    /// Child handles in insertion order.
    pub fn children(&self) -> &[BlockHash] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Link `child` below this node.
    ///
    /// The caller guarantees `child` is not already linked anywhere.
    pub(crate) fn add_child(&mut self, child: &mut Node) {
        child.parent = Some(self.hash);
        self.children.push(child.hash);
    }

    /// Find `hash` within the subtree rooted at this node.
    ///
    /// Resolves the hash through the arena, then walks parents upward until
    /// this node is met. Hash uniqueness makes this equivalent to a full
    /// depth-first search of the subtree.
    pub(crate) fn get_node<'a>(&self, hash: &BlockHash, nodes: &'a Nodes) -> Option<&'a Node> {
        let found = nodes.get(hash)?;
        let mut current = found;
        loop {
            if current.hash == self.hash {
                return Some(found);
            }
            if current.depth <= self.depth {
                return None;
            }
            current = nodes.get(&current.parent?)?;
        }
    }

    /// First node at height `number` in a pre-order walk of this subtree.
    ///
    /// Children are visited in insertion order, so among forks at the same
    /// height the branch that was linked first wins. Heights never decrease
    /// going down a path, which lets the walk skip any subtree whose root is
    /// already past `number`.
    pub(crate) fn get_node_from_block_number<'a>(
        &'a self,
        number: u64,
        nodes: &'a Nodes,
    ) -> Option<&'a Node> {
        let mut stack: Vec<&Node> = vec![self];
        while let Some(node) = stack.pop() {
            if node.number == number {
                return Some(node);
            }
            if node.number > number {
                continue;
            }
            stack.extend(node.children.iter().rev().filter_map(|h| nodes.get(h)));
        }
        None
    }

    /// Path from this node down to `end`, both inclusive, root side first.
    ///
    /// Walks parent handles up from `end`. Running out of parents (or
    /// climbing above this node's depth) before meeting this node means
    /// `end` is on a different branch.
    pub(crate) fn sub_chain<'a>(
        &'a self,
        end: &'a Node,
        nodes: &'a Nodes,
    ) -> BlockTreeResult<Vec<&'a Node>> {
        let not_descendant = || BlockTreeError::NotDescendant {
            ancestor: self.hash,
            descendant: end.hash,
        };

        let mut path = Vec::with_capacity(end.depth.saturating_sub(self.depth) as usize + 1);
        let mut current = end;
        loop {
            path.push(current);
            if current.hash == self.hash {
                path.reverse();
                return Ok(path);
            }
            if current.depth <= self.depth {
                return Err(not_descendant());
            }
            current = current
                .parent
                .and_then(|p| nodes.get(&p))
                .ok_or_else(not_descendant)?;
        }
    }

    /// Materialize the full block for this node from the store.
    pub fn get_block_from_node(&self, store: &dyn BlockStore) -> BlockTreeResult<Block> {
        load_block(store, &self.hash)
    }
}

/// Hydrate one block by hash, mapping a miss to `NotFound`.
pub(crate) fn load_block(store: &dyn BlockStore, hash: &BlockHash) -> BlockTreeResult<Block> {
    store
        .load_block(hash)
        .map_err(|e| BlockTreeError::Store(e.to_string()))?
        .ok_or(BlockTreeError::NotFound(BlockId::Hash(*hash)))
}
