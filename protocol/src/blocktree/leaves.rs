//! The set of current chain tips.
//!
//! A hash is in the [`LeafMap`] exactly when its node has no children. The
//! map holds handles only; the nodes themselves stay in the tree arena.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::node::{Node, Nodes};
use crate::storage::BlockHash;

/// What an insertion did to the tip set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafUpdate {
    /// The parent was a tip and the new block replaced it.
    Extended,
    /// The parent already had children; the new block opened a fork.
    Forked,
}

/// Tip hashes of the tree.
#[derive(Debug, Clone, Default)]
pub struct LeafMap {
    leaves: HashSet<BlockHash>,
}

impl LeafMap {
    /// A leaf set holding only `root`.
    pub(crate) fn new(root: BlockHash) -> Self {
        let mut leaves = HashSet::new();
        leaves.insert(root);
        Self { leaves }
    }

    /// Record that `new_leaf` was just linked below `old_leaf`.
    ///
    /// Called once per successful insertion, after `old_leaf` gained the
    /// child. A parent that was a tip stops being one; a parent that already
    /// had children was not in the set to begin with.
    pub(crate) fn replace(&mut self, old_leaf: &Node, new_leaf: &Node) -> LeafUpdate {
        self.leaves.insert(new_leaf.hash());
        if self.leaves.remove(&old_leaf.hash()) {
            LeafUpdate::Extended
        } else {
            LeafUpdate::Forked
        }
    }

    /// Drop every tip for which `keep` returns false.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&BlockHash) -> bool) {
        self.leaves.retain(|h| keep(h));
    }

    /// The best tip: deepest first, see [`compare_tips`] for ties.
    pub fn deepest_leaf<'a>(&self, nodes: &'a Nodes) -> Option<&'a Node> {
        self.leaves
            .iter()
            .filter_map(|h| nodes.get(h))
            .max_by(|a, b| compare_tips(a, b))
    }

    /// All tips, best first.
    pub fn sorted<'a>(&self, nodes: &'a Nodes) -> Vec<&'a Node> {
        let mut tips: Vec<&Node> = self.leaves.iter().filter_map(|h| nodes.get(h)).collect();
        tips.sort_by(|a, b| compare_tips(b, a));
        tips
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.leaves.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &BlockHash> {
        self.leaves.iter()
    }
}

/// Total order over tips, `Greater` meaning "better".
///
/// Greater depth wins. Equal depth goes to the block that arrived earlier,
/// and equal arrival to the numerically lower hash. Hashes are unique, so
/// two distinct tips never compare equal.
pub fn compare_tips(a: &Node, b: &Node) -> Ordering {
    a.depth()
        .cmp(&b.depth())
        .then_with(|| b.arrival_time().cmp(&a.arrival_time()))
        .then_with(|| b.hash().cmp(&a.hash()))
}
