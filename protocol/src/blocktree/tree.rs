//! The block tree aggregate.
//!
//! Owns the node arena, the leaf set and the finalization log. All
//! selection and path queries live here; the [`Node`] and [`LeafMap`]
//! helpers only ever see the arena through a shared borrow.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info};

use super::error::{BlockTreeError, BlockTreeResult};
use super::leaves::{LeafMap, LeafUpdate};
use super::node::{load_block, Node, Nodes};
use crate::storage::block::now_millis;
use crate::storage::{Block, BlockHash, BlockId, BlockStore};

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Result of [`BlockTree::add_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The block was linked into the tree.
    Imported(LeafUpdate),
    /// The hash was already indexed; nothing changed.
    AlreadyKnown,
}

/// One entry in the finalization log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedCheckpoint {
    pub hash: BlockHash,
    pub number: u64,
    /// Wall clock (unix ms) when finality was recorded.
    pub finalized_at: u64,
}

/// Compact view of a node for diagnostics and the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub hash: BlockHash,
    pub number: u64,
    pub depth: u64,
    pub arrival_time: u64,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            hash: node.hash(),
            number: node.number(),
            depth: node.depth(),
            arrival_time: node.arrival_time(),
        }
    }
}

/// Point-in-time summary of the whole tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeSnapshot {
    pub root: NodeSummary,
    pub best: NodeSummary,
    pub node_count: usize,
    /// Tips, best first.
    pub leaves: Vec<NodeSummary>,
    pub last_finalized: Option<FinalizedCheckpoint>,
}

// ---------------------------------------------------------------------------
// BlockTree
// ---------------------------------------------------------------------------

/// In-memory index of every known, unpruned block header.
///
/// Rooted at genesis until the first finalization, then at the most recently
/// finalized block. Nodes are addressed by hash; `nodes` doubles as the
/// hash index, so lookups by hash are constant time.
#[derive(Debug, Clone)]
pub struct BlockTree {
    nodes: Nodes,
    root: BlockHash,
    leaves: LeafMap,
    finalized_blocks: Vec<FinalizedCheckpoint>,
    /// Arrival time of genesis. Slots are counted from here even after the
    /// root moves.
    slot_origin: u64,
}

impl BlockTree {
    /// Build a tree holding only `genesis`, at depth 0.
    pub fn new_from_genesis(genesis: &Block) -> Self {
        let root = Node::new(genesis.hash(), genesis.number(), 0, genesis.arrival_time);
        let hash = root.hash();
        let mut nodes = HashMap::new();
        nodes.insert(hash, root);

        Self {
            nodes,
            root: hash,
            leaves: LeafMap::new(hash),
            finalized_blocks: Vec::new(),
            slot_origin: genesis.arrival_time,
        }
    }

    // -- Mutation -----------------------------------------------------------

    /// Index `block` under its parent.
    ///
    /// Re-adding a known hash is a no-op. The parent must already be in the
    /// tree; out-of-order delivery has to be buffered by the caller.
    pub fn add_block(&mut self, block: &Block) -> BlockTreeResult<ImportOutcome> {
        let hash = block.hash();
        if self.nodes.contains_key(&hash) {
            debug!(hash = %hash, number = block.number(), "block already in tree");
            return Ok(ImportOutcome::AlreadyKnown);
        }

        let parent_hash = block.parent_hash();
        let parent = self
            .nodes
            .get_mut(&parent_hash)
            .ok_or(BlockTreeError::ParentNotFound {
                parent: parent_hash,
            })?;

        if block.number() < parent.number() {
            return Err(BlockTreeError::InvalidBlockNumber {
                parent_number: parent.number(),
                got: block.number(),
            });
        }

        let mut node = Node::new(hash, block.number(), parent.depth() + 1, block.arrival_time);
        parent.add_child(&mut node);
        let update = self.leaves.replace(parent, &node);

        debug!(
            hash = %hash,
            number = node.number(),
            depth = node.depth(),
            update = ?update,
            "block added to tree"
        );
        self.nodes.insert(hash, node);
        Ok(ImportOutcome::Imported(update))
    }

    /// Mark `hash` final and prune everything that is not below it.
    ///
    /// The finalized block becomes the new root at depth 0; every sibling
    /// branch and every former ancestor is dropped, and so are their tips.
    /// Returns the number of pruned nodes. Finalizing the current root again
    /// is a no-op.
    pub fn finalize(&mut self, hash: &BlockHash) -> BlockTreeResult<usize> {
        self.finalize_pruned(hash).map(|pruned| pruned.len())
    }

    /// [`finalize`](Self::finalize), returning the hashes that were pruned.
    pub fn finalize_pruned(&mut self, hash: &BlockHash) -> BlockTreeResult<Vec<BlockHash>> {
        let node = self
            .nodes
            .get(hash)
            .ok_or(BlockTreeError::NotFound(BlockId::Hash(*hash)))?;
        let number = node.number();
        let depth_offset = node.depth();

        if *hash == self.root && self.last_finalized().map(|c| c.hash) == Some(*hash) {
            return Ok(Vec::new());
        }

        let keep = self.subtree_hashes(hash);
        let pruned: Vec<BlockHash> = self
            .nodes
            .keys()
            .filter(|h| !keep.contains(*h))
            .copied()
            .collect();
        self.nodes.retain(|h, _| keep.contains(h));
        for node in self.nodes.values_mut() {
            node.depth -= depth_offset;
        }
        if let Some(new_root) = self.nodes.get_mut(hash) {
            new_root.parent = None;
        }
        let nodes = &self.nodes;
        self.leaves.retain(|h| nodes.contains_key(h));
        self.root = *hash;

        self.finalized_blocks.push(FinalizedCheckpoint {
            hash: *hash,
            number,
            finalized_at: now_millis(),
        });

        info!(
            hash = %hash,
            number,
            pruned = pruned.len(),
            remaining = self.nodes.len(),
            "block finalized"
        );
        Ok(pruned)
    }

    fn subtree_hashes(&self, from: &BlockHash) -> HashSet<BlockHash> {
        let mut keep = HashSet::new();
        let mut stack = vec![*from];
        while let Some(h) = stack.pop() {
            if let Some(node) = self.nodes.get(&h) {
                stack.extend(node.children().iter().copied());
            }
            keep.insert(h);
        }
        keep
    }

    // -- Lookup -------------------------------------------------------------

    /// Node for `hash`, if indexed.
    pub fn get_node(&self, hash: &BlockHash) -> Option<&Node> {
        self.root_node().get_node(hash, &self.nodes)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    /// The current root (genesis or last finalized block).
    pub fn root_node(&self) -> &Node {
        &self.nodes[&self.root]
    }

    /// Number of indexed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root is never removed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaf_map(&self) -> &LeafMap {
        &self.leaves
    }

    /// All tips, best first.
    pub fn leaves(&self) -> Vec<&Node> {
        self.leaves.sorted(&self.nodes)
    }

    /// Node at height `number`.
    ///
    /// Forks can put several nodes at one height. The node on the current
    /// best chain wins; if the best chain has nothing at that height, the
    /// first match of a pre-order walk from the root (children in insertion
    /// order) is returned.
    pub fn get_node_from_block_number(&self, number: u64) -> Option<&Node> {
        self.longest_path()
            .into_iter()
            .find(|n| n.number() == number)
            .or_else(|| self.root_node().get_node_from_block_number(number, &self.nodes))
    }

    /// Full block at height `number`, same tie-break as
    /// [`get_node_from_block_number`](Self::get_node_from_block_number).
    pub fn get_block_from_block_number(
        &self,
        number: u64,
        store: &dyn BlockStore,
    ) -> BlockTreeResult<Block> {
        self.get_node_from_block_number(number)
            .ok_or(BlockTreeError::NotFound(BlockId::Number(number)))?
            .get_block_from_node(store)
    }

    // -- Paths and selection ------------------------------------------------

    /// The best tip.
    pub fn deepest_leaf(&self) -> &Node {
        self.leaves
            .deepest_leaf(&self.nodes)
            .unwrap_or_else(|| self.root_node())
    }

    /// Full block for the best tip.
    pub fn deepest_block(&self, store: &dyn BlockStore) -> BlockTreeResult<Block> {
        self.deepest_leaf().get_block_from_node(store)
    }

    /// Root to best tip, inclusive. Always `deepest_leaf().depth() + 1` long.
    pub fn longest_path(&self) -> Vec<&Node> {
        let mut path = Vec::with_capacity(self.deepest_leaf().depth() as usize + 1);
        let mut current = Some(self.deepest_leaf());
        while let Some(node) = current {
            path.push(node);
            current = node.parent().and_then(|p| self.nodes.get(&p));
        }
        path.reverse();
        path
    }

    /// Path from `start` down to `end`, both inclusive.
    pub fn sub_chain(&self, start: &BlockHash, end: &BlockHash) -> BlockTreeResult<Vec<&Node>> {
        let start_node = self
            .nodes
            .get(start)
            .ok_or(BlockTreeError::NotFound(BlockId::Hash(*start)))?;
        let end_node = self
            .nodes
            .get(end)
            .ok_or(BlockTreeError::NotFound(BlockId::Hash(*end)))?;
        start_node.sub_chain(end_node, &self.nodes)
    }

    /// [`sub_chain`](Self::sub_chain) with endpoints resolved by height.
    pub fn sub_chain_by_number(&self, start: u64, end: u64) -> BlockTreeResult<Vec<&Node>> {
        let start_node = self
            .get_node_from_block_number(start)
            .ok_or(BlockTreeError::NotFound(BlockId::Number(start)))?;
        let end_node = self
            .get_node_from_block_number(end)
            .ok_or(BlockTreeError::NotFound(BlockId::Number(end)))?;
        start_node.sub_chain(end_node, &self.nodes)
    }

    /// Full blocks from height `start` to `end`, inclusive.
    pub fn sub_blockchain(
        &self,
        start: u64,
        end: u64,
        store: &dyn BlockStore,
    ) -> BlockTreeResult<Vec<Block>> {
        self.sub_chain_by_number(start, end)?
            .into_iter()
            .map(|node| node.get_block_from_node(store))
            .collect()
    }

    // -- Slots --------------------------------------------------------------

    /// Slots elapsed between genesis arrival and `block`'s arrival.
    ///
    /// Counts how many `slot_duration` steps it takes to reach or pass the
    /// block's arrival time, so a block arriving mid-slot is attributed to
    /// the slot that ends after it: origin 1000, duration 6, arrival 1019
    /// gives 4, not 3. A block arriving at or before genesis is slot 0.
    ///
    /// The origin is always genesis arrival, never the current root: after
    /// [`finalize`](Self::finalize) moves the root, slot numbers keep
    /// counting from genesis instead of restarting at the new root.
    pub fn compute_slot_for_block(&self, block: &Block, slot_duration: u64) -> BlockTreeResult<u64> {
        compute_slot(self.slot_origin, block.arrival_time, slot_duration)
    }

    pub fn slot_origin(&self) -> u64 {
        self.slot_origin
    }

    // -- Finality -----------------------------------------------------------

    /// Finalization log, oldest first.
    pub fn finalized_blocks(&self) -> &[FinalizedCheckpoint] {
        &self.finalized_blocks
    }

    pub fn last_finalized(&self) -> Option<&FinalizedCheckpoint> {
        self.finalized_blocks.last()
    }

    // -- Diagnostics --------------------------------------------------------

    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root: self.root_node().into(),
            best: self.deepest_leaf().into(),
            node_count: self.nodes.len(),
            leaves: self.leaves().into_iter().map(NodeSummary::from).collect(),
            last_finalized: self.last_finalized().cloned(),
        }
    }

    /// Verify the structural invariants: the root is parentless at depth 0,
    /// every child sits one level below a parent that lists it, and the leaf
    /// set is exactly the childless nodes.
    pub fn check_invariants(&self) -> Result<(), String> {
        let root = self
            .nodes
            .get(&self.root)
            .ok_or_else(|| format!("root {} missing from arena", self.root))?;
        if root.parent().is_some() || root.depth() != 0 {
            return Err(format!("root {} has a parent or nonzero depth", root.hash()));
        }

        for node in self.nodes.values() {
            if let Some(parent_hash) = node.parent() {
                let parent = self
                    .nodes
                    .get(&parent_hash)
                    .ok_or_else(|| format!("{} has dangling parent", node.hash()))?;
                if node.depth() != parent.depth() + 1 {
                    return Err(format!("{} depth does not follow its parent", node.hash()));
                }
                if node.number() < parent.number() {
                    return Err(format!("{} numbered below its parent", node.hash()));
                }
                if !parent.children().contains(&node.hash()) {
                    return Err(format!("{} missing from its parent's children", node.hash()));
                }
            } else if node.hash() != self.root {
                return Err(format!("{} is a second parentless node", node.hash()));
            }

            if node.is_leaf() != self.leaves.contains(&node.hash()) {
                return Err(format!("leaf set disagrees about {}", node.hash()));
            }
        }

        if self.leaves.hashes().any(|h| !self.nodes.contains_key(h)) {
            return Err("leaf set holds a pruned hash".to_string());
        }
        Ok(())
    }
}

/// Slot count from `origin` to `arrival` in steps of `slot_duration`.
pub fn compute_slot(origin: u64, arrival: u64, slot_duration: u64) -> BlockTreeResult<u64> {
    if slot_duration == 0 {
        return Err(BlockTreeError::InvalidSlotDuration);
    }
    Ok(arrival.saturating_sub(origin).div_ceil(slot_duration))
}

impl fmt::Display for BlockTree {
    /// Human-readable dump: the tip line, then an indented tree.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tips: Vec<String> = self.leaves().iter().map(|n| n.hash().to_string()).collect();
        writeln!(f, "Leaves: {}", tips.join(" "))?;

        let root = self.root_node();
        writeln!(f, "{}", describe(root))?;

        // (node, prefix for its children, is last sibling)
        let mut stack: Vec<(&Node, String, bool)> = Vec::new();
        push_children(&mut stack, root, String::new(), &self.nodes);
        while let Some((node, prefix, last)) = stack.pop() {
            let branch = if last { "└── " } else { "├── " };
            writeln!(f, "{}{}{}", prefix, branch, describe(node))?;
            let child_prefix = format!("{}{}", prefix, if last { "    " } else { "│   " });
            push_children(&mut stack, node, child_prefix, &self.nodes);
        }
        Ok(())
    }
}

fn describe(node: &Node) -> String {
    format!(
        "#{} 0x{} (depth {}, arrived {})",
        node.number(),
        node.hash().short(),
        node.depth(),
        node.arrival_time()
    )
}

fn push_children<'a>(
    stack: &mut Vec<(&'a Node, String, bool)>,
    node: &Node,
    prefix: String,
    nodes: &'a Nodes,
) {
    let children: Vec<&Node> = node.children().iter().filter_map(|h| nodes.get(h)).collect();
    let count = children.len();
    for (i, child) in children.into_iter().enumerate().rev() {
        stack.push((child, prefix.clone(), i + 1 == count));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockHeader, ChainDb};

    fn genesis() -> Block {
        Block::genesis([0u8; 32], 1_000)
    }

    /// Child of `parent` with a distinguishing state root and arrival time.
    fn child(parent: &Block, tag: u8, arrival: u64) -> Block {
        let header = BlockHeader::new(
            parent.hash(),
            parent.number() + 1,
            [tag; 32],
            [0u8; 32],
            Vec::new(),
        );
        Block::from_header(header, arrival)
    }

    fn hashes(nodes: &[&Node]) -> Vec<BlockHash> {
        nodes.iter().map(|n| n.hash()).collect()
    }

    /// G -> A -> B, A -> C. B arrives before C.
    fn fork() -> (BlockTree, Block, Block, Block, Block) {
        let g = genesis();
        let a = child(&g, 1, 1_006);
        let b = child(&a, 2, 1_012);
        let c = child(&a, 3, 1_013);
        let mut tree = BlockTree::new_from_genesis(&g);
        for block in [&a, &b, &c] {
            tree.add_block(block).unwrap();
            tree.check_invariants().unwrap();
        }
        (tree, g, a, b, c)
    }

    #[test]
    fn new_tree_has_single_root_leaf() {
        let g = genesis();
        let tree = BlockTree::new_from_genesis(&g);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.root_node().depth(), 0);
        assert_eq!(tree.deepest_leaf().hash(), g.hash());
        assert_eq!(hashes(&tree.longest_path()), vec![g.hash()]);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn depth_follows_parent() {
        let (tree, g, a, b, c) = fork();
        assert_eq!(tree.get_node(&g.hash()).unwrap().depth(), 0);
        assert_eq!(tree.get_node(&a.hash()).unwrap().depth(), 1);
        assert_eq!(tree.get_node(&b.hash()).unwrap().depth(), 2);
        assert_eq!(tree.get_node(&c.hash()).unwrap().depth(), 2);
    }

    #[test]
    fn fork_scenario_leaves_and_longest_path() {
        let (tree, g, a, b, c) = fork();
        let mut tips: Vec<BlockHash> = tree.leaf_map().hashes().copied().collect();
        tips.sort();
        let mut expected = vec![b.hash(), c.hash()];
        expected.sort();
        assert_eq!(tips, expected);

        // B arrived first.
        assert_eq!(hashes(&tree.longest_path()), vec![g.hash(), a.hash(), b.hash()]);
        assert_eq!(
            tree.longest_path().len() as u64,
            tree.deepest_leaf().depth() + 1
        );
    }

    #[test]
    fn tie_break_falls_back_to_hash() {
        let g = genesis();
        let a = child(&g, 1, 1_006);
        let b = child(&g, 2, 1_006);
        let mut tree = BlockTree::new_from_genesis(&g);
        tree.add_block(&b).unwrap();
        tree.add_block(&a).unwrap();
        let expected = a.hash().min(b.hash());
        assert_eq!(tree.deepest_leaf().hash(), expected);
    }

    #[test]
    fn longer_fork_overtakes() {
        let (mut tree, _, _, _, c) = fork();
        let d = child(&c, 4, 1_020);
        assert_eq!(
            tree.add_block(&d).unwrap(),
            ImportOutcome::Imported(LeafUpdate::Extended)
        );
        assert_eq!(tree.deepest_leaf().hash(), d.hash());
        assert_eq!(tree.leaves().len(), 2);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn add_block_reports_fork() {
        let g = genesis();
        let a = child(&g, 1, 1_006);
        let b = child(&g, 2, 1_007);
        let mut tree = BlockTree::new_from_genesis(&g);
        assert_eq!(
            tree.add_block(&a).unwrap(),
            ImportOutcome::Imported(LeafUpdate::Extended)
        );
        assert_eq!(
            tree.add_block(&b).unwrap(),
            ImportOutcome::Imported(LeafUpdate::Forked)
        );
    }

    #[test]
    fn add_block_is_idempotent() {
        let (mut tree, _, _, b, _) = fork();
        let before = tree.to_string();
        let len = tree.len();

        assert_eq!(tree.add_block(&b).unwrap(), ImportOutcome::AlreadyKnown);
        assert_eq!(tree.len(), len);
        assert_eq!(tree.to_string(), before);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn re_adding_genesis_is_a_no_op() {
        let g = genesis();
        let mut tree = BlockTree::new_from_genesis(&g);
        assert_eq!(tree.add_block(&g).unwrap(), ImportOutcome::AlreadyKnown);
    }

    #[test]
    fn missing_parent_leaves_tree_untouched() {
        let (mut tree, _, _, _, _) = fork();
        let other_genesis = Block::genesis([9u8; 32], 0);
        let stranger = child(&other_genesis, 9, 2_000);
        let orphan = child(&stranger, 10, 2_001);
        let len = tree.len();
        let tips = tree.leaf_map().len();

        let err = tree.add_block(&orphan).unwrap_err();
        assert_eq!(
            err,
            BlockTreeError::ParentNotFound {
                parent: stranger.hash()
            }
        );
        assert_eq!(tree.len(), len);
        assert_eq!(tree.leaf_map().len(), tips);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn number_below_parent_is_rejected() {
        let g = genesis();
        let a = child(&g, 1, 1_006);
        let b = child(&a, 2, 1_012);
        let header = BlockHeader::new(b.hash(), 1, [7u8; 32], [0u8; 32], Vec::new());
        let bad = Block::from_header(header, 1_020);

        let mut tree = BlockTree::new_from_genesis(&g);
        tree.add_block(&a).unwrap();
        tree.add_block(&b).unwrap();
        assert_eq!(
            tree.add_block(&bad).unwrap_err(),
            BlockTreeError::InvalidBlockNumber {
                parent_number: 2,
                got: 1
            }
        );
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn equal_numbers_along_a_path_are_allowed() {
        let g = genesis();
        let header = BlockHeader::new(g.hash(), 0, [5u8; 32], [0u8; 32], Vec::new());
        let same = Block::from_header(header, 1_001);
        let mut tree = BlockTree::new_from_genesis(&g);
        tree.add_block(&same).unwrap();
        assert_eq!(tree.get_node(&same.hash()).unwrap().depth(), 1);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn get_node_absent_is_none() {
        let (tree, _, _, _, _) = fork();
        assert!(tree.get_node(&BlockHash([0xEE; 32])).is_none());
    }

    #[test]
    fn sub_chain_between_hashes() {
        let (tree, g, a, b, c) = fork();
        assert_eq!(
            hashes(&tree.sub_chain(&g.hash(), &b.hash()).unwrap()),
            vec![g.hash(), a.hash(), b.hash()]
        );
        assert_eq!(
            tree.sub_chain(&b.hash(), &c.hash()).unwrap_err(),
            BlockTreeError::NotDescendant {
                ancestor: b.hash(),
                descendant: c.hash()
            }
        );
        assert_eq!(
            tree.sub_chain(&BlockHash([1; 32]), &b.hash()).unwrap_err(),
            BlockTreeError::NotFound(BlockId::Hash(BlockHash([1; 32])))
        );
    }

    #[test]
    fn height_lookup_prefers_best_chain() {
        let (mut tree, _, _, b, c) = fork();
        assert_eq!(tree.get_node_from_block_number(2).unwrap().hash(), b.hash());

        // Extend C so its branch becomes best; #2 now resolves to C.
        let d = child(&c, 4, 1_020);
        tree.add_block(&d).unwrap();
        assert_eq!(tree.get_node_from_block_number(2).unwrap().hash(), c.hash());
        assert_eq!(tree.get_node_from_block_number(3).unwrap().hash(), d.hash());
        assert!(tree.get_node_from_block_number(4).is_none());
    }

    #[test]
    fn height_lookup_falls_back_to_walk_off_best_chain() {
        let g = genesis();
        let a = child(&g, 1, 1_006);
        let b = child(&a, 2, 1_012);
        let header = BlockHeader::new(g.hash(), 10, [3u8; 32], [0u8; 32], Vec::new());
        let jump = Block::from_header(header, 1_007);
        let mut tree = BlockTree::new_from_genesis(&g);
        for block in [&a, &b, &jump] {
            tree.add_block(block).unwrap();
        }

        assert_eq!(tree.deepest_leaf().hash(), b.hash());
        assert_eq!(tree.get_node_from_block_number(10).unwrap().hash(), jump.hash());
        assert!(tree.get_node_from_block_number(5).is_none());
    }

    #[test]
    fn sub_blockchain_hydrates_from_store() {
        let db = ChainDb::open_temporary().unwrap();
        let (tree, g, a, b, c) = fork();
        for block in [&g, &a, &b, &c] {
            db.put_block(block).unwrap();
        }

        let blocks = tree.sub_blockchain(0, 2, &db).unwrap();
        assert_eq!(
            blocks.iter().map(|b| b.hash()).collect::<Vec<_>>(),
            vec![g.hash(), a.hash(), b.hash()]
        );
        assert_eq!(tree.deepest_block(&db).unwrap(), b);
        assert_eq!(tree.get_block_from_block_number(1, &db).unwrap(), a);
        assert_eq!(
            tree.get_block_from_block_number(9, &db).unwrap_err(),
            BlockTreeError::NotFound(BlockId::Number(9))
        );
    }

    #[test]
    fn missing_body_is_not_found() {
        let db = ChainDb::open_temporary().unwrap();
        let (tree, _, _, b, _) = fork();
        assert_eq!(
            tree.deepest_block(&db).unwrap_err(),
            BlockTreeError::NotFound(BlockId::Hash(b.hash()))
        );
    }

    #[test]
    fn slot_uses_stepping_semantics() {
        let g = genesis();
        let tree = BlockTree::new_from_genesis(&g);
        let block = child(&g, 1, 1_019);
        assert_eq!(tree.compute_slot_for_block(&block, 6).unwrap(), 4);

        let on_boundary = child(&g, 1, 1_018);
        assert_eq!(tree.compute_slot_for_block(&on_boundary, 6).unwrap(), 3);

        let early = child(&g, 1, 900);
        assert_eq!(tree.compute_slot_for_block(&early, 6).unwrap(), 0);
        assert_eq!(tree.compute_slot_for_block(&g, 6).unwrap(), 0);
    }

    #[test]
    fn zero_slot_duration_is_rejected() {
        let g = genesis();
        let tree = BlockTree::new_from_genesis(&g);
        assert_eq!(
            tree.compute_slot_for_block(&g, 0).unwrap_err(),
            BlockTreeError::InvalidSlotDuration
        );
    }

    #[test]
    fn finalize_prunes_side_forks_and_rebases() {
        let (mut tree, g, a, b, c) = fork();
        let d = child(&b, 4, 1_020);
        tree.add_block(&d).unwrap();

        let pruned = tree.finalize(&b.hash()).unwrap();
        // G, A and the C fork go away.
        assert_eq!(pruned, 3);
        assert_eq!(tree.root_node().hash(), b.hash());
        assert_eq!(tree.root_node().depth(), 0);
        assert_eq!(tree.get_node(&d.hash()).unwrap().depth(), 1);
        assert!(tree.get_node(&g.hash()).is_none());
        assert!(tree.get_node(&a.hash()).is_none());
        assert!(tree.get_node(&c.hash()).is_none());
        assert!(!tree.leaf_map().contains(&c.hash()));
        assert_eq!(hashes(&tree.longest_path()), vec![b.hash(), d.hash()]);
        assert_eq!(tree.finalized_blocks().len(), 1);
        assert_eq!(tree.last_finalized().unwrap().number, 2);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn finalize_pruned_names_every_dropped_hash() {
        let (mut tree, g, a, b, c) = fork();
        let mut pruned = tree.finalize_pruned(&b.hash()).unwrap();
        pruned.sort();
        let mut expected = vec![g.hash(), a.hash(), c.hash()];
        expected.sort();
        assert_eq!(pruned, expected);
        assert!(tree.finalize_pruned(&b.hash()).unwrap().is_empty());
    }

    #[test]
    fn finalize_keeps_slot_origin() {
        let (mut tree, g, a, _, _) = fork();
        tree.finalize(&a.hash()).unwrap();
        let late = child(&g, 9, 1_019);
        assert_eq!(tree.compute_slot_for_block(&late, 6).unwrap(), 4);
    }

    #[test]
    fn finalize_root_twice_is_a_no_op() {
        let (mut tree, g, _, _, _) = fork();
        assert_eq!(tree.finalize(&g.hash()).unwrap(), 0);
        assert_eq!(tree.finalize(&g.hash()).unwrap(), 0);
        assert_eq!(tree.finalized_blocks().len(), 1);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn finalize_unknown_is_not_found() {
        let (mut tree, _, _, _, _) = fork();
        assert!(matches!(
            tree.finalize(&BlockHash([3; 32])),
            Err(BlockTreeError::NotFound(_))
        ));
    }

    #[test]
    fn blocks_below_pruned_branch_get_parent_not_found() {
        let (mut tree, _, _, b, c) = fork();
        tree.finalize(&b.hash()).unwrap();
        let late = child(&c, 8, 1_030);
        assert!(matches!(
            tree.add_block(&late),
            Err(BlockTreeError::ParentNotFound { .. })
        ));
    }

    #[test]
    fn display_lists_leaves_and_branches() {
        let (tree, _, _, b, c) = fork();
        let dump = tree.to_string();
        assert!(dump.starts_with("Leaves: "));
        assert!(dump.contains(&b.hash().to_string()));
        assert!(dump.contains(&format!("0x{}", c.hash().short())));
        assert!(dump.contains("└── "));
        assert!(dump.contains("├── "));
    }

    #[test]
    fn snapshot_matches_tree() {
        let (tree, g, _, b, _) = fork();
        let snap = tree.snapshot();
        assert_eq!(snap.root.hash, g.hash());
        assert_eq!(snap.best.hash, b.hash());
        assert_eq!(snap.node_count, 4);
        assert_eq!(snap.leaves.len(), 2);
        assert_eq!(snap.leaves[0].hash, b.hash());
        assert!(snap.last_finalized.is_none());
    }
}
