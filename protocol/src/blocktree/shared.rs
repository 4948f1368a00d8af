//! Thread-safe handle around a [`BlockTree`].
//!
//! Every mutation takes the write lock for its whole duration, so readers
//! never observe a half-linked node or a leaf set out of step with the
//! arena. Readers get owned copies of nodes back. Hydrating bodies from the
//! [`BlockStore`] happens after the read lock is released.

use std::sync::Arc;

use parking_lot::RwLock;

use super::error::BlockTreeResult;
use super::node::{load_block, Node};
use super::tree::{BlockTree, FinalizedCheckpoint, ImportOutcome, TreeSnapshot};
use super::BlockTreeError;
use crate::storage::{Block, BlockHash, BlockId, BlockStore};

#[derive(Debug, Clone)]
pub struct SharedBlockTree {
    inner: Arc<RwLock<BlockTree>>,
}

impl SharedBlockTree {
    pub fn new(tree: BlockTree) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    pub fn from_genesis(genesis: &Block) -> Self {
        Self::new(BlockTree::new_from_genesis(genesis))
    }

    /// Run `f` against a consistent view of the tree.
    pub fn read<R>(&self, f: impl FnOnce(&BlockTree) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn add_block(&self, block: &Block) -> BlockTreeResult<ImportOutcome> {
        self.inner.write().add_block(block)
    }

    pub fn finalize(&self, hash: &BlockHash) -> BlockTreeResult<usize> {
        self.inner.write().finalize(hash)
    }

    pub fn finalize_pruned(&self, hash: &BlockHash) -> BlockTreeResult<Vec<BlockHash>> {
        self.inner.write().finalize_pruned(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.inner.read().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get_node(&self, hash: &BlockHash) -> Option<Node> {
        self.inner.read().get_node(hash).cloned()
    }

    pub fn root(&self) -> Node {
        self.inner.read().root_node().clone()
    }

    pub fn deepest_leaf(&self) -> Node {
        self.inner.read().deepest_leaf().clone()
    }

    pub fn leaves(&self) -> Vec<Node> {
        self.inner.read().leaves().into_iter().cloned().collect()
    }

    pub fn longest_path(&self) -> Vec<Node> {
        self.inner.read().longest_path().into_iter().cloned().collect()
    }

    pub fn get_node_from_block_number(&self, number: u64) -> Option<Node> {
        self.inner.read().get_node_from_block_number(number).cloned()
    }

    pub fn sub_chain(&self, start: &BlockHash, end: &BlockHash) -> BlockTreeResult<Vec<Node>> {
        let tree = self.inner.read();
        let path = tree.sub_chain(start, end)?;
        Ok(path.into_iter().cloned().collect())
    }

    pub fn compute_slot_for_block(&self, block: &Block, slot_duration: u64) -> BlockTreeResult<u64> {
        self.inner.read().compute_slot_for_block(block, slot_duration)
    }

    pub fn last_finalized(&self) -> Option<FinalizedCheckpoint> {
        self.inner.read().last_finalized().cloned()
    }

    pub fn finalized_blocks(&self) -> Vec<FinalizedCheckpoint> {
        self.inner.read().finalized_blocks().to_vec()
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.inner.read().snapshot()
    }

    /// Text dump of the tree, as produced by its `Display` impl.
    pub fn render(&self) -> String {
        self.inner.read().to_string()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.inner.read().check_invariants()
    }

    // -- Hydrating reads ----------------------------------------------------

    pub fn deepest_block(&self, store: &dyn BlockStore) -> BlockTreeResult<Block> {
        let hash = self.inner.read().deepest_leaf().hash();
        load_block(store, &hash)
    }

    pub fn get_block_from_block_number(
        &self,
        number: u64,
        store: &dyn BlockStore,
    ) -> BlockTreeResult<Block> {
        let hash = self
            .inner
            .read()
            .get_node_from_block_number(number)
            .map(|n| n.hash())
            .ok_or(BlockTreeError::NotFound(BlockId::Number(number)))?;
        load_block(store, &hash)
    }

    pub fn sub_blockchain(
        &self,
        start: u64,
        end: u64,
        store: &dyn BlockStore,
    ) -> BlockTreeResult<Vec<Block>> {
        let hashes: Vec<BlockHash> = {
            let tree = self.inner.read();
            let path = tree.sub_chain_by_number(start, end)?;
            path.iter().map(|n| n.hash()).collect()
        };
        hashes.iter().map(|h| load_block(store, h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlockHeader, ChainDb};
    use std::thread;

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

    #[test]
    fn returns_owned_copies() {
        let g = Block::genesis([0u8; 32], 0);
        let a = child(&g, 1, 6);
        let shared = SharedBlockTree::from_genesis(&g);
        shared.add_block(&a).unwrap();

        let node = shared.get_node(&a.hash()).unwrap();
        shared.finalize(&a.hash()).unwrap();
        // The copy still reports the pre-finalization depth.
        assert_eq!(node.depth(), 1);
        assert_eq!(shared.get_node(&a.hash()).unwrap().depth(), 0);
    }

    #[test]
    fn hydrating_reads_go_through_store() {
        let db = ChainDb::open_temporary().unwrap();
        let g = Block::genesis([0u8; 32], 0);
        let a = child(&g, 1, 6);
        let b = child(&a, 2, 12);
        let shared = SharedBlockTree::from_genesis(&g);
        for block in [&g, &a, &b] {
            db.put_block(block).unwrap();
        }
        shared.add_block(&a).unwrap();
        shared.add_block(&b).unwrap();

        assert_eq!(shared.deepest_block(&db).unwrap(), b);
        assert_eq!(shared.get_block_from_block_number(1, &db).unwrap(), a);
        assert_eq!(shared.sub_blockchain(0, 2, &db).unwrap(), vec![g, a, b]);
    }

    #[test]
    fn concurrent_writers_keep_tree_consistent() {
        let g = Block::genesis([0u8; 32], 0);
        let shared = SharedBlockTree::from_genesis(&g);

        let handles: Vec<_> = (0..4u8)
            .map(|branch| {
                let shared = shared.clone();
                let g = g.clone();
                thread::spawn(move || {
                    let mut parent = g;
                    for i in 0..25u8 {
                        let block = child(&parent, branch * 32 + i + 1, u64::from(i) * 6);
                        shared.add_block(&block).unwrap();
                        assert!(shared.deepest_leaf().depth() >= 1);
                        parent = block;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(shared.len(), 101);
        assert_eq!(shared.leaves().len(), 4);
        assert_eq!(shared.longest_path().len(), 26);
        shared.check_invariants().unwrap();
    }
}
