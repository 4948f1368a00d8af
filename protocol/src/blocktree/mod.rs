//! # Block Tree
//!
//! In-memory index of every block header the node knows about that has not
//! been pruned by finality. Drives fork choice, height lookups and sub-chain
//! queries for the sync and consensus layers.
//!
//! ```text
//! node.rs    — Node: one block's position (hash, number, depth, links)
//! leaves.rs  — LeafMap: the current tips and the fork-choice order
//! tree.rs    — BlockTree: insertion, selection, paths, finalization
//! shared.rs  — SharedBlockTree: RwLock handle for concurrent callers
//! error.rs   — BlockTreeError
//! ```
//!
//! Nodes live in a hash-keyed arena. Parent and child links are hashes, so
//! the same map serves as the lookup index and the tree has no reference
//! cycles. Bodies are never held here; they are hydrated on demand through
//! [`BlockStore`](crate::storage::BlockStore).
//!
//! Fork choice is longest chain by depth. Ties go to the tip that arrived
//! first, then to the lower hash.

pub mod error;
pub mod leaves;
pub mod node;
pub mod shared;
pub mod tree;

pub use error::{BlockTreeError, BlockTreeResult};
pub use leaves::{compare_tips, LeafMap, LeafUpdate};
pub use node::Node;
pub use shared::SharedBlockTree;
pub use tree::{
    compute_slot, BlockTree, FinalizedCheckpoint, ImportOutcome, NodeSummary, TreeSnapshot,
};
