//! Error types for block tree operations.

use crate::storage::{BlockHash, BlockId};

/// Errors returned by [`BlockTree`](super::BlockTree) operations.
///
/// A duplicate insertion is not an error: see
/// [`ImportOutcome::AlreadyKnown`](super::ImportOutcome::AlreadyKnown).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockTreeError {
    /// The block's parent is not indexed. Callers must insert parents first.
    #[error("parent not found: {parent}")]
    ParentNotFound { parent: BlockHash },

    /// Lookup miss, or the store has no body for an indexed hash.
    #[error("{0} not found")]
    NotFound(BlockId),

    /// `descendant` does not sit below `ancestor` in the tree.
    #[error("{descendant} is not a descendant of {ancestor}")]
    NotDescendant {
        ancestor: BlockHash,
        descendant: BlockHash,
    },

    #[error("slot duration must be greater than zero")]
    InvalidSlotDuration,

    /// A child numbered below its parent would break height monotonicity.
    #[error("block #{got} cannot extend parent #{parent_number}")]
    InvalidBlockNumber { parent_number: u64, got: u64 },

    #[error("block store error: {0}")]
    Store(String),
}

pub type BlockTreeResult<T> = Result<T, BlockTreeError>;
