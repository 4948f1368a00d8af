//! # Storage Module
//!
//! Block data types and the persistent store behind the block tree.
//!
//! ```text
//! block.rs  — BlockHash, BlockHeader, Block, hash/verify operations
//! db.rs     — sled-backed ChainDb and the BlockStore hydration seam
//! ```
//!
//! The in-memory [`BlockTree`](crate::blocktree::BlockTree) indexes headers
//! only. Whenever a caller needs a body it goes through [`BlockStore`], which
//! keeps disk I/O out of the tree's critical section.

pub mod block;
pub mod db;

pub use block::{Block, BlockError, BlockHash, BlockHeader, BlockId, Extrinsic};
pub use db::{BlockStore, ChainDb, DbError, DbResult};
