//! # Network Module
//!
//! Everything between the transport and the block tree: the wire format,
//! the per-peer status table and the import service that turns announcements
//! and responses into tree insertions.
//!
//! ## Architecture
//!
//! ```text
//! message.rs  — tagged bincode wire messages (status, block req/resp, announce)
//! peers.rs    — PeerManager task owning peer status, PeerHandle client
//! service.rs  — ChainService import loop, OrphanPool, ChainEvent, restore
//! ```
//!
//! ## Design Decisions
//!
//! - The protocol crate stays transport-agnostic. Messages come and go as
//!   [`NetworkMessage`] values on tokio channels; wiring those to sockets is
//!   the binary's problem.
//! - Peer status lives in one task behind an mpsc queue; callers hold a
//!   cloneable [`PeerHandle`].
//! - Blocks that arrive before their parent are buffered in a bounded pool
//!   until the parent shows up.

pub mod message;
pub mod peers;
pub mod service;

pub use message::{
    BlockAnnounceMessage, BlockRequestMessage, BlockResponseMessage, Direction, Message,
    MessageError, MessageType, NetworkMessage, PeerId, StatusMessage, TransactionsMessage,
};
pub use peers::{is_compatible, PeerCommand, PeerError, PeerHandle, PeerManager};
pub use service::{
    restore_tree, ChainEvent, ChainService, ImportResult, OrphanPool, ServiceConfig, ServiceError,
};
