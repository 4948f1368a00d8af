//! # Wire Messages
//!
//! Every message on the wire is a one-byte type tag followed by the bincode
//! encoding of the payload:
//!
//! ```text
//! ┌──────┬──────────────────────────────┐
//! │ tag  │ bincode(payload)             │
//! │ (1B) │                              │
//! └──────┴──────────────────────────────┘
//! ```
//!
//! | Tag | Payload                 |
//! |-----|-------------------------|
//! | 1   | [`StatusMessage`]        |
//! | 2   | [`BlockRequestMessage`]  |
//! | 3   | [`BlockResponseMessage`] |
//! | 4   | [`BlockAnnounceMessage`] |
//! | 5   | [`TransactionsMessage`]  |
//!
//! The tag lets a receiver route a message before paying for a full decode,
//! and lets it skip types it does not understand.

use serde::{Deserialize, Serialize};

use crate::storage::{Block, BlockHash, BlockHeader, BlockId, Extrinsic};

/// Opaque identifier of a remote peer, as handed to us by the transport.
pub type PeerId = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("empty message")]
    Empty,

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("codec error: {0}")]
    Codec(String),
}

// ---------------------------------------------------------------------------
// Message Type Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Status = 1,
    BlockRequest = 2,
    BlockResponse = 3,
    BlockAnnounce = 4,
    Transactions = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Status),
            2 => Ok(Self::BlockRequest),
            3 => Ok(Self::BlockResponse),
            4 => Ok(Self::BlockAnnounce),
            5 => Ok(Self::Transactions),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Handshake summary exchanged when a peer connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub protocol_version: u32,
    pub min_supported_version: u32,
    /// Bitmask of `ROLE_*` flags from [`crate::config`].
    pub roles: u8,
    pub best_block_number: u64,
    pub best_block_hash: BlockHash,
    pub genesis_hash: BlockHash,
}

/// Walk direction for a block request, relative to `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Towards the tips.
    Ascending,
    /// Towards genesis, following parent hashes.
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequestMessage {
    /// Echoed back in the response so the requester can match them up.
    pub id: u64,
    pub from: BlockId,
    /// Stop after this block, if given.
    pub to: Option<BlockHash>,
    pub direction: Direction,
    /// At most this many blocks. `None` means the responder's limit.
    pub max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponseMessage {
    pub id: u64,
    pub blocks: Vec<Block>,
}

/// A peer telling us it has a new block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnounceMessage {
    pub header: BlockHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionsMessage {
    pub extrinsics: Vec<Extrinsic>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Any message the node speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Status(StatusMessage),
    BlockRequest(BlockRequestMessage),
    BlockResponse(BlockResponseMessage),
    BlockAnnounce(BlockAnnounceMessage),
    Transactions(TransactionsMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Status(_) => MessageType::Status,
            Self::BlockRequest(_) => MessageType::BlockRequest,
            Self::BlockResponse(_) => MessageType::BlockResponse,
            Self::BlockAnnounce(_) => MessageType::BlockAnnounce,
            Self::Transactions(_) => MessageType::Transactions,
        }
    }

    /// Tag byte followed by the bincode payload.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            Self::Status(m) => bincode::serialize(m),
            Self::BlockRequest(m) => bincode::serialize(m),
            Self::BlockResponse(m) => bincode::serialize(m),
            Self::BlockAnnounce(m) => bincode::serialize(m),
            Self::Transactions(m) => bincode::serialize(m),
        }
        .map_err(|e| MessageError::Codec(e.to_string()))?;

        let mut bytes = Vec::with_capacity(1 + payload.len());
        bytes.push(self.message_type() as u8);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let (&tag, payload) = bytes.split_first().ok_or(MessageError::Empty)?;
        Ok(match MessageType::try_from(tag)? {
            MessageType::Status => Self::Status(decode_payload(payload)?),
            MessageType::BlockRequest => Self::BlockRequest(decode_payload(payload)?),
            MessageType::BlockResponse => Self::BlockResponse(decode_payload(payload)?),
            MessageType::BlockAnnounce => Self::BlockAnnounce(decode_payload(payload)?),
            MessageType::Transactions => Self::Transactions(decode_payload(payload)?),
        })
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, MessageError> {
    bincode::deserialize(payload).map_err(|e| MessageError::Codec(e.to_string()))
}

/// A message tagged with the peer it came from or is going to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    pub peer: PeerId,
    pub message: Message,
}

impl NetworkMessage {
    pub fn new(peer: impl Into<PeerId>, message: Message) -> Self {
        Self {
            peer: peer.into(),
            message,
        }
    }
}
