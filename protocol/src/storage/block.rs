//! # Block Structure
//!
//! A block is a header plus an opaque list of extrinsics. Arbor never looks
//! inside an extrinsic; executing them is the runtime's job. The node only
//! needs enough of the header to place the block in the tree.
//!
//! ## Block Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── parent_hash: BlockHash                 │
//! │  ├── number: u64                            │
//! │  ├── state_root: [u8; 32]                   │
//! │  ├── extrinsics_root: [u8; 32] (Merkle root)│
//! │  ├── digest: Vec<u8>                        │
//! │  └── hash: BlockHash  (BLAKE3 of the above) │
//! ├─────────────────────────────────────────────┤
//! │  body: Vec<Extrinsic>                       │
//! │  arrival_time: u64  (local, not hashed)     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! `arrival_time` is the local wall clock (unix milliseconds) at the moment
//! this node first saw the block. It is not part of the header and two nodes
//! will disagree about it. Slot computation is the only consumer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::hash::{blake3_hash, domain_separated_hash, merkle_root, HEADER_HASH_CONTEXT};

/// Opaque extrinsic bytes.
pub type Extrinsic = Vec<u8>;

// ---------------------------------------------------------------------------
// BlockHash
// ---------------------------------------------------------------------------

/// 32-byte block digest.
///
/// Serialized as a `0x`-prefixed hex string in human-readable formats (JSON)
/// and as raw bytes in binary formats (bincode).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash. Used as the parent of genesis.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First four bytes as hex. Handy in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        BlockHash(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(0x{})", self.short())
    }
}

/// Failure to parse a [`BlockHash`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockHashParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl FromStr for BlockHash {
    type Err = BlockHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(digits).map_err(|e| BlockHashParseError::InvalidHex(e.to_string()))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| BlockHashParseError::InvalidLength(bytes.len()))?;
        Ok(BlockHash(array))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            Ok(BlockHash(<[u8; 32]>::deserialize(deserializer)?))
        }
    }
}

/// A block reference by hash or by height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockId {
    Hash(BlockHash),
    Number(u64),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Hash(hash) => write!(f, "block {}", hash),
            BlockId::Number(number) => write!(f, "block #{}", number),
        }
    }
}

// ---------------------------------------------------------------------------
// BlockHeader
// ---------------------------------------------------------------------------

/// Block header. Everything the tree and sync layers need to know.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent header. [`BlockHash::ZERO`] for genesis.
    pub parent_hash: BlockHash,
    /// Block height. Genesis is 0.
    pub number: u64,
    /// State root after executing this block. Computed by the runtime.
    pub state_root: [u8; 32],
    /// Merkle root over the BLAKE3 hashes of the extrinsics.
    pub extrinsics_root: [u8; 32],
    /// Consensus digest (pre-runtime and seal items), opaque here.
    #[serde(default)]
    pub digest: Vec<u8>,
    /// BLAKE3 hash of the fields above.
    pub hash: BlockHash,
}

impl BlockHeader {
    /// Build a header and fill in its hash.
    pub fn new(
        parent_hash: BlockHash,
        number: u64,
        state_root: [u8; 32],
        extrinsics_root: [u8; 32],
        digest: Vec<u8>,
    ) -> Self {
        let hash = compute_header_hash(&parent_hash, number, &state_root, &extrinsics_root, &digest);
        Self {
            parent_hash,
            number,
            state_root,
            extrinsics_root,
            digest,
            hash,
        }
    }

    /// Recompute the hash from the header fields.
    pub fn compute_hash(&self) -> BlockHash {
        compute_header_hash(
            &self.parent_hash,
            self.number,
            &self.state_root,
            &self.extrinsics_root,
            &self.digest,
        )
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Errors from [`Block::verify`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("block #{number} hash mismatch: stored={stored}, computed={computed}")]
    HashMismatch {
        number: u64,
        stored: BlockHash,
        computed: BlockHash,
    },

    #[error("block #{0} extrinsics root does not match its body")]
    ExtrinsicsRootMismatch(u64),

    #[error("block #0 must have a zero parent hash")]
    InvalidGenesis,
}

/// A full block: header, body, and the local arrival timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub body: Vec<Extrinsic>,
    /// Local arrival time in unix milliseconds.
    #[serde(default)]
    pub arrival_time: u64,
}

impl Block {
    /// Construct the genesis block from an initial state commitment.
    ///
    /// `timestamp` doubles as the arrival time: genesis never "arrives", so
    /// its declared time anchors slot zero.
    pub fn genesis(state_root: [u8; 32], timestamp: u64) -> Self {
        let header = BlockHeader::new(BlockHash::ZERO, 0, state_root, [0u8; 32], Vec::new());
        Block {
            header,
            body: Vec::new(),
            arrival_time: timestamp,
        }
    }

    /// Construct a child of `parent` carrying `body`, stamped with the
    /// current wall clock.
    pub fn new(parent: &BlockHeader, body: Vec<Extrinsic>, state_root: [u8; 32]) -> Self {
        let extrinsics_root = compute_extrinsics_root(&body);
        let header = BlockHeader::new(
            parent.hash,
            parent.number + 1,
            state_root,
            extrinsics_root,
            Vec::new(),
        );
        Block {
            header,
            body,
            arrival_time: now_millis(),
        }
    }

    /// Wrap a bare header (e.g. from an announcement) as a bodyless block.
    pub fn from_header(header: BlockHeader, arrival_time: u64) -> Self {
        Block {
            header,
            body: Vec::new(),
            arrival_time,
        }
    }

    /// Override the arrival timestamp.
    pub fn with_arrival_time(mut self, arrival_time: u64) -> Self {
        self.arrival_time = arrival_time;
        self
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.header.parent_hash
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Check header hash and extrinsics root against the contents.
    ///
    /// Does not look at signatures or state; those belong to the runtime
    /// and consensus collaborators.
    pub fn verify(&self) -> Result<(), BlockError> {
        let computed = self.header.compute_hash();
        if computed != self.header.hash {
            return Err(BlockError::HashMismatch {
                number: self.header.number,
                stored: self.header.hash,
                computed,
            });
        }

        if !self.body.is_empty()
            && compute_extrinsics_root(&self.body) != self.header.extrinsics_root
        {
            return Err(BlockError::ExtrinsicsRootMismatch(self.header.number));
        }

        if self.header.number == 0 && self.header.parent_hash != BlockHash::ZERO {
            return Err(BlockError::InvalidGenesis);
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hash Computation
// ---------------------------------------------------------------------------

fn compute_header_hash(
    parent_hash: &BlockHash,
    number: u64,
    state_root: &[u8; 32],
    extrinsics_root: &[u8; 32],
    digest: &[u8],
) -> BlockHash {
    let mut preimage = Vec::with_capacity(104 + digest.len());
    preimage.extend_from_slice(parent_hash.as_bytes());
    preimage.extend_from_slice(&number.to_le_bytes());
    preimage.extend_from_slice(state_root);
    preimage.extend_from_slice(extrinsics_root);
    preimage.extend_from_slice(digest);
    BlockHash(domain_separated_hash(HEADER_HASH_CONTEXT, &preimage))
}

/// Merkle root over the BLAKE3 hash of each extrinsic.
pub fn compute_extrinsics_root(body: &[Extrinsic]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = body.iter().map(|xt| blake3_hash(xt)).collect();
    merkle_root(&leaves)
}

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
