//! # Genesis
//!
//! Loads the chain spec JSON and seeds an empty database with block #0.
//!
//! A chain spec looks like:
//!
//! ```json
//! {
//!   "name": "Arbor Local",
//!   "id": "arbor_local",
//!   "protocolId": "/arbor/1",
//!   "bootnodes": ["/ip4/127.0.0.1/tcp/30333"],
//!   "timestamp": 1767225600000,
//!   "rawState": { "0x3a636f6465": "0x00" }
//! }
//! ```
//!
//! `rawState` is the initial key/value storage, hex on both sides. Its
//! commitment becomes the genesis state root, so two nodes loading the same
//! file derive the same genesis hash.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DEFAULT_PROTOCOL_ID;
use crate::crypto::{blake3_hash_multi, merkle_root};
use crate::storage::{Block, BlockHash, ChainDb, DbError};

#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("failed to read genesis file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed genesis JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid raw state entry {key}: {reason}")]
    InvalidState { key: String, reason: String },

    #[error("database already holds genesis {stored}, refusing to overwrite with {expected}")]
    GenesisMismatch {
        stored: BlockHash,
        expected: BlockHash,
    },

    #[error("genesis {0} is recorded but its block is missing")]
    MissingBlock(BlockHash),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Parsed chain spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genesis {
    pub name: String,
    pub id: String,
    #[serde(default = "default_protocol_id")]
    pub protocol_id: String,
    #[serde(default)]
    pub bootnodes: Vec<String>,
    /// Unix milliseconds. Anchors slot zero.
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub raw_state: BTreeMap<String, String>,
}

fn default_protocol_id() -> String {
    DEFAULT_PROTOCOL_ID.to_string()
}

impl Genesis {
    /// Merkle commitment over the raw state, entries in key order.
    pub fn state_root(&self) -> Result<[u8; 32], GenesisError> {
        let mut leaves = Vec::with_capacity(self.raw_state.len());
        for (key, value) in &self.raw_state {
            let k = decode_hex(key, key)?;
            let v = decode_hex(key, value)?;
            leaves.push(blake3_hash_multi(&[&k, &v]));
        }
        Ok(merkle_root(&leaves))
    }

    /// Block #0 described by this spec.
    pub fn to_block(&self) -> Result<Block, GenesisError> {
        Ok(Block::genesis(self.state_root()?, self.timestamp))
    }
}

fn decode_hex(key: &str, value: &str) -> Result<Vec<u8>, GenesisError> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(trimmed).map_err(|e| GenesisError::InvalidState {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Read and parse a chain spec from disk.
pub fn load_genesis<P: AsRef<Path>>(path: P) -> Result<Genesis, GenesisError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading genesis");
    let raw = fs::read_to_string(path).map_err(|source| GenesisError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Make sure `db` holds the genesis block described by `genesis`.
///
/// On an empty database this writes block #0, the genesis hash, the
/// finalized hash and the chain spec itself. Running it again with the same
/// spec returns the stored block untouched. A database initialized from a
/// different spec is an error.
pub fn initialize_genesis(db: &ChainDb, genesis: &Genesis) -> Result<Block, GenesisError> {
    let block = genesis.to_block()?;
    let hash = block.hash();

    if let Some(stored) = db.genesis_hash()? {
        if stored != hash {
            return Err(GenesisError::GenesisMismatch {
                stored,
                expected: hash,
            });
        }
        debug!(hash = %hash, "genesis already initialized");
        return db.get_block(&stored)?.ok_or(GenesisError::MissingBlock(stored));
    }

    db.put_block(&block)?;
    db.set_genesis_hash(&hash)?;
    db.set_finalized_hash(&hash)?;
    db.set_genesis_data(&serde_json::to_vec(genesis)?)?;

    info!(
        name = %genesis.name,
        id = %genesis.id,
        protocol_id = %genesis.protocol_id,
        bootnodes = ?genesis.bootnodes,
        hash = %hash,
        "genesis initialized"
    );
    Ok(block)
}
