//! # ChainDb — Persistent Block Store
//!
//! The block tree only keeps metadata in memory. Headers and bodies live
//! here, in sled, and are hydrated on demand through the [`BlockStore`]
//! seam.
//!
//! ## Tree Layout
//!
//! | Tree       | Key                          | Value                    |
//! |------------|------------------------------|--------------------------|
//! | `headers`  | `hash` (32B)                 | `bincode(BlockHeader)`   |
//! | `bodies`   | `hash` (32B)                 | `bincode(StoredBody)`    |
//! | `numbers`  | `number` (8B BE) ‖ `hash`    | empty                    |
//! | `metadata` | key (UTF-8)                  | value (bytes)            |
//!
//! Block numbers are big-endian so a prefix scan over `numbers` returns every
//! block at a height, and a full scan returns blocks in ascending height
//! order. Forks share a height, which is why the hash is part of the key.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use super::block::{Block, BlockHash, BlockHeader, Extrinsic};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key not found: {0}")]
    NotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// BlockStore seam
// ---------------------------------------------------------------------------

/// Read access to full blocks, keyed by hash.
///
/// The block tree calls this to turn indexed metadata back into a [`Block`].
/// `Ok(None)` means the store has no body for that hash.
pub trait BlockStore: Send + Sync {
    fn load_block(&self, hash: &BlockHash) -> DbResult<Option<Block>>;
}

// ---------------------------------------------------------------------------
// Metadata Keys
// ---------------------------------------------------------------------------

const META_GENESIS_HASH: &[u8] = b"genesis_hash";
const META_FINALIZED_HASH: &[u8] = b"finalized_hash";
const META_GENESIS_DATA: &[u8] = b"genesis_data";

/// What we keep per hash in the `bodies` tree.
#[derive(Debug, Serialize, Deserialize)]
struct StoredBody {
    body: Vec<Extrinsic>,
    arrival_time: u64,
}

// ---------------------------------------------------------------------------
// ChainDb
// ---------------------------------------------------------------------------

/// sled-backed block store.
///
/// sled handles its own locking, so `ChainDb` is shared as `Arc<ChainDb>`
/// without any extra synchronization.
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
    headers: Tree,
    bodies: Tree,
    numbers: Tree,
    metadata: Tree,
}

impl ChainDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway database, removed on drop. Tests use this.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            headers: db.open_tree("headers")?,
            bodies: db.open_tree("bodies")?,
            numbers: db.open_tree("numbers")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // -- Blocks -------------------------------------------------------------

    /// Persist a block's header, body, and height index entry.
    ///
    /// Re-writing an existing block overwrites it with identical bytes,
    /// so callers don't need to check first.
    pub fn put_block(&self, block: &Block) -> DbResult<()> {
        let hash = block.header.hash;
        let header_bytes = encode(&block.header)?;
        let body_bytes = encode(&StoredBody {
            body: block.body.clone(),
            arrival_time: block.arrival_time,
        })?;

        self.headers.insert(hash.as_bytes(), header_bytes)?;
        self.bodies.insert(hash.as_bytes(), body_bytes)?;
        self.numbers
            .insert(number_key(block.header.number, &hash), &[] as &[u8])?;
        self.db.flush()?;
        Ok(())
    }

    /// Fetch a header by hash.
    pub fn get_header(&self, hash: &BlockHash) -> DbResult<Option<BlockHeader>> {
        match self.headers.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a full block by hash. `None` unless both header and body exist.
    pub fn get_block(&self, hash: &BlockHash) -> DbResult<Option<Block>> {
        let header = match self.get_header(hash)? {
            Some(h) => h,
            None => return Ok(None),
        };
        match self.bodies.get(hash.as_bytes())? {
            Some(bytes) => {
                let stored: StoredBody = decode(&bytes)?;
                Ok(Some(Block {
                    header,
                    body: stored.body,
                    arrival_time: stored.arrival_time,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &BlockHash) -> DbResult<bool> {
        Ok(self.bodies.contains_key(hash.as_bytes())?)
    }

    /// Every stored hash at `number`, ordered by hash.
    pub fn block_hashes_at(&self, number: u64) -> DbResult<Vec<BlockHash>> {
        let mut hashes = Vec::new();
        for entry in self.numbers.scan_prefix(number.to_be_bytes()) {
            let (key, _) = entry?;
            hashes.push(hash_from_number_key(&key)?);
        }
        Ok(hashes)
    }

    /// Every stored block in ascending height order.
    ///
    /// Used to rebuild the in-memory tree on restart.
    pub fn blocks_by_number(&self) -> DbResult<Vec<Block>> {
        let mut blocks = Vec::new();
        for entry in self.numbers.iter() {
            let (key, _) = entry?;
            let hash = hash_from_number_key(&key)?;
            let block = self
                .get_block(&hash)?
                .ok_or_else(|| DbError::NotFound(hash.to_string()))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.headers.len()
    }

    // -- Metadata -----------------------------------------------------------

    pub fn set_genesis_hash(&self, hash: &BlockHash) -> DbResult<()> {
        self.metadata.insert(META_GENESIS_HASH, hash.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn genesis_hash(&self) -> DbResult<Option<BlockHash>> {
        self.read_hash(META_GENESIS_HASH)
    }

    pub fn set_finalized_hash(&self, hash: &BlockHash) -> DbResult<()> {
        self.metadata.insert(META_FINALIZED_HASH, hash.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn finalized_hash(&self) -> DbResult<Option<BlockHash>> {
        self.read_hash(META_FINALIZED_HASH)
    }

    /// Raw chain spec the database was initialized from (JSON bytes).
    pub fn set_genesis_data(&self, data: &[u8]) -> DbResult<()> {
        self.metadata.insert(META_GENESIS_DATA, data)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn genesis_data(&self) -> DbResult<Option<Vec<u8>>> {
        Ok(self.metadata.get(META_GENESIS_DATA)?.map(|v| v.to_vec()))
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn read_hash(&self, key: &[u8]) -> DbResult<Option<BlockHash>> {
        match self.metadata.get(key)? {
            Some(bytes) => {
                let array: [u8; 32] = bytes.as_ref().try_into().map_err(|_| {
                    DbError::Serialization(format!("invalid hash bytes under {:?}", key))
                })?;
                Ok(Some(BlockHash(array)))
            }
            None => Ok(None),
        }
    }
}

impl BlockStore for ChainDb {
    fn load_block(&self, hash: &BlockHash) -> DbResult<Option<Block>> {
        self.get_block(hash)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}

fn number_key(number: u64, hash: &BlockHash) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&number.to_be_bytes());
    key[8..].copy_from_slice(hash.as_bytes());
    key
}

fn hash_from_number_key(key: &[u8]) -> DbResult<BlockHash> {
    key.get(8..40)
        .and_then(|slice| <[u8; 32]>::try_from(slice).ok())
        .map(BlockHash)
        .ok_or_else(|| DbError::Serialization("malformed number index key".to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
