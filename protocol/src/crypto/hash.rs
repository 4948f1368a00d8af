//! # Hashing Utilities
//!
//! Arbor hashes everything with BLAKE3: block headers, extrinsics roots,
//! and the genesis state commitment. There is exactly one hash function in
//! the protocol and we intend to keep it that way.
//!
//! Header hashes use BLAKE3's `derive_key` mode with a fixed context string
//! so a header preimage can never collide with an extrinsic or state hash
//! computed over the same bytes.

/// Context string for header hashing in `derive_key` mode.
pub const HEADER_HASH_CONTEXT: &str = "arbor 2026-01 block header";

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash multiple byte slices together without concatenating them first.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Domain-separated hash. Two different contexts never produce the same
/// digest for the same input.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute a binary Merkle root over leaf hashes.
///
/// Odd levels duplicate their last element. An empty leaf set yields the
/// all-zero root, and a single leaf is paired with itself so the root is
/// always the output of a hash.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    if level.len() == 1 {
        return blake3_hash_multi(&[level[0].as_slice(), level[0].as_slice()]);
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                blake3_hash_multi(&[left.as_slice(), right.as_slice()])
            })
            .collect();
    }

    level[0]
}
