//! # Cryptographic Primitives
//!
//! Arbor only needs hashing: the block tree indexes metadata and leaves
//! signature checks to the consensus collaborator. Everything here is a thin
//! wrapper around the `blake3` crate.

pub mod hash;

pub use hash::{blake3_hash, blake3_hash_multi, domain_separated_hash, merkle_root};
