// Copyright (c) 2026 Arbor Contributors. MIT License.
// See LICENSE for details.

//! # Arbor Protocol — Core Library
//!
//! The chain-following core of an Arbor node: block types, persistent
//! storage, and the in-memory block tree that decides which fork is best.
//!
//! ## Architecture
//!
//! - **blocktree** — Every unfinalized block header, fork choice, sub-chain
//!   queries, slot arithmetic and finality pruning.
//! - **storage** — Block and header types, plus the sled-backed `ChainDb`.
//! - **network** — Wire messages, the peer status table and the import
//!   service that feeds the tree.
//! - **genesis** — Chain spec loading and first-run database seeding.
//! - **crypto** — BLAKE3 hashing and Merkle roots.
//! - **config** — Protocol constants and defaults.
//!
//! ## Design Notes
//!
//! 1. The tree holds headers only. Bodies stay on disk and are hydrated on
//!    demand, outside the tree lock.
//! 2. Fork choice is deterministic: deepest tip, then earliest arrival, then
//!    lowest hash. Two nodes with the same view pick the same chain.
//! 3. Finality is the only thing that removes blocks.

pub mod blocktree;
pub mod config;
pub mod crypto;
pub mod genesis;
pub mod network;
pub mod storage;
