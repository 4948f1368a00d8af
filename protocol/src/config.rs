//! # Protocol Configuration & Constants
//!
//! Network-wide numbers live here so the tree, the import service and the
//! node binary agree on them. Runtime knobs (ports, paths, log level) are
//! clap flags in the node crate and only default to the values below.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Version advertised in our status message. Peers must match it exactly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version we still speak. Also compared on handshake.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Default libp2p-style protocol id, used when the genesis file omits one.
pub const DEFAULT_PROTOCOL_ID: &str = "/arbor/1";

/// Role bitmask for a full node in status messages.
pub const ROLE_FULL: u8 = 0b0000_0001;

/// Role bitmask for a block authoring node.
pub const ROLE_AUTHORITY: u8 = 0b0000_0100;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Slot length. Every slot number handed out by the tree is counted in
/// steps of this size from genesis arrival.
pub const SLOT_DURATION: Duration = Duration::from_secs(6);

/// [`SLOT_DURATION`] in milliseconds, the unit arrival times are kept in.
pub const SLOT_DURATION_MS: u64 = 6_000;

// ---------------------------------------------------------------------------
// Sync & Import
// ---------------------------------------------------------------------------

/// Upper bound on buffered blocks whose parent has not arrived yet. When
/// full, the oldest orphan is evicted first.
pub const ORPHAN_POOL_CAPACITY: usize = 1_024;

/// How many hashes pruned by finalization we remember, so blocks building
/// on a dead fork are recognized instead of buffered.
pub const PRUNED_HASH_MEMORY: usize = 4_096;

/// Largest `max` we honor in a block request, and the most we ask for.
pub const MAX_BLOCKS_PER_REQUEST: u32 = 128;

/// Depth of the inbound/outbound network message queues.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 1_024;

/// Depth of the chain event broadcast. Slow subscribers that fall further
/// behind than this see a `Lagged` error and skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Depth of the peer manager's command queue.
pub const PEER_COMMAND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Node Defaults
// ---------------------------------------------------------------------------

/// Default HTTP API port.
pub const DEFAULT_RPC_PORT: u16 = 9933;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9615;

/// Default data directory, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = "./arbor-data";

/// Genesis file read by `arbor-node init` when no path is given.
pub const DEFAULT_GENESIS_PATH: &str = "./genesis.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_duration_units_agree() {
        assert_eq!(SLOT_DURATION.as_millis() as u64, SLOT_DURATION_MS);
        assert!(SLOT_DURATION_MS > 0);
    }

    #[test]
    fn test_version_window_is_ordered() {
        assert!(MIN_SUPPORTED_VERSION <= PROTOCOL_VERSION);
    }

    #[test]
    fn test_ports_are_distinct() {
        assert_ne!(DEFAULT_RPC_PORT, DEFAULT_METRICS_PORT);
    }

    #[test]
    fn test_roles_do_not_overlap() {
        assert_eq!(ROLE_FULL & ROLE_AUTHORITY, 0);
    }
}
