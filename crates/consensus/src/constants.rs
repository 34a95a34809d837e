//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// Portion of the block size miners fill before fees ramp up.
pub const MAX_BLOCK_SIZE_GEN: usize = MAX_BLOCK_SIZE / 2;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Lock times at or above this value are unix timestamps, below are heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Orphan blocks kept in memory before random eviction.
pub const DEFAULT_MAX_ORPHAN_BLOCKS: usize = 750;
/// Orphan transactions kept in memory before random eviction.
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 10_000;
/// Orphan transactions larger than this are dropped outright.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;

/// Current network protocol version for gossip messages.
pub const PROTOCOL_VERSION: i32 = 60_006;
/// Peers older than this are disconnected during handshake.
pub const MIN_PEER_PROTO_VERSION: i32 = 60_002;

/// Upper bounds on gossip payload vectors.
pub const MAX_INV_ENTRIES: usize = 50_000;
pub const MAX_ADDR_ENTRIES: usize = 1_000;
/// Free transactions relayed per ~10-minute decay window, in kilobytes.
pub const DEFAULT_LIMIT_FREE_RELAY: i64 = 15;

/// Misbehaviour score at which a peer is banned.
pub const BAN_SCORE: u32 = 100;

/// Alerts at or above this priority put the node into safe mode.
pub const ALERT_SAFE_MODE_PRIORITY: i32 = 1_000;

/// A synchronized checkpoint older than this puts the node into safe mode.
pub const SYNC_CHECKPOINT_MAX_AGE: i64 = 10 * 24 * 60 * 60;

/// Rotate block files before they exceed this size.
pub const MAX_BLOCK_FILE_SIZE: u64 = 0x7F00_0000 - MAX_BLOCK_SIZE as u64;

/// Message magic used for signed operator messages.
pub const SIGNED_MESSAGE_MAGIC: &str = "Cinder Signed Message:\n";
