//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = (MAX_BLOCK_SIZE / 50) as u32;
/// Blocks more than this many seconds ahead of the local clock are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks whose median timestamp bounds a new block.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Lock times below this value are heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Highest transaction version relayed by default.
pub const CURRENT_TX_VERSION: i32 = 1;
/// Transactions at or above this size are not relayed.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
/// Largest standard scriptSig (a 15-of-15 P2SH multisig spend fits).
pub const MAX_STANDARD_SCRIPT_SIG_SIZE: usize = 1_650;
/// Loose transactions larger than this are never kept as orphans.
pub const MAX_ORPHAN_TX_SIZE: usize = 5_000;
/// Fee rate per kilobyte that defines dust, in base units.
pub const MIN_RELAY_TX_FEE: i64 = 1_000;
/// Largest data push accepted in a standard OP_RETURN output.
pub const MAX_OP_RETURN_RELAY: usize = 40;
/// Coinbase scriptSig length bounds.
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;
