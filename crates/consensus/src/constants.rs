//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;

/// Threshold for `lock_time`: below this value it is a block height, otherwise a unix time.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Interpret sequence numbers as relative lock-time constraints.
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;
/// Use the median time past instead of the block time for lock-time cutoffs.
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;
/// Lock-time flags applied to candidate transactions outside of block connection.
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_012;
/// Peers at or above this version understand `sendheaders`.
pub const SENDHEADERS_VERSION: i32 = 70_012;
/// Peers below this version cannot serve blocks by `getheaders`.
pub const GETHEADERS_VERSION: i32 = 31_800;

/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum age of the tip before the node considers itself in initial download.
pub const DEFAULT_MAX_TIP_AGE: i64 = 24 * 60 * 60;
/// Headers may be at most this far in the future relative to adjusted time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks used for median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Block version top bits signalling BIP9 version-bits semantics.
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: i32 = 0xE000_0000_u32 as i32;
pub const VERSIONBITS_NUM_BITS: u32 = 29;
pub const VERSIONBITS_LAST_OLD_BLOCK_VERSION: i32 = 4;
