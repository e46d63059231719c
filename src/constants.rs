//! Chain state constants

/// Maximum money supply: 21,000,000 coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;

/// Satoshis per coin
pub const COIN: i64 = 100_000_000;

/// Blocks a coinbase output must wait before it can be spent
pub const COINBASE_MATURITY: u32 = 100;

/// Default maximum block size: 32MB
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 32_000_000;

/// Largest length prefix accepted when decoding a vector
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Protocol version that introduced compact blocks (BIP152)
pub const SHORT_IDS_BLOCKS_VERSION: u32 = 70014;

/// Protocol version spoken by default
pub const PROTOCOL_VERSION: u32 = 70015;

/// Height assigned to coins that only exist in the mempool
pub const MEMPOOL_HEIGHT: i32 = 0x7FFF_FFFF;

/// Serialized block header size
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Bytes per short transaction ID on the wire
pub const SHORT_TXID_LENGTH: usize = 6;

/// Mask keeping the low 48 bits of a SipHash output
pub const SHORT_TXID_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Output index carried by the null prevout of a coinbase input
pub const COINBASE_PREVOUT_INDEX: u32 = 0xffffffff;

/// Default age after which a tip is considered stale (initial download)
pub const DEFAULT_MAX_TIP_AGE: u64 = 24 * 60 * 60;
