//! Protocol constants. All monetary values in leads (1 GAL = 10^8 leads).

pub const COIN: i64 = 100_000_000;

/// Hard cap on total issuance.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Wire magic prefix identifying the Galena network.
pub const MAGIC_BYTES: [u8; 4] = [0x47, 0x41, 0x4C, 0x4E]; // "GALN"

pub const PROTOCOL_VERSION: u32 = 70_001;

/// Maximum serialized block size accepted from the network.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum serialized transaction size accepted for relay.
pub const MAX_TX_SIZE: usize = 100_000;

/// Maximum script length the decoder will allocate.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Decoder caps on collection counts, enforced before allocation.
pub const MAX_TX_INPUTS: u64 = 4_096;
pub const MAX_TX_OUTPUTS: u64 = 4_096;
pub const MAX_BLOCK_TXS: u64 = 16_384;

/// A block timestamp may run at most this far ahead of wall clock.
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Maximum entries in one `inv` or `getdata` message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Maximum block hashes returned for one `getblocks` request.
pub const GETBLOCKS_RESPONSE_CAP: usize = 500;

/// Maximum locator hashes considered from a peer.
pub const MAX_LOCATOR_SIZE: usize = 64;

pub const DEFAULT_P2P_PORT: u16 = 9333;
