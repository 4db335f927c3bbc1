//! Error types for the Galena protocol.
use thiserror::Error;

use crate::types::{Hash256, OutPoint};

/// Errors raised while decoding consensus-encoded data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")] UnexpectedEnd,
    #[error("non-canonical varint encoding")] NonCanonicalVarint,
    #[error("collection length {len} exceeds cap {max}")] OversizedCollection { len: u64, max: u64 },
    #[error("trailing bytes after decode")] TrailingBytes,
}

/// Errors raised during block validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("proof of work does not meet target")] InvalidPow,
    #[error("unusable compact target {0:#010x}")] InvalidTarget(u32),
    #[error("timestamp {timestamp} past allowed horizon {horizon}")] TimestampTooFar { timestamp: u32, horizon: u64 },
    #[error("block has no transactions")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("coinbase at position {0}")] MultipleCoinbase(usize),
    #[error("merkle root mismatch")] InvalidMerkleRoot,
    #[error("oversized block: {size} > {max}")] OversizedBlock { size: usize, max: usize },
}

/// Errors raised while verifying a transaction for the memory pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("coinbase transaction outside a block")] CoinbaseOutsideBlock,
    #[error("non-standard transaction: {0}")] NonStandard(&'static str),
    #[error("missing source transaction {missing}")] MissingSource { missing: Hash256 },
    #[error("input references unknown output {0}")] UnknownOutput(OutPoint),
    #[error("double spend of {0}")] DoubleSpend(OutPoint),
    #[error("script rejected input {index}: {reason}")] Script { index: usize, reason: String },
    #[error("storage: {0}")] Storage(String),
    #[error("verification abandoned")] Abandoned,
}

/// Opaque error surfaced by a storage implementation. Carried as-is;
/// the engine never interprets the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("storage: {0}")]
pub struct StorageError(pub String);

/// Errors surfaced by the block chain engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error(transparent)] Codec(#[from] CodecError),
    #[error("rejected by block hook: {0}")] HookAborted(String),
    #[error("chain not initialized")] NotInitialized,
    #[error("consistency violation: {0}")] Fatal(String),
}
