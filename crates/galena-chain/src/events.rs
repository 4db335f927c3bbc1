//! Typed events describing chain and pool transitions.
//!
//! Delivered over tokio broadcast channels. Chain events for a single
//! block are emitted back-to-back while the chain lock is held, so
//! subscribers observe `BlockAdd`, the per-transaction events, and the
//! closing `BlockSave`/`BlockRevoke` without interleaving from other
//! blocks. During a reorg every revoke event precedes every apply event.

use std::sync::Arc;

use galena_core::types::{Hash256, Transaction};

/// Capacity of the chain and pool broadcast channels. A subscriber that
/// lags by more than this many events observes a `Lagged` error rather
/// than blocking the engine.
pub const EVENT_CAPACITY: usize = 1024;

/// Events emitted by the block chain engine.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block passed validation and linkage and is about to persist.
    BlockAdd { hash: Hash256, height: u32 },
    /// A block and its transactions were persisted; for active blocks
    /// this closes the admission bracket.
    BlockSave { hash: Hash256, height: u32 },
    /// A block left the active chain during a reorganization.
    BlockRevoke { hash: Hash256, height: u32 },
    /// A transaction entered the active chain inside `block_hash`.
    TxAdd {
        tx: Arc<Transaction>,
        txid: Hash256,
        block_hash: Hash256,
        index: u32,
    },
    /// A transaction was persisted with its containing-block reference.
    TxSave { txid: Hash256, block_hash: Hash256 },
    /// A transaction left the active chain during a reorganization.
    TxRevoke {
        tx: Arc<Transaction>,
        txid: Hash256,
        block_hash: Hash256,
    },
}

/// Events emitted by the transaction pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A transaction passed verification and entered the pool.
    TxNotify { tx: Arc<Transaction>, txid: Hash256 },
    /// A transaction left the pool (confirmed, conflicted, or removed).
    TxCancel { tx: Arc<Transaction>, txid: Hash256 },
}
