//! Durable block and transaction storage.
//!
//! The [`Storage`] trait is the engine's only durable collaborator: an
//! opaque content-addressed map from hashes to block records and
//! transactions, plus an active-height index and the tip pointer. The
//! engine decides *what* to write; implementations decide *how*. The
//! in-memory implementation here backs tests; the production node uses
//! RocksDB (galena-node).
//!
//! Blocks are never deleted. Reorgs rewrite records with a toggled
//! `active` flag and relink the height index.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use galena_core::bits::ChainWork;
use galena_core::error::StorageError;
use galena_core::types::{BlockHeader, Hash256, Transaction};

/// A stored block: header plus everything the engine derives at
/// admission time.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockRecord {
    /// The 80-byte header fields.
    pub header: BlockHeader,
    /// Header hash, derived at admission.
    pub hash: Hash256,
    /// Distance from genesis along parent links.
    pub height: u32,
    /// Serialized block size in bytes.
    pub size: u32,
    /// Whether this block is on the active chain.
    pub active: bool,
    /// Cumulative work from genesis through this block.
    pub chain_work: ChainWork,
    /// Transaction IDs in block order.
    pub tx_hashes: Vec<Hash256>,
}

/// A stored transaction with its containing-block reference.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StoredTx {
    /// The transaction body.
    pub tx: Transaction,
    /// Hash of the block the transaction was last stored under.
    pub block_hash: Hash256,
    /// Position within that block.
    pub index: u32,
}

/// Durable mapping used by the chain engine and transaction pool.
///
/// Implementations must serialize writes per key; the engine serializes
/// whole-block write sequences itself. All methods are synchronous; the
/// async boundary lives in the callers.
pub trait Storage: Send + Sync {
    /// Store or overwrite a block record, keyed by its hash. Must also
    /// index the record under `header.prev_hash` for
    /// [`blocks_by_prev`](Self::blocks_by_prev).
    fn put_block(&self, record: &BlockRecord) -> Result<(), StorageError>;

    /// Look up a block record by hash.
    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, StorageError>;

    /// All stored blocks whose parent is `prev`.
    fn blocks_by_prev(&self, prev: &Hash256) -> Result<Vec<BlockRecord>, StorageError>;

    /// Whether a block with this hash is stored.
    ///
    /// Default implementation delegates to [`block_by_hash`](Self::block_by_hash).
    fn knows_block(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.block_by_hash(hash)?.is_some())
    }

    /// Store a transaction with its containing-block reference.
    fn put_tx(&self, tx: &Transaction, block_hash: &Hash256, index: u32) -> Result<(), StorageError>;

    /// Look up a transaction by ID.
    fn tx_by_hash(&self, txid: &Hash256) -> Result<Option<StoredTx>, StorageError>;

    /// Bind a height on the active chain to a block hash.
    fn link_height(&self, height: u32, hash: &Hash256) -> Result<(), StorageError>;

    /// Clear the active-chain binding for a height.
    fn unlink_height(&self, height: u32) -> Result<(), StorageError>;

    /// The active-chain block hash at a height, if any.
    fn active_hash_at_height(&self, height: u32) -> Result<Option<Hash256>, StorageError>;

    /// The persisted tip hash, if one was ever written.
    fn tip_hash(&self) -> Result<Option<Hash256>, StorageError>;

    /// Persist the tip hash.
    fn put_tip_hash(&self, hash: &Hash256) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemInner {
    blocks: HashMap<Hash256, BlockRecord>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    txs: HashMap<Hash256, StoredTx>,
    heights: HashMap<u32, Hash256>,
    tip: Option<Hash256>,
}

/// In-memory [`Storage`] for tests. No persistence, unbounded growth.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemInner>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Number of stored transactions.
    pub fn tx_count(&self) -> usize {
        self.inner.read().txs.len()
    }
}

impl Storage for MemoryStorage {
    fn put_block(&self, record: &BlockRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        let children = inner.by_prev.entry(record.header.prev_hash).or_default();
        if !children.contains(&record.hash) {
            children.push(record.hash);
        }
        inner.blocks.insert(record.hash, record.clone());
        Ok(())
    }

    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, StorageError> {
        Ok(self.inner.read().blocks.get(hash).cloned())
    }

    fn blocks_by_prev(&self, prev: &Hash256) -> Result<Vec<BlockRecord>, StorageError> {
        let inner = self.inner.read();
        let hashes = inner.by_prev.get(prev).cloned().unwrap_or_default();
        Ok(hashes
            .iter()
            .filter_map(|hash| inner.blocks.get(hash).cloned())
            .collect())
    }

    fn put_tx(&self, tx: &Transaction, block_hash: &Hash256, index: u32) -> Result<(), StorageError> {
        self.inner.write().txs.insert(
            tx.txid(),
            StoredTx { tx: tx.clone(), block_hash: *block_hash, index },
        );
        Ok(())
    }

    fn tx_by_hash(&self, txid: &Hash256) -> Result<Option<StoredTx>, StorageError> {
        Ok(self.inner.read().txs.get(txid).cloned())
    }

    fn link_height(&self, height: u32, hash: &Hash256) -> Result<(), StorageError> {
        self.inner.write().heights.insert(height, *hash);
        Ok(())
    }

    fn unlink_height(&self, height: u32) -> Result<(), StorageError> {
        self.inner.write().heights.remove(&height);
        Ok(())
    }

    fn active_hash_at_height(&self, height: u32) -> Result<Option<Hash256>, StorageError> {
        Ok(self.inner.read().heights.get(&height).copied())
    }

    fn tip_hash(&self) -> Result<Option<Hash256>, StorageError> {
        Ok(self.inner.read().tip)
    }

    fn put_tip_hash(&self, hash: &Hash256) -> Result<(), StorageError> {
        self.inner.write().tip = Some(*hash);
        Ok(())
    }
}
