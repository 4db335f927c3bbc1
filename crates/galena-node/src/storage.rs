//! RocksDB-backed durable storage.
//!
//! Implements the chain engine's [`Storage`] trait over column
//! families for block records, transactions, the parent index, the
//! active-height index, and metadata. Multi-key writes go through an
//! atomic [`WriteBatch`].

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};

use galena_chain::{BlockRecord, Storage, StoredTx};
use galena_core::error::StorageError;
use galena_core::types::{Hash256, Transaction};

const CF_BLOCKS: &str = "blocks";
const CF_TXS: &str = "txs";
const CF_PREV_INDEX: &str = "prev_index";
const CF_HEIGHT_INDEX: &str = "height_index";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[CF_BLOCKS, CF_TXS, CF_PREV_INDEX, CF_HEIGHT_INDEX, CF_METADATA];

const META_TIP_HASH: &[u8] = b"tip_hash";

fn rocks_err(error: rocksdb::Error) -> StorageError {
    StorageError(error.to_string())
}

fn codec_err(error: impl std::fmt::Display) -> StorageError {
    StorageError(format!("storage codec: {error}"))
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Hash256, StorageError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StorageError("stored hash is not 32 bytes".to_string()))?;
    Ok(Hash256(array))
}

/// RocksDB-backed [`Storage`] implementation.
pub struct RocksStorage {
    db: DB,
}

impl RocksStorage {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, descriptors).map_err(rocks_err)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError(format!("missing column family {name}")))
    }

    /// Parent-index key: `prev_hash || block_hash`.
    fn prev_index_key(prev: &Hash256, hash: &Hash256) -> [u8; 64] {
        let mut key = [0u8; 64];
        key[..32].copy_from_slice(prev.as_bytes());
        key[32..].copy_from_slice(hash.as_bytes());
        key
    }
}

impl Storage for RocksStorage {
    fn put_block(&self, record: &BlockRecord) -> Result<(), StorageError> {
        let bytes =
            bincode::encode_to_vec(record, bincode::config::standard()).map_err(codec_err)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_BLOCKS)?, record.hash.as_bytes(), bytes);
        batch.put_cf(
            self.cf(CF_PREV_INDEX)?,
            Self::prev_index_key(&record.header.prev_hash, &record.hash),
            b"",
        );
        self.db.write(batch).map_err(rocks_err)
    }

    fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, StorageError> {
        let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_BLOCKS)?, hash.as_bytes())
            .map_err(rocks_err)?
        else {
            return Ok(None);
        };
        let (record, _): (BlockRecord, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).map_err(codec_err)?;
        Ok(Some(record))
    }

    fn blocks_by_prev(&self, prev: &Hash256) -> Result<Vec<BlockRecord>, StorageError> {
        let cf = self.cf(CF_PREV_INDEX)?;
        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prev.as_bytes(), rocksdb::Direction::Forward));
        for entry in iter {
            let (key, _) = entry.map_err(rocks_err)?;
            if !key.starts_with(prev.as_bytes()) {
                break;
            }
            let child = hash_from_bytes(&key[32..])?;
            if let Some(record) = self.block_by_hash(&child)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn put_tx(&self, tx: &Transaction, block_hash: &Hash256, index: u32) -> Result<(), StorageError> {
        let stored = StoredTx { tx: tx.clone(), block_hash: *block_hash, index };
        let bytes =
            bincode::encode_to_vec(&stored, bincode::config::standard()).map_err(codec_err)?;
        self.db
            .put_cf(self.cf(CF_TXS)?, tx.txid().as_bytes(), bytes)
            .map_err(rocks_err)
    }

    fn tx_by_hash(&self, txid: &Hash256) -> Result<Option<StoredTx>, StorageError> {
        let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_TXS)?, txid.as_bytes())
            .map_err(rocks_err)?
        else {
            return Ok(None);
        };
        let (stored, _): (StoredTx, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).map_err(codec_err)?;
        Ok(Some(stored))
    }

    fn link_height(&self, height: u32, hash: &Hash256) -> Result<(), StorageError> {
        self.db
            .put_cf(self.cf(CF_HEIGHT_INDEX)?, height.to_be_bytes(), hash.as_bytes())
            .map_err(rocks_err)
    }

    fn unlink_height(&self, height: u32) -> Result<(), StorageError> {
        self.db
            .delete_cf(self.cf(CF_HEIGHT_INDEX)?, height.to_be_bytes())
            .map_err(rocks_err)
    }

    fn active_hash_at_height(&self, height: u32) -> Result<Option<Hash256>, StorageError> {
        let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_HEIGHT_INDEX)?, height.to_be_bytes())
            .map_err(rocks_err)?
        else {
            return Ok(None);
        };
        Ok(Some(hash_from_bytes(&bytes)?))
    }

    fn tip_hash(&self) -> Result<Option<Hash256>, StorageError> {
        let Some(bytes) = self
            .db
            .get_cf(self.cf(CF_METADATA)?, META_TIP_HASH)
            .map_err(rocks_err)?
        else {
            return Ok(None);
        };
        Ok(Some(hash_from_bytes(&bytes)?))
    }

    fn put_tip_hash(&self, hash: &Hash256) -> Result<(), StorageError> {
        self.db
            .put_cf(self.cf(CF_METADATA)?, META_TIP_HASH, hash.as_bytes())
            .map_err(rocks_err)
    }
}
