//! The block chain engine: authoritative block index and active tip.
//!
//! [`BlockChain::add`] runs the full admission pipeline: duplicate
//! check, context-free validation, parent linkage, chain-work
//! derivation, pre-persist hooks, tip selection (extend / reorganize /
//! side-chain), and orphan-pool drain. The chain lock is held across
//! the whole pipeline, so the events of one block never interleave with
//! another's.
//!
//! Reorganizations walk parent pointers to the fork point, gather the
//! complete revoke and apply lists up front, and only then execute
//! them; the in-memory tip moves last, so a storage failure leaves the
//! previous tip in force.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use galena_core::bits;
use galena_core::constants::MAX_LOCATOR_SIZE;
use galena_core::error::ChainError;
use galena_core::types::{Block, Hash256, Transaction};
use galena_core::validation;

use crate::events::{ChainEvent, EVENT_CAPACITY};
use crate::store::{BlockRecord, Storage};

/// Pre-persist hook, run at the `BlockAdd` point of the pipeline.
///
/// Hooks observe the derived record before anything is written. An
/// error aborts admission of that block.
pub trait BlockHook: Send + Sync {
    fn on_block_add(&self, record: &BlockRecord, block: &Block) -> Result<(), ChainError>;
}

/// How an admitted block changed the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The block was already stored; nothing happened.
    AlreadyKnown,
    /// The parent is unknown; the block is parked in the orphan pool.
    PendingParent,
    /// The block extended the active tip.
    Extended { height: u32 },
    /// The block was stored on a side chain with less work.
    SideChain { height: u32 },
    /// The block triggered a reorganization onto its branch.
    Reorged { revoked: usize, adopted: usize, height: u32 },
}

struct ChainInner {
    /// The active tip record. `None` until [`BlockChain::init`] runs.
    tip: Option<BlockRecord>,
    /// Orphan blocks keyed by the parent hash they are waiting for.
    orphans: HashMap<Hash256, Vec<Block>>,
    /// Hashes currently parked in `orphans`, for duplicate suppression.
    orphan_hashes: HashSet<Hash256>,
}

/// The block chain engine.
pub struct BlockChain {
    storage: Arc<dyn Storage>,
    events: broadcast::Sender<ChainEvent>,
    state: Mutex<ChainInner>,
    hooks: RwLock<Vec<Box<dyn BlockHook>>>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
    genesis: Block,
}

impl BlockChain {
    /// Create an engine over the given storage with the system clock.
    pub fn new(storage: Arc<dyn Storage>, genesis: Block) -> Self {
        Self::with_clock(storage, genesis, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })
    }

    /// Create an engine with a custom clock for testing.
    pub fn with_clock(
        storage: Arc<dyn Storage>,
        genesis: Block,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage,
            events,
            state: Mutex::new(ChainInner {
                tip: None,
                orphans: HashMap::new(),
                orphan_hashes: HashSet::new(),
            }),
            hooks: RwLock::new(Vec::new()),
            clock: Box::new(clock),
            genesis,
        }
    }

    /// Subscribe to chain events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.events.subscribe()
    }

    /// Install a pre-persist hook.
    pub fn install_hook(&self, hook: Box<dyn BlockHook>) {
        self.hooks.write().push(hook);
    }

    /// Ensure the genesis block is stored and rehydrate the active tip.
    pub fn init(&self) -> Result<(), ChainError> {
        let mut inner = self.state.lock();

        if let Some(tip_hash) = self.storage.tip_hash()? {
            let record = self.storage.block_by_hash(&tip_hash)?.ok_or_else(|| {
                ChainError::Fatal(format!("tip {tip_hash} missing from storage"))
            })?;
            info!(height = record.height, hash = %record.hash, "chain tip rehydrated");
            inner.tip = Some(record);
            return Ok(());
        }

        let hash = self.genesis.hash();
        let record = BlockRecord {
            header: self.genesis.header,
            hash,
            height: 0,
            size: self.genesis.serialized_size() as u32,
            active: true,
            chain_work: bits::ChainWork::from_biguint(&bits::work_from_bits(
                self.genesis.header.bits,
            )),
            tx_hashes: self.genesis.txids(),
        };
        self.storage.put_block(&record)?;
        for (index, tx) in self.genesis.transactions.iter().enumerate() {
            self.storage.put_tx(tx, &hash, index as u32)?;
        }
        self.storage.link_height(0, &hash)?;
        self.storage.put_tip_hash(&hash)?;
        info!(hash = %hash, "genesis block connected");
        inner.tip = Some(record);
        Ok(())
    }

    /// The current active tip, if initialized.
    pub fn tip(&self) -> Option<BlockRecord> {
        self.state.lock().tip.clone()
    }

    /// Number of blocks parked in the orphan pool.
    pub fn orphan_count(&self) -> usize {
        self.state.lock().orphan_hashes.len()
    }

    /// Look up a block record by hash.
    pub fn block_by_hash(&self, hash: &Hash256) -> Result<Option<BlockRecord>, ChainError> {
        Ok(self.storage.block_by_hash(hash)?)
    }

    /// Resolve a block locator: the first entry on the active chain
    /// wins, else the genesis block.
    pub fn block_by_locator(&self, locator: &[Hash256]) -> Result<BlockRecord, ChainError> {
        for hash in locator.iter().take(MAX_LOCATOR_SIZE) {
            if let Some(record) = self.storage.block_by_hash(hash)? {
                if record.active {
                    return Ok(record);
                }
            }
        }
        self.storage
            .block_by_hash(&self.genesis.hash())?
            .ok_or(ChainError::NotInitialized)
    }

    /// Active-chain block hashes from `from_height` upward, at most `cap`.
    pub fn active_range(&self, from_height: u32, cap: usize) -> Result<Vec<Hash256>, ChainError> {
        let mut hashes = Vec::new();
        let mut height = from_height;
        while hashes.len() < cap {
            match self.storage.active_hash_at_height(height)? {
                Some(hash) => hashes.push(hash),
                None => break,
            }
            height += 1;
        }
        Ok(hashes)
    }

    /// Run the admission pipeline for one block, then drain any orphans
    /// that were waiting on it.
    pub fn add(&self, block: Block) -> Result<AddOutcome, ChainError> {
        let mut inner = self.state.lock();
        let (outcome, admitted) = self.ingest(&mut inner, block)?;
        if let Some(hash) = admitted {
            self.drain_orphans(&mut inner, hash);
        }
        Ok(outcome)
    }

    /// One pass of the pipeline. Returns the outcome plus the admitted
    /// hash when the block is now in storage (feeds the orphan drain).
    fn ingest(
        &self,
        inner: &mut ChainInner,
        block: Block,
    ) -> Result<(AddOutcome, Option<Hash256>), ChainError> {
        let hash = block.hash();

        if self.storage.knows_block(&hash)? {
            return Ok((AddOutcome::AlreadyKnown, None));
        }

        validation::validate_block(&block, (self.clock)())?;

        let parent = match self.storage.block_by_hash(&block.header.prev_hash)? {
            Some(parent) => parent,
            None => {
                if inner.orphan_hashes.insert(hash) {
                    debug!(%hash, prev = %block.header.prev_hash, "parent unknown, block parked");
                    inner
                        .orphans
                        .entry(block.header.prev_hash)
                        .or_default()
                        .push(block);
                } else {
                    debug!(%hash, "duplicate orphan ignored");
                }
                return Ok((AddOutcome::PendingParent, None));
            }
        };

        let mut record = BlockRecord {
            header: block.header,
            hash,
            height: parent.height + 1,
            size: block.serialized_size() as u32,
            active: false,
            chain_work: parent
                .chain_work
                .plus(&bits::work_from_bits(block.header.bits)),
            tx_hashes: block.txids(),
        };

        for hook in self.hooks.read().iter() {
            hook.on_block_add(&record, &block)?;
        }
        self.emit(ChainEvent::BlockAdd { hash, height: record.height });

        let tip = inner.tip.clone().ok_or(ChainError::NotInitialized)?;

        let outcome = if parent.hash == tip.hash {
            record.active = true;
            self.storage.put_block(&record)?;
            for (index, tx) in block.transactions.iter().enumerate() {
                self.storage.put_tx(tx, &hash, index as u32)?;
            }
            self.storage.link_height(record.height, &hash)?;
            self.emit_tx_adds(hash, &block.transactions);
            self.storage.put_tip_hash(&hash)?;
            inner.tip = Some(record.clone());
            self.emit(ChainEvent::BlockSave { hash, height: record.height });
            debug!(height = record.height, %hash, "tip extended");
            AddOutcome::Extended { height: record.height }
        } else if record.chain_work > tip.chain_work {
            let (revoked, adopted) = self.reorganize(inner, &tip, &record, &block)?;
            AddOutcome::Reorged { revoked, adopted, height: record.height }
        } else {
            // Equal work keeps the incumbent: first seen wins.
            self.storage.put_block(&record)?;
            for (index, tx) in block.transactions.iter().enumerate() {
                if self.storage.tx_by_hash(&record.tx_hashes[index])?.is_none() {
                    self.storage.put_tx(tx, &hash, index as u32)?;
                }
            }
            self.emit(ChainEvent::BlockSave { hash, height: record.height });
            debug!(height = record.height, %hash, "side-chain block stored");
            AddOutcome::SideChain { height: record.height }
        };

        Ok((outcome, Some(hash)))
    }

    /// Re-feed orphans whose parent just landed, to fixpoint.
    fn drain_orphans(&self, inner: &mut ChainInner, first: Hash256) {
        let mut queue = vec![first];
        while let Some(parent_hash) = queue.pop() {
            let Some(children) = inner.orphans.remove(&parent_hash) else {
                continue;
            };
            for child in children {
                let child_hash = child.hash();
                inner.orphan_hashes.remove(&child_hash);
                match self.ingest(inner, child) {
                    Ok((_, Some(admitted))) => queue.push(admitted),
                    Ok((_, None)) => {}
                    Err(error) => {
                        warn!(hash = %child_hash, %error, "orphaned block failed admission");
                    }
                }
            }
        }
    }

    /// Switch the active chain onto the branch ending at `new_record`.
    ///
    /// Plan first: collect the revoke list (old tip down to the fork
    /// point, exclusive) and the apply list (fork point exclusive up to
    /// the new tip) with their transactions, then execute. All revokes
    /// are emitted before any apply.
    fn reorganize(
        &self,
        inner: &mut ChainInner,
        old_tip: &BlockRecord,
        new_record: &BlockRecord,
        new_block: &Block,
    ) -> Result<(usize, usize), ChainError> {
        // New branch ancestors, child-first, down to the first active
        // block. That block is the fork point: the active chain is
        // linear, so the first active ancestor is the common ancestor.
        let mut branch: Vec<BlockRecord> = Vec::new();
        let mut cursor = self
            .storage
            .block_by_hash(&new_record.header.prev_hash)?
            .ok_or_else(|| ChainError::Fatal("reorg parent vanished".into()))?;
        while !cursor.active {
            let prev = cursor.header.prev_hash;
            branch.push(cursor);
            cursor = self.storage.block_by_hash(&prev)?.ok_or_else(|| {
                ChainError::Fatal(format!("broken parent link at {prev}"))
            })?;
        }
        let fork = cursor;

        // Old branch from the tip down to the fork point, tip-first.
        let mut revoke: Vec<(BlockRecord, Vec<Transaction>)> = Vec::new();
        let mut cursor = old_tip.clone();
        while cursor.hash != fork.hash {
            if cursor.height == 0 {
                return Err(ChainError::Fatal(
                    "reorg walk reached genesis without finding the fork point".into(),
                ));
            }
            let txs = self.load_block_txs(&cursor)?;
            let prev = cursor.header.prev_hash;
            revoke.push((cursor, txs));
            cursor = self.storage.block_by_hash(&prev)?.ok_or_else(|| {
                ChainError::Fatal(format!("broken parent link at {prev}"))
            })?;
        }

        // Apply list in ascending height order, ending with the new block.
        let mut apply: Vec<(BlockRecord, Vec<Transaction>)> = Vec::new();
        for record in branch.into_iter().rev() {
            let txs = self.load_block_txs(&record)?;
            apply.push((record, txs));
        }
        apply.push((new_record.clone(), new_block.transactions.clone()));

        info!(
            fork_height = fork.height,
            revoked = revoke.len(),
            adopted = apply.len(),
            new_tip = %new_record.hash,
            "reorganizing chain"
        );

        // Execute: revoke the abandoned branch first.
        for (record, txs) in &revoke {
            for tx in txs {
                self.emit(ChainEvent::TxRevoke {
                    tx: Arc::new(tx.clone()),
                    txid: tx.txid(),
                    block_hash: record.hash,
                });
            }
            let mut revoked = record.clone();
            revoked.active = false;
            self.storage.put_block(&revoked)?;
            self.storage.unlink_height(revoked.height)?;
            self.emit(ChainEvent::BlockRevoke { hash: revoked.hash, height: revoked.height });
        }

        // Then adopt the new branch.
        for (record, txs) in &apply {
            let mut adopted = record.clone();
            adopted.active = true;
            self.storage.put_block(&adopted)?;
            for (index, tx) in txs.iter().enumerate() {
                self.storage.put_tx(tx, &adopted.hash, index as u32)?;
            }
            self.storage.link_height(adopted.height, &adopted.hash)?;
            self.emit_tx_adds(adopted.hash, txs);
            self.emit(ChainEvent::BlockSave { hash: adopted.hash, height: adopted.height });
        }

        self.storage.put_tip_hash(&new_record.hash)?;
        let mut new_tip = new_record.clone();
        new_tip.active = true;
        inner.tip = Some(new_tip);

        Ok((revoke.len(), apply.len()))
    }

    /// Fetch the transaction bodies of a stored block.
    fn load_block_txs(&self, record: &BlockRecord) -> Result<Vec<Transaction>, ChainError> {
        record
            .tx_hashes
            .iter()
            .map(|txid| {
                self.storage
                    .tx_by_hash(txid)?
                    .map(|stored| stored.tx)
                    .ok_or_else(|| {
                        ChainError::Fatal(format!(
                            "transaction {txid} of block {} missing from storage",
                            record.hash
                        ))
                    })
            })
            .collect()
    }

    fn emit_tx_adds(&self, block_hash: Hash256, txs: &[Transaction]) {
        for (index, tx) in txs.iter().enumerate() {
            let txid = tx.txid();
            self.emit(ChainEvent::TxAdd {
                tx: Arc::new(tx.clone()),
                txid,
                block_hash,
                index: index as u32,
            });
            self.emit(ChainEvent::TxSave { txid, block_hash });
        }
    }

    fn emit(&self, event: ChainEvent) {
        // A send error only means nobody is subscribed.
        let _ = self.events.send(event);
    }
}
