//! The transaction store: a mempool with shared verification.
//!
//! Every transaction hash owns at most one entry, a tagged sum over
//! three states: *verifying* (carrying the waiter queue that gives
//! concurrent submitters one shared verification), *accepted* (in the
//! pool, spent outpoints indexed for conflict detection), or *orphan*
//! (parked until its missing source transaction appears).
//!
//! Acceptance resolves each input against accepted pool entries first
//! and durable storage second, then runs the pluggable script verifier
//! off the event path. Confirmation (a `TxAdd` chain event) removes the
//! confirmed transaction and recursively evicts every pool transaction
//! that conflicts with its inputs.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use galena_core::error::TxError;
use galena_core::script::{self, Address, ScriptVerifier};
use galena_core::types::{Hash256, OutPoint, Transaction, TxOutput};

use crate::events::{ChainEvent, EVENT_CAPACITY, PoolEvent};
use crate::store::Storage;

/// The final verdict delivered to every submitter of a hash.
pub type VerifyOutcome = Result<Arc<Transaction>, TxError>;

/// Result of submitting a transaction to the pool.
#[derive(Debug)]
pub struct Submission {
    /// True when this call started a verification (or was rejected
    /// synchronously), false when it joined one already in flight or
    /// hit an already-accepted entry.
    pub started: bool,
    /// The verification outcome for the transaction.
    pub outcome: VerifyOutcome,
}

/// One entry per transaction hash.
enum PoolEntry {
    /// Verification in flight; later submitters queue here.
    Verifying {
        waiters: Vec<oneshot::Sender<VerifyOutcome>>,
        /// Set by [`TransactionStore::remove`]: drop the entry once
        /// verification succeeds.
        remove_after_verify: bool,
    },
    /// Verified and unconfirmed.
    Accepted { tx: Arc<Transaction>, first_seen: u64 },
    /// Waiting for a missing source transaction.
    Orphan { tx: Arc<Transaction>, missing: Hash256 },
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<Hash256, PoolEntry>,
    /// Missing source txid → orphans waiting on it. Every value here is
    /// an `Orphan` key in `entries`.
    orphans_by_missing: HashMap<Hash256, Vec<Hash256>>,
    /// Outpoint → accepted pool transaction spending it.
    spent_by: HashMap<OutPoint, Hash256>,
}

/// Per-address transaction index and event fan-out, maintained when
/// live accounting is enabled.
#[derive(Default)]
pub struct Accounting {
    index: Mutex<HashMap<Address, Vec<Hash256>>>,
    subscribers: Mutex<HashMap<Address, broadcast::Sender<PoolEvent>>>,
}

impl Accounting {
    /// Pool transactions currently indexed for an address.
    pub fn txids_for(&self, address: &Address) -> Vec<Hash256> {
        self.index.lock().get(address).cloned().unwrap_or_default()
    }

    /// Subscribe to pool events touching an address.
    pub fn subscribe(&self, address: Address) -> broadcast::Receiver<PoolEvent> {
        self.subscribers
            .lock()
            .entry(address)
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .subscribe()
    }

    fn record(&self, address: Address, txid: Hash256) {
        let mut index = self.index.lock();
        let list = index.entry(address).or_default();
        if !list.contains(&txid) {
            list.push(txid);
        }
    }

    fn forget(&self, address: &Address, txid: &Hash256) {
        let mut index = self.index.lock();
        if let Some(list) = index.get_mut(address) {
            list.retain(|id| id != txid);
            if list.is_empty() {
                index.remove(address);
            }
        }
    }

    fn notify(&self, address: &Address, event: PoolEvent) {
        if let Some(sender) = self.subscribers.lock().get(address) {
            let _ = sender.send(event);
        }
    }
}

/// The memory pool of unconfirmed transactions.
pub struct TransactionStore {
    inner: Mutex<PoolInner>,
    storage: Arc<dyn Storage>,
    verifier: Arc<dyn ScriptVerifier>,
    events: broadcast::Sender<PoolEvent>,
    accounting: Option<Accounting>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl TransactionStore {
    /// Create a pool over the given storage and script verifier.
    pub fn new(storage: Arc<dyn Storage>, verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            storage,
            verifier,
            events: broadcast::channel(EVENT_CAPACITY).0,
            accounting: None,
            clock: Box::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs()
            }),
        }
    }

    /// Enable the per-address accounting index.
    pub fn with_accounting(mut self) -> Self {
        self.accounting = Some(Accounting::default());
        self
    }

    /// Replace the clock used for first-seen stamps (testing).
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// The accounting index, when enabled.
    pub fn accounting(&self) -> Option<&Accounting> {
        self.accounting.as_ref()
    }

    /// Submit a transaction for verification and pool admission.
    ///
    /// Concurrent submissions of the same hash share one verification:
    /// later callers join the first one's waiter queue and receive the
    /// same outcome. Returns a boxed future because promoted orphans
    /// re-enter `add` from within a completing verification.
    pub fn add(
        self: &Arc<Self>,
        tx: Transaction,
    ) -> Pin<Box<dyn Future<Output = Submission> + Send + 'static>> {
        let store = Arc::clone(self);
        Box::pin(async move { store.add_inner(tx).await })
    }

    async fn add_inner(self: Arc<Self>, tx: Transaction) -> Submission {
        let txid = tx.txid();

        enum Decision {
            Join(oneshot::Receiver<VerifyOutcome>),
            Done(VerifyOutcome),
            Reject(TxError),
            Run,
        }

        let decision = {
            let mut inner = self.inner.lock();

            // A re-announced orphan gets a fresh verification attempt:
            // its source may have confirmed in a block since.
            if matches!(inner.entries.get(&txid), Some(PoolEntry::Orphan { .. })) {
                Self::drop_orphan(&mut inner, &txid);
            }

            match inner.entries.get_mut(&txid) {
                Some(PoolEntry::Verifying { waiters, .. }) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    Decision::Join(receiver)
                }
                Some(PoolEntry::Accepted { tx, .. }) => Decision::Done(Ok(Arc::clone(tx))),
                Some(PoolEntry::Orphan { .. }) => Decision::Reject(TxError::Abandoned),
                None => {
                    if tx.is_coinbase() {
                        Decision::Reject(TxError::CoinbaseOutsideBlock)
                    } else if !self.verifier.is_standard(&tx) {
                        Decision::Reject(TxError::NonStandard(
                            "fails the standard template predicate",
                        ))
                    } else {
                        inner.entries.insert(
                            txid,
                            PoolEntry::Verifying {
                                waiters: Vec::new(),
                                remove_after_verify: false,
                            },
                        );
                        Decision::Run
                    }
                }
            }
        };

        match decision {
            Decision::Join(receiver) => {
                let outcome = receiver.await.unwrap_or(Err(TxError::Abandoned));
                Submission { started: false, outcome }
            }
            Decision::Done(outcome) => Submission { started: false, outcome },
            Decision::Reject(error) => {
                debug!(%txid, %error, "transaction rejected before verification");
                Submission { started: true, outcome: Err(error) }
            }
            Decision::Run => {
                let tx = Arc::new(tx);
                let result = self.verify(txid, &tx).await;
                let outcome = self.complete(txid, tx, result);
                Submission { started: true, outcome }
            }
        }
    }

    /// Resolve every input and run the script verifier. Returns the
    /// resolved previous outputs, input-aligned, for address derivation.
    async fn verify(
        &self,
        txid: Hash256,
        tx: &Arc<Transaction>,
    ) -> Result<Vec<TxOutput>, TxError> {
        let mut resolved = Vec::with_capacity(tx.inputs.len());
        let mut seen: HashSet<OutPoint> = HashSet::new();

        for input in &tx.inputs {
            let outpoint = input.previous_output.clone();
            if !seen.insert(outpoint.clone()) {
                return Err(TxError::DoubleSpend(outpoint));
            }
            {
                let inner = self.inner.lock();
                if let Some(spender) = inner.spent_by.get(&outpoint) {
                    if *spender != txid {
                        return Err(TxError::DoubleSpend(outpoint));
                    }
                }
            }
            let Some(source) = self.lookup_source(&outpoint.txid)? else {
                return Err(TxError::MissingSource { missing: outpoint.txid });
            };
            let prev_out = source
                .outputs
                .get(outpoint.index as usize)
                .cloned()
                .ok_or_else(|| TxError::UnknownOutput(outpoint.clone()))?;
            resolved.push(prev_out);
        }

        // Script checks may be expensive; keep them off the event path.
        let verifier = Arc::clone(&self.verifier);
        let tx_for_scripts = Arc::clone(tx);
        let prev_outs = resolved.clone();
        tokio::task::spawn_blocking(move || {
            for (index, prev_out) in prev_outs.iter().enumerate() {
                verifier.verify_input(&tx_for_scripts, index, prev_out)?;
            }
            Ok::<(), TxError>(())
        })
        .await
        .map_err(|_| TxError::Abandoned)??;

        Ok(resolved)
    }

    /// Find a source transaction: accepted pool entries first, then storage.
    fn lookup_source(&self, txid: &Hash256) -> Result<Option<Transaction>, TxError> {
        {
            let inner = self.inner.lock();
            if let Some(PoolEntry::Accepted { tx, .. }) = inner.entries.get(txid) {
                return Ok(Some((**tx).clone()));
            }
        }
        match self.storage.tx_by_hash(txid) {
            Ok(Some(stored)) => Ok(Some(stored.tx)),
            Ok(None) => Ok(None),
            Err(error) => Err(TxError::Storage(error.0)),
        }
    }

    /// Settle a finished verification: transition the entry, wake every
    /// waiter, emit events, and re-feed orphans that were waiting.
    fn complete(
        self: &Arc<Self>,
        txid: Hash256,
        tx: Arc<Transaction>,
        result: Result<Vec<TxOutput>, TxError>,
    ) -> VerifyOutcome {
        let waiters: Vec<oneshot::Sender<VerifyOutcome>>;
        let mut accepted = false;
        let mut deferred_remove = false;
        let mut prev_outs: Vec<TxOutput> = Vec::new();
        let mut refeed: Vec<Transaction> = Vec::new();
        let outcome: VerifyOutcome;

        {
            let mut inner = self.inner.lock();
            let (entry_waiters, remove_after) = match inner.entries.remove(&txid) {
                Some(PoolEntry::Verifying { waiters, remove_after_verify }) => {
                    (waiters, remove_after_verify)
                }
                other => {
                    error!(%txid, "verification completed for unexpected entry state");
                    if let Some(entry) = other {
                        inner.entries.insert(txid, entry);
                    }
                    return Err(TxError::Abandoned);
                }
            };
            waiters = entry_waiters;

            match result {
                Ok(outs) => {
                    // An entry accepted while we verified may have claimed
                    // one of our outpoints.
                    let conflict = tx.inputs.iter().find_map(|input| {
                        match inner.spent_by.get(&input.previous_output) {
                            Some(spender) if *spender != txid => {
                                Some(input.previous_output.clone())
                            }
                            _ => None,
                        }
                    });
                    if let Some(outpoint) = conflict {
                        outcome = Err(TxError::DoubleSpend(outpoint));
                    } else {
                        for input in &tx.inputs {
                            inner.spent_by.insert(input.previous_output.clone(), txid);
                        }
                        inner.entries.insert(
                            txid,
                            PoolEntry::Accepted {
                                tx: Arc::clone(&tx),
                                first_seen: (self.clock)(),
                            },
                        );
                        accepted = true;
                        deferred_remove = remove_after;
                        prev_outs = outs;
                        if let Some(waiting) = inner.orphans_by_missing.remove(&txid) {
                            for orphan_id in waiting {
                                if let Some(PoolEntry::Orphan { tx: orphan_tx, .. }) =
                                    inner.entries.remove(&orphan_id)
                                {
                                    refeed.push((*orphan_tx).clone());
                                }
                            }
                        }
                        outcome = Ok(Arc::clone(&tx));
                    }
                }
                Err(TxError::MissingSource { missing }) => {
                    // Callers learn about the missing source now; the
                    // parent may never arrive.
                    if !remove_after {
                        inner.entries.insert(
                            txid,
                            PoolEntry::Orphan { tx: Arc::clone(&tx), missing },
                        );
                        inner.orphans_by_missing.entry(missing).or_default().push(txid);
                    }
                    outcome = Err(TxError::MissingSource { missing });
                }
                Err(error) => outcome = Err(error),
            }
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        if accepted {
            self.emit(PoolEvent::TxNotify { tx: Arc::clone(&tx), txid });
            if let Some(accounting) = &self.accounting {
                for address in addresses_from(&tx, &prev_outs) {
                    accounting.record(address, txid);
                    accounting.notify(&address, PoolEvent::TxNotify { tx: Arc::clone(&tx), txid });
                }
            }
            for orphan in refeed {
                self.resubmit(orphan);
            }
            if deferred_remove {
                self.remove(&txid);
            }
        }

        outcome
    }

    /// Re-submit a promoted orphan on its own task.
    fn resubmit(self: &Arc<Self>, tx: Transaction) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let txid = tx.txid();
            let submission = store.add(tx).await;
            match submission.outcome {
                Ok(_) => debug!(%txid, "orphan transaction promoted"),
                Err(error) => debug!(%txid, %error, "orphan re-submission failed"),
            }
        });
    }

    /// Fetch a transaction, waiting for an in-flight verification.
    ///
    /// Returns the accepted transaction, or `None` for unknown hashes,
    /// parked orphans, and verifications that fail.
    pub async fn get(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        let receiver = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(txid) {
                Some(PoolEntry::Accepted { tx, .. }) => return Some(Arc::clone(tx)),
                Some(PoolEntry::Verifying { waiters, .. }) => {
                    let (sender, receiver) = oneshot::channel();
                    waiters.push(sender);
                    receiver
                }
                _ => return None,
            }
        };
        receiver.await.ok().and_then(Result::ok)
    }

    /// The accepted transaction for a hash, without waiting.
    pub fn accepted(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        match self.inner.lock().entries.get(txid) {
            Some(PoolEntry::Accepted { tx, .. }) => Some(Arc::clone(tx)),
            _ => None,
        }
    }

    /// First-seen timestamp of an accepted transaction.
    pub fn first_seen(&self, txid: &Hash256) -> Option<u64> {
        match self.inner.lock().entries.get(txid) {
            Some(PoolEntry::Accepted { first_seen, .. }) => Some(*first_seen),
            _ => None,
        }
    }

    /// Whether the pool has seen this hash in any state (verifying,
    /// accepted, or orphan). Inv deduplication wants the superset.
    pub fn is_known(&self, txid: &Hash256) -> bool {
        self.inner.lock().entries.contains_key(txid)
    }

    /// Number of accepted transactions.
    pub fn accepted_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, PoolEntry::Accepted { .. }))
            .count()
    }

    /// Number of parked orphan transactions.
    pub fn orphan_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, PoolEntry::Orphan { .. }))
            .count()
    }

    /// Remove a transaction from the pool.
    ///
    /// Accepted entries are dropped now, with a `TxCancel`. A verifying
    /// entry is flagged for removal once its verification succeeds (a
    /// failed one is already gone). Orphans are discarded silently;
    /// they were never announced.
    pub fn remove(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        enum Action {
            Took(Arc<Transaction>),
            Nothing,
        }

        let action = {
            let mut inner = self.inner.lock();
            match inner.entries.remove(txid) {
                Some(PoolEntry::Verifying { waiters, .. }) => {
                    inner.entries.insert(
                        *txid,
                        PoolEntry::Verifying { waiters, remove_after_verify: true },
                    );
                    Action::Nothing
                }
                Some(PoolEntry::Accepted { tx, .. }) => {
                    let outpoints: Vec<OutPoint> =
                        tx.inputs.iter().map(|i| i.previous_output.clone()).collect();
                    for outpoint in outpoints {
                        if inner.spent_by.get(&outpoint) == Some(txid) {
                            inner.spent_by.remove(&outpoint);
                        }
                    }
                    Action::Took(tx)
                }
                Some(PoolEntry::Orphan { missing, .. }) => {
                    if let Some(list) = inner.orphans_by_missing.get_mut(&missing) {
                        list.retain(|id| id != txid);
                        if list.is_empty() {
                            inner.orphans_by_missing.remove(&missing);
                        }
                    }
                    Action::Nothing
                }
                None => Action::Nothing,
            }
        };

        match action {
            Action::Took(tx) => {
                self.emit_cancel(&tx, *txid);
                Some(tx)
            }
            Action::Nothing => None,
        }
    }

    /// Handle a `TxAdd` chain event: the transaction confirmed, so drop
    /// it from the pool and evict every pool transaction spending any
    /// of the same outpoints, recursively across their descendants.
    pub fn handle_tx_add(&self, tx: &Transaction) {
        let txid = tx.txid();
        if self.remove(&txid).is_some() {
            debug!(%txid, "confirmed transaction left the pool");
        }

        let mut queue: Vec<Hash256> = {
            let inner = self.inner.lock();
            tx.inputs
                .iter()
                .filter(|input| !input.previous_output.is_null())
                .filter_map(|input| inner.spent_by.get(&input.previous_output).copied())
                .filter(|spender| *spender != txid)
                .collect()
        };

        let mut evicted = HashSet::new();
        while let Some(victim) = queue.pop() {
            if !evicted.insert(victim) {
                continue;
            }
            let Some(victim_tx) = self.accepted(&victim) else {
                continue;
            };
            {
                let inner = self.inner.lock();
                for index in 0..victim_tx.outputs.len() {
                    let outpoint = OutPoint { txid: victim, index: index as u32 };
                    if let Some(child) = inner.spent_by.get(&outpoint).copied() {
                        queue.push(child);
                    }
                }
            }
            self.remove(&victim);
            info!(txid = %victim, "evicted conflicting mempool transaction");
        }
    }

    /// Forward `TxAdd` chain events into [`handle_tx_add`](Self::handle_tx_add)
    /// until the chain's event channel closes.
    pub fn spawn_confirmation_listener(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ChainEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChainEvent::TxAdd { tx, .. }) => store.handle_tx_add(&tx),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "pool lagged behind chain events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Remove an orphan entry and its reverse-index reference.
    fn drop_orphan(inner: &mut PoolInner, txid: &Hash256) -> Option<Arc<Transaction>> {
        match inner.entries.remove(txid) {
            Some(PoolEntry::Orphan { tx, missing }) => {
                if let Some(list) = inner.orphans_by_missing.get_mut(&missing) {
                    list.retain(|id| id != txid);
                    if list.is_empty() {
                        inner.orphans_by_missing.remove(&missing);
                    }
                }
                Some(tx)
            }
            Some(other) => {
                inner.entries.insert(*txid, other);
                None
            }
            None => None,
        }
    }

    /// Addresses touched by a transaction leaving the pool, resolving
    /// input sources best-effort.
    fn cancel_addresses(&self, tx: &Transaction) -> Vec<Address> {
        let mut prev_outs = Vec::new();
        for input in &tx.inputs {
            if input.previous_output.is_null() {
                continue;
            }
            if let Ok(Some(source)) = self.lookup_source(&input.previous_output.txid) {
                if let Some(out) = source.outputs.get(input.previous_output.index as usize) {
                    prev_outs.push(out.clone());
                }
            }
        }
        addresses_from(tx, &prev_outs)
    }

    fn emit_cancel(&self, tx: &Arc<Transaction>, txid: Hash256) {
        self.emit(PoolEvent::TxCancel { tx: Arc::clone(tx), txid });
        if let Some(accounting) = &self.accounting {
            for address in self.cancel_addresses(tx) {
                accounting.forget(&address, &txid);
                accounting.notify(&address, PoolEvent::TxCancel { tx: Arc::clone(tx), txid });
            }
        }
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }
}

/// Deduplicated addresses from a transaction's outputs and its resolved
/// input sources.
fn addresses_from(tx: &Transaction, prev_outs: &[TxOutput]) -> Vec<Address> {
    let mut addresses = Vec::new();
    for out in tx.outputs.iter().chain(prev_outs.iter()) {
        if let Some(address) = script::extract_address(&out.script_pubkey) {
            if !addresses.contains(&address) {
                addresses.push(address);
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use galena_core::script::AcceptAll;
    use galena_core::types::{TxInput, TxOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Script verifier that counts invocations and optionally stalls,
    /// to make verification overlap observable.
    struct CountingVerifier {
        verified: AtomicUsize,
        delay: Duration,
    }

    impl CountingVerifier {
        fn new(delay: Duration) -> Self {
            Self { verified: AtomicUsize::new(0), delay }
        }
    }

    impl ScriptVerifier for CountingVerifier {
        fn verify_input(
            &self,
            _tx: &Transaction,
            _input_index: usize,
            _prev_out: &TxOutput,
        ) -> Result<(), TxError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.verified.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_standard(&self, _tx: &Transaction) -> bool {
            true
        }
    }

    fn spend(source: Hash256, index: u32, tag: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: source, index },
                script_sig: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 10, script_pubkey: vec![0xac] }],
            lock_time: tag,
        }
    }

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: vec![1],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![0xac] }],
            lock_time: 0,
        }
    }

    /// A pool over fresh storage seeded with one confirmed source tx.
    fn seeded_pool(verifier: Arc<dyn ScriptVerifier>) -> (Arc<TransactionStore>, Hash256) {
        let storage = Arc::new(MemoryStorage::new());
        let source = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: vec![9],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![
                TxOutput { value: 30, script_pubkey: vec![0xac] },
                TxOutput { value: 20, script_pubkey: vec![0xac] },
            ],
            lock_time: 0,
        };
        let source_id = source.txid();
        storage.put_tx(&source, &Hash256([0xBB; 32]), 1).unwrap();
        let pool = Arc::new(
            TransactionStore::new(storage, verifier).with_clock(|| 1_000),
        );
        (pool, source_id)
    }

    fn drain(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    // --- acceptance ---

    #[tokio::test]
    async fn accepts_valid_spend() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);
        let txid = tx.txid();

        let submission = pool.add(tx).await;
        assert!(submission.started);
        assert_eq!(submission.outcome.unwrap().txid(), txid);

        assert!(pool.is_known(&txid));
        assert!(pool.accepted(&txid).is_some());
        assert_eq!(pool.first_seen(&txid), Some(1_000));
        assert_eq!(pool.accepted_count(), 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PoolEvent::TxNotify { txid: id, .. } if *id == txid));
    }

    #[tokio::test]
    async fn accepted_resubmission_returns_immediately() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);

        pool.add(tx.clone()).await.outcome.unwrap();
        drain(&mut rx);

        let submission = pool.add(tx).await;
        assert!(!submission.started);
        assert!(submission.outcome.is_ok());
        // No second notify.
        assert!(drain(&mut rx).is_empty());
    }

    // --- synchronous rejects ---

    #[tokio::test]
    async fn rejects_coinbase() {
        let (pool, _) = seeded_pool(Arc::new(AcceptAll));
        let submission = pool.add(coinbase()).await;
        assert!(submission.started);
        assert!(matches!(submission.outcome, Err(TxError::CoinbaseOutsideBlock)));
        assert!(!pool.is_known(&coinbase().txid()));
    }

    #[tokio::test]
    async fn rejects_non_standard() {
        let (pool, source) = seeded_pool(Arc::new(galena_core::script::TemplateVerifier));
        // Bare OP_RETURN-ish output is not a standard template.
        let mut tx = spend(source, 0, 1);
        tx.outputs[0].script_pubkey = vec![0x6a];
        let submission = pool.add(tx.clone()).await;
        assert!(matches!(submission.outcome, Err(TxError::NonStandard(_))));
        assert!(!pool.is_known(&tx.txid()));
    }

    // --- verification failures ---

    #[tokio::test]
    async fn unknown_output_index_rejected() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let tx = spend(source, 7, 1);
        let submission = pool.add(tx.clone()).await;
        assert!(matches!(submission.outcome, Err(TxError::UnknownOutput(_))));
        // Failed entries are gone entirely.
        assert!(!pool.is_known(&tx.txid()));
    }

    #[tokio::test]
    async fn pool_double_spend_rejected() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        pool.add(spend(source, 0, 1)).await.outcome.unwrap();

        let conflict = spend(source, 0, 2);
        let submission = pool.add(conflict.clone()).await;
        assert!(matches!(submission.outcome, Err(TxError::DoubleSpend(_))));
        assert!(!pool.is_known(&conflict.txid()));
    }

    #[tokio::test]
    async fn duplicate_outpoint_within_tx_rejected() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut tx = spend(source, 0, 1);
        tx.inputs.push(tx.inputs[0].clone());
        let submission = pool.add(tx).await;
        assert!(matches!(submission.outcome, Err(TxError::DoubleSpend(_))));
    }

    // --- shared verification ---

    #[tokio::test]
    async fn concurrent_adds_share_one_verification() {
        let verifier = Arc::new(CountingVerifier::new(Duration::from_millis(20)));
        let (pool, source) = seeded_pool(Arc::clone(&verifier) as Arc<dyn ScriptVerifier>);
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);

        let (a, b) = tokio::join!(pool.add(tx.clone()), pool.add(tx));
        assert!(a.outcome.is_ok());
        assert!(b.outcome.is_ok());
        // Exactly one of the two started the verification.
        assert!(a.started ^ b.started);
        assert_eq!(verifier.verified.load(Ordering::SeqCst), 1);

        // Exactly one notify.
        let notifies = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PoolEvent::TxNotify { .. }))
            .count();
        assert_eq!(notifies, 1);
    }

    #[tokio::test]
    async fn get_waits_for_in_flight_verification() {
        let verifier = Arc::new(CountingVerifier::new(Duration::from_millis(20)));
        let (pool, source) = seeded_pool(verifier as Arc<dyn ScriptVerifier>);
        let tx = spend(source, 0, 1);
        let txid = tx.txid();

        let add = pool.add(tx);
        let get = pool.get(&txid);
        let (submission, fetched) = tokio::join!(add, get);
        assert!(submission.outcome.is_ok());
        assert_eq!(fetched.unwrap().txid(), txid);
    }

    #[tokio::test]
    async fn get_unknown_is_none() {
        let (pool, _) = seeded_pool(Arc::new(AcceptAll));
        assert!(pool.get(&Hash256([0x5A; 32])).await.is_none());
    }

    // --- orphans ---

    #[tokio::test]
    async fn missing_source_parks_orphan() {
        let (pool, _) = seeded_pool(Arc::new(AcceptAll));
        let missing = Hash256([0x77; 32]);
        let child = spend(missing, 0, 1);
        let child_id = child.txid();

        let submission = pool.add(child).await;
        match submission.outcome {
            Err(TxError::MissingSource { missing: m }) => assert_eq!(m, missing),
            other => panic!("expected MissingSource, got {other:?}"),
        }
        assert!(pool.is_known(&child_id));
        assert!(pool.accepted(&child_id).is_none());
        assert_eq!(pool.orphan_count(), 1);
    }

    #[tokio::test]
    async fn orphan_promoted_when_source_arrives() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut rx = pool.subscribe();

        // Parent P spends the seeded source; child C spends P.
        let parent = spend(source, 0, 1);
        let parent_id = parent.txid();
        let child = spend(parent_id, 0, 2);
        let child_id = child.txid();

        let submission = pool.add(child).await;
        assert!(matches!(submission.outcome, Err(TxError::MissingSource { .. })));

        pool.add(parent).await.outcome.unwrap();

        wait_until(|| pool.accepted(&child_id).is_some()).await;
        assert_eq!(pool.orphan_count(), 0);
        assert_eq!(pool.accepted_count(), 2);

        // Two notifies, parent first.
        let notified: Vec<Hash256> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                PoolEvent::TxNotify { txid, .. } => Some(txid),
                _ => None,
            })
            .collect();
        assert_eq!(notified, vec![parent_id, child_id]);
    }

    #[tokio::test]
    async fn orphan_chain_promotes_transitively() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let a = spend(source, 0, 1);
        let b = spend(a.txid(), 0, 2);
        let c = spend(b.txid(), 0, 3);
        let c_id = c.txid();

        pool.add(c).await.outcome.unwrap_err();
        pool.add(b).await.outcome.unwrap_err();
        assert_eq!(pool.orphan_count(), 2);

        pool.add(a).await.outcome.unwrap();
        wait_until(|| pool.accepted(&c_id).is_some()).await;
        assert_eq!(pool.accepted_count(), 3);
        assert_eq!(pool.orphan_count(), 0);
    }

    // --- removal ---

    #[tokio::test]
    async fn remove_accepted_emits_cancel() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);
        let txid = tx.txid();
        pool.add(tx).await.outcome.unwrap();
        drain(&mut rx);

        let removed = pool.remove(&txid);
        assert!(removed.is_some());
        assert!(!pool.is_known(&txid));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PoolEvent::TxCancel { txid: id, .. } if *id == txid));

        // The freed outpoint is spendable again.
        let replacement = spend(source, 0, 2);
        assert!(pool.add(replacement).await.outcome.is_ok());
    }

    #[tokio::test]
    async fn remove_during_verification_is_deferred() {
        let verifier = Arc::new(CountingVerifier::new(Duration::from_millis(100)));
        let (pool, source) = seeded_pool(verifier as Arc<dyn ScriptVerifier>);
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);
        let txid = tx.txid();

        let handle = tokio::spawn(pool.add(tx));
        wait_until(|| pool.is_known(&txid)).await;

        // Still verifying: remove defers.
        assert!(pool.remove(&txid).is_none());

        let submission = handle.await.unwrap();
        assert!(submission.outcome.is_ok());
        // The entry was dropped right after acceptance.
        assert!(pool.accepted(&txid).is_none());
        assert!(!pool.is_known(&txid));

        let kinds: Vec<bool> = drain(&mut rx)
            .iter()
            .map(|e| matches!(e, PoolEvent::TxNotify { .. }))
            .collect();
        // Notify then cancel.
        assert_eq!(kinds, vec![true, false]);
    }

    #[tokio::test]
    async fn remove_unknown_is_none() {
        let (pool, _) = seeded_pool(Arc::new(AcceptAll));
        assert!(pool.remove(&Hash256([1; 32])).is_none());
    }

    // --- confirmation handling ---

    #[tokio::test]
    async fn confirmation_removes_pooled_tx() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let mut rx = pool.subscribe();
        let tx = spend(source, 0, 1);
        let txid = tx.txid();
        pool.add(tx.clone()).await.outcome.unwrap();
        drain(&mut rx);

        pool.handle_tx_add(&tx);

        assert!(!pool.is_known(&txid));
        let events = drain(&mut rx);
        assert!(matches!(&events[0], PoolEvent::TxCancel { txid: id, .. } if *id == txid));
    }

    #[tokio::test]
    async fn confirmation_evicts_conflicts_and_descendants() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));

        // Pool: A spends source:0, B spends A:0 (descendant).
        let a = spend(source, 0, 1);
        let a_id = a.txid();
        let b = spend(a_id, 0, 2);
        let b_id = b.txid();
        pool.add(a).await.outcome.unwrap();
        pool.add(b).await.outcome.unwrap();

        // A different transaction spending source:0 confirms.
        let confirmed = spend(source, 0, 99);
        pool.handle_tx_add(&confirmed);

        assert!(!pool.is_known(&a_id));
        assert!(!pool.is_known(&b_id));
        assert_eq!(pool.accepted_count(), 0);
    }

    #[tokio::test]
    async fn confirmation_spares_unrelated() {
        let (pool, source) = seeded_pool(Arc::new(AcceptAll));
        let unrelated = spend(source, 1, 1);
        let unrelated_id = unrelated.txid();
        pool.add(unrelated).await.outcome.unwrap();

        let confirmed = spend(source, 0, 99);
        pool.handle_tx_add(&confirmed);

        assert!(pool.is_known(&unrelated_id));
        assert_eq!(pool.accepted_count(), 1);
    }

    // --- accounting ---

    fn p2pkh(seed: u8) -> Vec<u8> {
        script::pay_to_pubkey_hash(&Address([seed; 20]))
    }

    #[tokio::test]
    async fn accounting_indexes_output_addresses() {
        let storage = Arc::new(MemoryStorage::new());
        let source = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: vec![9],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 30, script_pubkey: p2pkh(0xB0) }],
            lock_time: 0,
        };
        let source_id = source.txid();
        storage.put_tx(&source, &Hash256([0xBB; 32]), 1).unwrap();

        let pool = Arc::new(
            TransactionStore::new(storage, Arc::new(AcceptAll)).with_accounting(),
        );

        let recipient = Address([0xA0; 20]);
        let mut addr_rx = pool.accounting().unwrap().subscribe(recipient);

        let mut tx = spend(source_id, 0, 1);
        tx.outputs[0].script_pubkey = p2pkh(0xA0);
        let txid = tx.txid();
        pool.add(tx).await.outcome.unwrap();

        // Output address and resolved input-source address are indexed.
        assert_eq!(pool.accounting().unwrap().txids_for(&recipient), vec![txid]);
        assert_eq!(
            pool.accounting().unwrap().txids_for(&Address([0xB0; 20])),
            vec![txid]
        );
        assert!(matches!(addr_rx.try_recv().unwrap(), PoolEvent::TxNotify { .. }));

        // Cancellation clears the index and notifies the address.
        pool.remove(&txid);
        assert!(pool.accounting().unwrap().txids_for(&recipient).is_empty());
        assert!(matches!(addr_rx.try_recv().unwrap(), PoolEvent::TxCancel { .. }));
    }
}
