//! Node composition: the lifecycle state machine and message dispatch.
//!
//! The node wires storage, the block chain engine, and the transaction
//! pool together, then consumes [`PeerEvent`]s from the connection
//! layer. Lifecycle: `Created → Init → NetConnect → BlockDownload →
//! Active`; initialization may never be re-entered.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use galena_chain::{BlockChain, Storage, TransactionStore};
use galena_core::constants::{GETBLOCKS_RESPONSE_CAP, MAX_INV_ENTRIES};
use galena_core::error::{ChainError, TxError};
use galena_core::script::{ScriptVerifier, TemplateVerifier};
use galena_core::types::{Block, Hash256, Transaction};

use crate::config::NodeConfig;
use crate::messages::{InvItem, InvKind, Message};
use crate::peer::{Connection, PeerEvent, PeerManager, TxRebroadcast};

/// Lifecycle states of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, not started.
    Created,
    /// Block chain initialization in progress.
    Init,
    /// Initialized; waiting for the first ready peer.
    NetConnect,
    /// Downloading blocks from peers.
    BlockDownload,
    /// Caught up with the network.
    Active,
}

/// The full node.
pub struct Node {
    chain: Arc<BlockChain>,
    pool: Arc<TransactionStore>,
    peers: Arc<dyn PeerManager>,
    storage: Arc<dyn Storage>,
    rebroadcast: RwLock<Option<Arc<dyn TxRebroadcast>>>,
    state: Mutex<NodeState>,
    running: AtomicBool,
}

impl Node {
    /// Assemble a node over the given storage and peer manager.
    pub fn new(
        config: &NodeConfig,
        storage: Arc<dyn Storage>,
        peers: Arc<dyn PeerManager>,
    ) -> Result<Arc<Self>, ChainError> {
        let genesis = config
            .genesis_block()
            .map_err(|error| ChainError::Fatal(error.to_string()))?;
        let chain = Arc::new(BlockChain::new(Arc::clone(&storage), genesis));
        let verifier: Arc<dyn ScriptVerifier> = Arc::new(TemplateVerifier);
        let mut pool = TransactionStore::new(Arc::clone(&storage), verifier);
        if config.live_accounting {
            pool = pool.with_accounting();
        }

        Ok(Arc::new(Self {
            chain,
            pool: Arc::new(pool),
            peers,
            storage,
            rebroadcast: RwLock::new(None),
            state: Mutex::new(NodeState::Created),
            running: AtomicBool::new(false),
        }))
    }

    /// The block chain engine.
    pub fn chain(&self) -> &Arc<BlockChain> {
        &self.chain
    }

    /// The transaction pool.
    pub fn pool(&self) -> &Arc<TransactionStore> {
        &self.pool
    }

    /// Install the transaction rebroadcaster.
    pub fn set_rebroadcast(&self, rebroadcast: Arc<dyn TxRebroadcast>) {
        *self.rebroadcast.write() = Some(rebroadcast);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// True from `NetConnect` onward.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drive `Created → Init → NetConnect`: initialize the chain, wire
    /// the pool to chain confirmations, and start accepting peers.
    ///
    /// Must run inside a tokio runtime (the confirmation listener is a
    /// spawned task). Starting twice is an error; `Init` may never be
    /// re-entered.
    pub fn start(self: &Arc<Self>) -> Result<(), ChainError> {
        {
            let mut state = self.state.lock();
            if *state != NodeState::Created {
                return Err(ChainError::Fatal(format!(
                    "start() called in state {:?}; initialization may not be re-entered",
                    *state
                )));
            }
            *state = NodeState::Init;
        }

        info!("initializing block chain");
        self.chain.init()?;
        self.pool.spawn_confirmation_listener(self.chain.subscribe());

        *self.state.lock() = NodeState::NetConnect;
        self.running.store(true, Ordering::SeqCst);
        if let Some(tip) = self.chain.tip() {
            info!(height = tip.height, hash = %tip.hash, "node running, waiting for peers");
        }
        Ok(())
    }

    /// First peer is ready: enter block download and ask it for blocks.
    pub fn on_net_connected(&self) {
        {
            let mut state = self.state.lock();
            if *state != NodeState::NetConnect {
                return;
            }
            *state = NodeState::BlockDownload;
        }
        info!("first peer ready, entering block download");
        let message = Message::GetBlocks { locator: self.build_locator(), stop: Hash256::ZERO };
        for connection in self.peers.active_connections() {
            if let Err(error) = connection.send(message.clone()) {
                warn!(peer = %connection.peer_label(), %error, "getblocks send failed");
            }
        }
    }

    /// Build a block locator for the active chain: dense near the tip,
    /// exponentially sparser toward genesis, genesis always last.
    pub fn build_locator(&self) -> Vec<Hash256> {
        let Some(tip) = self.chain.tip() else {
            return Vec::new();
        };
        let mut hashes = Vec::new();
        let mut step: u32 = 1;
        let mut height = i64::from(tip.height);
        loop {
            if let Ok(Some(hash)) = self.storage.active_hash_at_height(height as u32) {
                hashes.push(hash);
            }
            if height == 0 {
                break;
            }
            if hashes.len() >= 10 {
                step = step.saturating_mul(2);
            }
            height = (height - i64::from(step)).max(0);
        }
        hashes
    }

    /// Consume peer events until the channel closes.
    pub fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<PeerEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            debug!("peer event channel closed, node loop exiting");
        })
    }

    /// Dispatch one peer event.
    pub async fn handle_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::Connected => self.on_net_connected(),
            PeerEvent::Message { from, message } => self.handle_message(&from, message).await,
        }
    }

    /// Dispatch one inbound message.
    pub async fn handle_message(self: &Arc<Self>, from: &Arc<dyn Connection>, message: Message) {
        match message {
            Message::Inv(items) => self.handle_inv(from, items),
            Message::Block(block) => self.handle_block(block),
            Message::Tx(tx) => self.handle_tx(tx).await,
            Message::GetData(items) => self.handle_getdata(from, items),
            Message::GetBlocks { locator, stop } => self.handle_getblocks(from, &locator, stop),
        }
    }

    /// Answer an inventory announcement with one `getdata` for every
    /// entry we do not have, preserving announcement order.
    fn handle_inv(&self, from: &Arc<dyn Connection>, items: Vec<InvItem>) {
        let mut unknown = Vec::new();
        for item in items.into_iter().take(MAX_INV_ENTRIES) {
            let known = match item.kind {
                InvKind::Tx => self.pool.is_known(&item.hash),
                InvKind::Block => match self.storage.knows_block(&item.hash) {
                    Ok(known) => known,
                    Err(error) => {
                        warn!(%error, hash = %item.hash, "storage lookup failed during inv");
                        true
                    }
                },
            };
            if !known {
                unknown.push(item);
            }
        }
        if unknown.is_empty() {
            return;
        }
        debug!(peer = %from.peer_label(), count = unknown.len(), "requesting unknown inventory");
        if let Err(error) = from.send(Message::GetData(unknown)) {
            warn!(peer = %from.peer_label(), %error, "getdata send failed");
        }
    }

    /// Feed an inbound block through the chain engine.
    fn handle_block(&self, block: Block) {
        let hash = block.hash();
        match self.chain.add(block) {
            Ok(outcome) => debug!(%hash, ?outcome, "block processed"),
            Err(error) => warn!(%hash, %error, "block rejected"),
        }
    }

    /// Feed an inbound transaction through the pool, distinguishing a
    /// missing source from an outright rejection.
    async fn handle_tx(self: &Arc<Self>, tx: Transaction) {
        let txid = tx.txid();
        if self.pool.is_known(&txid) {
            debug!(%txid, "transaction already known");
            return;
        }
        let submission = self.pool.add(tx).await;
        match submission.outcome {
            Ok(_) => debug!(%txid, "transaction accepted"),
            Err(TxError::MissingSource { missing }) => {
                info!(%txid, %missing, "transaction parked, source missing");
            }
            Err(error) => warn!(%txid, %error, "transaction rejected"),
        }
    }

    /// Serve `getdata` requests from the pool. Serving blocks is not
    /// implemented yet; peers re-request them elsewhere.
    fn handle_getdata(&self, from: &Arc<dyn Connection>, items: Vec<InvItem>) {
        for item in items.into_iter().take(MAX_INV_ENTRIES) {
            match item.kind {
                InvKind::Tx => {
                    if let Some(tx) = self.pool.accepted(&item.hash) {
                        if let Err(error) = from.send(Message::Tx((*tx).clone())) {
                            warn!(peer = %from.peer_label(), %error, "tx send failed");
                        }
                    }
                }
                InvKind::Block => {
                    debug!(hash = %item.hash, "getdata for blocks not served yet");
                }
            }
        }
    }

    /// Answer `getblocks`: resolve the locator on the active chain and
    /// announce the following block hashes, up to the protocol cap or
    /// the requested stop hash.
    fn handle_getblocks(&self, from: &Arc<dyn Connection>, locator: &[Hash256], stop: Hash256) {
        let start = match self.chain.block_by_locator(locator) {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "locator resolution failed");
                return;
            }
        };
        let mut hashes = match self.chain.active_range(start.height + 1, GETBLOCKS_RESPONSE_CAP) {
            Ok(hashes) => hashes,
            Err(error) => {
                warn!(%error, "active range walk failed");
                return;
            }
        };
        if !stop.is_zero() {
            if let Some(position) = hashes.iter().position(|hash| *hash == stop) {
                hashes.truncate(position + 1);
            }
        }
        if hashes.is_empty() {
            return;
        }
        debug!(peer = %from.peer_label(), count = hashes.len(), from_height = start.height + 1, "answering getblocks");
        let items = hashes.into_iter().map(InvItem::block).collect();
        if let Err(error) = from.send(Message::Inv(items)) {
            warn!(peer = %from.peer_label(), %error, "inv send failed");
        }
    }

    /// Fan an inventory announcement out to every active connection.
    pub fn send_inv(&self, items: Vec<InvItem>) {
        let message = Message::Inv(items);
        for connection in self.peers.active_connections() {
            if let Err(error) = connection.send(message.clone()) {
                warn!(peer = %connection.peer_label(), %error, "inv send failed");
            }
        }
    }

    /// Submit a locally-originated transaction: pool admission, then
    /// rebroadcaster registration and an inv announcement.
    pub async fn send_tx(self: &Arc<Self>, tx: Transaction) -> Result<Arc<Transaction>, TxError> {
        let txid = tx.txid();
        let submission = self.pool.add(tx).await;
        let tx = submission.outcome?;
        if let Some(rebroadcast) = self.rebroadcast.read().clone() {
            rebroadcast.register(Arc::clone(&tx));
        }
        self.send_inv(vec![InvItem::tx(txid)]);
        Ok(tx)
    }
}
