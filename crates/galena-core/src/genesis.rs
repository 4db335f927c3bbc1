//! Genesis block definition for the Galena network.
//!
//! The genesis block (height 0) carries a single coinbase transaction
//! paying the initial subsidy to a fixed pay-to-pubkey-hash script. All
//! values are hardcoded and deterministic; every node computes the
//! identical genesis block, and its header satisfies the proof-of-work
//! check at [`GENESIS_BITS`].

use std::sync::LazyLock;

use crate::constants::COIN;
use crate::script::{self, Address};
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Genesis block timestamp: March 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: u32 = 1_772_323_200;

/// Compact target of the genesis block (regtest-grade difficulty).
pub const GENESIS_BITS: u32 = 0x207f_ffff;

/// Nonce satisfying the genesis proof of work at [`GENESIS_BITS`].
pub const GENESIS_NONCE: u32 = 1;

/// Message embedded in the genesis coinbase input.
pub const GENESIS_MESSAGE: &[u8] = b"The heaviest chain carries the ore. Galena genesis 2026.";

/// Initial block subsidy paid by the genesis coinbase.
pub const GENESIS_REWARD: i64 = 50 * COIN;

/// Address the genesis subsidy pays to.
pub const GENESIS_MINER: Address = Address([
    0xfd, 0x39, 0x10, 0x34, 0xce, 0xaf, 0x01, 0xa8, 0x58, 0xcb,
    0x41, 0x24, 0xb7, 0x86, 0x1f, 0xda, 0x0d, 0xe8, 0xd3, 0xa3,
]);

/// Cached genesis data, computed once on first access.
struct GenesisData {
    block: Block,
    hash: Hash256,
    coinbase_txid: Hash256,
}

static GENESIS: LazyLock<GenesisData> = LazyLock::new(build_genesis);

/// Build the genesis block and cache derived values.
fn build_genesis() -> GenesisData {
    let coinbase = build_genesis_coinbase();
    let coinbase_txid = coinbase.txid();

    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            // Single transaction: the merkle root is the coinbase txid.
            merkle_root: coinbase_txid,
            timestamp: GENESIS_TIMESTAMP,
            bits: GENESIS_BITS,
            nonce: GENESIS_NONCE,
        },
        transactions: vec![coinbase],
    };
    let hash = block.hash();

    GenesisData { block, hash, coinbase_txid }
}

/// Build the genesis coinbase transaction.
fn build_genesis_coinbase() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script_sig: GENESIS_MESSAGE.to_vec(),
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            value: GENESIS_REWARD,
            script_pubkey: script::pay_to_pubkey_hash(&GENESIS_MINER),
        }],
        lock_time: 0,
    }
}

/// The genesis block (height 0).
pub fn genesis_block() -> &'static Block {
    &GENESIS.block
}

/// The genesis block header hash.
pub fn genesis_hash() -> Hash256 {
    GENESIS.hash
}

/// The transaction ID of the genesis coinbase.
pub fn genesis_coinbase_txid() -> Hash256 {
    GENESIS.coinbase_txid
}

/// Check whether a block is the genesis block by comparing header hashes.
pub fn is_genesis(block: &Block) -> bool {
    block.hash() == GENESIS.hash
}
