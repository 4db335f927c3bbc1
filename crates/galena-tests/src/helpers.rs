//! Shared test helpers for the end-to-end suite.

use galena_core::genesis::GENESIS_BITS;
use galena_core::merkle;
use galena_core::script::{self, Address};
use galena_core::types::*;
use galena_core::validation;

/// A throwaway address from a seed byte.
pub fn addr(seed: u8) -> Address {
    Address([seed; 20])
}

/// Standard pay-to-pubkey-hash output script for a seed address.
pub fn p2pkh(seed: u8) -> Vec<u8> {
    script::pay_to_pubkey_hash(&addr(seed))
}

/// A coinbase transaction made unique by its tag.
pub fn coinbase(tag: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            value: 5_000_000_000,
            script_pubkey: p2pkh(tag as u8),
        }],
        lock_time: 0,
    }
}

/// A transaction spending the given outpoints into one standard output.
pub fn spend(outpoints: Vec<OutPoint>, value: i64, to: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: outpoints
            .into_iter()
            .map(|previous_output| TxInput {
                previous_output,
                script_sig: vec![],
                sequence: 0xffff_ffff,
            })
            .collect(),
        outputs: vec![TxOutput { value, script_pubkey: p2pkh(to) }],
        lock_time: 0,
    }
}

/// Build a block over the transactions and grind the nonce until its
/// header meets the easy test target.
pub fn make_block(prev: Hash256, timestamp: u32, txs: Vec<Transaction>) -> Block {
    let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_hash: prev,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            bits: GENESIS_BITS,
            nonce: 0,
        },
        transactions: txs,
    };
    while validation::check_proof_of_work(&block.header).is_err() {
        block.header.nonce += 1;
    }
    block
}
