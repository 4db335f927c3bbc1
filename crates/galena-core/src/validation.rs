//! Context-free block validation.
//!
//! Checks run in a fixed order before a block touches storage:
//! proof of work, timestamp horizon, transaction list shape, merkle
//! root, size cap. Contextual decisions (parent linkage, chain work,
//! tip selection) belong to the chain engine.
//!
//! Difficulty retarget verification is deliberately absent: inbound
//! `bits` are accepted as given. A conforming peer network makes this
//! safe only against lazy attackers; closing the gap needs the retarget
//! rule checked at every period boundary.

use crate::bits;
use crate::constants::{MAX_BLOCK_SIZE, MAX_FUTURE_BLOCK_TIME};
use crate::error::BlockError;
use crate::merkle;
use crate::types::{Block, BlockHeader};

/// Proof of work: the header hash, as an unsigned 256-bit little-endian
/// integer, must be at most the decoded compact target.
pub fn check_proof_of_work(header: &BlockHeader) -> Result<(), BlockError> {
    let target = bits::target_from_bits(header.bits)?;
    if !bits::hash_meets_target(&header.hash(), &target) {
        return Err(BlockError::InvalidPow);
    }
    Ok(())
}

/// Timestamp horizon: at most [`MAX_FUTURE_BLOCK_TIME`] ahead of `now`.
pub fn check_timestamp(header: &BlockHeader, now: u64) -> Result<(), BlockError> {
    let horizon = now + MAX_FUTURE_BLOCK_TIME;
    if header.timestamp as u64 > horizon {
        return Err(BlockError::TimestampTooFar { timestamp: header.timestamp, horizon });
    }
    Ok(())
}

/// Transaction list shape: non-empty, coinbase first, coinbase only first.
pub fn check_shape(block: &Block) -> Result<(), BlockError> {
    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(BlockError::MultipleCoinbase(i));
        }
    }
    Ok(())
}

/// Merkle commitment: the computed root over the block's txids must
/// equal the header's `merkle_root`.
pub fn check_merkle_root(block: &Block) -> Result<(), BlockError> {
    if merkle::merkle_root(&block.txids()) != block.header.merkle_root {
        return Err(BlockError::InvalidMerkleRoot);
    }
    Ok(())
}

/// Run every context-free check in order.
pub fn validate_block(block: &Block, now: u64) -> Result<(), BlockError> {
    check_proof_of_work(&block.header)?;
    check_timestamp(&block.header, now)?;
    check_shape(block)?;
    check_merkle_root(block)?;

    let size = block.serialized_size();
    if size > MAX_BLOCK_SIZE {
        return Err(BlockError::OversizedBlock { size, max: MAX_BLOCK_SIZE });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis;
    use crate::types::{Hash256, OutPoint, Transaction, TxInput, TxOutput};

    fn coinbase(tag: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                script_sig: tag.to_le_bytes().to_vec(),
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 50, script_pubkey: vec![0xac] }],
            lock_time: 0,
        }
    }

    fn spend(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: Hash256([tag; 32]), index: 0 },
                script_sig: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput { value: 1, script_pubkey: vec![0xac] }],
            lock_time: 0,
        }
    }

    /// Build a block over the given transactions and grind the nonce
    /// until the easy test target is met.
    fn mined_block(txs: Vec<Transaction>, timestamp: u32) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(Transaction::txid).collect();
        let mut block = Block {
            header: crate::types::BlockHeader {
                version: 1,
                prev_hash: genesis::genesis_hash(),
                merkle_root: crate::merkle::merkle_root(&txids),
                timestamp,
                bits: genesis::GENESIS_BITS,
                nonce: 0,
            },
            transactions: txs,
        };
        while check_proof_of_work(&block.header).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    const NOW: u64 = genesis::GENESIS_TIMESTAMP as u64 + 600;

    // --- proof of work ---

    #[test]
    fn genesis_passes_pow() {
        assert!(check_proof_of_work(&genesis::genesis_block().header).is_ok());
    }

    #[test]
    fn hard_target_rejects() {
        let mut header = genesis::genesis_block().header;
        // One-in-2^192 target; the fixed genesis header will not meet it.
        header.bits = 0x0900_ffff;
        assert_eq!(check_proof_of_work(&header), Err(BlockError::InvalidPow));
    }

    #[test]
    fn unusable_bits_reject() {
        let mut header = genesis::genesis_block().header;
        header.bits = 0;
        assert_eq!(check_proof_of_work(&header), Err(BlockError::InvalidTarget(0)));
    }

    // --- timestamp ---

    #[test]
    fn timestamp_within_horizon_passes() {
        let block = mined_block(vec![coinbase(1)], NOW as u32 + 7_000);
        assert!(check_timestamp(&block.header, NOW).is_ok());
    }

    #[test]
    fn timestamp_past_horizon_fails() {
        let block = mined_block(vec![coinbase(1)], NOW as u32 + 7_201);
        assert_eq!(
            check_timestamp(&block.header, NOW),
            Err(BlockError::TimestampTooFar {
                timestamp: NOW as u32 + 7_201,
                horizon: NOW + MAX_FUTURE_BLOCK_TIME,
            })
        );
    }

    // --- shape ---

    #[test]
    fn empty_block_fails_shape() {
        let block = mined_block(vec![], NOW as u32);
        assert_eq!(check_shape(&block), Err(BlockError::NoCoinbase));
    }

    #[test]
    fn first_tx_must_be_coinbase() {
        let block = mined_block(vec![spend(1)], NOW as u32);
        assert_eq!(check_shape(&block), Err(BlockError::FirstTxNotCoinbase));
    }

    #[test]
    fn second_coinbase_rejected() {
        let block = mined_block(vec![coinbase(1), coinbase(2)], NOW as u32);
        assert_eq!(check_shape(&block), Err(BlockError::MultipleCoinbase(1)));
    }

    #[test]
    fn well_shaped_block_passes() {
        let block = mined_block(vec![coinbase(1), spend(2), spend(3)], NOW as u32);
        assert!(check_shape(&block).is_ok());
    }

    // --- merkle ---

    #[test]
    fn merkle_root_must_match() {
        let mut block = mined_block(vec![coinbase(1), spend(2)], NOW as u32);
        assert!(check_merkle_root(&block).is_ok());
        block.header.merkle_root = Hash256([0xEE; 32]);
        assert_eq!(check_merkle_root(&block), Err(BlockError::InvalidMerkleRoot));
    }

    // --- combined ---

    #[test]
    fn validate_block_accepts_good_block() {
        let block = mined_block(vec![coinbase(1), spend(2)], NOW as u32);
        assert!(validate_block(&block, NOW).is_ok());
    }

    #[test]
    fn validate_block_runs_pow_first() {
        // Broken in every way; PoW failure must be reported, matching the
        // fixed check order.
        let mut block = mined_block(vec![], NOW as u32 + 10_000);
        block.header.bits = 0x0900_ffff;
        assert_eq!(validate_block(&block, NOW), Err(BlockError::InvalidPow));
    }

    #[test]
    fn validate_genesis_passes() {
        assert!(validate_block(genesis::genesis_block(), NOW).is_ok());
    }
}
