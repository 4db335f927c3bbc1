//! Merkle tree over transaction IDs.
//!
//! The canonical algorithm: leaves are the txids themselves, each level
//! pairs adjacent hashes with `dsha256(left || right)`, and a level with
//! an odd count duplicates its last hash. A single-transaction block's
//! merkle root is therefore that transaction's ID. Empty input produces
//! [`Hash256::ZERO`].

use crate::hash::dsha256;
use crate::types::Hash256;

/// Hash one interior node from its two children.
fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    dsha256(&buf)
}

/// Compute the next level from the current one, duplicating the last
/// hash when the count is odd.
fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    let mut next = Vec::with_capacity(level.len().div_ceil(2));
    let mut i = 0;
    while i < level.len() {
        let left = &level[i];
        let right = if i + 1 < level.len() { &level[i + 1] } else { left };
        next.push(node_hash(left, right));
        i += 2;
    }
    next
}

/// Compute the merkle root over a list of transaction IDs.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }

    let mut current = txids.to_vec();
    while current.len() > 1 {
        current = next_level(&current);
    }
    current[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_root_is_the_txid() {
        let a = h(0xAA);
        assert_eq!(merkle_root(&[a]), a);
    }

    #[test]
    fn two_leaves() {
        let a = h(1);
        let b = h(2);
        assert_eq!(merkle_root(&[a, b]), node_hash(&a, &b));
    }

    #[test]
    fn three_leaves_duplicate_last() {
        let (a, b, c) = (h(1), h(2), h(3));
        let expected = node_hash(&node_hash(&a, &b), &node_hash(&c, &c));
        assert_eq!(merkle_root(&[a, b, c]), expected);
    }

    #[test]
    fn four_leaves_balanced() {
        let leaves: Vec<Hash256> = (1..=4).map(h).collect();
        let expected = node_hash(
            &node_hash(&leaves[0], &leaves[1]),
            &node_hash(&leaves[2], &leaves[3]),
        );
        assert_eq!(merkle_root(&leaves), expected);
    }

    #[test]
    fn five_leaves_duplicates_at_two_levels() {
        let leaves: Vec<Hash256> = (1..=5).map(h).collect();
        let n01 = node_hash(&leaves[0], &leaves[1]);
        let n23 = node_hash(&leaves[2], &leaves[3]);
        let n44 = node_hash(&leaves[4], &leaves[4]);
        let left = node_hash(&n01, &n23);
        let right = node_hash(&n44, &n44);
        assert_eq!(merkle_root(&leaves), node_hash(&left, &right));
    }

    #[test]
    fn root_changes_with_any_leaf() {
        let a = vec![h(1), h(2), h(3)];
        let b = vec![h(1), h(2), h(4)];
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn order_matters() {
        assert_ne!(merkle_root(&[h(1), h(2)]), merkle_root(&[h(2), h(1)]));
    }

    #[test]
    fn deterministic_across_sizes() {
        for count in 1..=12u8 {
            let leaves: Vec<Hash256> = (0..count).map(h).collect();
            assert_eq!(merkle_root(&leaves), merkle_root(&leaves), "count={count}");
        }
    }
}
