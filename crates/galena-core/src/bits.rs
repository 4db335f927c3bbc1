//! Compact difficulty targets and chain work.
//!
//! The 32-bit compact form packs a 256-bit target as
//! `mantissa * 256^(exponent - 3)` with a sign bit at `0x0080_0000`.
//! Proof of work requires the header hash, interpreted as an unsigned
//! 256-bit little-endian integer, to be at most the target.
//!
//! Chain work accumulates `2^256 / (target + 1)` per block and is kept
//! as a 32-byte big-endian rendering so that byte-wise ordering equals
//! numeric ordering.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BlockError;
use crate::types::Hash256;

/// A decoded compact target, including the sign and overflow flags of
/// the compact format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactTarget {
    /// The 256-bit target value (the magnitude; zero when the mantissa is zero).
    pub value: BigUint,
    /// Set when the sign bit is present with a non-zero mantissa.
    pub negative: bool,
    /// Set when the value would not fit in 256 bits.
    pub overflow: bool,
}

/// Decode the 32-bit compact form.
pub fn decode_compact(bits: u32) -> CompactTarget {
    let size = (bits >> 24) as u64;
    let word = bits & 0x007f_ffff;

    let value = if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    };

    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

    CompactTarget { value, negative, overflow }
}

/// Encode a 256-bit target into the compact form. Round-trips with
/// [`decode_compact`] for non-negative, non-overflowing targets.
pub fn encode_compact(value: &BigUint) -> u32 {
    let mut size = value.to_bytes_be().len() as u32;
    if value.is_zero() {
        size = 0;
    }

    let mut compact: u32 = if size <= 3 {
        let low = value.to_u32().unwrap_or(0);
        low << (8 * (3 - size))
    } else {
        let shifted: BigUint = value >> (8 * (size - 3) as u64);
        shifted.to_u32().unwrap_or(0)
    };

    // The mantissa sign bit must stay clear; shift into the exponent instead.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

/// The target a block header must meet, or an error if the compact form
/// is negative, overflowing, or zero.
pub fn target_from_bits(bits: u32) -> Result<BigUint, BlockError> {
    let compact = decode_compact(bits);
    if compact.negative || compact.overflow || compact.value.is_zero() {
        return Err(BlockError::InvalidTarget(bits));
    }
    Ok(compact.value)
}

/// Expected work for one block at the given compact target:
/// `floor(2^256 / (target + 1))`. Zero for unusable targets.
pub fn work_from_bits(bits: u32) -> BigUint {
    match target_from_bits(bits) {
        Ok(target) => (BigUint::one() << 256u32) / (target + BigUint::one()),
        Err(_) => BigUint::zero(),
    }
}

/// Proof-of-work comparison: the hash as an unsigned 256-bit
/// little-endian integer must be at most the target.
pub fn hash_meets_target(hash: &Hash256, target: &BigUint) -> bool {
    BigUint::from_bytes_le(&hash.0) <= *target
}

/// Cumulative chain work as a 32-byte big-endian integer.
///
/// Big-endian storage makes the derived lexicographic `Ord` equal to
/// numeric ordering, so tip selection can compare values directly.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ChainWork(pub [u8; 32]);

impl ChainWork {
    /// No accumulated work.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Build from a big integer, saturating at 2^256 - 1.
    pub fn from_biguint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return Self([0xff; 32]);
        }
        let mut buf = [0u8; 32];
        buf[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(buf)
    }

    /// The numeric value.
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// This work plus one block's worth.
    pub fn plus(&self, block_work: &BigUint) -> Self {
        Self::from_biguint(&(self.to_biguint() + block_work))
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_biguint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // --- decode_compact ---

    #[test]
    fn decode_regtest_limit() {
        let compact = decode_compact(0x207f_ffff);
        assert!(!compact.negative);
        assert!(!compact.overflow);
        assert_eq!(compact.value, BigUint::from(0x7f_ffffu32) << 232);
    }

    #[test]
    fn decode_mainnet_limit() {
        // The classic 0x1d00ffff limit: 0xffff * 256^26.
        let compact = decode_compact(0x1d00_ffff);
        assert!(!compact.negative);
        assert!(!compact.overflow);
        assert_eq!(compact.value, BigUint::from(0xffffu32) << 208);
    }

    #[test]
    fn decode_small_exponents() {
        assert_eq!(decode_compact(0x0112_3456).value, BigUint::from(0x12u32));
        assert_eq!(decode_compact(0x0212_3456).value, BigUint::from(0x1234u32));
        assert_eq!(decode_compact(0x0312_3456).value, BigUint::from(0x12_3456u32));
    }

    #[test]
    fn decode_zero_mantissa() {
        let compact = decode_compact(0x2000_0000);
        assert!(compact.value.is_zero());
        assert!(!compact.negative);
        assert!(!compact.overflow);
    }

    #[test]
    fn decode_negative_flag() {
        let compact = decode_compact(0x0380_1234);
        assert!(compact.negative);
        // Sign bit with zero mantissa is not negative.
        assert!(!decode_compact(0x0080_0000).negative);
    }

    #[test]
    fn decode_overflow_flag() {
        assert!(decode_compact(0x2301_0000).overflow); // word > 0xffff, size 35
        assert!(decode_compact(0xff00_0001).overflow); // size 255
        assert!(decode_compact(0x2200_ffff).overflow); // two mantissa bytes at size 34
        assert!(!decode_compact(0x2200_00ff).overflow); // one mantissa byte fits at size 34
    }

    // --- encode_compact ---

    #[test]
    fn encode_round_trips_known_values() {
        for bits in [0x2070_0000u32, 0x207f_ffff, 0x1d00_ffff, 0x1b04_04cb, 0x0101_0000] {
            let decoded = decode_compact(bits);
            assert!(!decoded.negative && !decoded.overflow);
            assert_eq!(encode_compact(&decoded.value), bits, "bits={bits:#010x}");
        }
    }

    #[test]
    fn encode_zero() {
        assert_eq!(encode_compact(&BigUint::zero()), 0);
    }

    #[test]
    fn encode_avoids_sign_bit() {
        // 0x80 as the top mantissa byte must shift into the exponent.
        let value = BigUint::from(0x80u32);
        let bits = encode_compact(&value);
        assert_eq!(bits & 0x0080_0000, 0);
        assert_eq!(decode_compact(bits).value, value);
    }

    // --- target_from_bits ---

    #[test]
    fn target_rejects_zero_and_negative() {
        assert_eq!(target_from_bits(0), Err(BlockError::InvalidTarget(0)));
        assert_eq!(
            target_from_bits(0x0380_1234),
            Err(BlockError::InvalidTarget(0x0380_1234))
        );
        assert_eq!(
            target_from_bits(0x2301_0000),
            Err(BlockError::InvalidTarget(0x2301_0000))
        );
    }

    // --- work ---

    #[test]
    fn work_is_inverse_of_target() {
        // target = 2^255 - ish: work should be small; harder target, more work.
        let easy = work_from_bits(0x207f_ffff);
        let hard = work_from_bits(0x1d00_ffff);
        assert!(hard > easy);
        assert!(easy >= BigUint::one());
    }

    #[test]
    fn work_of_unusable_bits_is_zero() {
        assert!(work_from_bits(0).is_zero());
    }

    #[test]
    fn work_formula_exact() {
        // target + 1 divides 2^256 exactly when target = 2^n - 1.
        // bits 0x2100..? use a 3-byte target 0x03ffff -> work = 2^256 / 0x040000.
        let bits = 0x0303_ffff;
        let expected = (BigUint::one() << 256u32) / BigUint::from(0x04_0000u32);
        assert_eq!(work_from_bits(bits), expected);
    }

    // --- hash_meets_target ---

    #[test]
    fn zero_hash_meets_any_usable_target() {
        let target = target_from_bits(0x1d00_ffff).unwrap();
        assert!(hash_meets_target(&Hash256::ZERO, &target));
    }

    #[test]
    fn max_hash_fails_real_targets() {
        let target = target_from_bits(0x1d00_ffff).unwrap();
        assert!(!hash_meets_target(&Hash256([0xff; 32]), &target));
    }

    #[test]
    fn boundary_hash_exactly_at_target() {
        let target = target_from_bits(0x207f_ffff).unwrap();
        let boundary = ChainWork::from_biguint(&target);
        // ChainWork is big-endian; hash bytes are little-endian. Reverse.
        let mut le = boundary.0;
        le.reverse();
        assert!(hash_meets_target(&Hash256(le), &target));
    }

    // --- ChainWork ---

    #[test]
    fn chain_work_ordering_is_numeric() {
        let a = ChainWork::from_biguint(&BigUint::from(100u32));
        let b = ChainWork::from_biguint(&BigUint::from(200u32));
        let c = ChainWork::from_biguint(&(BigUint::one() << 200u32));
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
    }

    #[test]
    fn chain_work_plus_accumulates() {
        let w = ChainWork::ZERO
            .plus(&BigUint::from(5u32))
            .plus(&BigUint::from(7u32));
        assert_eq!(w.to_biguint(), BigUint::from(12u32));
    }

    #[test]
    fn chain_work_round_trip() {
        let value = (BigUint::one() << 130u32) + BigUint::from(99u32);
        let w = ChainWork::from_biguint(&value);
        assert_eq!(w.to_biguint(), value);
    }

    #[test]
    fn chain_work_saturates() {
        let too_big = BigUint::one() << 300u32;
        assert_eq!(ChainWork::from_biguint(&too_big), ChainWork([0xff; 32]));
    }

    // --- properties ---

    proptest! {
        #[test]
        fn prop_compact_round_trip(mantissa in 1u32..0x0080_0000, exponent in 1u32..=32) {
            let bits = (exponent << 24) | mantissa;
            let decoded = decode_compact(bits);
            prop_assume!(!decoded.negative && !decoded.overflow && !decoded.value.is_zero());
            // Encoding normalizes: decode(encode(decode(bits))) == decode(bits).
            let reencoded = encode_compact(&decoded.value);
            prop_assert_eq!(decode_compact(reencoded).value, decoded.value);
        }

        #[test]
        fn prop_chain_work_round_trip(bytes in any::<[u8; 16]>()) {
            let value = BigUint::from_bytes_be(&bytes);
            prop_assert_eq!(ChainWork::from_biguint(&value).to_biguint(), value);
        }
    }
}
