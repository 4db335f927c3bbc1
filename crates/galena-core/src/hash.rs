//! Double-SHA-256, the universal digest of the protocol.

use sha2::{Digest, Sha256};

use crate::types::Hash256;

/// Compute `SHA256(SHA256(data))`.
pub fn dsha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// First four bytes of the double-SHA-256 digest, used as the wire
/// frame checksum.
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = dsha256(data);
    [digest.0[0], digest.0[1], digest.0[2], digest.0[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsha256_deterministic() {
        assert_eq!(dsha256(b"galena"), dsha256(b"galena"));
    }

    #[test]
    fn dsha256_changes_with_input() {
        assert_ne!(dsha256(b"a"), dsha256(b"b"));
    }

    #[test]
    fn dsha256_empty_input_known_vector() {
        // dSHA256("") is a fixed, well-known value; pin the first bytes.
        let h = dsha256(b"");
        assert_eq!(&h.0[0..4], &[0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn checksum_is_digest_prefix() {
        let h = dsha256(b"payload");
        assert_eq!(checksum(b"payload"), [h.0[0], h.0[1], h.0[2], h.0[3]]);
    }
}
