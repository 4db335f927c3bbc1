//! Script templates and the verification seam.
//!
//! Scripts are opaque byte strings to the engine. The node recognizes
//! the two standard output templates (pay-to-pubkey-hash and
//! pay-to-pubkey) for standardness and address derivation; full
//! signature interpretation is a pluggable capability behind
//! [`ScriptVerifier`] so a real interpreter can slot in without touching
//! the chain or pool code.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TxError;
use crate::hash::dsha256;
use crate::types::{Transaction, TxOutput};

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;

/// A 20-byte address: the hash embedded in a pay-to-pubkey-hash output.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive an address from a raw public key: the first 20 bytes of
    /// its double-SHA-256.
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        let digest = dsha256(pubkey);
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&digest.0[..20]);
        Self(buf)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

/// The standard output script templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptTemplate {
    /// `OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`
    PayToPubkeyHash(Address),
    /// `<33 or 65 byte pubkey> OP_CHECKSIG`
    PayToPubkey(Vec<u8>),
}

/// Classify an output script against the standard templates.
pub fn classify(script_pubkey: &[u8]) -> Option<ScriptTemplate> {
    if script_pubkey.len() == 25
        && script_pubkey[0] == OP_DUP
        && script_pubkey[1] == OP_HASH160
        && script_pubkey[2] == 20
        && script_pubkey[23] == OP_EQUALVERIFY
        && script_pubkey[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script_pubkey[3..23]);
        return Some(ScriptTemplate::PayToPubkeyHash(Address(hash)));
    }

    let is_p2pk = matches!(
        (script_pubkey.len(), script_pubkey.first()),
        (35, Some(&33)) | (67, Some(&65))
    ) && script_pubkey.last() == Some(&OP_CHECKSIG);
    if is_p2pk {
        return Some(ScriptTemplate::PayToPubkey(
            script_pubkey[1..script_pubkey.len() - 1].to_vec(),
        ));
    }

    None
}

/// The address an output script pays to, if it is standard.
pub fn extract_address(script_pubkey: &[u8]) -> Option<Address> {
    match classify(script_pubkey)? {
        ScriptTemplate::PayToPubkeyHash(address) => Some(address),
        ScriptTemplate::PayToPubkey(pubkey) => Some(Address::from_pubkey(&pubkey)),
    }
}

/// Assemble a pay-to-pubkey-hash output script for the given address.
pub fn pay_to_pubkey_hash(address: &Address) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(&address.0);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Input-script verification and transaction standardness.
///
/// Implementations may run a full interpreter; the engine only needs a
/// verdict. `verify_input` is invoked off the event path and may block.
pub trait ScriptVerifier: Send + Sync {
    /// Verify that input `input_index` of `tx` satisfies the referenced
    /// output's locking script.
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        prev_out: &TxOutput,
    ) -> Result<(), TxError>;

    /// The relay standardness predicate.
    fn is_standard(&self, tx: &Transaction) -> bool;
}

/// Template-only verification: an input passes when the output it spends
/// matches a standard template, and a transaction is standard when every
/// output does. No signature math.
pub struct TemplateVerifier;

impl ScriptVerifier for TemplateVerifier {
    fn verify_input(
        &self,
        _tx: &Transaction,
        input_index: usize,
        prev_out: &TxOutput,
    ) -> Result<(), TxError> {
        if classify(&prev_out.script_pubkey).is_none() {
            return Err(TxError::Script {
                index: input_index,
                reason: "spent output script matches no standard template".into(),
            });
        }
        Ok(())
    }

    fn is_standard(&self, tx: &Transaction) -> bool {
        !tx.outputs.is_empty()
            && tx
                .outputs
                .iter()
                .all(|out| classify(&out.script_pubkey).is_some())
    }
}

/// Accept everything. Test double for exercising pool and chain logic
/// without standard scripts.
pub struct AcceptAll;

impl ScriptVerifier for AcceptAll {
    fn verify_input(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _prev_out: &TxOutput,
    ) -> Result<(), TxError> {
        Ok(())
    }

    fn is_standard(&self, _tx: &Transaction) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput};

    fn p2pkh_output(seed: u8) -> TxOutput {
        TxOutput {
            value: 100,
            script_pubkey: pay_to_pubkey_hash(&Address([seed; 20])),
        }
    }

    // --- classify ---

    #[test]
    fn classify_p2pkh() {
        let address = Address([7; 20]);
        let script = pay_to_pubkey_hash(&address);
        assert_eq!(classify(&script), Some(ScriptTemplate::PayToPubkeyHash(address)));
    }

    #[test]
    fn classify_p2pk_compressed() {
        let mut script = vec![33u8];
        script.extend_from_slice(&[2u8; 33]);
        script.push(OP_CHECKSIG);
        assert_eq!(classify(&script), Some(ScriptTemplate::PayToPubkey(vec![2u8; 33])));
    }

    #[test]
    fn classify_p2pk_uncompressed() {
        let mut script = vec![65u8];
        script.extend_from_slice(&[4u8; 65]);
        script.push(OP_CHECKSIG);
        assert!(matches!(classify(&script), Some(ScriptTemplate::PayToPubkey(pk)) if pk.len() == 65));
    }

    #[test]
    fn classify_rejects_garbage() {
        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&[0x51]), None);
        let mut almost = pay_to_pubkey_hash(&Address([7; 20]));
        almost[24] = 0x00; // not OP_CHECKSIG
        assert_eq!(classify(&almost), None);
    }

    // --- addresses ---

    #[test]
    fn extract_address_p2pkh() {
        let address = Address([9; 20]);
        assert_eq!(extract_address(&pay_to_pubkey_hash(&address)), Some(address));
    }

    #[test]
    fn extract_address_p2pk_hashes_pubkey() {
        let mut script = vec![33u8];
        script.extend_from_slice(&[2u8; 33]);
        script.push(OP_CHECKSIG);
        assert_eq!(extract_address(&script), Some(Address::from_pubkey(&[2u8; 33])));
    }

    #[test]
    fn extract_address_non_standard_is_none() {
        assert_eq!(extract_address(&[0x6a, 0x01, 0x02]), None);
    }

    #[test]
    fn address_display_is_base58() {
        let s = Address([1; 20]).to_string();
        assert!(!s.is_empty());
        assert!(bs58::decode(&s).into_vec().is_ok());
    }

    // --- TemplateVerifier ---

    #[test]
    fn template_verifier_accepts_standard_spend() {
        let tx = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        assert!(TemplateVerifier.verify_input(&tx, 0, &p2pkh_output(1)).is_ok());
    }

    #[test]
    fn template_verifier_rejects_non_standard_spend() {
        let tx = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        let out = TxOutput { value: 1, script_pubkey: vec![0x6a] };
        assert!(matches!(
            TemplateVerifier.verify_input(&tx, 3, &out),
            Err(TxError::Script { index: 3, .. })
        ));
    }

    #[test]
    fn standardness_requires_all_outputs_standard() {
        let standard = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint { txid: crate::types::Hash256([1; 32]), index: 0 },
                script_sig: vec![],
                sequence: 0,
            }],
            outputs: vec![p2pkh_output(1), p2pkh_output(2)],
            lock_time: 0,
        };
        assert!(TemplateVerifier.is_standard(&standard));

        let mut mixed = standard.clone();
        mixed.outputs.push(TxOutput { value: 1, script_pubkey: vec![0x6a] });
        assert!(!TemplateVerifier.is_standard(&mixed));

        let mut empty = standard;
        empty.outputs.clear();
        assert!(!TemplateVerifier.is_standard(&empty));
    }

    #[test]
    fn accept_all_accepts() {
        let tx = Transaction { version: 1, inputs: vec![], outputs: vec![], lock_time: 0 };
        assert!(AcceptAll.verify_input(&tx, 0, &TxOutput { value: 0, script_pubkey: vec![] }).is_ok());
        assert!(AcceptAll.is_standard(&tx));
    }
}
