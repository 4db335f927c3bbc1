//! Consensus wire codec.
//!
//! Little-endian integers, compact-size varints, the 80-byte block header
//! layout, and the canonical transaction input/output layout. Every entity
//! satisfies `decode(encode(x)) == x`; decoding is bounds-checked, rejects
//! non-canonical varints, and caps collection sizes before allocating.

use crate::constants::{MAX_BLOCK_TXS, MAX_SCRIPT_SIZE, MAX_TX_INPUTS, MAX_TX_OUTPUTS};
use crate::error::CodecError;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Split `n` bytes off the front of the input.
fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::UnexpectedEnd);
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

fn read_u16(input: &mut &[u8]) -> Result<u16, CodecError> {
    let bytes = take(input, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn read_u32(input: &mut &[u8]) -> Result<u32, CodecError> {
    let bytes = take(input, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(input: &mut &[u8]) -> Result<u64, CodecError> {
    let bytes = take(input, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(input: &mut &[u8]) -> Result<i64, CodecError> {
    Ok(read_u64(input)? as i64)
}

pub(crate) fn read_hash(input: &mut &[u8]) -> Result<Hash256, CodecError> {
    let bytes = take(input, 32)?;
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    Ok(Hash256(buf))
}

/// Write a compact-size varint (1/3/5/9-byte forms).
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Read a compact-size varint, rejecting non-minimal encodings.
pub fn read_varint(input: &mut &[u8]) -> Result<u64, CodecError> {
    let tag = take(input, 1)?[0];
    match tag {
        0xfd => {
            let v = read_u16(input)? as u64;
            if v < 0xfd {
                return Err(CodecError::NonCanonicalVarint);
            }
            Ok(v)
        }
        0xfe => {
            let v = read_u32(input)? as u64;
            if v <= 0xffff {
                return Err(CodecError::NonCanonicalVarint);
            }
            Ok(v)
        }
        0xff => {
            let v = read_u64(input)?;
            if v <= 0xffff_ffff {
                return Err(CodecError::NonCanonicalVarint);
            }
            Ok(v)
        }
        t => Ok(t as u64),
    }
}

/// Read a varint-counted collection length, enforcing a cap before any
/// allocation happens.
fn read_count(input: &mut &[u8], max: u64) -> Result<usize, CodecError> {
    let len = read_varint(input)?;
    if len > max {
        return Err(CodecError::OversizedCollection { len, max });
    }
    Ok(len as usize)
}

fn read_script(input: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_count(input, MAX_SCRIPT_SIZE as u64)?;
    Ok(take(input, len)?.to_vec())
}

impl Transaction {
    /// Append the consensus encoding to `out`.
    pub fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.previous_output.txid.as_bytes());
            out.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_varint(out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_varint(out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }

    /// Consensus encoding as a fresh byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.consensus_encode(&mut out);
        out
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        let mut size = 4 + 4; // version + lock_time
        size += varint_size(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 32 + 4 + varint_size(input.script_sig.len() as u64) + input.script_sig.len() + 4;
        }
        size += varint_size(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + varint_size(output.script_pubkey.len() as u64) + output.script_pubkey.len();
        }
        size
    }

    /// Decode from a cursor, advancing it past the transaction.
    pub fn consensus_decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let version = read_u32(input)?;
        let input_count = read_count(input, MAX_TX_INPUTS)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let txid = read_hash(input)?;
            let index = read_u32(input)?;
            let script_sig = read_script(input)?;
            let sequence = read_u32(input)?;
            inputs.push(TxInput {
                previous_output: OutPoint { txid, index },
                script_sig,
                sequence,
            });
        }
        let output_count = read_count(input, MAX_TX_OUTPUTS)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = read_i64(input)?;
            let script_pubkey = read_script(input)?;
            outputs.push(TxOutput { value, script_pubkey });
        }
        let lock_time = read_u32(input)?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }

    /// Decode a transaction occupying the entire buffer.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let tx = Self::consensus_decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(tx)
    }
}

/// Size of the varint encoding of `n`.
pub fn varint_size(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

impl BlockHeader {
    /// The 80-byte consensus encoding:
    /// `version | prev_hash | merkle_root | timestamp | bits | nonce`.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Decode from a cursor, advancing it past the 80 header bytes.
    pub fn consensus_decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let version = read_u32(input)?;
        let prev_hash = read_hash(input)?;
        let merkle_root = read_hash(input)?;
        let timestamp = read_u32(input)?;
        let bits = read_u32(input)?;
        let nonce = read_u32(input)?;
        Ok(BlockHeader { version, prev_hash, merkle_root, timestamp, bits, nonce })
    }
}

impl Block {
    /// Append the consensus encoding (header, tx count, transactions).
    pub fn consensus_encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header.encode());
        write_varint(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(out);
        }
    }

    /// Consensus encoding as a fresh byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.consensus_encode(&mut out);
        out
    }

    /// Serialized size in bytes.
    pub fn serialized_size(&self) -> usize {
        BlockHeader::SIZE
            + varint_size(self.transactions.len() as u64)
            + self.transactions.iter().map(Transaction::serialized_size).sum::<usize>()
    }

    /// Decode from a cursor, advancing it past the block.
    pub fn consensus_decode(input: &mut &[u8]) -> Result<Self, CodecError> {
        let header = BlockHeader::consensus_decode(input)?;
        let tx_count = read_count(input, MAX_BLOCK_TXS)?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::consensus_decode(input)?);
        }
        Ok(Block { header, transactions })
    }

    /// Decode a block occupying the entire buffer.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let block = Self::consensus_decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(block)
    }
}
