//! Wire messages consumed by the node, with the inherited frame format.
//!
//! A frame is `magic(4) | command(12, NUL-padded) | length(4, LE) |
//! checksum(4) | payload`, where the checksum is the first four bytes
//! of the payload's double-SHA-256. Payloads use the consensus codec:
//! compact-size counts, little-endian integers.

use thiserror::Error;

use galena_core::constants::{MAX_BLOCK_SIZE, MAX_INV_ENTRIES, MAX_LOCATOR_SIZE, PROTOCOL_VERSION};
use galena_core::encode::{read_varint, write_varint};
use galena_core::error::CodecError;
use galena_core::hash;
use galena_core::types::{Block, Hash256, Transaction};

/// Size of the fixed frame header.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Width of the NUL-padded command field.
pub const COMMAND_LEN: usize = 12;

/// Cap on a single frame's payload.
pub const MAX_PAYLOAD_SIZE: usize = MAX_BLOCK_SIZE + 1024;

/// Errors raised while framing or unframing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("wrong network magic")] WrongMagic,
    #[error("frame truncated")] Truncated,
    #[error("payload length {len} exceeds cap {max}")] PayloadTooLarge { len: usize, max: usize },
    #[error("checksum mismatch")] ChecksumMismatch,
    #[error("unknown command {0:?}")] UnknownCommand(String),
    #[error("command field is not NUL-padded ascii")] BadCommand,
    #[error(transparent)] Codec(#[from] CodecError),
    #[error("connection closed")] Closed,
}

/// Inventory entry type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvKind {
    Tx,
    Block,
}

impl InvKind {
    /// Wire tag of this kind.
    pub fn as_u32(self) -> u32 {
        match self {
            InvKind::Tx => 1,
            InvKind::Block => 2,
        }
    }

    /// Parse a wire tag; unknown tags are tolerated by the caller.
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(InvKind::Tx),
            2 => Some(InvKind::Block),
            _ => None,
        }
    }
}

/// One inventory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvItem {
    pub fn tx(hash: Hash256) -> Self {
        Self { kind: InvKind::Tx, hash }
    }

    pub fn block(hash: Hash256) -> Self {
        Self { kind: InvKind::Block, hash }
    }
}

/// The messages the core consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    Block(Block),
    Tx(Transaction),
    GetBlocks { locator: Vec<Hash256>, stop: Hash256 },
}

impl Message {
    /// The command string carried in the frame header.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::GetBlocks { .. } => "getblocks",
        }
    }

    /// Encode the payload with the consensus codec.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Inv(items) | Message::GetData(items) => encode_inv(&mut out, items),
            Message::Block(block) => block.consensus_encode(&mut out),
            Message::Tx(tx) => tx.consensus_encode(&mut out),
            Message::GetBlocks { locator, stop } => {
                out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
                write_varint(&mut out, locator.len() as u64);
                for hash in locator {
                    out.extend_from_slice(hash.as_bytes());
                }
                out.extend_from_slice(stop.as_bytes());
            }
        }
        out
    }

    /// Decode a payload for a known command.
    fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = payload;
        let message = match command {
            "inv" => Message::Inv(decode_inv(&mut cursor)?),
            "getdata" => Message::GetData(decode_inv(&mut cursor)?),
            "block" => Message::Block(Block::consensus_decode(&mut cursor)?),
            "tx" => Message::Tx(Transaction::consensus_decode(&mut cursor)?),
            "getblocks" => {
                let version = read_u32(&mut cursor)?;
                let _ = version; // peers may speak older protocol versions
                let count = read_varint(&mut cursor)?;
                if count > MAX_LOCATOR_SIZE as u64 {
                    return Err(CodecError::OversizedCollection {
                        len: count,
                        max: MAX_LOCATOR_SIZE as u64,
                    }
                    .into());
                }
                let mut locator = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    locator.push(read_hash(&mut cursor)?);
                }
                let stop = read_hash(&mut cursor)?;
                Message::GetBlocks { locator, stop }
            }
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        if !cursor.is_empty() {
            return Err(CodecError::TrailingBytes.into());
        }
        Ok(message)
    }

    /// Assemble a complete frame for the given network magic.
    pub fn to_frame(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&magic);

        let mut command = [0u8; COMMAND_LEN];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        frame.extend_from_slice(&command);

        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&hash::checksum(&payload));
        frame.extend_from_slice(&payload);
        frame
    }

    /// Parse one frame from the front of `data`.
    ///
    /// Returns the message and the number of bytes consumed.
    /// [`FrameError::Truncated`] means the caller should read more
    /// bytes and retry.
    pub fn from_frame(magic: [u8; 4], data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated);
        }
        if data[0..4] != magic {
            return Err(FrameError::WrongMagic);
        }

        let command_field = &data[4..4 + COMMAND_LEN];
        let name_len = command_field
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_LEN);
        if command_field[name_len..].iter().any(|byte| *byte != 0) {
            return Err(FrameError::BadCommand);
        }
        let command =
            std::str::from_utf8(&command_field[..name_len]).map_err(|_| FrameError::BadCommand)?;

        let length = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { len: length, max: MAX_PAYLOAD_SIZE });
        }
        if data.len() < FRAME_HEADER_SIZE + length {
            return Err(FrameError::Truncated);
        }

        let checksum = &data[20..24];
        let payload = &data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length];
        if hash::checksum(payload) != checksum[..] {
            return Err(FrameError::ChecksumMismatch);
        }

        let message = Self::decode_payload(command, payload)?;
        Ok((message, FRAME_HEADER_SIZE + length))
    }
}

fn encode_inv(out: &mut Vec<u8>, items: &[InvItem]) {
    write_varint(out, items.len() as u64);
    for item in items {
        out.extend_from_slice(&item.kind.as_u32().to_le_bytes());
        out.extend_from_slice(item.hash.as_bytes());
    }
}

/// Decode an inventory list, silently dropping entries with unknown
/// type tags.
fn decode_inv(cursor: &mut &[u8]) -> Result<Vec<InvItem>, FrameError> {
    let count = read_varint(cursor)?;
    if count > MAX_INV_ENTRIES as u64 {
        return Err(CodecError::OversizedCollection { len: count, max: MAX_INV_ENTRIES as u64 }.into());
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = read_u32(cursor)?;
        let hash = read_hash(cursor)?;
        if let Some(kind) = InvKind::from_u32(tag) {
            items.push(InvItem { kind, hash });
        }
    }
    Ok(items)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, CodecError> {
    if cursor.len() < 4 {
        return Err(CodecError::UnexpectedEnd);
    }
    let value = u32::from_le_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
    *cursor = &cursor[4..];
    Ok(value)
}

fn read_hash(cursor: &mut &[u8]) -> Result<Hash256, CodecError> {
    if cursor.len() < 32 {
        return Err(CodecError::UnexpectedEnd);
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&cursor[..32]);
    *cursor = &cursor[32..];
    Ok(Hash256(bytes))
}
