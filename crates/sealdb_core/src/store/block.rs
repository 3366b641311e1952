//! Block framing for the data file.
//!
//! ```text
//! | magic (2) | kind (1) | group (4) | doc id (16) | sequence (8) | body_len (4) | crc32 (4) | body |
//! ```
//!
//! The CRC covers the 35 header bytes before it. The body is a sealed
//! pipeline frame whose associated data is the header up to and including
//! the sequence number, so a body cannot be moved to another document,
//! group or kind without failing authentication.

use crate::error::{CoreError, CoreResult};
use crate::id::DocumentId;
use crate::types::{GroupId, SequenceNumber};
use crate::wal::compute_crc32;
use bytes::{Buf, BufMut};

/// Magic number at the start of every block.
pub const BLOCK_MAGIC: u16 = 0x5342;

/// Bytes covered by the body's associated data.
const CONTEXT_SIZE: usize = 2 + 1 + 4 + 16 + 8;

/// Full header size including body length and checksum.
pub const BLOCK_HEADER_SIZE: usize = CONTEXT_SIZE + 4 + 4;

/// What a block records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    /// A document version. Body: the sealed document.
    Put = 1,
    /// A document deletion. Body: empty.
    Tombstone = 2,
    /// A group definition. Body: the group name.
    Group = 3,
    /// A group removal. Body: empty.
    DropGroup = 4,
    /// An index definition. Body: `{field, unique}`.
    Index = 5,
    /// An index removal. Body: the field path.
    DropIndex = 6,
    /// Everything before this block is durable up to its sequence.
    Checkpoint = 7,
}

impl BlockKind {
    /// Converts a byte to a block kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Put),
            2 => Some(Self::Tombstone),
            3 => Some(Self::Group),
            4 => Some(Self::DropGroup),
            5 => Some(Self::Index),
            6 => Some(Self::DropIndex),
            7 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The fixed-size part of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block kind.
    pub kind: BlockKind,
    /// Group the block belongs to (zero for checkpoints).
    pub group: GroupId,
    /// Document the block belongs to (all zeros when not applicable).
    pub id: DocumentId,
    /// Commit sequence of the change, or the checkpointed sequence.
    pub sequence: SequenceNumber,
    /// Length of the sealed body.
    pub body_len: u32,
}

impl BlockHeader {
    /// Creates a header; `body_len` is filled in when the body is sealed.
    #[must_use]
    pub fn new(kind: BlockKind, group: GroupId, id: DocumentId, sequence: SequenceNumber) -> Self {
        Self {
            kind,
            group,
            id,
            sequence,
            body_len: 0,
        }
    }

    /// The bytes the body is authenticated against.
    #[must_use]
    pub fn context(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTEXT_SIZE);
        buf.put_u16_le(BLOCK_MAGIC);
        buf.put_u8(self.kind.as_byte());
        buf.put_u32_le(self.group.as_u32());
        buf.put_slice(self.id.as_bytes());
        buf.put_u64_le(self.sequence.as_u64());
        buf
    }

    /// Encodes the full header including its checksum.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.context();
        buf.put_u32_le(self.body_len);
        let crc = compute_crc32(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decodes a header, verifying magic, kind and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if any check fails.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(CoreError::tamper("block header truncated"));
        }
        let (covered, mut crc) = bytes[..BLOCK_HEADER_SIZE].split_at(BLOCK_HEADER_SIZE - 4);
        if compute_crc32(covered) != crc.get_u32_le() {
            return Err(CoreError::tamper("block header checksum mismatch"));
        }
        Self::parse(covered)
    }

    /// Decodes a header without looking at its checksum.
    ///
    /// Only useful together with authenticating the body against
    /// [`BlockHeader::context`], which vouches for every field but the
    /// body length.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] for a short buffer, bad
    /// magic or unknown kind.
    pub fn decode_unverified(bytes: &[u8]) -> CoreResult<Self> {
        let covered = bytes
            .get(..BLOCK_HEADER_SIZE - 4)
            .ok_or_else(|| CoreError::tamper("block header truncated"))?;
        Self::parse(covered)
    }

    fn parse(mut buf: &[u8]) -> CoreResult<Self> {
        if buf.get_u16_le() != BLOCK_MAGIC {
            return Err(CoreError::tamper("bad block magic"));
        }
        let kind_byte = buf.get_u8();
        let kind = BlockKind::from_byte(kind_byte)
            .ok_or_else(|| CoreError::tamper(format!("unknown block kind {kind_byte}")))?;
        let group = GroupId::new(buf.get_u32_le());
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let sequence = SequenceNumber::new(buf.get_u64_le());
        let body_len = buf.get_u32_le();

        Ok(Self {
            kind,
            group,
            id: DocumentId::from_bytes(id),
            sequence,
            body_len,
        })
    }

    /// Total length of the block on disk.
    #[must_use]
    pub fn block_len(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + u64::from(self.body_len)
    }
}

/// Where a block lives in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    /// Offset of the block header.
    pub offset: u64,
    /// Header plus body length.
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHeader {
        let mut header = BlockHeader::new(
            BlockKind::Put,
            GroupId::new(3),
            DocumentId::new(),
            SequenceNumber::new(99),
        );
        header.body_len = 120;
        header
    }

    #[test]
    fn header_decodes_what_it_encodes() {
        let header = sample();
        let bytes = header.encode();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
        assert_eq!(header.block_len(), BLOCK_HEADER_SIZE as u64 + 120);
    }

    #[test]
    fn every_header_byte_is_checked() {
        let bytes = sample().encode();
        for i in 0..bytes.len() {
            let mut damaged = bytes.clone();
            damaged[i] ^= 0x10;
            assert!(BlockHeader::decode(&damaged).is_err(), "byte {i}");
        }
    }

    #[test]
    fn unverified_decode_ignores_only_the_checksum() {
        let header = sample();
        let mut bytes = header.encode();
        bytes[BLOCK_HEADER_SIZE - 1] ^= 0x01;
        assert!(BlockHeader::decode(&bytes).is_err());
        assert_eq!(BlockHeader::decode_unverified(&bytes).unwrap(), header);

        bytes[2] = 0xEE;
        assert!(BlockHeader::decode_unverified(&bytes).is_err());
    }

    #[test]
    fn context_excludes_body_length() {
        let mut a = sample();
        let b = a;
        a.body_len = 7;
        assert_eq!(a.context(), b.context());
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn kind_bytes() {
        for kind in [
            BlockKind::Put,
            BlockKind::Tombstone,
            BlockKind::Group,
            BlockKind::DropGroup,
            BlockKind::Index,
            BlockKind::DropIndex,
            BlockKind::Checkpoint,
        ] {
            assert_eq!(BlockKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(BlockKind::from_byte(0), None);
    }
}
