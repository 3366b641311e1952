//! WAL record types and their plaintext encoding.
//!
//! Record plaintext, before it is sealed by the WAL pipeline:
//!
//! ```text
//! | sequence (8) | type (1) | txid (8) | body (N) |
//! ```
//!
//! All integers are little-endian. `Put` and `Delete` bodies start with the
//! group name (u16 length prefix) and the 16-byte document id; a `Put` then
//! carries the canonical document bytes behind a u32 length.

use crate::error::{CoreError, CoreResult};
use crate::id::DocumentId;
use crate::types::{SequenceNumber, TransactionId};
use bytes::{Buf, BufMut};
use sealdb_codec::{decode_document, encode_document, Document};

/// Type of WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Begin a new transaction.
    Begin = 1,
    /// Insert or replace a document.
    Put = 2,
    /// Delete a document.
    Delete = 3,
    /// Commit marker.
    Commit = 4,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A logical WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Begin a new transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },

    /// Insert or replace a document.
    Put {
        /// Transaction ID.
        txid: TransactionId,
        /// Group holding the document.
        group: String,
        /// Document identifier.
        id: DocumentId,
        /// The full new document.
        document: Document,
    },

    /// Delete a document.
    Delete {
        /// Transaction ID.
        txid: TransactionId,
        /// Group holding the document.
        group: String,
        /// Document identifier.
        id: DocumentId,
    },

    /// Commit marker. Its sequence number is the commit sequence.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Commit { .. } => WalRecordType::Commit,
        }
    }

    /// Returns the owning transaction.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Begin { txid }
            | Self::Put { txid, .. }
            | Self::Delete { txid, .. }
            | Self::Commit { txid } => *txid,
        }
    }

    /// Serializes the record together with its sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name or document is too large for
    /// its length prefix.
    pub fn encode(&self, seq: SequenceNumber) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u64_le(seq.as_u64());
        buf.put_u8(self.record_type().as_byte());
        buf.put_u64_le(self.txid().as_u64());

        match self {
            Self::Begin { .. } | Self::Commit { .. } => {}
            Self::Put {
                group,
                id,
                document,
                ..
            } => {
                put_target(&mut buf, group, id)?;
                let bytes = encode_document(document);
                let len = u32::try_from(bytes.len())
                    .map_err(|_| CoreError::invalid_document("document too large for the WAL"))?;
                buf.put_u32_le(len);
                buf.put_slice(&bytes);
            }
            Self::Delete { group, id, .. } => put_target(&mut buf, group, id)?,
        }

        Ok(buf)
    }

    /// Deserializes a record, returning it with its sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if the bytes are not a
    /// well-formed record.
    pub fn decode(mut payload: &[u8]) -> CoreResult<(SequenceNumber, Self)> {
        if payload.remaining() < 17 {
            return Err(CoreError::tamper("WAL record shorter than its fixed prefix"));
        }
        let seq = SequenceNumber::new(payload.get_u64_le());
        let type_byte = payload.get_u8();
        let txid = TransactionId::new(payload.get_u64_le());

        let record_type = WalRecordType::from_byte(type_byte)
            .ok_or_else(|| CoreError::tamper(format!("unknown WAL record type {type_byte}")))?;

        let record = match record_type {
            WalRecordType::Begin => Self::Begin { txid },
            WalRecordType::Commit => Self::Commit { txid },
            WalRecordType::Put => {
                let (group, id) = get_target(&mut payload)?;
                let len = get_u32(&mut payload)? as usize;
                if payload.remaining() < len {
                    return Err(CoreError::tamper("WAL put record truncated"));
                }
                let document = decode_document(&payload[..len])
                    .map_err(|e| CoreError::tamper(format!("WAL document: {e}")))?;
                payload.advance(len);
                Self::Put {
                    txid,
                    group,
                    id,
                    document,
                }
            }
            WalRecordType::Delete => {
                let (group, id) = get_target(&mut payload)?;
                Self::Delete { txid, group, id }
            }
        };

        if payload.has_remaining() {
            return Err(CoreError::tamper(format!(
                "{} trailing bytes after {record_type:?} record",
                payload.remaining()
            )));
        }
        Ok((seq, record))
    }
}

fn put_target(buf: &mut Vec<u8>, group: &str, id: &DocumentId) -> CoreResult<()> {
    let len = u16::try_from(group.len())
        .map_err(|_| CoreError::InvalidGroupName {
            name: group.to_string(),
        })?;
    buf.put_u16_le(len);
    buf.put_slice(group.as_bytes());
    buf.put_slice(id.as_bytes());
    Ok(())
}

fn get_target(payload: &mut &[u8]) -> CoreResult<(String, DocumentId)> {
    if payload.remaining() < 2 {
        return Err(CoreError::tamper("WAL record truncated before group name"));
    }
    let len = payload.get_u16_le() as usize;
    if payload.remaining() < len + 16 {
        return Err(CoreError::tamper("WAL record truncated inside target"));
    }
    let group = std::str::from_utf8(&payload[..len])
        .map_err(|_| CoreError::tamper("WAL group name is not UTF-8"))?
        .to_string();
    payload.advance(len);
    let mut id = [0u8; 16];
    payload.copy_to_slice(&mut id);
    Ok((group, DocumentId::from_bytes(id)))
}

fn get_u32(payload: &mut &[u8]) -> CoreResult<u32> {
    if payload.remaining() < 4 {
        return Err(CoreError::tamper("WAL record truncated"));
    }
    Ok(payload.get_u32_le())
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealdb_codec::doc;

    #[test]
    fn record_type_bytes() {
        for t in [
            WalRecordType::Begin,
            WalRecordType::Put,
            WalRecordType::Delete,
            WalRecordType::Commit,
        ] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(5), None);
    }

    #[test]
    fn put_record_keeps_document() {
        let record = WalRecord::Put {
            txid: TransactionId::new(7),
            group: "users".into(),
            id: DocumentId::new(),
            document: doc! { "name" => "alice", "age" => 30 },
        };
        let bytes = record.encode(SequenceNumber::new(42)).unwrap();
        let (seq, decoded) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(seq, SequenceNumber::new(42));
        assert_eq!(decoded, record);
    }

    #[test]
    fn delete_and_markers_decode() {
        let id = DocumentId::new();
        for record in [
            WalRecord::Begin {
                txid: TransactionId::new(1),
            },
            WalRecord::Delete {
                txid: TransactionId::new(1),
                group: "g".into(),
                id,
            },
            WalRecord::Commit {
                txid: TransactionId::new(1),
            },
        ] {
            let bytes = record.encode(SequenceNumber::new(3)).unwrap();
            assert_eq!(WalRecord::decode(&bytes).unwrap().1, record);
        }
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = WalRecord::Delete {
            txid: TransactionId::new(1),
            group: "orders".into(),
            id: DocumentId::new(),
        };
        let bytes = record.encode(SequenceNumber::new(1)).unwrap();
        for cut in [0, 10, 17, 20, bytes.len() - 1] {
            assert!(WalRecord::decode(&bytes[..cut]).unwrap_err().is_tamper());
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = WalRecord::Commit {
            txid: TransactionId::new(9),
        }
        .encode(SequenceNumber::new(1))
        .unwrap();
        bytes.push(0);
        assert!(WalRecord::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = WalRecord::Begin {
            txid: TransactionId::new(1),
        }
        .encode(SequenceNumber::new(1))
        .unwrap();
        bytes[8] = 0x7f;
        assert!(WalRecord::decode(&bytes).unwrap_err().is_tamper());
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty() {
        assert_eq!(compute_crc32(&[]), 0);
    }
}
