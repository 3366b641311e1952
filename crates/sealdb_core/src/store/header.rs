//! Data file header.
//!
//! ```text
//! | magic "SEALDB\0\1" (8) | params_len (4) | params (CBOR) | crc32 (4) | check_len (4) | key check frame |
//! ```
//!
//! The parameters are stored in the clear because the key cannot be derived
//! without them. The key check frame is a constant sealed with the record
//! subkey; failing to open it means the passphrase is wrong or the header
//! was altered.

use crate::config::KdfParams;
use crate::crypto::SALT_SIZE;
use crate::error::{CoreError, CoreResult};
use crate::pipeline::Pipeline;
use crate::wal::compute_crc32;
use bytes::{Buf, BufMut};
use sealdb_storage::StorageBackend;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of the data file.
pub const FILE_MAGIC: [u8; 8] = *b"SEALDB\0\x01";

/// Current data file format.
pub const FILE_FORMAT: u16 = 1;

const KEY_CHECK: &[u8] = b"sealdb key check";
const KEY_CHECK_CONTEXT: &[u8] = b"sealdb/key-check";

/// Upper bound on the parameter blob, to reject garbage lengths.
const MAX_PARAMS_LEN: usize = 4096;

/// Parameters fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParams {
    /// Data file format.
    pub format: u16,
    /// Argon2id salt, shared with the WAL header.
    pub salt: [u8; SALT_SIZE],
    /// Argon2id cost parameters.
    pub kdf: KdfParams,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// A parsed header, before the key is checked.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Creation parameters.
    pub params: FileParams,
    /// Sealed key check constant.
    key_check: Vec<u8>,
    /// Offset of the first block.
    pub data_start: u64,
}

impl FileHeader {
    /// Encodes a header for `params`, sealing the key check with `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters cannot be serialized or sealed.
    pub fn encode(params: &FileParams, pipeline: &Pipeline) -> CoreResult<Vec<u8>> {
        let mut encoded = Vec::new();
        ciborium::into_writer(params, &mut encoded)
            .map_err(|e| CoreError::invalid_format(format!("cannot encode header: {e}")))?;
        let key_check = pipeline.seal(KEY_CHECK, KEY_CHECK_CONTEXT)?;

        let mut buf = Vec::with_capacity(8 + 4 + encoded.len() + 8 + key_check.len());
        buf.put_slice(&FILE_MAGIC);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(&encoded);
        let crc = compute_crc32(&buf);
        buf.put_u32_le(crc);
        buf.put_u32_le(key_check.len() as u32);
        buf.put_slice(&key_check);
        Ok(buf)
    }

    /// Reads the header of `backend`. Returns `None` for an empty file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFormat`] if the file is not a SealDB data
    /// file, or [`CoreError::TamperOrCorruption`] if the header is damaged.
    pub fn read(backend: &dyn StorageBackend) -> CoreResult<Option<Self>> {
        let size = backend.size()?;
        if size == 0 {
            return Ok(None);
        }
        if size < 12 {
            return Err(CoreError::tamper("data file shorter than its header"));
        }

        let mut prefix = backend.read_at(0, 12)?;
        if prefix[..8] != FILE_MAGIC {
            return Err(CoreError::invalid_format("not a SealDB data file"));
        }
        let params_len = (&prefix[8..12]).get_u32_le() as usize;
        if params_len > MAX_PARAMS_LEN || 12 + params_len as u64 + 8 > size {
            return Err(CoreError::tamper("data file header length is implausible"));
        }

        let rest = backend.read_at(12, params_len + 8)?;
        let (params_bytes, mut tail) = rest.split_at(params_len);
        prefix.extend_from_slice(params_bytes);
        if compute_crc32(&prefix) != tail.get_u32_le() {
            return Err(CoreError::tamper("data file header checksum mismatch"));
        }
        let check_len = tail.get_u32_le() as usize;
        let check_offset = 12 + params_len as u64 + 8;
        if check_len > MAX_PARAMS_LEN || check_offset + check_len as u64 > size {
            return Err(CoreError::tamper("key check frame truncated"));
        }

        let params: FileParams = ciborium::from_reader(params_bytes)
            .map_err(|e| CoreError::tamper(format!("data file parameters: {e}")))?;
        if params.format != FILE_FORMAT {
            return Err(CoreError::invalid_format(format!(
                "unsupported data file format {}",
                params.format
            )));
        }

        Ok(Some(Self {
            params,
            key_check: backend.read_at(check_offset, check_len)?,
            data_start: check_offset + check_len as u64,
        }))
    }

    /// Confirms that `pipeline` holds the key this file was created with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] for a wrong passphrase or
    /// an altered header.
    pub fn verify_key(&self, pipeline: &Pipeline) -> CoreResult<()> {
        let opened = pipeline
            .open(&self.key_check, KEY_CHECK_CONTEXT)
            .map_err(|_| CoreError::tamper("wrong passphrase or altered data file header"))?;
        if opened != KEY_CHECK {
            return Err(CoreError::tamper("key check constant mismatch"));
        }
        Ok(())
    }
}
