//! The codec pipeline: serialize, compress, seal.
//!
//! Every document block in the data file and every WAL entry passes through
//! here. A sealed frame is laid out as
//!
//! ```text
//! [format-version u8][flags u8][nonce 12][ciphertext][tag 16]
//! ```
//!
//! The version and flag bytes are authenticated together with a caller
//! supplied context, so a frame cannot be replayed under a different header
//! or moved from the WAL into the data file. Authentication is checked
//! before anything is decompressed or deserialized.

use crate::config::{Config, KdfParams};
use crate::crypto::{Cipher, EncryptionKey, NONCE_SIZE, SALT_SIZE, TAG_SIZE};
use crate::error::{CoreError, CoreResult};
use sealdb_codec::{decode_document, encode_document, Document};

/// Current frame format version.
pub const FORMAT_VERSION: u8 = 1;

/// Flag bit: the plaintext was zstd-compressed before sealing.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Bytes a frame adds on top of its (possibly compressed) payload.
pub const FRAME_OVERHEAD: usize = 2 + NONCE_SIZE + TAG_SIZE;

/// Serializes, compresses and seals payloads under one key.
#[derive(Debug)]
pub struct Pipeline {
    cipher: Cipher,
    compression_threshold: usize,
    compression_level: i32,
}

impl Pipeline {
    /// Creates a pipeline for `key` using the compression settings of `config`.
    #[must_use]
    pub fn new(key: &EncryptionKey, config: &Config) -> Self {
        Self {
            cipher: Cipher::new(key),
            compression_threshold: config.compression_threshold,
            compression_level: config.compression_level,
        }
    }

    /// Encodes a document into a sealed frame.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or encryption fails.
    pub fn encode(&self, doc: &Document, context: &[u8]) -> CoreResult<Vec<u8>> {
        self.seal(&encode_document(doc), context)
    }

    /// Decodes a sealed frame back into a document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] if the frame fails
    /// authentication or its authenticated content does not decode.
    pub fn decode(&self, frame: &[u8], context: &[u8]) -> CoreResult<Document> {
        let plain = self.open(frame, context)?;
        decode_document(&plain)
            .map_err(|e| CoreError::tamper(format!("authenticated payload does not decode: {e}")))
    }

    /// Compresses (when worthwhile) and seals raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compression or encryption fails.
    pub fn seal(&self, plain: &[u8], context: &[u8]) -> CoreResult<Vec<u8>> {
        let mut flags = 0u8;
        let compressed = if plain.len() >= self.compression_threshold {
            let packed = zstd::stream::encode_all(plain, self.compression_level)?;
            (packed.len() < plain.len()).then_some(packed)
        } else {
            None
        };
        let body = match &compressed {
            Some(packed) => {
                flags |= FLAG_COMPRESSED;
                packed.as_slice()
            }
            None => plain,
        };

        let header = [FORMAT_VERSION, flags];
        let sealed = self.cipher.seal(body, &associated_data(&header, context))?;

        let mut frame = Vec::with_capacity(header.len() + sealed.len());
        frame.extend_from_slice(&header);
        frame.extend(sealed);
        Ok(frame)
    }

    /// Verifies, decrypts and decompresses a frame made by [`Pipeline::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TamperOrCorruption`] on any authentication,
    /// version or decompression failure.
    pub fn open(&self, frame: &[u8], context: &[u8]) -> CoreResult<Vec<u8>> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CoreError::tamper(format!(
                "frame of {} bytes is shorter than the {FRAME_OVERHEAD} byte overhead",
                frame.len()
            )));
        }
        let (header, sealed) = frame.split_at(2);
        if header[0] != FORMAT_VERSION {
            return Err(CoreError::tamper(format!(
                "unknown frame version {}",
                header[0]
            )));
        }

        let body = self.cipher.open(sealed, &associated_data(header, context))?;

        // Flags are authenticated from here on.
        let flags = header[1];
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(CoreError::tamper(format!("unknown frame flags {flags:#04x}")));
        }
        if flags & FLAG_COMPRESSED == 0 {
            return Ok(body);
        }
        zstd::stream::decode_all(body.as_slice())
            .map_err(|e| CoreError::tamper(format!("authenticated payload does not decompress: {e}")))
    }
}

/// HKDF info string for the record store subkey.
const RECORDS_KEY_INFO: &[u8] = b"sealdb-records-v1";
/// HKDF info string for the WAL subkey.
const WAL_KEY_INFO: &[u8] = b"sealdb-wal-v1";

/// The two pipelines of an open database, one per subkey.
#[derive(Debug)]
pub struct Keyring {
    /// Seals document and catalog blocks in the data file.
    pub records: Pipeline,
    /// Seals WAL entries.
    pub wal: Pipeline,
}

impl Keyring {
    /// Stretches `passphrase` with Argon2id and splits the result into the
    /// record and WAL subkeys.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyDerivation`] if the KDF parameters are invalid.
    pub fn derive(
        passphrase: &[u8],
        salt: &[u8; SALT_SIZE],
        kdf: &KdfParams,
        config: &Config,
    ) -> CoreResult<Self> {
        let master = EncryptionKey::derive_from_passphrase(passphrase, salt, kdf)?;
        Ok(Self {
            records: Pipeline::new(&master.subkey(RECORDS_KEY_INFO)?, config),
            wal: Pipeline::new(&master.subkey(WAL_KEY_INFO)?, config),
        })
    }
}

fn associated_data(header: &[u8], context: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(header.len() + context.len());
    aad.extend_from_slice(header);
    aad.extend_from_slice(context);
    aad
}
