//! Encryption at rest.
//!
//! - the passphrase is stretched with Argon2id over a per-database salt
//! - purpose-specific subkeys (records, WAL) come from HKDF-SHA256
//! - every frame is sealed with AES-256-GCM under a fresh random nonce
//! - keys are zeroized on drop and never printed

mod cipher;
mod key;

pub use cipher::{Cipher, NONCE_SIZE, TAG_SIZE};
pub use key::{generate_salt, EncryptionKey, KEY_SIZE, SALT_SIZE};
