//! Key material and derivation.

use crate::config::KdfParams;
use crate::error::{CoreError, CoreResult};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the per-database salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Generates a fresh random salt for a new database.
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// A 256-bit key, zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the key as a byte slice.
    ///
    /// Don't log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Stretches a passphrase into the database master key with Argon2id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyDerivation`] if `params` are out of range for
    /// Argon2.
    pub fn derive_from_passphrase(
        passphrase: &[u8],
        salt: &[u8; SALT_SIZE],
        params: &KdfParams,
    ) -> CoreResult<Self> {
        let argon_params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CoreError::key_derivation(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase, salt, &mut bytes)
            .map_err(|e| CoreError::key_derivation(e.to_string()))?;
        Ok(Self { bytes })
    }

    /// Derives an independent subkey for one purpose with HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyDerivation`] if HKDF expansion fails.
    pub fn subkey(&self, info: &[u8]) -> CoreResult<Self> {
        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(info, &mut bytes)
            .map_err(|_| CoreError::key_derivation("HKDF expand failed"))?;
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let salt = [7u8; SALT_SIZE];
        let params = KdfParams::low_cost();
        let a = EncryptionKey::derive_from_passphrase(b"hunter2", &salt, &params).unwrap();
        let b = EncryptionKey::derive_from_passphrase(b"hunter2", &salt, &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        let other_salt = [8u8; SALT_SIZE];
        let c = EncryptionKey::derive_from_passphrase(b"hunter2", &other_salt, &params).unwrap();
        assert_ne!(a.as_bytes(), c.as_bytes());

        let d = EncryptionKey::derive_from_passphrase(b"hunter3", &salt, &params).unwrap();
        assert_ne!(a.as_bytes(), d.as_bytes());
    }

    #[test]
    fn subkeys_differ_by_purpose() {
        let master = EncryptionKey::generate();
        let records = master.subkey(b"records").unwrap();
        let wal = master.subkey(b"wal").unwrap();
        assert_ne!(records.as_bytes(), wal.as_bytes());
        assert_ne!(records.as_bytes(), master.as_bytes());
        assert_eq!(records.as_bytes(), master.subkey(b"records").unwrap().as_bytes());
    }

    #[test]
    fn invalid_params_are_reported() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 1,
            parallelism: 1,
        };
        let result = EncryptionKey::derive_from_passphrase(b"pw", &[0u8; SALT_SIZE], &params);
        assert!(matches!(result, Err(CoreError::KeyDerivation { .. })));
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
