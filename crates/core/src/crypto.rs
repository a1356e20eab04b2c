//! Authenticated encryption for capture-store lines.
//!
//! AES-256-GCM under a single 256-bit key. Ciphertext layout is a 12-byte
//! random nonce followed by the GCM ciphertext and tag; there is no key
//! identifier. Keys travel base64url-encoded (no padding) in configs,
//! environment variables, and key files.

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{Error, Result};
use cm_protocol::KeySource;

/// Key length in bytes.
pub const KEY_BYTES: usize = 32;

const NONCE_BYTES: usize = 12;

/// Key files above this size are rejected as certainly-not-a-key.
const MAX_KEY_FILE_BYTES: u64 = 4096;

/// A resolved store encryption key.
#[derive(Clone)]
pub struct StoreKey {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("StoreKey(..)")
    }
}

impl StoreKey {
    /// Parses a base64url (no padding) encoded 256-bit key.
    pub fn from_base64url(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim().as_bytes())
            .map_err(|e| Error::ConfigInvalid(format!("encryption key is not base64url: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_BYTES {
            return Err(Error::ConfigInvalid(format!(
                "encryption key must be {KEY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(bytes)
                .map_err(|_| Error::ConfigInvalid("bad key length".to_string()))?,
        })
    }

    /// Resolves a key from its configured source. Precedence between sources
    /// is encoded in [`KeySource`] itself; this only materializes one.
    pub fn resolve(source: &KeySource) -> Result<Option<Self>> {
        match source {
            KeySource::None => Ok(None),
            KeySource::Inline(encoded) => Self::from_base64url(encoded).map(Some),
            KeySource::Env(var) => {
                let encoded = std::env::var(var).map_err(|_| {
                    Error::ConfigInvalid(format!("encryption key env var '{var}' is not set"))
                })?;
                Self::from_base64url(&encoded).map(Some)
            }
            KeySource::File(path) => Self::from_key_file(path).map(Some),
        }
    }

    fn from_key_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            Error::ConfigInvalid(format!("key file {}: {e}", path.display()))
        })?;
        if !metadata.is_file() {
            return Err(Error::ConfigInvalid(format!(
                "key file {} is not a regular file",
                path.display()
            )));
        }
        if metadata.len() > MAX_KEY_FILE_BYTES {
            return Err(Error::ConfigInvalid(format!(
                "key file {} is {} bytes; refusing to read more than {MAX_KEY_FILE_BYTES}",
                path.display(),
                metadata.len()
            )));
        }
        let encoded = std::fs::read_to_string(path)?;
        Self::from_base64url(&encoded)
    }

    /// Encrypts `plaintext`; output is nonce-prefixed and opaque.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::CaptureAuthFailure)?;

        let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.append(&mut ciphertext);
        Ok(out)
    }

    /// Decrypts and authenticates nonce-prefixed ciphertext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_BYTES {
            return Err(Error::CaptureAuthFailure);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::CaptureAuthFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> StoreKey {
        StoreKey::from_bytes(&[7u8; KEY_BYTES]).unwrap()
    }

    #[test]
    fn round_trip() {
        let key = test_key();
        let ciphertext = key.encrypt(b"secret line").unwrap();
        assert_ne!(&ciphertext[NONCE_BYTES..], b"secret line");
        assert_eq!(key.decrypt(&ciphertext).unwrap(), b"secret line");
    }

    #[test]
    fn tampering_fails_authentication() {
        let key = test_key();
        let mut ciphertext = key.encrypt(b"secret line").unwrap();
        *ciphertext.last_mut().unwrap() ^= 0x01;

        let err = key.decrypt(&ciphertext).unwrap_err();
        assert!(matches!(err, Error::CaptureAuthFailure));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ciphertext = test_key().encrypt(b"secret line").unwrap();
        let other = StoreKey::from_bytes(&[8u8; KEY_BYTES]).unwrap();
        assert!(matches!(
            other.decrypt(&ciphertext),
            Err(Error::CaptureAuthFailure)
        ));
    }

    #[test]
    fn base64url_key_round_trip() {
        let encoded = URL_SAFE_NO_PAD.encode([9u8; KEY_BYTES]);
        let key = StoreKey::from_base64url(&encoded).unwrap();
        let ciphertext = key.encrypt(b"x").unwrap();
        assert_eq!(key.decrypt(&ciphertext).unwrap(), b"x");
    }

    #[test]
    fn short_key_is_config_error() {
        let encoded = URL_SAFE_NO_PAD.encode([1u8; 16]);
        assert!(matches!(
            StoreKey::from_base64url(&encoded),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn resolve_env_source() {
        let encoded = URL_SAFE_NO_PAD.encode([3u8; KEY_BYTES]);
        // Unique name to avoid cross-test interference.
        let var = "CM_TEST_KEY_RESOLVE_ENV";
        unsafe { std::env::set_var(var, &encoded) };

        let key = StoreKey::resolve(&KeySource::Env(var.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(key.decrypt(&key.encrypt(b"y").unwrap()).unwrap(), b"y");

        unsafe { std::env::remove_var(var) };
    }

    #[test]
    fn resolve_missing_env_is_config_error() {
        let err = StoreKey::resolve(&KeySource::Env("CM_TEST_KEY_DOES_NOT_EXIST".into()))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn resolve_none_is_none() {
        assert!(StoreKey::resolve(&KeySource::None).unwrap().is_none());
    }
}
