//! Credential storage for upstream media-server accounts.
//!
//! Passwords are never stored in the clear. They are encrypted at rest with
//! AES-256-GCM; the key is derived with HKDF-SHA256 from a persisted salt,
//! not from anything guessable like the hostname.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const SALT_FILENAME: &str = "credential_salt";
const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const HKDF_INFO: &[u8] = b"exstreamtv-core credential encryption key v1";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Encrypts and decrypts upstream account passwords for storage in `media_libraries`.
pub struct CredentialManager {
    state_dir: PathBuf,
}

impl CredentialManager {
    /// `state_dir` is the directory the salt file lives in (the config's data directory).
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// Encrypts a password for storage. Returns nonce-prefixed ciphertext.
    pub fn encrypt(&self, password: &str) -> Result<Vec<u8>> {
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, password.as_bytes())
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend(ciphertext);
        Ok(result)
    }

    /// Decrypts a password previously produced by [`Self::encrypt`].
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<String> {
        if encrypted.len() < NONCE_LENGTH {
            return Err(CredentialError::InvalidData(
                "encrypted data shorter than nonce".to_string(),
            ));
        }

        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CredentialError::DecryptionError(e.to_string()))
    }

    fn derive_key(&self) -> Result<[u8; 32]> {
        let salt = self.get_or_create_salt()?;
        let hk = Hkdf::<Sha256>::new(Some(&salt), &[]);
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| CredentialError::EncryptionError(format!("hkdf expand failed: {e}")))?;
        Ok(key)
    }

    fn get_or_create_salt(&self) -> Result<[u8; SALT_LENGTH]> {
        let salt_path = self.state_dir.join(SALT_FILENAME);

        if salt_path.exists() {
            let salt_data = fs::read(&salt_path)?;
            if salt_data.len() == SALT_LENGTH {
                let mut salt = [0u8; SALT_LENGTH];
                salt.copy_from_slice(&salt_data);
                return Ok(salt);
            }
        }

        let mut salt = [0u8; SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        if let Some(parent) = salt_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&salt_path, &salt)?;

        Ok(salt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn unique_state_dir() -> PathBuf {
        let count = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let thread_id = std::thread::current().id();
        std::env::temp_dir().join(format!("exstreamtv_test_credentials_{:?}_{}", thread_id, count))
    }

    #[test]
    fn roundtrip() {
        let dir = unique_state_dir();
        let manager = CredentialManager::new(dir.clone());

        let password = "correct-horse-battery-staple";
        let encrypted = manager.encrypt(password).unwrap();
        assert_ne!(encrypted, password.as_bytes());

        let decrypted = manager.decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, password);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn same_password_different_ciphertexts_same_plaintext() {
        let dir = unique_state_dir();
        let manager = CredentialManager::new(dir.clone());

        let password = "same_password";
        let e1 = manager.encrypt(password).unwrap();
        let e2 = manager.encrypt(password).unwrap();
        assert_ne!(e1, e2);
        assert_eq!(manager.decrypt(&e1).unwrap(), password);
        assert_eq!(manager.decrypt(&e2).unwrap(), password);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let dir = unique_state_dir();
        let manager = CredentialManager::new(dir.clone());
        assert!(manager.decrypt(&[0, 1, 2]).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn salt_is_stable_across_instances() {
        let dir = unique_state_dir();
        let password = "stable-salt-check";
        let encrypted = CredentialManager::new(dir.clone()).encrypt(password).unwrap();
        let decrypted = CredentialManager::new(dir.clone()).decrypt(&encrypted).unwrap();
        assert_eq!(decrypted, password);
        let _ = fs::remove_dir_all(&dir);
    }
}
