//! Encrypted key/value persistence for credentials.
//!
//! This module provides:
//! - `SecureVault`: seals every value with ChaCha20-Poly1305 before it reaches storage
//! - `SecureStorage`: where sealed blobs live (files or memory)
//! - `KeyProvider`: where the data key lives (OS keychain, passphrase file, or memory)
//!
//! Backends are chosen once at construction; the vault never branches per call.

pub mod crypto;
pub mod keys;
pub mod storage;

use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::config::{Config, KeyStoreKind};
use crate::error::VaultError;

pub use crypto::DataKey;
pub use keys::{
    KeyProtection, KeyProvider, KeyringKeyProvider, MemoryKeyProvider, PassphraseKeyProvider,
};
pub use storage::{FileStorage, MemoryStorage, SecureStorage};

/// Persisted key for the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";
/// Persisted key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
/// Persisted key for the per-install fingerprint
pub const DEVICE_FINGERPRINT_KEY: &str = "device_fingerprint";
/// Persisted key for the session metadata JSON
pub const SESSION_METADATA_KEY: &str = "session_metadata";

/// Subdirectory of the data directory holding sealed values
const VAULT_DIR: &str = "vault";

pub struct SecureVault {
    storage: Arc<dyn SecureStorage>,
    keys: Arc<dyn KeyProvider>,
    data_key: Mutex<Option<DataKey>>,
}

impl SecureVault {
    pub fn new(storage: Arc<dyn SecureStorage>, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            storage,
            keys,
            data_key: Mutex::new(None),
        }
    }

    /// Vault held entirely in memory.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryKeyProvider::new()),
        )
    }

    /// Open the on-disk vault, preferring the OS keychain for the data key.
    pub fn open(config: &Config) -> Result<Self, VaultError> {
        let data_dir = config.data_dir()?;
        let storage = Arc::new(FileStorage::new(data_dir.join(VAULT_DIR))?);

        let keys: Arc<dyn KeyProvider> = match config.key_store {
            KeyStoreKind::Keychain => {
                let keyring = KeyringKeyProvider::new();
                if keyring.is_usable() {
                    Arc::new(keyring)
                } else {
                    warn!("OS keychain unavailable; falling back to passphrase-wrapped key file");
                    Arc::new(PassphraseKeyProvider::new(
                        &data_dir,
                        PassphraseKeyProvider::default_passphrase(),
                    ))
                }
            }
            KeyStoreKind::File => Arc::new(PassphraseKeyProvider::new(
                &data_dir,
                PassphraseKeyProvider::default_passphrase(),
            )),
        };

        debug!(dir = %data_dir.display(), protection = ?keys.protection(), "Opened vault");
        Ok(Self::new(storage, keys))
    }

    pub fn protection(&self) -> KeyProtection {
        self.keys.protection()
    }

    /// The data key, generated at most once even under concurrent first use.
    fn data_key(&self) -> Result<DataKey, VaultError> {
        let mut guard = self
            .data_key
            .lock()
            .map_err(|_| VaultError::KeyStore("data key lock poisoned".to_string()))?;
        if let Some(ref key) = *guard {
            return Ok(key.clone());
        }
        let key = self.keys.load_or_create()?;
        *guard = Some(key.clone());
        Ok(key)
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), VaultError> {
        let sealed = crypto::seal(&self.data_key()?, value.as_bytes())?;
        self.storage.write(key, &sealed)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, VaultError> {
        let Some(sealed) = self.storage.read(key)? else {
            return Ok(None);
        };
        let plaintext = crypto::open(&self.data_key()?, &sealed)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| VaultError::InvalidUtf8 {
                key: key.to_string(),
            })
    }

    pub fn delete(&self, key: &str) -> Result<(), VaultError> {
        self.storage.remove(key)
    }

    /// Delete every key, attempting all of them before reporting the first failure.
    pub fn clear(&self, keys: &[&str]) -> Result<(), VaultError> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.storage.remove(key) {
                warn!(key = *key, error = %e, "Failed to delete vault entry");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), VaultError> {
        self.put(key, &serde_json::to_string(value)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, VaultError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
