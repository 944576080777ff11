//! Where the vault's data key lives.
//!
//! The keychain provider is preferred. The passphrase provider is the
//! fallback for hosts without a usable keychain and is reported as weaker.

use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::crypto::{self, DataKey, SALT_SIZE};
use crate::error::VaultError;

const SERVICE_NAME: &str = "keyward";
const KEY_ACCOUNT: &str = "vault-data-key";
const PROBE_ACCOUNT: &str = "vault-probe";

/// Key file name for the passphrase fallback
const KEY_FILE: &str = "vault.key";
const KEY_FILE_VERSION: u32 = 1;

/// Environment variable supplying the fallback passphrase
pub const PASSPHRASE_ENV: &str = "KEYWARD_VAULT_PASSPHRASE";

/// How strongly the data key is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProtection {
    /// OS keychain / hardware-backed keystore.
    Platform,
    /// Passphrase-wrapped file on disk. Weaker than `Platform`.
    Fallback,
    /// Lives only in process memory.
    Ephemeral,
}

pub trait KeyProvider: Send + Sync {
    /// Return the install's data key, generating and persisting it on first use.
    fn load_or_create(&self) -> Result<DataKey, VaultError>;

    fn protection(&self) -> KeyProtection;
}

/// Data key stored in the OS keychain.
pub struct KeyringKeyProvider {
    service: String,
}

impl KeyringKeyProvider {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Check that the keychain persists values across entries.
    ///
    /// A keychain without a platform backend accepts writes but loses them,
    /// which would silently rotate the data key on every start.
    pub fn is_usable(&self) -> bool {
        let probe = "probe";
        let written = Entry::new(&self.service, PROBE_ACCOUNT)
            .and_then(|entry| entry.set_password(probe));
        if let Err(e) = written {
            debug!(error = %e, "Keychain write probe failed");
            return false;
        }

        let read_back = Entry::new(&self.service, PROBE_ACCOUNT)
            .and_then(|entry| entry.get_password());
        let usable = matches!(read_back, Ok(ref value) if value == probe);

        if let Ok(entry) = Entry::new(&self.service, PROBE_ACCOUNT) {
            let _ = entry.delete_credential();
        }
        usable
    }

    fn entry(&self) -> Result<Entry, VaultError> {
        Entry::new(&self.service, KEY_ACCOUNT)
            .map_err(|e| VaultError::KeyStore(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyProvider for KeyringKeyProvider {
    fn load_or_create(&self) -> Result<DataKey, VaultError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| VaultError::KeyStore(format!("Corrupt keychain key: {}", e)))?;
                DataKey::from_slice(&bytes)
            }
            Err(keyring::Error::NoEntry) => {
                debug!("Generating vault data key in keychain");
                let key = DataKey::generate();
                entry
                    .set_password(&STANDARD.encode(key.as_bytes()))
                    .map_err(|e| {
                        VaultError::KeyStore(format!("Failed to store key in keychain: {}", e))
                    })?;
                Ok(key)
            }
            Err(e) => Err(VaultError::KeyStore(format!(
                "Failed to read key from keychain: {}",
                e
            ))),
        }
    }

    fn protection(&self) -> KeyProtection {
        KeyProtection::Platform
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    salt: String,
    wrapped_key: String,
}

/// Data key wrapped with an Argon2id-derived key and stored in a file.
pub struct PassphraseKeyProvider {
    path: PathBuf,
    passphrase: String,
}

impl PassphraseKeyProvider {
    pub fn new(dir: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: dir.into().join(KEY_FILE),
            passphrase: passphrase.into(),
        }
    }

    /// Passphrase from the environment, or an install-path derived value.
    ///
    /// The derived value only obfuscates the key file; anyone who can read
    /// the file and knows the home directory can unwrap it.
    pub fn default_passphrase() -> String {
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            if !passphrase.is_empty() {
                return passphrase;
            }
        }
        let home = dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        format!("{}:{}", SERVICE_NAME, home)
    }
}

impl KeyProvider for PassphraseKeyProvider {
    fn load_or_create(&self) -> Result<DataKey, VaultError> {
        if self.path.exists() {
            let contents = std::fs::read_to_string(&self.path)?;
            let file: KeyFile = serde_json::from_str(&contents)?;
            if file.version != KEY_FILE_VERSION {
                return Err(VaultError::KeyStore(format!(
                    "Unsupported key file version {}",
                    file.version
                )));
            }
            let salt = STANDARD
                .decode(&file.salt)
                .map_err(|e| VaultError::KeyStore(format!("Corrupt key file salt: {}", e)))?;
            let wrapped = STANDARD
                .decode(&file.wrapped_key)
                .map_err(|e| VaultError::KeyStore(format!("Corrupt key file: {}", e)))?;
            let wrapping = crypto::derive_wrapping_key(self.passphrase.as_bytes(), &salt)?;
            let raw = crypto::open(&wrapping, &wrapped)?;
            return DataKey::from_slice(&raw);
        }

        warn!(
            path = %self.path.display(),
            "Creating passphrase-wrapped vault key; this is weaker than the OS keychain"
        );
        let key = DataKey::generate();
        let salt: [u8; SALT_SIZE] = crypto::random_bytes();
        let wrapping = crypto::derive_wrapping_key(self.passphrase.as_bytes(), &salt)?;
        let file = KeyFile {
            version: KEY_FILE_VERSION,
            salt: STANDARD.encode(salt),
            wrapped_key: STANDARD.encode(crypto::seal(&wrapping, key.as_bytes())?),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(key)
    }

    fn protection(&self) -> KeyProtection {
        KeyProtection::Fallback
    }
}

/// A key that dies with the process.
pub struct MemoryKeyProvider {
    key: DataKey,
}

impl MemoryKeyProvider {
    pub fn new() -> Self {
        Self {
            key: DataKey::generate(),
        }
    }
}

impl Default for MemoryKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyProvider for MemoryKeyProvider {
    fn load_or_create(&self) -> Result<DataKey, VaultError> {
        Ok(self.key.clone())
    }

    fn protection(&self) -> KeyProtection {
        KeyProtection::Ephemeral
    }
}
