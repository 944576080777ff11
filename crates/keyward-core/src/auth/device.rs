use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tracing::info;

use crate::error::VaultError;
use crate::vault::{crypto, SecureVault, DEVICE_FINGERPRINT_KEY};

/// Random bytes behind a fingerprint (256 bits).
const FINGERPRINT_BYTES: usize = 32;

/// Stable per-install identifier binding a session to this installation.
///
/// Only ever compared for equality. Regenerating it invalidates every
/// persisted session.
pub struct DeviceIdentity {
    vault: Arc<SecureVault>,
    cached: Mutex<Option<String>>,
}

impl DeviceIdentity {
    pub fn new(vault: Arc<SecureVault>) -> Self {
        Self {
            vault,
            cached: Mutex::new(None),
        }
    }

    /// Return this install's fingerprint, generating and persisting it on first use.
    pub fn fingerprint(&self) -> Result<String, VaultError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| VaultError::KeyStore("fingerprint lock poisoned".to_string()))?;
        if let Some(ref fingerprint) = *cached {
            return Ok(fingerprint.clone());
        }

        let fingerprint = match self.vault.get(DEVICE_FINGERPRINT_KEY)? {
            Some(existing) => existing,
            None => {
                let bytes: [u8; FINGERPRINT_BYTES] = crypto::random_bytes();
                let generated = URL_SAFE_NO_PAD.encode(bytes);
                self.vault.put(DEVICE_FINGERPRINT_KEY, &generated)?;
                info!("Generated new device fingerprint");
                generated
            }
        };

        *cached = Some(fingerprint.clone());
        Ok(fingerprint)
    }
}
