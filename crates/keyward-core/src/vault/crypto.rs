//! ChaCha20-Poly1305 sealing for vault values and Argon2id key wrapping.

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

use crate::error::VaultError;

/// Nonce size for ChaCha20-Poly1305 (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Salt size for Argon2id key derivation.
pub const SALT_SIZE: usize = 16;

/// The symmetric key protecting every vault value.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey([u8; KEY_SIZE]);

impl DataKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, VaultError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            VaultError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `plaintext` under `key` with a fresh nonce.
///
/// # Returns
/// `nonce || ciphertext || tag`
pub fn seal(key: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Crypto(e.to_string()))?;

    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Crypto(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a blob produced by [`seal`].
pub fn open(key: &DataKey, sealed: &[u8]) -> Result<Vec<u8>, VaultError> {
    if sealed.len() < NONCE_SIZE {
        return Err(VaultError::Crypto(format!(
            "Sealed value too short: {} bytes",
            sealed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Crypto(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| VaultError::Crypto(e.to_string()))
}

/// Derive a key-wrapping key from a passphrase with Argon2id.
pub fn derive_wrapping_key(passphrase: &[u8], salt: &[u8]) -> Result<DataKey, VaultError> {
    let mut out = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|e| VaultError::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(DataKey(out))
}
