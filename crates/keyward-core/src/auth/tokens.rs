use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{TokenStoreError, VaultError};
use crate::vault::{SecureVault, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// Treat access tokens as expired this long before their `exp` claim.
const ACCESS_TOKEN_LEEWAY_SECS: i64 = 30;

/// The access/refresh token pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Expiry embedded in the access token, if it is a JWT carrying `exp`.
    pub fn access_token_expires_at(&self) -> Option<DateTime<Utc>> {
        let payload = self.access_token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        let claims: Claims = serde_json::from_slice(&bytes).ok()?;
        DateTime::from_timestamp(claims.exp?, 0)
    }

    /// Opaque tokens without an expiry are never considered expired here;
    /// the server's 401 is the authority for those.
    pub fn is_access_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.access_token_expires_at()
            .map(|exp| now + Duration::seconds(ACCESS_TOKEN_LEEWAY_SECS) >= exp)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Typed access to the persisted token pair.
pub struct TokenStore {
    vault: Arc<SecureVault>,
}

impl TokenStore {
    pub fn new(vault: Arc<SecureVault>) -> Self {
        Self { vault }
    }

    /// Persist both tokens. The refresh token is written last; if it fails the
    /// previous access token is put back so the pair never mixes generations.
    pub fn set_credential(&self, credential: &Credential) -> Result<(), TokenStoreError> {
        let previous_access = self.vault.get(ACCESS_TOKEN_KEY)?;

        self.vault.put(ACCESS_TOKEN_KEY, &credential.access_token)?;

        if let Err(source) = self.vault.put(REFRESH_TOKEN_KEY, &credential.refresh_token) {
            let rollback = match previous_access {
                Some(ref previous) => self.vault.put(ACCESS_TOKEN_KEY, previous),
                None => self.vault.delete(ACCESS_TOKEN_KEY),
            };
            if let Err(ref e) = rollback {
                warn!(error = %e, "Failed to roll back access token after partial write");
            }
            return Err(TokenStoreError::PartialWrite {
                rolled_back: rollback.is_ok(),
                source,
            });
        }

        debug!("Stored credential");
        Ok(())
    }

    pub fn credential(&self) -> Result<Option<Credential>, TokenStoreError> {
        let access = self.vault.get(ACCESS_TOKEN_KEY)?;
        let refresh = self.vault.get(REFRESH_TOKEN_KEY)?;
        match (access, refresh) {
            (Some(access_token), Some(refresh_token)) => Ok(Some(Credential {
                access_token,
                refresh_token,
            })),
            (None, None) => Ok(None),
            _ => {
                warn!("Only one of the token pair is stored; treating as logged out");
                Ok(None)
            }
        }
    }

    pub fn access_token(&self) -> Result<Option<String>, VaultError> {
        self.vault.get(ACCESS_TOKEN_KEY)
    }

    pub fn clear(&self) -> Result<(), VaultError> {
        self.vault.clear(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{MemoryKeyProvider, MemoryStorage, SecureStorage};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Storage that can be told to reject writes for one key.
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_key: &'static str,
        failing: AtomicBool,
    }

    impl SecureStorage for FlakyStorage {
        fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &[u8]) -> Result<(), VaultError> {
            if self.failing.load(Ordering::SeqCst) && key == self.fail_key {
                return Err(VaultError::Storage(std::io::Error::other("disk full")));
            }
            self.inner.write(key, value)
        }

        fn remove(&self, key: &str) -> Result<(), VaultError> {
            self.inner.remove(key)
        }
    }

    fn flaky_store() -> (TokenStore, Arc<FlakyStorage>) {
        let storage = Arc::new(FlakyStorage {
            inner: MemoryStorage::new(),
            fail_key: REFRESH_TOKEN_KEY,
            failing: AtomicBool::new(false),
        });
        let vault = Arc::new(SecureVault::new(
            storage.clone(),
            Arc::new(MemoryKeyProvider::new()),
        ));
        (TokenStore::new(vault), storage)
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{}}}"#, exp));
        format!("{}.{}.signature", header, payload)
    }

    #[test]
    fn test_set_and_get_credential() {
        let store = TokenStore::new(Arc::new(SecureVault::in_memory()));
        assert_eq!(store.credential().unwrap(), None);

        let credential = Credential::new("access-1", "refresh-1");
        store.set_credential(&credential).unwrap();
        assert_eq!(store.credential().unwrap(), Some(credential));
        assert_eq!(store.access_token().unwrap().as_deref(), Some("access-1"));

        store.clear().unwrap();
        assert_eq!(store.credential().unwrap(), None);
    }

    #[test]
    fn test_failed_refresh_write_rolls_back_access_token() {
        let (store, storage) = flaky_store();
        store
            .set_credential(&Credential::new("access-1", "refresh-1"))
            .unwrap();

        storage.failing.store(true, Ordering::SeqCst);
        let result = store.set_credential(&Credential::new("access-2", "refresh-2"));
        assert!(matches!(
            result,
            Err(TokenStoreError::PartialWrite { rolled_back: true, .. })
        ));

        storage.failing.store(false, Ordering::SeqCst);
        assert_eq!(
            store.credential().unwrap(),
            Some(Credential::new("access-1", "refresh-1"))
        );
    }

    #[test]
    fn test_failed_first_write_removes_new_access_token() {
        let (store, storage) = flaky_store();
        storage.failing.store(true, Ordering::SeqCst);

        let result = store.set_credential(&Credential::new("access-1", "refresh-1"));
        assert!(matches!(
            result,
            Err(TokenStoreError::PartialWrite { rolled_back: true, .. })
        ));

        storage.failing.store(false, Ordering::SeqCst);
        assert_eq!(store.access_token().unwrap(), None);
    }

    #[test]
    fn test_half_stored_pair_reads_as_logged_out() {
        let vault = Arc::new(SecureVault::in_memory());
        vault.put(ACCESS_TOKEN_KEY, "orphan").unwrap();
        let store = TokenStore::new(vault);
        assert_eq!(store.credential().unwrap(), None);
    }

    #[test]
    fn test_jwt_expiry_is_decoded() {
        let exp = Utc::now().timestamp() + 3600;
        let credential = Credential::new(jwt_with_exp(exp), "r");
        assert_eq!(credential.access_token_expires_at().unwrap().timestamp(), exp);
        assert!(!credential.is_access_token_expired(Utc::now()));
        assert!(credential.is_access_token_expired(Utc::now() + Duration::hours(2)));
    }

    #[test]
    fn test_expiry_within_leeway_counts_as_expired() {
        let credential = Credential::new(jwt_with_exp(Utc::now().timestamp() + 10), "r");
        assert!(credential.is_access_token_expired(Utc::now()));
    }

    #[test]
    fn test_opaque_tokens_never_expire_locally() {
        let credential = Credential::new("opaque-token", "r");
        assert_eq!(credential.access_token_expires_at(), None);
        assert!(!credential.is_access_token_expired(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", Credential::new("secret-access", "secret-refresh"));
        assert!(!rendered.contains("secret"));
    }
}
