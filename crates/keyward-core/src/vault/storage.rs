//! Backends holding the vault's sealed blobs.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::VaultError;

/// Raw byte persistence underneath the vault. Implementations never see
/// plaintext; the vault seals values before handing them over.
pub trait SecureStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), VaultError>;
    fn remove(&self, key: &str) -> Result<(), VaultError>;
}

/// One file per key inside a private directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, VaultError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(VaultError::Storage(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid vault key '{}'", key),
            )));
        }
        Ok(self.dir.join(format!("{}.bin", key)))
    }
}

impl SecureStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), VaultError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)?;
        restrict_permissions(&tmp, 0o600)?;
        // rename is atomic on the same filesystem, so readers never see half a value
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), VaultError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), VaultError> {
    Ok(())
}

/// Process-local storage for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> VaultError {
    VaultError::Storage(std::io::Error::new(
        ErrorKind::Other,
        "memory storage lock poisoned",
    ))
}

impl SecureStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, VaultError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), VaultError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
