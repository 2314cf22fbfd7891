//! On-disk persistence of the encrypted transport secret

use super::vault::{self, VaultKey};
use super::CredentialError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What `status` found at the credential path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStatus {
    Missing,
    Readable { bytes: usize },
    Corrupt(String),
}

/// Encrypted single-secret store backed by one file
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    key: VaultKey,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, key: VaultKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encrypt and persist `secret`, replacing any previous blob atomically
    pub fn save(&self, secret: &str) -> Result<(), CredentialError> {
        let blob = vault::encrypt(secret, &self.key)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = open_owner_only(&tmp_path)?;
            file.write_all(&blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        info!(path = %self.path.display(), "Persisted transport credential");
        Ok(())
    }

    /// Load the stored secret; `Ok(None)` when nothing has been stored yet
    pub fn load(&self) -> Result<Option<String>, CredentialError> {
        let blob = match fs::read(&self.path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored credential");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        vault::decrypt(&blob, &self.key).map(Some)
    }

    /// Load the stored secret, failing with `Missing` when absent
    pub fn require(&self) -> Result<String, CredentialError> {
        self.load()?.ok_or(CredentialError::Missing)
    }

    /// Remove the stored blob; returns whether one existed
    pub fn clear(&self) -> Result<bool, CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed stored credential");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn status(&self) -> Result<CredentialStatus, CredentialError> {
        match self.load() {
            Ok(None) => Ok(CredentialStatus::Missing),
            Ok(Some(secret)) => Ok(CredentialStatus::Readable {
                bytes: secret.len(),
            }),
            Err(CredentialError::Corrupt(reason)) => Ok(CredentialStatus::Corrupt(reason)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::credentials::vault::derive_key;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, id: &str) -> CredentialStore {
        CredentialStore::new(
            dir.path().join("nested").join("credential.bin"),
            derive_key(Some(id), Environment::Development).key,
        )
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "srv-1");
        assert_eq!(store.load().unwrap(), None);
        assert!(matches!(store.require(), Err(CredentialError::Missing)));
        assert_eq!(store.status().unwrap(), CredentialStatus::Missing);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "srv-1");
        store.save("amqp://agent:pw@broker:5672").unwrap();
        assert_eq!(
            store.load().unwrap().as_deref(),
            Some("amqp://agent:pw@broker:5672")
        );
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_secret() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "srv-1");
        store.save("first").unwrap();
        store.save("second").unwrap();
        assert_eq!(store.require().unwrap(), "second");
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_owner_read_write_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "srv-1");
        store.save("secret").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_other_identity_sees_corrupt_blob() {
        let dir = TempDir::new().unwrap();
        store_in(&dir, "srv-1").save("secret").unwrap();

        let other = store_in(&dir, "srv-2");
        assert!(matches!(other.load(), Err(CredentialError::Corrupt(_))));
        assert!(matches!(
            other.status().unwrap(),
            CredentialStatus::Corrupt(_)
        ));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, "srv-1");
        assert!(!store.clear().unwrap());
        store.save("secret").unwrap();
        assert!(store.clear().unwrap());
        assert_eq!(store.load().unwrap(), None);
    }
}
