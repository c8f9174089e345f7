//! Secret store abstraction
//!
//! The OS keychain is an external collaborator; the core talks to it
//! through [`SecretStore`]. [`FileSecretStore`] stands in on hosts
//! without a keychain service (one 0600-permission file per secret), and
//! [`MemorySecretStore`] backs the tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Secret store failures.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    /// The platform secret store refused access
    #[error("secret store access denied: {0}")]
    AccessDenied(String),

    /// Underlying I/O failure
    #[error("secret store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Named secret storage.
///
/// Names are flat strings; values are opaque bytes. Implementations must
/// overwrite on `set` and tolerate deleting a missing name.
pub trait SecretStore: Send + Sync {
    /// Read a secret, `None` when absent.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError>;

    /// Write (or overwrite) a secret.
    fn set(&self, name: &str, value: &[u8]) -> Result<(), SecretStoreError>;

    /// Delete a secret; deleting a missing name is a no-op.
    fn delete(&self, name: &str) -> Result<(), SecretStoreError>;
}

/// File-per-secret store with owner-only permissions.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    /// Open (creating if needed) a secret directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SecretStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileSecretStore { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        match fs::read(self.path_for(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(SecretStoreError::AccessDenied(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        let path = self.path_for(name);
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                file.set_permissions(fs::Permissions::from_mode(0o600))?;
            }
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory secret store for tests.
///
/// `deny_access` flips every call into an access-denied failure, which
/// is how the keystore-unavailable startup path is exercised.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Vec<u8>>>,
    deny: Mutex<bool>,
}

impl MemorySecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle access denial.
    pub fn deny_access(&self, deny: bool) {
        *self.deny.lock() = deny;
    }

    fn check_access(&self) -> Result<(), SecretStoreError> {
        if *self.deny.lock() {
            Err(SecretStoreError::AccessDenied("denied by test".into()))
        } else {
            Ok(())
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        self.check_access()?;
        Ok(self.secrets.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<(), SecretStoreError> {
        self.check_access()?;
        self.secrets.lock().insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        self.check_access()?;
        self.secrets.lock().remove(name);
        Ok(())
    }
}
