//! File-backed credential storage.
//!
//! Credentials are kept in a single JSON document at
//! `~/.local/share/ledgerlink/credentials.json` on Linux (the platform data
//! directory elsewhere). The document is rewritten after every mutation while
//! the store's lock is held. On Unix the file is only readable by its owner.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{CompareAndSwap, CredentialStore, CredentialTable, StoreError};
use crate::model::{Credential, TenantId};

/// On-disk document format.
#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    /// Version of the document format (for future migrations).
    version: u32,

    /// All stored credentials.
    credentials: Vec<Credential>,
}

/// Credential store persisted as a JSON file.
pub struct FileCredentialStore {
    path: PathBuf,
    table: Mutex<CredentialTable>,
}

impl FileCredentialStore {
    /// Get the default path of the credentials file.
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let dirs = directories::ProjectDirs::from("com", "ledgerlink", "ledgerlink")
            .ok_or(StoreError::DataDirUnavailable)?;
        Ok(dirs.data_dir().join("credentials.json"))
    }

    /// Open the store at the default location.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_path()?)
    }

    /// Open the store at a specific path.
    ///
    /// Creates parent directories if they don't exist. A missing file is
    /// treated as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let table = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: CredentialFile = serde_json::from_str(&contents)?;
            CredentialTable::from_records(file.credentials)
        } else {
            CredentialTable::default()
        };

        tracing::debug!("Opened credential store at {:?}", path);

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, table: &CredentialTable) -> Result<(), StoreError> {
        let file = CredentialFile {
            version: 1,
            credentials: table.list(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        write_private(&self.path, contents.as_bytes())?;
        Ok(())
    }
}

/// Replace `path` with `contents`, readable by the owner only.
///
/// The data goes to a sibling file first so a crash never leaves a truncated
/// document.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    // `mode` only applies on creation; a leftover temp file keeps its old bits.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credential>, StoreError> {
        Ok(self.table.lock().get(tenant))
    }

    async fn save(&self, credential: Credential) -> Result<Credential, StoreError> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        let stored = next.save(credential);
        self.persist(&next)?;
        *table = next;
        Ok(stored)
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        credential: Credential,
    ) -> Result<CompareAndSwap, StoreError> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        let outcome = next.compare_and_swap(expected_revision, credential);
        if let CompareAndSwap::Updated(_) = outcome {
            self.persist(&next)?;
            *table = next;
        }
        Ok(outcome)
    }

    async fn clear(&self, tenant: &TenantId) -> Result<bool, StoreError> {
        let mut table = self.table.lock();
        let mut next = table.clone();
        if !next.clear(tenant) {
            return Ok(false);
        }
        self.persist(&next)?;
        *table = next;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.table.lock().list())
    }
}
