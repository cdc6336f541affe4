//! In-memory credential storage implementation.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CompareAndSwap, CredentialStore, CredentialTable, StoreError};
use crate::model::{Credential, TenantId};

/// In-memory credential store for testing and embedding.
///
/// This store is not persistent; data is lost when the process exits.
///
/// # Thread Safety
///
/// All operations take a single `parking_lot::Mutex`, which makes each
/// mutation atomic and the store safe to share across threads.
#[derive(Default)]
pub struct MemoryCredentialStore {
    table: Mutex<CredentialTable>,
}

impl MemoryCredentialStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store with initial credentials.
    pub fn with_credentials(credentials: Vec<Credential>) -> Self {
        Self {
            table: Mutex::new(CredentialTable::from_records(credentials)),
        }
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.table.lock().list().len();
        f.debug_struct("MemoryCredentialStore")
            .field("tenants", &count)
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credential>, StoreError> {
        Ok(self.table.lock().get(tenant))
    }

    async fn save(&self, credential: Credential) -> Result<Credential, StoreError> {
        Ok(self.table.lock().save(credential))
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        credential: Credential,
    ) -> Result<CompareAndSwap, StoreError> {
        Ok(self.table.lock().compare_and_swap(expected_revision, credential))
    }

    async fn clear(&self, tenant: &TenantId) -> Result<bool, StoreError> {
        Ok(self.table.lock().clear(tenant))
    }

    async fn list(&self) -> Result<Vec<Credential>, StoreError> {
        Ok(self.table.lock().list())
    }
}
