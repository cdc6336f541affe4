//! Credential storage abstraction.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`CredentialStore`] - Trait for per-tenant credential persistence
//! - [`MemoryCredentialStore`] - In-memory implementation for tests and embedding
//! - [`FileCredentialStore`] - JSON file implementation used by the CLI
//!
//! # Atomicity
//!
//! Every mutation runs under the store's lock, so a [`clear`](CredentialStore::clear)
//! racing with a refresh that finishes later is never overwritten: the refresh
//! writes through [`compare_and_swap`](CredentialStore::compare_and_swap), which
//! fails once the revision has moved.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::model::{Credential, TenantId};

mod file;
mod memory;

pub use file::FileCredentialStore;
pub(crate) use file::write_private;
pub use memory::MemoryCredentialStore;

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose) and is
/// zeroed when dropped. Debug and Display implementations show `[REDACTED]`.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret holds an empty value.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// Error type for credential store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// I/O error reading or writing the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Data directory not available on this platform.
    #[error("data directory not available")]
    DataDirUnavailable,
}

/// Outcome of [`CredentialStore::compare_and_swap`].
#[derive(Debug, Clone)]
pub enum CompareAndSwap {
    /// The write was applied; carries the stored record.
    Updated(Credential),
    /// The stored revision moved; carries the current record, if any.
    Stale(Option<Credential>),
}

/// Durable per-tenant credential records.
///
/// Implementations must apply each mutation atomically per tenant.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the credential for a tenant.
    ///
    /// Returns `Ok(None)` if no credential was ever issued.
    async fn load(&self, tenant: &TenantId) -> Result<Option<Credential>, StoreError>;

    /// Insert or replace the credential for its tenant.
    ///
    /// Returns the stored record with its new revision.
    async fn save(&self, credential: Credential) -> Result<Credential, StoreError>;

    /// Replace the credential only if the stored revision equals `expected_revision`.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        credential: Credential,
    ) -> Result<CompareAndSwap, StoreError>;

    /// Clear the tenant's tokens and mark the credential revoked.
    ///
    /// Returns `Ok(false)` when there was nothing to clear (unknown tenant or
    /// already revoked). Never an error for those cases.
    async fn clear(&self, tenant: &TenantId) -> Result<bool, StoreError>;

    /// List all stored credentials, ordered by tenant id.
    async fn list(&self) -> Result<Vec<Credential>, StoreError>;
}

/// In-memory credential table shared by the store implementations.
///
/// Callers hold the owning lock for the duration of each method.
#[derive(Debug, Default, Clone)]
pub(crate) struct CredentialTable {
    records: HashMap<TenantId, Credential>,
}

impl CredentialTable {
    pub(crate) fn from_records(records: Vec<Credential>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|c| (c.tenant_id.clone(), c))
                .collect(),
        }
    }

    pub(crate) fn get(&self, tenant: &TenantId) -> Option<Credential> {
        self.records.get(tenant).cloned()
    }

    pub(crate) fn save(&mut self, mut credential: Credential) -> Credential {
        let previous = self
            .records
            .get(&credential.tenant_id)
            .map(|c| c.revision)
            .unwrap_or(0);
        credential.revision = previous + 1;
        self.records
            .insert(credential.tenant_id.clone(), credential.clone());
        credential
    }

    pub(crate) fn compare_and_swap(
        &mut self,
        expected_revision: u64,
        credential: Credential,
    ) -> CompareAndSwap {
        match self.records.get(&credential.tenant_id) {
            Some(current) if current.revision == expected_revision => {
                CompareAndSwap::Updated(self.save(credential))
            }
            current => CompareAndSwap::Stale(current.cloned()),
        }
    }

    pub(crate) fn clear(&mut self, tenant: &TenantId) -> bool {
        match self.records.get_mut(tenant) {
            Some(current) if !current.is_revoked() => {
                current.revoke(Utc::now());
                current.revision += 1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn list(&self) -> Vec<Credential> {
        let mut all: Vec<Credential> = self.records.values().cloned().collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}
