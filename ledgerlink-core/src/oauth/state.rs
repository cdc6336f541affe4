//! Anti-forgery state ledger.
//!
//! States live in memory. Processes that issue a URL and handle the callback
//! separately (the CLI) carry the ledger between runs with
//! [`load_from`](PendingAuthorizations::load_from) and
//! [`save_to`](PendingAuthorizations::save_to).

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::model::TenantId;
use crate::store::{StoreError, write_private};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingAuthorization {
    tenant: TenantId,
    issued_at: DateTime<Utc>,
}

/// On-disk form of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PendingFile {
    version: u32,
    states: HashMap<String, PendingAuthorization>,
}

/// Issued authorization states awaiting their callback.
///
/// Each state is single use and expires after the configured TTL.
#[derive(Debug)]
pub struct PendingAuthorizations {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingAuthorization>>,
}

impl PendingAuthorizations {
    /// Create an empty ledger whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn is_live(&self, pending: &PendingAuthorization, now: DateTime<Utc>) -> bool {
        now - pending.issued_at < self.ttl
    }

    /// Record a state issued for `tenant`.
    pub fn insert(&self, state: impl Into<String>, tenant: TenantId) {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, p| self.is_live(p, now));
        entries.insert(
            state.into(),
            PendingAuthorization {
                tenant,
                issued_at: now,
            },
        );
    }

    /// Consume a state, returning the tenant it was issued for.
    ///
    /// Unknown, already consumed, and expired states all return `None`.
    pub fn take(&self, state: &str) -> Option<TenantId> {
        let pending = self.entries.lock().remove(state)?;
        if !self.is_live(&pending, Utc::now()) {
            return None;
        }
        Some(pending.tenant)
    }

    /// Whether a live state exists for `tenant`.
    pub fn is_pending(&self, tenant: &TenantId) -> bool {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .any(|p| &p.tenant == tenant && self.is_live(p, now))
    }

    /// Merge live states persisted at `path` into the ledger.
    ///
    /// A missing file is not an error.
    pub fn load_from(&self, path: &Path) -> Result<(), StoreError> {
        if !path.exists() {
            return Ok(());
        }
        let file: PendingFile = serde_json::from_str(&fs::read_to_string(path)?)?;

        let now = Utc::now();
        let mut entries = self.entries.lock();
        for (state, pending) in file.states {
            if self.is_live(&pending, now) {
                entries.entry(state).or_insert(pending);
            }
        }
        Ok(())
    }

    /// Persist the live states to `path`, replacing its contents.
    pub fn save_to(&self, path: &Path) -> Result<(), StoreError> {
        let now = Utc::now();
        let states = self
            .entries
            .lock()
            .iter()
            .filter(|(_, p)| self.is_live(p, now))
            .map(|(state, p)| (state.clone(), p.clone()))
            .collect();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = PendingFile { version: 1, states };
        write_private(path, serde_json::to_string_pretty(&file)?.as_bytes())?;
        Ok(())
    }
}
