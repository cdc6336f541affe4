//! Domain model types for Ledgerlink.
//!
//! This module defines the core types used throughout Ledgerlink:
//! - [`TenantId`] - The remote platform's realm identifier for a connected company
//! - [`CredentialState`] - Lifecycle state of a stored credential
//! - [`Credential`] - The per-tenant OAuth credential record
//! - [`ConnectionStatus`] - Derived per-tenant connection state

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::store::Secret;
use crate::token::TokenGrant;

/// Identifier for a connected company (the QuickBooks "realm").
///
/// Realm ids are opaque; no normalization is applied.
///
/// # Examples
///
/// ```
/// use ledgerlink_core::TenantId;
///
/// let realm = TenantId::new("9130357992221046");
/// assert_eq!(realm.as_str(), "9130357992221046");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a new tenant id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Persisted lifecycle state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    /// Tokens are present and were valid when last written.
    Active,
    /// The access token is past its expiry and has not been refreshed yet.
    Expired,
    /// Tokens were revoked or invalidated; re-authorization is required.
    Revoked,
}

impl CredentialState {
    /// Get the state as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// OAuth credential for one tenant.
///
/// A `Revoked` credential never carries tokens. Records are never deleted,
/// only transitioned; `revision` is bumped by the store on every write and
/// drives compare-and-swap updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// The realm this credential authorizes.
    pub tenant_id: TenantId,

    /// Current bearer token.
    pub access_token: Option<Secret>,

    /// Refresh token (rotated by the authorization server on refresh).
    pub refresh_token: Option<Secret>,

    /// When the access token expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// When the refresh token itself expires, if the server reported it.
    #[serde(default)]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,

    /// Lifecycle state.
    pub state: CredentialState,

    /// Store-assigned revision, incremented on every write.
    #[serde(default)]
    pub revision: u64,

    /// When this record was last written.
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Build a freshly issued credential from a token grant.
    pub fn issued(tenant_id: TenantId, grant: TokenGrant, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            access_token: Some(grant.access_token),
            refresh_token: grant.refresh_token,
            expires_at: now.checked_add_signed(grant.expires_in),
            refresh_token_expires_at: grant
                .refresh_token_expires_in
                .and_then(|d| now.checked_add_signed(d)),
            state: CredentialState::Active,
            revision: 0,
            updated_at: now,
        }
    }

    /// Produce the credential that results from a successful refresh.
    ///
    /// The previous refresh token is kept when the grant does not rotate it.
    pub fn refreshed(&self, grant: TokenGrant, now: DateTime<Utc>) -> Self {
        let refresh_token = grant.refresh_token.or_else(|| self.refresh_token.clone());
        let refresh_token_expires_at = grant
            .refresh_token_expires_in
            .and_then(|d| now.checked_add_signed(d))
            .or(self.refresh_token_expires_at);

        Self {
            tenant_id: self.tenant_id.clone(),
            access_token: Some(grant.access_token),
            refresh_token,
            expires_at: now.checked_add_signed(grant.expires_in),
            refresh_token_expires_at,
            state: CredentialState::Active,
            revision: self.revision,
            updated_at: now,
        }
    }

    /// Clear both tokens and mark the credential revoked.
    pub fn revoke(&mut self, now: DateTime<Utc>) {
        self.access_token = None;
        self.refresh_token = None;
        self.expires_at = None;
        self.refresh_token_expires_at = None;
        self.state = CredentialState::Revoked;
        self.updated_at = now;
    }

    /// Whether the credential has been revoked.
    pub fn is_revoked(&self) -> bool {
        self.state == CredentialState::Revoked
    }

    /// Whether the access token is expired at `now`, treating tokens that
    /// expire within `buffer` as already expired.
    ///
    /// A credential without an expiry is considered expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match (self.expires_at, now.checked_add_signed(buffer)) {
            (Some(exp), Some(deadline)) => deadline >= exp,
            _ => true,
        }
    }

    /// The access token, if the credential is usable at `now`.
    pub fn usable_access_token(&self, now: DateTime<Utc>, buffer: Duration) -> Option<&Secret> {
        if self.is_revoked() || self.is_expired_at(now, buffer) {
            return None;
        }
        self.access_token.as_ref()
    }

    /// State as observed at `now`: an active credential past its expiry
    /// reports `Expired`.
    pub fn effective_state(&self, now: DateTime<Utc>) -> CredentialState {
        match self.state {
            CredentialState::Active if self.is_expired_at(now, Duration::zero()) => {
                CredentialState::Expired
            }
            state => state,
        }
    }
}

/// Per-tenant connection status, derived from the stored credential and
/// in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No credential has ever been issued.
    Disconnected,
    /// An authorization URL was issued and its state is awaiting the callback.
    AuthorizationPending,
    /// A usable access token is stored.
    Authorized,
    /// The access token is expired and will be refreshed on next use.
    Expired,
    /// A refresh request is in flight.
    Refreshing,
    /// The credential was revoked; re-authorization is required.
    Revoked,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::AuthorizationPending => "authorization_pending",
            Self::Authorized => "authorized",
            Self::Expired => "expired",
            Self::Refreshing => "refreshing",
            Self::Revoked => "revoked",
        };
        write!(f, "{}", s)
    }
}
