//! Default implementation of the TokenManager trait.
//!
//! This module provides [`DefaultTokenManager`], the per-tenant OAuth
//! credential lifecycle for QuickBooks Online: authorization URLs, code
//! exchange, refresh, revocation and local disconnection.
//!
//! # Refresh policy
//!
//! - Tokens expiring within the configured buffer are refreshed before use.
//! - Refreshes are single-flight per tenant: one guard per tenant, the
//!   credential is re-read under the guard, so concurrent callers observe
//!   the first caller's result instead of sending their own request.
//! - HTTP 400/401 from the token endpoint revokes the credential, unless a
//!   newer credential was stored while the request was in flight.
//! - Every other failure (network, timeout, 5xx, malformed body) leaves the
//!   stored credential untouched.
//! - Refresh results are written with compare-and-swap; a disconnect that
//!   lands while the request is in flight wins.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use ledgerlink_core::{
//!     ClientConfig, MemoryCredentialStore, TenantId, TokenManager,
//!     token_manager::DefaultTokenManager,
//! };
//!
//! let config = ClientConfig::new("client-id", "client-secret", "https://app.example.com/callback");
//! let manager = DefaultTokenManager::new(Arc::new(config), MemoryCredentialStore::new())?;
//!
//! let realm = TenantId::new("9130357992221046");
//! let token = manager.valid_access_token(&realm).await?;
//! println!("Bearer {}", token.expose());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use reqwest::header::ACCEPT;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    config::ClientConfig,
    model::{ConnectionStatus, Credential, TenantId},
    oauth::{self, PendingAuthorizations},
    store::{CompareAndSwap, CredentialStore, Secret},
    token::{
        AuthorizationRequest, TokenError, TokenErrorResponse, TokenGrant, TokenManager,
        TokenResponse,
    },
};

/// Why a token endpoint call did not produce a grant.
#[derive(Debug)]
enum EndpointFailure {
    /// The server answered with a non-success status.
    Status { status: u16, error: Option<String> },
    /// The request never completed (connect error, timeout, ...).
    Transport(reqwest::Error),
    /// The server answered 2xx with an unusable body.
    Malformed(String),
}

impl std::fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status {
                status,
                error: Some(error),
            } => write!(f, "token endpoint returned HTTP {} ({})", status, error),
            Self::Status { status, error: None } => {
                write!(f, "token endpoint returned HTTP {}", status)
            }
            Self::Transport(e) if e.is_timeout() => write!(f, "token endpoint timed out"),
            Self::Transport(e) => write!(f, "token endpoint unreachable: {}", e),
            Self::Malformed(reason) => write!(f, "malformed token response: {}", reason),
        }
    }
}

type RefreshGuards = Mutex<HashMap<TenantId, Arc<AsyncMutex<()>>>>;

/// Holds a tenant's refresh guard.
///
/// On drop the guard is released and its map entry removed when no other
/// caller is waiting on it.
struct RefreshLease<'a> {
    guards: &'a RefreshGuards,
    tenant: TenantId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for RefreshLease<'_> {
    fn drop(&mut self) {
        let mut guards = self.guards.lock();
        // Released under the map lock so no new caller can clone the guard in between.
        self.held.take();
        let idle = guards
            .get(&self.tenant)
            .is_some_and(|guard| Arc::strong_count(guard) == 1);
        if idle {
            guards.remove(&self.tenant);
        }
    }
}

/// Reports a tenant as refreshing for as long as it is alive.
struct RefreshingMarker<'a> {
    refreshing: &'a Mutex<HashSet<TenantId>>,
    tenant: TenantId,
}

impl<'a> RefreshingMarker<'a> {
    fn new(refreshing: &'a Mutex<HashSet<TenantId>>, tenant: TenantId) -> Self {
        refreshing.lock().insert(tenant.clone());
        Self { refreshing, tenant }
    }
}

impl Drop for RefreshingMarker<'_> {
    fn drop(&mut self) {
        self.refreshing.lock().remove(&self.tenant);
    }
}

/// Default implementation of [`TokenManager`].
///
/// # Type Parameters
///
/// * `S` - The credential store implementation to use
pub struct DefaultTokenManager<S: CredentialStore> {
    config: Arc<ClientConfig>,
    store: S,
    http_client: reqwest::Client,
    pending: PendingAuthorizations,
    refresh_guards: RefreshGuards,
    refreshing: Mutex<HashSet<TenantId>>,
    expiry_buffer: Duration,
}

impl<S: CredentialStore + 'static> DefaultTokenManager<S> {
    /// Create a new token manager with the given configuration and store.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Config`] if the configuration is invalid.
    pub fn new(config: Arc<ClientConfig>, store: S) -> Result<Self, TokenError> {
        config.validate()?;

        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| TokenError::RefreshTransient {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            pending: PendingAuthorizations::new(config.state_ttl()),
            expiry_buffer: config.expiry_buffer(),
            config,
            store,
            http_client,
            refresh_guards: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
        })
    }

    /// The underlying credential store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Load the stored credential for a tenant, if any.
    pub async fn credential(&self, tenant: &TenantId) -> Result<Option<Credential>, TokenError> {
        Ok(self.store.load(tenant).await?)
    }

    /// The ledger of issued, not yet consumed authorization states.
    pub fn pending_authorizations(&self) -> &PendingAuthorizations {
        &self.pending
    }

    /// Consume a pending authorization state.
    ///
    /// Returns the tenant the state was issued for, or `None` if the state is
    /// unknown, already used or expired.
    pub fn verify_state(&self, state: &str) -> Option<TenantId> {
        self.pending.take(state)
    }

    /// Check the callback's state and exchange its code.
    ///
    /// The state is consumed whether or not the exchange succeeds. An
    /// unknown, replayed or expired state fails without contacting the
    /// token endpoint.
    pub async fn complete_authorization(
        &self,
        code: &str,
        realm: &TenantId,
        state: &str,
    ) -> Result<Credential, TokenError> {
        let Some(requested_for) = self.verify_state(state) else {
            tracing::warn!("Rejected authorization callback for {}: unknown state", realm);
            return Err(TokenError::AuthExchangeFailed {
                message: "state parameter is unknown or expired".to_string(),
            });
        };

        if &requested_for != realm {
            tracing::info!(
                "Authorization requested for {} completed for realm {}",
                requested_for,
                realm
            );
        }

        self.exchange_code(code, realm).await
    }

    /// Derive the tenant's connection status.
    pub async fn connection_status(
        &self,
        tenant: &TenantId,
    ) -> Result<ConnectionStatus, TokenError> {
        if self.refreshing.lock().contains(tenant) {
            return Ok(ConnectionStatus::Refreshing);
        }

        let credential = self.store.load(tenant).await?;
        let pending = self.pending.is_pending(tenant);

        let status = match credential {
            None if pending => ConnectionStatus::AuthorizationPending,
            None => ConnectionStatus::Disconnected,
            Some(c) if c.is_revoked() && pending => ConnectionStatus::AuthorizationPending,
            Some(c) if c.is_revoked() => ConnectionStatus::Revoked,
            Some(c) if c.is_expired_at(Utc::now(), Duration::zero()) => ConnectionStatus::Expired,
            Some(_) => ConnectionStatus::Authorized,
        };

        Ok(status)
    }

    /// Wait for the tenant's refresh guard.
    async fn lock_refresh(&self, tenant: &TenantId) -> RefreshLease<'_> {
        let guard = self
            .refresh_guards
            .lock()
            .entry(tenant.clone())
            .or_default()
            .clone();
        let held = guard.lock_owned().await;

        RefreshLease {
            guards: &self.refresh_guards,
            tenant: tenant.clone(),
            held: Some(held),
        }
    }

    /// Revoke `current` unless the store has moved past its revision.
    ///
    /// A newer, non-revoked record written meanwhile (a re-authorization) is
    /// kept and returned.
    async fn revoke_if_current(&self, current: &Credential) -> Result<Credential, TokenError> {
        let tenant = &current.tenant_id;
        let mut revoked = current.clone();
        revoked.revoke(Utc::now());

        match self
            .store
            .compare_and_swap(current.revision, revoked)
            .await?
        {
            CompareAndSwap::Stale(Some(latest)) if !latest.is_revoked() => {
                tracing::info!(
                    "Credential for {} was replaced during refresh; keeping the newer record",
                    tenant
                );
                Ok(latest)
            }
            CompareAndSwap::Updated(_) | CompareAndSwap::Stale(_) => {
                Err(TokenError::RefreshTerminal {
                    tenant: tenant.to_string(),
                })
            }
        }
    }

    async fn load_required(&self, tenant: &TenantId) -> Result<Credential, TokenError> {
        self.store
            .load(tenant)
            .await?
            .ok_or_else(|| TokenError::NotFound {
                tenant: tenant.to_string(),
            })
    }

    /// POST a form to the token endpoint with HTTP Basic client authentication.
    async fn request_tokens(&self, form: &[(&str, &str)]) -> Result<TokenGrant, EndpointFailure> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose()),
            )
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(EndpointFailure::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let error = response
                .json::<TokenErrorResponse>()
                .await
                .ok()
                .and_then(|body| body.error);
            return Err(EndpointFailure::Status {
                status: status.as_u16(),
                error,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EndpointFailure::Malformed(e.to_string()))?;

        body.into_grant()
            .map_err(|reason| EndpointFailure::Malformed(reason.to_string()))
    }

    /// Refresh `current`; the caller holds the tenant's refresh guard.
    async fn refresh_locked(&self, current: Credential) -> Result<Credential, TokenError> {
        let tenant = current.tenant_id.clone();

        if current.is_revoked() {
            return Err(TokenError::RefreshTerminal {
                tenant: tenant.to_string(),
            });
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            tracing::warn!("No refresh token stored for {}, revoking credential", tenant);
            return self.revoke_if_current(&current).await;
        };

        tracing::info!("Refreshing access token for {}", tenant);

        let outcome = {
            let _marker = RefreshingMarker::new(&self.refreshing, tenant.clone());
            self.request_tokens(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
            ])
            .await
        };

        match outcome {
            Ok(grant) => {
                let updated = current.refreshed(grant, Utc::now());
                match self
                    .store
                    .compare_and_swap(current.revision, updated)
                    .await?
                {
                    CompareAndSwap::Updated(stored) => {
                        tracing::info!("Successfully refreshed access token for {}", tenant);
                        Ok(stored)
                    }
                    CompareAndSwap::Stale(Some(latest)) if !latest.is_revoked() => {
                        tracing::info!(
                            "Credential for {} changed during refresh, using the newer record",
                            tenant
                        );
                        Ok(latest)
                    }
                    CompareAndSwap::Stale(_) => {
                        tracing::warn!(
                            "Credential for {} was revoked while refreshing; discarding new tokens",
                            tenant
                        );
                        Err(TokenError::RefreshTerminal {
                            tenant: tenant.to_string(),
                        })
                    }
                }
            }
            Err(EndpointFailure::Status { status, error }) if status == 400 || status == 401 => {
                tracing::warn!(
                    "Refresh token rejected for {} (HTTP {}, {})",
                    tenant,
                    status,
                    error.as_deref().unwrap_or("no error code")
                );
                self.revoke_if_current(&current).await
            }
            Err(failure) => {
                tracing::error!("Failed to refresh token for {}: {}", tenant, failure);
                Err(TokenError::RefreshTransient {
                    message: failure.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl<S: CredentialStore + 'static> TokenManager for DefaultTokenManager<S> {
    fn build_authorization_url(
        &self,
        tenant: &TenantId,
    ) -> Result<AuthorizationRequest, TokenError> {
        let (url, state) = oauth::authorization_url(&self.config)?;
        self.pending.insert(state.clone(), tenant.clone());

        tracing::debug!("Issued authorization URL for {}", tenant);

        Ok(AuthorizationRequest { url, state })
    }

    async fn exchange_code(&self, code: &str, realm: &TenantId) -> Result<Credential, TokenError> {
        if code.trim().is_empty() {
            return Err(TokenError::AuthExchangeFailed {
                message: "authorization code is empty".to_string(),
            });
        }

        let grant = self
            .request_tokens(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_uri.as_str()),
            ])
            .await
            .map_err(|failure| {
                tracing::warn!("Authorization code exchange failed for {}: {}", realm, failure);
                TokenError::AuthExchangeFailed {
                    message: failure.to_string(),
                }
            })?;

        if grant.refresh_token.is_none() {
            return Err(TokenError::AuthExchangeFailed {
                message: "malformed token response: response is missing refresh_token"
                    .to_string(),
            });
        }

        let credential = Credential::issued(realm.clone(), grant, Utc::now());
        let stored = self.store.save(credential).await?;

        tracing::info!("Connected realm {}", realm);

        Ok(stored)
    }

    async fn refresh(&self, tenant: &TenantId) -> Result<Credential, TokenError> {
        let _singleflight = self.lock_refresh(tenant).await;

        let current = self.load_required(tenant).await?;
        self.refresh_locked(current).await
    }

    async fn valid_access_token(&self, tenant: &TenantId) -> Result<Secret, TokenError> {
        let current = self.load_required(tenant).await?;
        if let Some(token) = current.usable_access_token(Utc::now(), self.expiry_buffer) {
            tracing::debug!("Using cached access token for {}", tenant);
            return Ok(token.clone());
        }
        if current.is_revoked() {
            return Err(TokenError::RefreshTerminal {
                tenant: tenant.to_string(),
            });
        }

        let _singleflight = self.lock_refresh(tenant).await;

        // Another caller may have refreshed while we waited for the guard.
        let current = self.load_required(tenant).await?;
        if let Some(token) = current.usable_access_token(Utc::now(), self.expiry_buffer) {
            tracing::debug!("Access token for {} refreshed by a concurrent caller", tenant);
            return Ok(token.clone());
        }

        let refreshed = self.refresh_locked(current).await?;
        refreshed
            .access_token
            .ok_or_else(|| TokenError::RefreshTerminal {
                tenant: tenant.to_string(),
            })
    }

    async fn revoke(&self, tenant: &TenantId) -> bool {
        let current = match self.store.load(tenant).await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("Failed to load credential for {}: {}", tenant, e);
                return false;
            }
        };

        if let Some(refresh_token) = current.and_then(|c| c.refresh_token) {
            let result = self
                .http_client
                .post(&self.config.revoke_url)
                .basic_auth(
                    &self.config.client_id,
                    Some(self.config.client_secret.expose()),
                )
                .header(ACCEPT, "application/json")
                .form(&[("token", refresh_token.expose())])
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("Revoked tokens for {} with the provider", tenant);
                }
                Ok(response) => {
                    tracing::warn!(
                        "Provider revocation for {} returned HTTP {}",
                        tenant,
                        response.status().as_u16()
                    );
                }
                Err(e) => {
                    tracing::warn!("Provider revocation for {} failed: {}", tenant, e);
                }
            }
        }

        match self.store.clear(tenant).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to clear credential for {}: {}", tenant, e);
                false
            }
        }
    }

    async fn disconnect(&self, tenant: &TenantId) -> Result<bool, TokenError> {
        let changed = self.store.clear(tenant).await?;
        if changed {
            tracing::info!("Disconnected realm {}", tenant);
        } else {
            tracing::debug!("Realm {} already disconnected", tenant);
        }
        Ok(changed)
    }
}
