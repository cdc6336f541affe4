//! Token types and the token lifecycle trait.
//!
//! This module provides:
//! - [`TokenError`] - Error taxonomy for the OAuth credential lifecycle
//! - [`TokenResponse`] - Typed token endpoint response
//! - [`TokenGrant`] - A validated token grant
//! - [`AuthorizationRequest`] - An authorization URL and its anti-forgery state
//! - [`TokenManager`] - Trait for token lifecycle management

use async_trait::async_trait;
use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::model::{Credential, TenantId};
use crate::store::{Secret, StoreError};

/// Error type for token operations.
///
/// Callers use [`is_transient`](TokenError::is_transient) to decide whether
/// retrying is safe and [`requires_reauthorization`](TokenError::requires_reauthorization)
/// to decide whether the user must go through the consent flow again.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No credential is stored for the tenant.
    #[error("no credential stored for tenant {tenant}")]
    NotFound { tenant: String },

    /// The authorization code (or the callback's state) was rejected.
    #[error("authorization code exchange failed: {message}")]
    AuthExchangeFailed { message: String },

    /// The refresh token is invalid or the credential was revoked.
    #[error("credential for tenant {tenant} is revoked; re-authorization required")]
    RefreshTerminal { tenant: String },

    /// Refresh failed for a retryable reason; stored state is unchanged.
    #[error("token refresh failed: {message}")]
    RefreshTransient { message: String },

    /// Storage error during token operations.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TokenError {
    /// Whether the same call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RefreshTransient { .. } | Self::Storage(_))
    }

    /// Whether the tenant must restart the authorization flow.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::AuthExchangeFailed { .. } | Self::RefreshTerminal { .. }
        )
    }
}

/// Token endpoint response body.
///
/// Every field is optional so that a missing value is reported as a
/// malformed response instead of a deserialization panic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub x_refresh_token_expires_in: Option<i64>,
    pub token_type: Option<String>,
}

/// OAuth error body returned with 4xx token endpoint responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenErrorResponse {
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Longest token lifetime accepted from the token endpoint: ten years.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// A validated token grant.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub expires_in: Duration,
    pub refresh_token_expires_in: Option<Duration>,
}

impl TokenResponse {
    /// Validate the response into a grant.
    ///
    /// `access_token` and a positive `expires_in` are required; the refresh
    /// token is left optional here and enforced by the caller where needed.
    /// Lifetimes above [`MAX_TOKEN_LIFETIME_SECS`] are rejected.
    pub fn into_grant(self) -> Result<TokenGrant, &'static str> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or("response is missing access_token")?;
        let expires_in = self
            .expires_in
            .filter(|secs| *secs > 0)
            .ok_or("response is missing expires_in")?;
        if expires_in > MAX_TOKEN_LIFETIME_SECS {
            return Err("expires_in is out of range");
        }

        let refresh_token_expires_in = match self.x_refresh_token_expires_in {
            Some(secs) if secs > MAX_TOKEN_LIFETIME_SECS => {
                return Err("x_refresh_token_expires_in is out of range");
            }
            Some(secs) if secs > 0 => Some(Duration::seconds(secs)),
            _ => None,
        };

        Ok(TokenGrant {
            access_token: Secret::new(access_token),
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
            expires_in: Duration::seconds(expires_in),
            refresh_token_expires_in,
        })
    }
}

/// An authorization URL together with the anti-forgery state it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// URL to redirect the user to.
    pub url: String,

    /// Unpredictable state value; must come back unchanged on the callback.
    pub state: String,
}

/// Trait for managing the per-tenant OAuth credential lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// use ledgerlink_core::{TenantId, TokenManager};
///
/// async fn call_api(manager: &dyn TokenManager) -> Result<(), ledgerlink_core::TokenError> {
///     let realm = TenantId::new("9130357992221046");
///     let token = manager.valid_access_token(&realm).await?;
///     // Use token.expose() as the bearer token
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Build the authorization URL for a tenant and record its state.
    fn build_authorization_url(&self, tenant: &TenantId) -> Result<AuthorizationRequest, TokenError>;

    /// Exchange an authorization code for a new credential and persist it.
    async fn exchange_code(&self, code: &str, realm: &TenantId) -> Result<Credential, TokenError>;

    /// Force a refresh of the tenant's tokens.
    async fn refresh(&self, tenant: &TenantId) -> Result<Credential, TokenError>;

    /// Get a usable access token, refreshing first if it is expired.
    ///
    /// Concurrent callers for the same tenant share a single refresh.
    async fn valid_access_token(&self, tenant: &TenantId) -> Result<Secret, TokenError>;

    /// Revoke the tenant's tokens remotely (best effort) and locally.
    ///
    /// Returns `false` only when the local store could not be updated.
    async fn revoke(&self, tenant: &TenantId) -> bool;

    /// Invalidate the tenant's credential locally without calling the server.
    ///
    /// Returns whether anything changed; already-revoked or unknown tenants
    /// are a no-op.
    async fn disconnect(&self, tenant: &TenantId) -> Result<bool, TokenError>;
}
