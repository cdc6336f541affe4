//! OAuth 2.0 authorization-code flow helpers.
//!
//! This module provides:
//! - [`create_oauth_client`] - An `oauth2` client built from [`ClientConfig`]
//! - [`authorization_url`] - The consent URL with a fresh CSRF state
//! - [`PendingAuthorizations`] - Ledger of issued, not-yet-consumed states
//!
//! Token exchange itself is done by [`DefaultTokenManager`](crate::DefaultTokenManager)
//! over `reqwest`, because the refresh policy depends on the exact HTTP
//! status returned by the token endpoint.

mod state;

pub use state::PendingAuthorizations;

use oauth2::{
    AuthUrl, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenUrl, basic::BasicClient,
};

use crate::config::{ClientConfig, ConfigError};

/// Create an OAuth2 client from the client configuration.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUrl`] if any endpoint or the redirect URI
/// does not parse.
pub fn create_oauth_client(config: &ClientConfig) -> Result<BasicClient, ConfigError> {
    let auth_url =
        AuthUrl::new(config.authorize_url.clone()).map_err(|e| ConfigError::InvalidUrl {
            field: "authorize_url",
            message: e.to_string(),
        })?;

    let token_url = TokenUrl::new(config.token_url.clone()).map_err(|e| ConfigError::InvalidUrl {
        field: "token_url",
        message: e.to_string(),
    })?;

    let redirect_url =
        RedirectUrl::new(config.redirect_uri.clone()).map_err(|e| ConfigError::InvalidUrl {
            field: "redirect_uri",
            message: e.to_string(),
        })?;

    let client = BasicClient::new(
        ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.expose().to_string())),
        auth_url,
        Some(token_url),
    )
    .set_redirect_uri(redirect_url);

    Ok(client)
}

/// Build the consent URL with a freshly generated CSRF state.
///
/// # Returns
///
/// A tuple of (authorization URL, state). The state must be recorded and
/// checked when the callback arrives.
pub fn authorization_url(config: &ClientConfig) -> Result<(String, String), ConfigError> {
    let client = create_oauth_client(config)?;

    let (url, csrf_state) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new(config.scope.clone()))
        .url();

    Ok((url.to_string(), csrf_state.secret().to_string()))
}
