//! Client configuration.
//!
//! [`ClientConfig`] is an immutable description of one QuickBooks app
//! registration: OAuth client credentials, endpoints, the webhook verifier
//! token, and timeouts. It is built once and shared (usually behind an `Arc`)
//! by the token manager, the webhook dispatcher and the resource client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::store::Secret;

/// The only scope Ledgerlink requests.
pub const ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";

const DEFAULT_AUTHORIZE_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
const DEFAULT_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
const DEFAULT_REVOKE_URL: &str = "https://developer.api.intuit.com/v2/oauth2/tokens/revoke";
const DEFAULT_BASE_URL: &str = "https://quickbooks.api.intuit.com";
const DEFAULT_SANDBOX_BASE_URL: &str = "https://sandbox-quickbooks.api.intuit.com";

/// Upper bound for configured intervals (timeouts, buffers, TTLs): 30 days.
pub const MAX_INTERVAL_SECS: i64 = 30 * 24 * 60 * 60;

/// Error type for configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value is missing or empty.
    #[error("missing configuration value: {field}")]
    Missing { field: &'static str },

    /// A URL value could not be parsed.
    #[error("invalid URL for {field}: {message}")]
    InvalidUrl { field: &'static str, message: String },

    /// A numeric value is outside its accepted range.
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// Immutable configuration for a QuickBooks app registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Use the sandbox API host instead of production.
    #[serde(default)]
    pub sandbox: bool,

    /// OAuth client id.
    pub client_id: String,

    /// OAuth client secret.
    pub client_secret: Secret,

    /// Redirect URI registered with the app.
    pub redirect_uri: String,

    /// Shared secret used to sign webhook deliveries ("verifier token").
    #[serde(default)]
    pub webhook_secret: Secret,

    /// OAuth scope requested in the authorization URL.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Authorization endpoint.
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,

    /// Token endpoint (code exchange and refresh).
    #[serde(default = "default_token_url")]
    pub token_url: String,

    /// Token revocation endpoint.
    #[serde(default = "default_revoke_url")]
    pub revoke_url: String,

    /// Production accounting API host.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Sandbox accounting API host.
    #[serde(default = "default_sandbox_base_url")]
    pub sandbox_base_url: String,

    /// Timeout applied to every outbound HTTP call, in seconds.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Access tokens expiring within this many seconds are refreshed early.
    #[serde(default = "default_expiry_buffer_secs")]
    pub expiry_buffer_secs: i64,

    /// Lifetime of an issued authorization `state`, in seconds.
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: i64,

    /// `minorversion` query parameter sent to the accounting API.
    #[serde(default)]
    pub minor_version: Option<u32>,
}

fn default_scope() -> String {
    ACCOUNTING_SCOPE.to_string()
}

fn default_authorize_url() -> String {
    DEFAULT_AUTHORIZE_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_revoke_url() -> String {
    DEFAULT_REVOKE_URL.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_sandbox_base_url() -> String {
    DEFAULT_SANDBOX_BASE_URL.to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_expiry_buffer_secs() -> i64 {
    60
}

fn default_state_ttl_secs() -> i64 {
    600
}

impl ClientConfig {
    /// Create a configuration with production defaults.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            sandbox: false,
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret),
            redirect_uri: redirect_uri.into(),
            webhook_secret: Secret::default(),
            scope: default_scope(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            revoke_url: default_revoke_url(),
            base_url: default_base_url(),
            sandbox_base_url: default_sandbox_base_url(),
            http_timeout_secs: default_http_timeout_secs(),
            expiry_buffer_secs: default_expiry_buffer_secs(),
            state_ttl_secs: default_state_ttl_secs(),
            minor_version: None,
        }
    }

    /// Toggle the sandbox API host.
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set the webhook verifier token.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Secret::new(secret);
        self
    }

    /// Point the OAuth endpoints somewhere else (tests, proxies).
    pub fn with_oauth_endpoints(
        mut self,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        revoke_url: impl Into<String>,
    ) -> Self {
        self.authorize_url = authorize_url.into();
        self.token_url = token_url.into();
        self.revoke_url = revoke_url.into();
        self
    }

    /// Override both API hosts.
    pub fn with_base_urls(
        mut self,
        base_url: impl Into<String>,
        sandbox_base_url: impl Into<String>,
    ) -> Self {
        self.base_url = base_url.into();
        self.sandbox_base_url = sandbox_base_url.into();
        self
    }

    /// Set the outbound HTTP timeout.
    pub fn with_http_timeout_secs(mut self, secs: u64) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    /// Set the early-refresh buffer.
    pub fn with_expiry_buffer_secs(mut self, secs: i64) -> Self {
        self.expiry_buffer_secs = secs;
        self
    }

    /// The accounting API host selected by the sandbox flag.
    pub fn api_base_url(&self) -> &str {
        if self.sandbox {
            &self.sandbox_base_url
        } else {
            &self.base_url
        }
    }

    /// Outbound HTTP timeout.
    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs.min(MAX_INTERVAL_SECS as u64))
    }

    /// Early-refresh buffer.
    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_buffer_secs.clamp(0, MAX_INTERVAL_SECS))
    }

    /// Lifetime of an authorization `state` value.
    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs.clamp(1, MAX_INTERVAL_SECS))
    }

    /// Check required values, interval ranges and URL syntax.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing { field: "client_id" });
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::Missing {
                field: "client_secret",
            });
        }

        let http_timeout = i64::try_from(self.http_timeout_secs).unwrap_or(i64::MAX);
        let intervals: [(&'static str, i64, i64); 3] = [
            ("http_timeout_secs", http_timeout, 1),
            ("expiry_buffer_secs", self.expiry_buffer_secs, 0),
            ("state_ttl_secs", self.state_ttl_secs, 1),
        ];
        for (field, value, min) in intervals {
            if !(min..=MAX_INTERVAL_SECS).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    min,
                    max: MAX_INTERVAL_SECS,
                });
            }
        }

        let urls: [(&'static str, &str); 6] = [
            ("redirect_uri", &self.redirect_uri),
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("revoke_url", &self.revoke_url),
            ("base_url", &self.base_url),
            ("sandbox_base_url", &self.sandbox_base_url),
        ];
        for (field, value) in urls {
            Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
                field,
                message: e.to_string(),
            })?;
        }

        Ok(())
    }
}
