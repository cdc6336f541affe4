//! Shared helpers for integration tests.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use ledgerlink_core::{
    ClientConfig, Credential, CredentialStore, DefaultTokenManager, MemoryCredentialStore, Secret,
    TenantId, token::TokenGrant,
};
use serde_json::{Value, json};
use std::sync::Arc;
use wiremock::MockServer;

pub const REALM: &str = "9130357992221046";
pub const WEBHOOK_SECRET: &str = "test-verifier-token";

/// `Basic base64("test-client-id:test-client-secret")`
pub const BASIC_AUTH: &str = "Basic dGVzdC1jbGllbnQtaWQ6dGVzdC1jbGllbnQtc2VjcmV0";

pub type TestManager = DefaultTokenManager<MemoryCredentialStore>;

/// Client configuration with every endpoint pointed at the mock server.
pub fn create_config(server: &MockServer) -> ClientConfig {
    let base = server.uri();
    ClientConfig::new(
        "test-client-id",
        "test-client-secret",
        "https://app.example.com/quickbooks/callback",
    )
    .with_oauth_endpoints(
        format!("{}/connect/oauth2", base),
        format!("{}/oauth2/v1/tokens/bearer", base),
        format!("{}/v2/oauth2/tokens/revoke", base),
    )
    .with_base_urls(base.clone(), base)
    .with_webhook_secret(WEBHOOK_SECRET)
    .with_http_timeout_secs(5)
}

pub fn create_manager(config: ClientConfig) -> Arc<TestManager> {
    Arc::new(DefaultTokenManager::new(Arc::new(config), MemoryCredentialStore::new()).unwrap())
}

/// Build a credential whose access token expires `expires_in` from now.
pub fn credential(realm: &str, access: &str, refresh: &str, expires_in: Duration) -> Credential {
    Credential::issued(
        TenantId::new(realm),
        TokenGrant {
            access_token: Secret::new(access),
            refresh_token: Some(Secret::new(refresh)),
            expires_in,
            refresh_token_expires_in: Some(Duration::days(100)),
        },
        Utc::now(),
    )
}

/// Store a credential that is still valid for an hour.
pub async fn seed_active(manager: &TestManager, realm: &str) -> Credential {
    manager
        .store()
        .save(credential(realm, "access-token", "refresh-token", Duration::hours(1)))
        .await
        .unwrap()
}

/// Store a credential whose access token expired a minute ago.
pub async fn seed_expired(manager: &TestManager, realm: &str) -> Credential {
    manager
        .store()
        .save(credential(
            realm,
            "stale-access-token",
            "refresh-token",
            Duration::minutes(-1),
        ))
        .await
        .unwrap()
}

/// Token endpoint success body.
pub fn token_body(access: &str, refresh: Option<&str>) -> Value {
    let mut body = json!({
        "token_type": "bearer",
        "access_token": access,
        "expires_in": 3600,
        "x_refresh_token_expires_in": 8726400
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}
