//! Integration tests for the OAuth credential lifecycle.
//!
//! These tests verify that the DefaultTokenManager correctly:
//! - Exchanges authorization codes and persists credentials
//! - Refreshes expired tokens exactly once under concurrency
//! - Revokes credentials on terminal refresh failures
//! - Leaves credentials untouched on transient failures
//! - Lets a disconnect win over an in-flight refresh
//! - Keeps a re-authorized credential when a stale refresh is rejected

mod common;

use chrono::{Duration, Utc};
use common::*;
use futures::future::join_all;
use ledgerlink_core::{
    ConnectionStatus, CredentialState, CredentialStore, TenantId, TokenError, TokenManager,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, header, method, path},
};

const TOKEN_PATH: &str = "/oauth2/v1/tokens/bearer";
const REVOKE_PATH: &str = "/v2/oauth2/tokens/revoke";

#[tokio::test]
async fn test_exchange_code_persists_active_credential() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(header("authorization", BASIC_AUTH))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc"))
        .and(body_string_contains(
            "redirect_uri=https%3A%2F%2Fapp.example.com%2Fquickbooks%2Fcallback",
        ))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-1", Some("refresh-1"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let before = Utc::now();
    let credential = manager
        .exchange_code("abc", &TenantId::new(REALM))
        .await
        .unwrap();

    assert_eq!(credential.state, CredentialState::Active);
    assert_eq!(credential.access_token.as_ref().unwrap().expose(), "access-1");
    assert_eq!(credential.refresh_token.as_ref().unwrap().expose(), "refresh-1");

    let expires_at = credential.expires_at.unwrap();
    assert!(expires_at >= before + Duration::seconds(3600));
    assert!(expires_at <= Utc::now() + Duration::seconds(3600));

    let stored = manager.store().load(&TenantId::new(REALM)).await.unwrap();
    assert_eq!(stored.unwrap().revision, credential.revision);
}

#[tokio::test]
async fn test_reused_code_is_rejected_without_write() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("code=abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-1", Some("refresh-1"))),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    let realm = TenantId::new(REALM);
    let first = manager.exchange_code("abc", &realm).await.unwrap();

    let second = manager.exchange_code("abc", &realm).await;
    assert!(matches!(second, Err(TokenError::AuthExchangeFailed { .. })));

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.revision, first.revision);
    assert_eq!(stored.state, CredentialState::Active);
}

#[tokio::test]
async fn test_exchange_rejects_response_without_refresh_token() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", None)))
        .mount(&server)
        .await;

    let realm = TenantId::new(REALM);
    let result = manager.exchange_code("abc", &realm).await;

    assert!(matches!(result, Err(TokenError::AuthExchangeFailed { .. })));
    assert!(manager.store().load(&realm).await.unwrap().is_none());
}

#[tokio::test]
async fn test_complete_authorization_checks_state() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-1", Some("refresh-1"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let realm = TenantId::new(REALM);
    let request = manager.build_authorization_url(&realm).unwrap();
    assert!(request.url.contains("response_type=code"));
    assert!(request.url.contains(&format!("state={}", request.state)));

    let forged = manager
        .complete_authorization("abc", &realm, "forged-state")
        .await;
    assert!(matches!(forged, Err(TokenError::AuthExchangeFailed { .. })));

    let credential = manager
        .complete_authorization("abc", &realm, &request.state)
        .await
        .unwrap();
    assert_eq!(credential.state, CredentialState::Active);

    let replayed = manager
        .complete_authorization("abc", &realm, &request.state)
        .await;
    assert!(matches!(replayed, Err(TokenError::AuthExchangeFailed { .. })));
}

#[tokio::test]
async fn test_valid_token_uses_cache_without_http() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    seed_active(&manager, REALM).await;
    let token = manager
        .valid_access_token(&TenantId::new(REALM))
        .await
        .unwrap();
    assert_eq!(token.expose(), "access-token");
}

#[tokio::test]
async fn test_token_inside_expiry_buffer_is_refreshed() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server).with_expiry_buffer_secs(120));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", None)))
        .expect(1)
        .mount(&server)
        .await;

    manager
        .store()
        .save(credential(REALM, "access-1", "refresh-1", Duration::seconds(90)))
        .await
        .unwrap();

    let token = manager
        .valid_access_token(&TenantId::new(REALM))
        .await
        .unwrap();
    assert_eq!(token.expose(), "access-2");
}

#[tokio::test]
async fn test_refresh_rotates_and_keeps_refresh_token() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("refresh_token=refresh-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-2", Some("refresh-2"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("refresh_token=refresh-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-3", None)))
        .expect(1)
        .mount(&server)
        .await;

    let realm = TenantId::new(REALM);
    seed_expired(&manager, REALM).await;

    let rotated = manager.refresh(&realm).await.unwrap();
    assert_eq!(rotated.refresh_token.as_ref().unwrap().expose(), "refresh-2");

    let kept = manager.refresh(&realm).await.unwrap();
    assert_eq!(kept.access_token.as_ref().unwrap().expose(), "access-3");
    assert_eq!(kept.refresh_token.as_ref().unwrap().expose(), "refresh-2");
    assert!(kept.revision > rotated.revision);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("fresh-access", Some("fresh-refresh")))
                .set_delay(std::time::Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let results = join_all((0..10).map(|_| manager.valid_access_token(&realm))).await;

    for result in results {
        assert_eq!(result.unwrap().expose(), "fresh-access");
    }
}

#[tokio::test]
async fn test_refresh_for_other_tenant_is_not_blocked() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("fresh-access", None))
                .set_delay(std::time::Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    seed_expired(&manager, "slow").await;
    seed_active(&manager, "fast").await;

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.valid_access_token(&TenantId::new("slow")).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let fast = tokio::time::timeout(
        std::time::Duration::from_millis(500),
        manager.valid_access_token(&TenantId::new("fast")),
    )
    .await
    .expect("other tenant blocked by refresh");
    assert_eq!(fast.unwrap().expose(), "access-token");

    assert!(slow.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_refresh_unauthorized_revokes_credential() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "invalid_grant"})))
        .expect(1)
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let result = manager.valid_access_token(&realm).await;
    assert!(matches!(result, Err(TokenError::RefreshTerminal { .. })));

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.state, CredentialState::Revoked);
    assert!(stored.access_token.is_none());
    assert!(stored.refresh_token.is_none());
    assert_eq!(
        manager.connection_status(&realm).await.unwrap(),
        ConnectionStatus::Revoked
    );

    // No second request once revoked.
    let again = manager.valid_access_token(&realm).await;
    assert!(matches!(again, Err(TokenError::RefreshTerminal { .. })));
}

#[tokio::test]
async fn test_refresh_bad_request_revokes_credential() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let result = manager.refresh(&TenantId::new(REALM)).await;

    assert!(matches!(result, Err(TokenError::RefreshTerminal { .. })));
}

#[tokio::test]
async fn test_refresh_server_error_leaves_credential_unchanged() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .mount(&server)
        .await;

    let seeded = seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let result = manager.valid_access_token(&realm).await;
    match result {
        Err(e) => assert!(e.is_transient(), "expected transient error, got {:?}", e),
        Ok(_) => panic!("expected refresh failure"),
    }

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.revision, seeded.revision);
    assert_eq!(stored.state, CredentialState::Active);
    assert_eq!(stored.refresh_token.unwrap().expose(), "refresh-token");
}

#[tokio::test]
async fn test_refresh_malformed_body_is_transient() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token_type": "bearer"})))
        .mount(&server)
        .await;

    let seeded = seed_expired(&manager, REALM).await;
    let result = manager.refresh(&TenantId::new(REALM)).await;

    assert!(matches!(result, Err(TokenError::RefreshTransient { .. })));
    let stored = manager
        .store()
        .load(&TenantId::new(REALM))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.revision, seeded.revision);
}

#[tokio::test]
async fn test_refresh_timeout_is_transient() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server).with_http_timeout_secs(1));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("late", None))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let result = manager.refresh(&TenantId::new(REALM)).await;

    assert!(matches!(result, Err(TokenError::RefreshTransient { .. })));
}

#[tokio::test]
async fn test_disconnect_during_refresh_wins() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("late-access", Some("late-refresh")))
                .set_delay(std::time::Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let in_flight = {
        let manager = manager.clone();
        let realm = realm.clone();
        tokio::spawn(async move { manager.refresh(&realm).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(
        manager.connection_status(&realm).await.unwrap(),
        ConnectionStatus::Refreshing
    );
    assert!(manager.disconnect(&realm).await.unwrap());

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(TokenError::RefreshTerminal { .. })));

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.state, CredentialState::Revoked);
    assert!(stored.access_token.is_none());
}

#[tokio::test]
async fn test_revoke_posts_refresh_token_and_clears() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(REVOKE_PATH))
        .and(header("authorization", BASIC_AUTH))
        .and(body_string_contains("token=refresh-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    seed_active(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    assert!(manager.revoke(&realm).await);

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.state, CredentialState::Revoked);
}

#[tokio::test]
async fn test_revoke_clears_locally_when_remote_fails() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(REVOKE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    seed_active(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    assert!(manager.revoke(&realm).await);

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.state, CredentialState::Revoked);
    assert!(stored.refresh_token.is_none());
    assert!(matches!(
        manager.valid_access_token(&realm).await,
        Err(TokenError::RefreshTerminal { .. })
    ));
}

#[tokio::test]
async fn test_reauthorization_after_revoke() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("access-new", Some("refresh-new"))),
        )
        .mount(&server)
        .await;

    seed_active(&manager, REALM).await;
    let realm = TenantId::new(REALM);
    assert!(manager.disconnect(&realm).await.unwrap());

    manager.build_authorization_url(&realm).unwrap();
    assert_eq!(
        manager.connection_status(&realm).await.unwrap(),
        ConnectionStatus::AuthorizationPending
    );

    manager.exchange_code("new-code", &realm).await.unwrap();
    let token = manager.valid_access_token(&realm).await.unwrap();
    assert_eq!(token.expose(), "access-new");
}

#[tokio::test]
async fn test_exchange_rejects_out_of_range_expiry() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 10_000_000_000_000_i64
        })))
        .mount(&server)
        .await;

    let realm = TenantId::new(REALM);
    let result = manager.exchange_code("auth-code", &realm).await;

    assert!(matches!(result, Err(TokenError::AuthExchangeFailed { .. })));
    assert!(manager.store().load(&realm).await.unwrap().is_none());
}

#[tokio::test]
async fn test_refresh_out_of_range_expiry_is_transient() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600,
            "x_refresh_token_expires_in": i64::MAX
        })))
        .mount(&server)
        .await;

    let seeded = seed_expired(&manager, REALM).await;
    let result = manager.refresh(&TenantId::new(REALM)).await;

    assert!(matches!(result, Err(TokenError::RefreshTransient { .. })));
    let stored = manager
        .store()
        .load(&TenantId::new(REALM))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.revision, seeded.revision);
}

#[tokio::test]
async fn test_rejected_refresh_keeps_reauthorized_credential() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": "invalid_grant"}))
                .set_delay(std::time::Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_body("new-access", Some("new-refresh"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let seeded = seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let in_flight = {
        let manager = manager.clone();
        let realm = realm.clone();
        tokio::spawn(async move { manager.refresh(&realm).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let reauthorized = manager.exchange_code("new-code", &realm).await.unwrap();
    assert!(reauthorized.revision > seeded.revision);

    let refreshed = in_flight.await.unwrap().unwrap();
    assert_eq!(refreshed.access_token.unwrap().expose(), "new-access");

    let stored = manager.store().load(&realm).await.unwrap().unwrap();
    assert_eq!(stored.state, CredentialState::Active);
    assert_eq!(stored.revision, reauthorized.revision);
    assert_eq!(stored.access_token.unwrap().expose(), "new-access");
}

#[tokio::test]
async fn test_cancelled_refresh_does_not_stick_as_refreshing() {
    let server = MockServer::start().await;
    let manager = create_manager(create_config(&server));

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body("late", None))
                .set_delay(std::time::Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    seed_expired(&manager, REALM).await;
    let realm = TenantId::new(REALM);

    let attempt = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        manager.valid_access_token(&realm),
    )
    .await;
    assert!(attempt.is_err());

    assert_eq!(
        manager.connection_status(&realm).await.unwrap(),
        ConnectionStatus::Expired
    );
}
