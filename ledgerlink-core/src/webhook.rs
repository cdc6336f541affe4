//! Inbound webhook handling.
//!
//! This module provides:
//! - [`WebhookEnvelope`] - Typed schema for QuickBooks change notifications
//! - [`WebhookDispatcher`] - Verifies, parses and dispatches deliveries
//! - [`EntitySyncHook`] - Extension point for non-authorization changes
//! - [`WebhookError`] / [`WebhookResponse`] - HTTP status mapping
//!
//! A `Delete` of the `Authorization` entity means the company disconnected
//! the app on the QuickBooks side; the realm's credential is revoked locally.
//! Everything else is forwarded to the configured hook.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::model::TenantId;
use crate::token::TokenManager;
use crate::verify::SignatureVerifier;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "intuit-signature";

/// Entity name QuickBooks uses for the app connection itself.
pub const AUTHORIZATION_ENTITY: &str = "Authorization";

/// Top-level webhook body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub event_notifications: Vec<EventNotification>,
}

/// Changes for a single realm.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub realm_id: TenantId,
    #[serde(default)]
    pub data_change_event: DataChangeEvent,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DataChangeEvent {
    #[serde(default)]
    pub entities: Vec<EntityChange>,
}

/// One changed entity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub name: String,
    pub id: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_id: Option<String>,
}

impl EntityChange {
    /// Whether this change disconnects the app from the realm.
    pub fn is_disconnect(&self) -> bool {
        self.operation == Operation::Delete && self.name == AUTHORIZATION_ENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Merge,
    Void,
    Emailed,
    #[serde(other)]
    Other,
}

/// An entity change together with the realm it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub realm: TenantId,
    pub entity: EntityChange,
}

impl WebhookEnvelope {
    /// Flatten the envelope into notices, preserving delivery order.
    pub fn notices(&self) -> Vec<ChangeNotice> {
        self.event_notifications
            .iter()
            .flat_map(|event| {
                event
                    .data_change_event
                    .entities
                    .iter()
                    .map(|entity| ChangeNotice {
                        realm: event.realm_id.clone(),
                        entity: entity.clone(),
                    })
            })
            .collect()
    }
}

/// Error returned by an [`EntitySyncHook`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SyncError {
    pub message: String,
}

impl SyncError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives entity changes other than authorization deletes.
#[async_trait]
pub trait EntitySyncHook: Send + Sync {
    async fn on_change(&self, notice: &ChangeNotice) -> Result<(), SyncError>;
}

/// Hook that ignores every change.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSyncHook;

#[async_trait]
impl EntitySyncHook for NoopSyncHook {
    async fn on_change(&self, notice: &ChangeNotice) -> Result<(), SyncError> {
        tracing::debug!(
            "Ignoring {:?} of {} {} for realm {}",
            notice.entity.operation,
            notice.entity.name,
            notice.entity.id,
            notice.realm
        );
        Ok(())
    }
}

/// Error type for webhook deliveries.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Signature missing or invalid.
    #[error("webhook signature verification failed")]
    Unauthenticated,

    /// Body is not a valid notification envelope.
    #[error("malformed webhook payload: {message}")]
    MalformedPayload { message: String },

    /// Processing failed on our side.
    #[error("webhook processing failed: {message}")]
    Internal { message: String },
}

impl WebhookError {
    /// HTTP status to answer the delivery with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthenticated | Self::MalformedPayload { .. } => 400,
            Self::Internal { .. } => 500,
        }
    }
}

/// A change that could not be processed.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub realm: TenantId,
    pub entity: String,
    pub id: String,
    pub reason: String,
}

/// Outcome of a delivery that was accepted.
#[derive(Debug, Clone, Default)]
pub struct WebhookReport {
    /// Number of entity changes seen.
    pub processed: usize,
    /// Realms whose credential this delivery revoked.
    pub disconnected: Vec<TenantId>,
    /// Changes handed to the sync hook.
    pub forwarded: usize,
    pub failures: Vec<EntityFailure>,
}

/// Status and body to send back to QuickBooks.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl From<&Result<WebhookReport, WebhookError>> for WebhookResponse {
    fn from(result: &Result<WebhookReport, WebhookError>) -> Self {
        match result {
            Ok(_) => Self {
                status: 200,
                body: json!({ "status": "ok" }),
            },
            Err(e) if e.status_code() == 400 => Self {
                status: 400,
                body: json!({ "error": "invalid webhook request" }),
            },
            Err(_) => Self {
                status: 500,
                body: json!({ "error": "internal error" }),
            },
        }
    }
}

/// Verifies and dispatches webhook deliveries.
pub struct WebhookDispatcher {
    verifier: SignatureVerifier,
    tokens: Arc<dyn TokenManager>,
    hook: Arc<dyn EntitySyncHook>,
}

impl WebhookDispatcher {
    pub fn new(verifier: SignatureVerifier, tokens: Arc<dyn TokenManager>) -> Self {
        Self {
            verifier,
            tokens,
            hook: Arc::new(NoopSyncHook),
        }
    }

    /// Forward non-authorization changes to `hook`.
    pub fn with_hook(mut self, hook: Arc<dyn EntitySyncHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Handle one delivery.
    ///
    /// Entities are processed in order; a failing entity is recorded in the
    /// report and does not stop the rest. If every entity fails the delivery
    /// is reported as an internal error so QuickBooks retries it.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookReport, WebhookError> {
        if !self.verifier.verify(raw_body, signature) {
            tracing::warn!(
                "Rejected webhook delivery: {} header missing or invalid",
                SIGNATURE_HEADER
            );
            return Err(WebhookError::Unauthenticated);
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body).map_err(|e| {
            tracing::warn!("Rejected webhook delivery: malformed payload: {}", e);
            WebhookError::MalformedPayload {
                message: e.to_string(),
            }
        })?;

        let mut report = WebhookReport::default();

        for notice in envelope.notices() {
            report.processed += 1;

            if notice.entity.is_disconnect() {
                match self.tokens.disconnect(&notice.realm).await {
                    Ok(true) => {
                        tracing::info!("Realm {} disconnected the app", notice.realm);
                        report.disconnected.push(notice.realm.clone());
                    }
                    Ok(false) => {
                        tracing::debug!("Realm {} was already disconnected", notice.realm);
                    }
                    Err(e) => {
                        tracing::error!("Failed to disconnect realm {}: {}", notice.realm, e);
                        report.failures.push(failure(&notice, e.to_string()));
                    }
                }
                continue;
            }

            match self.hook.on_change(&notice).await {
                Ok(()) => report.forwarded += 1,
                Err(e) => {
                    tracing::error!(
                        "Sync hook failed for {} {} in realm {}: {}",
                        notice.entity.name,
                        notice.entity.id,
                        notice.realm,
                        e
                    );
                    report.failures.push(failure(&notice, e.to_string()));
                }
            }
        }

        if report.processed > 0 && report.failures.len() == report.processed {
            return Err(WebhookError::Internal {
                message: format!("all {} entity changes failed", report.processed),
            });
        }

        Ok(report)
    }

    /// Handle one delivery and map the outcome to an HTTP response.
    pub async fn respond(&self, raw_body: &[u8], signature: Option<&str>) -> WebhookResponse {
        WebhookResponse::from(&self.handle(raw_body, signature).await)
    }
}

fn failure(notice: &ChangeNotice, reason: String) -> EntityFailure {
    EntityFailure {
        realm: notice.realm.clone(),
        entity: notice.entity.name.clone(),
        id: notice.entity.id.clone(),
        reason,
    }
}
