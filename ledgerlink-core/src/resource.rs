//! Accounting API client for one connected realm.
//!
//! Every QuickBooks entity carries a `SyncToken`. Writes must quote the
//! current token; a write with a stale token is rejected with fault code
//! `5010` and surfaced as [`ResourceError::Conflict`]. Conflicts are never
//! retried here, the caller decides whether to re-read and re-apply.

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use url::{Url, form_urlencoded};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::model::TenantId;
use crate::query::{BatchRequest, BatchResponse, CUSTOMER_ENTITY, CustomerSearch};
use crate::token::{TokenError, TokenManager};

/// Fault code QuickBooks returns for a stale `SyncToken`.
pub const STALE_OBJECT_CODE: &str = "5010";

const JSON: &str = "application/json";

const SANDBOX_APP_URL: &str = "https://sandbox.qbo.intuit.com/app/invoice";
const PRODUCTION_APP_URL: &str = "https://qbo.intuit.com/app/invoice";

/// Entity types handled by the client.
///
/// `Other` carries any further QuickBooks entity name, such as `Bill` or
/// `JournalEntry`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Customer,
    Invoice,
    Other(String),
}

impl ResourceKind {
    /// Path segment used in resource URLs.
    pub fn path(&self) -> String {
        self.entity_key().to_ascii_lowercase()
    }

    /// Key wrapping the entity in request and response bodies.
    pub fn entity_key(&self) -> &str {
        match self {
            Self::Customer => "Customer",
            Self::Invoice => "Invoice",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl FromStr for ResourceKind {
    type Err = ResourceError;

    /// `customer` and `invoice` match in any case; other entities must be
    /// given by their PascalCase name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "customer" => return Ok(Self::Customer),
            "invoice" => return Ok(Self::Invoice),
            _ => {}
        }

        let pascal = s.starts_with(|c: char| c.is_ascii_uppercase())
            && s.chars().all(|c| c.is_ascii_alphanumeric());
        if pascal {
            Ok(Self::Other(s.to_string()))
        } else {
            Err(ResourceError::UnsupportedKind {
                kind: s.to_string(),
            })
        }
    }
}

/// Identity and version of a remote entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteResourceRef {
    pub id: String,
    pub sync_token: String,
}

/// A remote entity: its identity, version token and remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: String,
    pub sync_token: String,
    /// Every field except `Id` and `SyncToken`.
    pub fields: Map<String, Value>,
}

impl Resource {
    /// Split an entity object into identity and fields.
    ///
    /// Returns `None` when `Id` or `SyncToken` is missing.
    pub fn from_entity(mut entity: Map<String, Value>) -> Option<Self> {
        let id = string_field(entity.remove("Id")?)?;
        let sync_token = string_field(entity.remove("SyncToken")?)?;
        Some(Self {
            id,
            sync_token,
            fields: entity,
        })
    }

    pub fn reference(&self) -> RemoteResourceRef {
        RemoteResourceRef {
            id: self.id.clone(),
            sync_token: self.sync_token.clone(),
        }
    }
}

fn string_field(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{"Fault": {...}}` error body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FaultEnvelope {
    #[serde(rename = "Fault", alias = "fault")]
    pub fault: Fault,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Fault {
    #[serde(rename = "Error", alias = "error", default)]
    pub errors: Vec<FaultError>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FaultError {
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "Detail", default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub element: Option<String>,
}

impl Fault {
    /// Whether the fault reports a stale `SyncToken`.
    pub fn is_stale_object(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.code.as_deref() == Some(STALE_OBJECT_CODE))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_deref().unwrap_or("Fault"))?;
        for error in &self.errors {
            write!(
                f,
                " [{}] {}",
                error.code.as_deref().unwrap_or("?"),
                error.message.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Error type for accounting API calls.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    /// The write quoted a stale `SyncToken`.
    #[error("{kind} {id} was modified concurrently (stale SyncToken)")]
    Conflict { kind: ResourceKind, id: String },

    /// The call failed; `status` is absent when no response was received.
    #[error("accounting API request failed (status {status:?}): {body}")]
    Transient { status: Option<u16>, body: String },

    /// No usable access token for the realm.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// A successful response had an unexpected shape.
    #[error("malformed API response: {message}")]
    Malformed { message: String },

    #[error("unsupported resource kind: {kind}")]
    UnsupportedKind { kind: String },
}

impl ResourceError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { status: None, .. } => true,
            Self::Transient {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            Self::Token(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ResourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Malformed {
                message: e.to_string(),
            };
        }
        Self::Transient {
            status: e.status().map(|s| s.as_u16()),
            body: e.to_string(),
        }
    }
}

/// Client for the accounting API of a single realm.
pub struct RemoteResourceClient {
    config: Arc<ClientConfig>,
    tokens: Arc<dyn TokenManager>,
    realm: TenantId,
    http_client: reqwest::Client,
}

impl RemoteResourceClient {
    pub fn new(
        config: Arc<ClientConfig>,
        tokens: Arc<dyn TokenManager>,
        realm: TenantId,
    ) -> Result<Self, ResourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        Ok(Self {
            config,
            tokens,
            realm,
            http_client,
        })
    }

    pub fn realm(&self) -> &TenantId {
        &self.realm
    }

    /// Fetch an entity by id.
    pub async fn get(&self, kind: ResourceKind, id: &str) -> Result<Resource, ResourceError> {
        let url = self.url(&[kind.path().as_str(), id])?;
        let response = self.send(self.http_client.get(url), JSON).await?;

        if !response.status().is_success() {
            return Err(failure(&kind, Some(id), response).await);
        }

        let body: Value = response.json().await?;
        extract_entity(&kind, body).ok_or_else(|| ResourceError::NotFound {
            kind,
            id: id.to_string(),
        })
    }

    /// Create an entity from `fields`.
    pub async fn create(
        &self,
        kind: ResourceKind,
        fields: Map<String, Value>,
    ) -> Result<Resource, ResourceError> {
        let url = self.write_url(&kind)?;
        let response = self
            .send(self.http_client.post(url).json(&fields), JSON)
            .await?;

        if !response.status().is_success() {
            return Err(failure(&kind, None, response).await);
        }

        let body: Value = response.json().await?;
        let created = extract_entity(&kind, body).ok_or_else(|| ResourceError::Malformed {
            message: format!("create response has no {} entity", kind.entity_key()),
        })?;

        tracing::info!("Created {} {} in realm {}", kind, created.id, self.realm);
        Ok(created)
    }

    /// Read-modify-write an entity under its current `SyncToken`.
    ///
    /// `mutator` receives the current entity and returns the fields to send.
    /// `Id` and `SyncToken` are always taken from the read, never from the
    /// mutator's output.
    pub async fn update<F>(
        &self,
        kind: ResourceKind,
        id: &str,
        mutator: F,
    ) -> Result<Resource, ResourceError>
    where
        F: FnOnce(&Resource) -> Map<String, Value> + Send,
    {
        let current = self.get(kind.clone(), id).await?;

        let mut body = mutator(&current);
        body.insert("Id".to_string(), Value::String(current.id.clone()));
        body.insert(
            "SyncToken".to_string(),
            Value::String(current.sync_token.clone()),
        );

        let url = self.write_url(&kind)?;
        let response = self
            .send(self.http_client.post(url).json(&body), JSON)
            .await?;

        if !response.status().is_success() {
            let error = failure(&kind, Some(id), response).await;
            if matches!(error, ResourceError::Conflict { .. }) {
                tracing::warn!(
                    "Update of {} {} in realm {} rejected: stale SyncToken {}",
                    kind,
                    id,
                    self.realm,
                    current.sync_token
                );
            }
            return Err(error);
        }

        let body: Value = response.json().await?;
        let updated = extract_entity(&kind, body).ok_or_else(|| ResourceError::Malformed {
            message: format!("update response has no {} entity", kind.entity_key()),
        })?;

        tracing::info!(
            "Updated {} {} in realm {} (SyncToken {} -> {})",
            kind,
            id,
            self.realm,
            current.sync_token,
            updated.sync_token
        );
        Ok(updated)
    }

    /// Download the PDF rendering of an entity.
    pub async fn pdf(&self, kind: ResourceKind, id: &str) -> Result<Vec<u8>, ResourceError> {
        let url = self.url(&[kind.path().as_str(), id, "pdf"])?;
        let response = self
            .send(self.http_client.get(url), "application/pdf")
            .await?;

        if !response.status().is_success() {
            return Err(failure(&kind, Some(id), response).await);
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Link to an invoice in the QuickBooks web app.
    pub fn view_link(&self, invoice_id: &str) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("txnId", invoice_id);
        if self.config.sandbox {
            query.append_pair("companyId", self.realm.as_str());
            format!("{}?{}", SANDBOX_APP_URL, query.finish())
        } else {
            format!("{}?{}", PRODUCTION_APP_URL, query.finish())
        }
    }

    /// Search customers with one batch request.
    pub async fn search_customers(
        &self,
        search: &CustomerSearch,
    ) -> Result<Vec<Resource>, ResourceError> {
        let queries = search.queries();
        if queries.is_empty() {
            tracing::debug!("Customer search without criteria; skipping request");
            return Ok(Vec::new());
        }

        let url = self.url(&["batch"])?;
        let request = BatchRequest { items: queries };
        let response = self
            .send(self.http_client.post(url).json(&request), JSON)
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ResourceError::Transient {
                status: Some(status),
                body,
            });
        }

        let batch: BatchResponse =
            response
                .json()
                .await
                .map_err(|e| ResourceError::Malformed {
                    message: e.to_string(),
                })?;
        let customers = batch.into_resources(CUSTOMER_ENTITY);

        tracing::debug!(
            "Customer search in realm {} matched {} customers",
            self.realm,
            customers.len()
        );
        Ok(customers)
    }

    /// `{base}/v3/company/{realm}/{segments...}` with `minorversion` applied.
    fn url(&self, segments: &[&str]) -> Result<Url, ResourceError> {
        let mut url =
            Url::parse(self.config.api_base_url()).map_err(|e| ResourceError::Malformed {
                message: format!("invalid API base URL: {}", e),
            })?;

        url.path_segments_mut()
            .map_err(|_| ResourceError::Malformed {
                message: "API base URL cannot have path segments".to_string(),
            })?
            .pop_if_empty()
            .extend(["v3", "company", self.realm.as_str()])
            .extend(segments);

        if let Some(minor) = self.config.minor_version {
            url.query_pairs_mut()
                .append_pair("minorversion", &minor.to_string());
        }

        Ok(url)
    }

    /// Write URL with a fresh `requestid` so QuickBooks can de-duplicate retries.
    fn write_url(&self, kind: &ResourceKind) -> Result<Url, ResourceError> {
        let mut url = self.url(&[kind.path().as_str()])?;
        url.query_pairs_mut()
            .append_pair("requestid", &Uuid::new_v4().to_string());
        Ok(url)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        accept: &'static str,
    ) -> Result<reqwest::Response, ResourceError> {
        let token = self.tokens.valid_access_token(&self.realm).await?;
        let response = request
            .bearer_auth(token.expose())
            .header(ACCEPT, accept)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Accounting API request for realm {} failed: {}", self.realm, e);
                ResourceError::Transient {
                    status: None,
                    body: e.to_string(),
                }
            })?;
        Ok(response)
    }
}

fn extract_entity(kind: &ResourceKind, mut body: Value) -> Option<Resource> {
    match body.get_mut(kind.entity_key()).map(Value::take) {
        Some(Value::Object(entity)) => Resource::from_entity(entity),
        _ => None,
    }
}

async fn failure(kind: &ResourceKind, id: Option<&str>, response: reqwest::Response) -> ResourceError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    if let Some(id) = id {
        if status == 404 {
            return ResourceError::NotFound {
                kind: kind.clone(),
                id: id.to_string(),
            };
        }
        if let Ok(envelope) = serde_json::from_str::<FaultEnvelope>(&body) {
            if envelope.fault.is_stale_object() {
                return ResourceError::Conflict {
                    kind: kind.clone(),
                    id: id.to_string(),
                };
            }
        }
    }

    ResourceError::Transient {
        status: Some(status),
        body,
    }
}
