//! # Ledgerlink Core
//!
//! Core library for connecting multi-tenant applications to QuickBooks Online.
//!
//! This crate provides:
//! - Per-tenant OAuth2 credential lifecycle with single-flight refresh
//! - Webhook signature verification and dispatch, including app disconnects
//! - An accounting API client with `SyncToken` optimistic concurrency and
//!   batch customer search
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ledgerlink_core::{
//!     ClientConfig, FileCredentialStore, RemoteResourceClient, ResourceKind, TenantId,
//!     DefaultTokenManager,
//! };
//!
//! async fn read_invoice(config: ClientConfig) -> Result<(), ledgerlink_core::LedgerlinkError> {
//!     let config = Arc::new(config);
//!     let store = FileCredentialStore::open_default()?;
//!     let tokens = Arc::new(DefaultTokenManager::new(config.clone(), store)?);
//!
//!     let client = RemoteResourceClient::new(config, tokens, TenantId::new("9130357992221046"))?;
//!     let invoice = client.get(ResourceKind::Invoice, "130").await?;
//!     println!("invoice {} at SyncToken {}", invoice.id, invoice.sync_token);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod oauth;
pub mod query;
pub mod resource;
pub mod store;
pub mod token;
pub mod token_manager;
pub mod verify;
pub mod webhook;

// Re-export commonly used types at crate root
pub use config::{ClientConfig, ConfigError};

pub use model::{ConnectionStatus, Credential, CredentialState, TenantId};

pub use store::{
    CompareAndSwap, CredentialStore, FileCredentialStore, MemoryCredentialStore, Secret,
    StoreError,
};

pub use token::{AuthorizationRequest, TokenError, TokenManager};

pub use token_manager::DefaultTokenManager;

pub use verify::SignatureVerifier;

pub use webhook::{
    EntitySyncHook, WebhookDispatcher, WebhookError, WebhookReport, WebhookResponse,
};

pub use resource::{RemoteResourceClient, Resource, ResourceError, ResourceKind};

pub use query::CustomerSearch;

pub use error::LedgerlinkError;
