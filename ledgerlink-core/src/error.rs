//! Top-level error types for Ledgerlink.

use thiserror::Error;

use crate::config::ConfigError;
use crate::resource::ResourceError;
use crate::store::StoreError;
use crate::token::TokenError;
use crate::webhook::WebhookError;

/// Top-level error type encompassing all Ledgerlink errors.
#[derive(Debug, Error)]
pub enum LedgerlinkError {
    /// Error from credential storage operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from the OAuth credential lifecycle.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Error handling a webhook delivery.
    #[error("webhook error: {0}")]
    Webhook(#[from] WebhookError),

    /// Error calling the accounting API.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl LedgerlinkError {
    /// Whether the operation may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Token(e) => e.is_transient(),
            Self::Resource(e) => e.is_retryable(),
            Self::Store(_) => true,
            Self::Webhook(WebhookError::Internal { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_retryability() {
        let err: LedgerlinkError = TokenError::RefreshTransient {
            message: "timeout".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: LedgerlinkError = WebhookError::Unauthenticated.into();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("signature"));
    }
}
