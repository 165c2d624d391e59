use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::{audit_provider_created, AuthProvider, Headers};
use crate::error::{AuthErrorCode, FunnelError, Result};

/// Static bearer token (spec.md §4.5). Construction fails with `MISSING_TOKEN`
/// for an empty or whitespace-only token; the attempted token is never included
/// in that error's message (spec.md §8 scenario 1).
pub struct BearerProvider {
    token: SecretString,
}

impl BearerProvider {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(FunnelError::auth(AuthErrorCode::MissingToken, "No access token provided"));
        }
        audit_provider_created("bearer", trimmed.len());
        Ok(Self { token: SecretString::from(trimmed.to_string()) })
    }
}

#[async_trait]
impl AuthProvider for BearerProvider {
    async fn get_headers(&self) -> Result<Headers> {
        let mut headers = Headers::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", self.token.expose_secret()));
        Ok(headers)
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn refresh(&self) -> Result<()> {
        tracing::debug!(event = "auth:refresh_noop", provider_kind = "bearer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_token_fails_construction_with_missing_token() {
        let err = BearerProvider::new("").unwrap_err();
        match err {
            FunnelError::Auth { code, message } => {
                assert_eq!(code, AuthErrorCode::MissingToken);
                assert_eq!(message, "No access token provided");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn whitespace_only_token_fails_construction() {
        assert!(BearerProvider::new("   ").is_err());
    }

    #[tokio::test]
    async fn returns_stable_bearer_header() {
        let provider = BearerProvider::new("t-123").unwrap();
        let headers = provider.get_headers().await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer t-123");
        let headers_again = provider.get_headers().await.unwrap();
        assert_eq!(headers, headers_again);
    }

    #[tokio::test]
    async fn trims_surrounding_whitespace() {
        let provider = BearerProvider::new("  t-123  ").unwrap();
        let headers = provider.get_headers().await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer t-123");
    }
}
