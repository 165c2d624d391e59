use async_trait::async_trait;

use super::{audit_provider_created, AuthProvider, Headers};
use crate::error::Result;

/// No credentials attached; always valid (spec.md §4.5).
pub struct NoAuthProvider;

impl NoAuthProvider {
    pub fn new() -> Self {
        audit_provider_created("none", 0);
        Self
    }
}

impl Default for NoAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for NoAuthProvider {
    async fn get_headers(&self) -> Result<Headers> {
        Ok(Headers::new())
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn refresh(&self) -> Result<()> {
        tracing::debug!(event = "auth:refresh_noop", provider_kind = "none");
        Ok(())
    }
}
