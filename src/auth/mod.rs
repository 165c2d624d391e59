//! Authentication providers (spec.md §4.5). Grounded on
//! `turbomcp-auth::oauth2::client` and `turbomcp-auth::manager` — the teacher
//! crate has no OAuth2 implementation at all.

mod auth_code;
mod bearer;
mod client_credentials;
mod none;
mod registry;

pub use auth_code::OAuth2AuthCodeProvider;
pub use bearer::BearerProvider;
pub use client_credentials::OAuth2ClientCredentialsProvider;
pub use none::NoAuthProvider;
pub use registry::{PendingAuthFlow, ProviderRegistry, PENDING_FLOW_TTL};

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// Headers a transport should attach to its next request. Only `Authorization`
/// is meaningful today but the map shape leaves room for providers that need
/// more (DPoP proof headers, etc.) without changing the trait.
pub type Headers = HashMap<String, String>;

/// Capability every auth provider implements (spec.md §4.5). Construction
/// itself is provider-specific (see each provider's `new`), validates inputs, and
/// emits the `auth:provider_created` audit event on success.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Returns the headers to attach to the next outbound request, acquiring or
    /// refreshing a token first if needed. Concurrent callers during an
    /// in-flight acquisition share the one outbound request (spec.md §8
    /// "at-most-one concurrent acquisition").
    async fn get_headers(&self) -> Result<Headers>;

    /// Cheap, synchronous-feeling validity check (no network call): true unless
    /// the cached credential is known to be expired/unusable.
    async fn is_valid(&self) -> bool;

    /// Forces a refresh. A logged no-op for providers with nothing to refresh
    /// (`NoAuth`, `Bearer`).
    async fn refresh(&self) -> Result<()>;

    /// Cancels any background task the provider owns (proactive refresh
    /// timer, OAuth2 state sweep). A logged no-op for providers with no such
    /// task. Explicit scoped ownership in place of a `FinalizationRegistry`
    /// (spec.md §9): the supervisor calls this on `disconnect_server` and at
    /// shutdown, matching the "owner calls destroy()" pattern it has for
    /// `OAuth2AuthCodeProvider`'s pending-flow sweep.
    fn destroy(&self) {}
}

/// Emits the `auth:provider_created` audit event with safe metadata (provider
/// kind and token length) — never the credential value itself (spec.md §4.5).
pub(crate) fn audit_provider_created(kind: &str, secret_len: usize) {
    tracing::info!(event = "auth:provider_created", provider_kind = kind, secret_len, "auth provider constructed");
}
