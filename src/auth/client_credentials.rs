//! OAuth2 client-credentials provider (spec.md §4.5). Grounded on
//! `turbomcp-auth::oauth2::client`'s use of the `oauth2` crate v5 typestate
//! `BasicClient`.

use std::sync::Arc;

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{AuthType, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;

use super::{audit_provider_created, AuthProvider, Headers};
use crate::error::{AuthErrorCode, FunnelError, Result};
use crate::token::{ITokenStorage, RefreshScheduler, TokenData, DEFAULT_LEAD};

/// Default skew subtracted from `expires_at` before a cached token is treated
/// as expired (spec.md §4.5).
const DEFAULT_SKEW: TimeDuration = TimeDuration::seconds(60);

pub struct OAuth2ClientCredentialsProvider {
    client: BasicClient<
        oauth2::EndpointNotSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointSet,
    >,
    scope: Option<String>,
    audience: Option<String>,
    storage: Arc<dyn ITokenStorage>,
    http: reqwest::Client,
    // Guards the single-flight token acquisition (spec.md §8 "at-most-one
    // concurrent acquisition"): concurrent callers block on this lock rather
    // than each issuing their own POST.
    acquiring: Mutex<()>,
    refresh_scheduler: std::sync::Mutex<Option<RefreshScheduler>>,
}

impl OAuth2ClientCredentialsProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
        scope: Option<String>,
        audience: Option<String>,
        storage: Arc<dyn ITokenStorage>,
    ) -> Result<Self> {
        let client_id = client_id.into();
        let client_secret = client_secret.into();
        let token_url =
            TokenUrl::new(token_endpoint.into()).map_err(|e| FunnelError::config(e.to_string()))?;

        let client = BasicClient::new(ClientId::new(client_id))
            .set_client_secret(ClientSecret::new(client_secret))
            .set_token_uri(token_url)
            .set_auth_type(AuthType::BasicAuth);

        audit_provider_created("oauth2_client_credentials", 0);

        Ok(Self {
            client,
            scope,
            audience,
            storage,
            http: reqwest::Client::new(),
            acquiring: Mutex::new(()),
            refresh_scheduler: std::sync::Mutex::new(None),
        })
    }

    /// Starts the proactive refresh timer (spec.md §4.6): fires `lead` before
    /// the cached token's `expires_at`, re-deriving the next wakeup from
    /// whatever is on storage each time so a reactive `refresh()` triggered by
    /// a 401 elsewhere is picked up automatically. Call once, after wrapping
    /// the provider in an `Arc` — idempotent against being skipped entirely,
    /// since `get_headers()` already acquires lazily on its own.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let provider = self.clone();
        let storage = self.storage.clone();
        let scheduler = RefreshScheduler::spawn(storage, DEFAULT_LEAD, move || {
            let provider = provider.clone();
            async move { provider.refresh().await.map_err(|e| e.to_string()) }
        });
        *self.refresh_scheduler.lock().unwrap() = Some(scheduler);
    }

    async fn acquire(&self) -> Result<TokenData> {
        // Holding this lock across the network call is exactly the single-flight
        // behavior the spec requires: the first caller in does the POST, every
        // other concurrent caller waits for the same result instead of issuing
        // its own.
        let _guard = self.acquiring.lock().await;

        // Re-check: another caller may have refreshed while we waited for the lock.
        if let Some(token) = self.storage.retrieve().await {
            if !token.is_expired(OffsetDateTime::now_utc(), DEFAULT_SKEW) {
                return Ok(token);
            }
        }

        let mut request = self.client.exchange_client_credentials();
        if let Some(scope) = &self.scope {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if let Some(audience) = &self.audience {
            request = request.add_extra_param("audience", audience.clone());
        }

        let response = request.request_async(&self.http).await.map_err(map_oauth_error)?;

        let expires_in = response
            .expires_in()
            .map(|d| TimeDuration::seconds(d.as_secs() as i64))
            .unwrap_or(TimeDuration::seconds(3600));

        let token = TokenData {
            access_token: secrecy::SecretString::from(response.access_token().secret().clone()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: response.scopes().map(|scopes| {
                scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
            }),
            refresh_token: response
                .refresh_token()
                .map(|rt| secrecy::SecretString::from(rt.secret().clone())),
        };

        self.storage.store(token.clone()).await;
        Ok(token)
    }
}

fn map_oauth_error<E: std::fmt::Display>(err: E) -> FunnelError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    let known_codes = [
        "invalid_request",
        "invalid_client",
        "invalid_grant",
        "unauthorized_client",
        "unsupported_grant_type",
        "invalid_scope",
        "access_denied",
        "unsupported_response_type",
        "server_error",
        "temporarily_unavailable",
    ];
    let code = known_codes
        .iter()
        .find(|c| lower.contains(*c))
        .map(|c| AuthErrorCode::from_oauth_error(c))
        .unwrap_or(AuthErrorCode::ServerError);
    FunnelError::auth(code, message)
}

#[async_trait]
impl AuthProvider for OAuth2ClientCredentialsProvider {
    async fn get_headers(&self) -> Result<Headers> {
        let token = match self.storage.retrieve().await {
            Some(token) if !token.is_expired(OffsetDateTime::now_utc(), DEFAULT_SKEW) => token,
            _ => self.acquire().await?,
        };
        let mut headers = Headers::new();
        headers.insert("Authorization".to_string(), token.authorization_header());
        Ok(headers)
    }

    async fn is_valid(&self) -> bool {
        !self.storage.is_expired(DEFAULT_SKEW).await
    }

    async fn refresh(&self) -> Result<()> {
        self.storage.clear().await;
        self.acquire().await.map(|_| ())
    }

    fn destroy(&self) {
        if let Some(mut scheduler) = self.refresh_scheduler.lock().unwrap().take() {
            scheduler.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_oauth_error_recognizes_known_codes() {
        let err = map_oauth_error("server returned invalid_grant: expired code");
        match err {
            FunnelError::Auth { code, .. } => assert_eq!(code, AuthErrorCode::InvalidGrant),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn map_oauth_error_defaults_to_server_error() {
        let err = map_oauth_error("connection reset by peer");
        match err {
            FunnelError::Auth { code, .. } => assert_eq!(code, AuthErrorCode::ServerError),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
