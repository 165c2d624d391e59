//! OAuth2 authorization-code + PKCE provider (spec.md §4.5 steps 1-7). Grounded
//! on `turbomcp-auth::oauth2::client`'s `oauth2` crate v5 usage for the
//! typestate `BasicClient` and PKCE helpers, and `turbomcp-auth::manager`'s
//! global registry for dispatching the out-of-band callback.

use std::sync::Arc;

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use secrecy::ExposeSecret;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::info;

use super::registry::FlowCompleter;
use super::{audit_provider_created, AuthProvider, Headers, ProviderRegistry};
use crate::error::{AuthErrorCode, FunnelError, Result};
use crate::token::{ITokenStorage, RefreshScheduler, TokenData, DEFAULT_LEAD};

const DEFAULT_SKEW: TimeDuration = TimeDuration::seconds(60);

type FullClient = BasicClient<
    oauth2::EndpointSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

pub struct OAuth2AuthCodeProvider {
    client: FullClient,
    scope: Option<String>,
    audience: Option<String>,
    storage: Arc<dyn ITokenStorage>,
    http: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    acquiring: Mutex<()>,
    refresh_scheduler: std::sync::Mutex<Option<RefreshScheduler>>,
    active_states: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl OAuth2AuthCodeProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Option<String>,
        authorization_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        redirect_uri: impl Into<String>,
        scope: Option<String>,
        audience: Option<String>,
        storage: Arc<dyn ITokenStorage>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Arc<Self>> {
        let authorization_endpoint = authorization_endpoint.into();
        let token_endpoint = token_endpoint.into();
        let redirect_uri = redirect_uri.into();
        crate::config::validate_http_url(&authorization_endpoint, true)?;
        crate::config::validate_http_url(&token_endpoint, true)?;
        crate::config::validate_http_url(&redirect_uri, true)?;

        let auth_url =
            AuthUrl::new(authorization_endpoint).map_err(|e| FunnelError::config(e.to_string()))?;
        let token_url =
            TokenUrl::new(token_endpoint).map_err(|e| FunnelError::config(e.to_string()))?;
        let redirect_url =
            RedirectUrl::new(redirect_uri).map_err(|e| FunnelError::config(e.to_string()))?;

        let mut client = BasicClient::new(ClientId::new(client_id.into()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);
        if let Some(secret) = client_secret {
            client = client.set_client_secret(ClientSecret::new(secret));
        }
        let client = client.set_auth_type(AuthType::BasicAuth);

        audit_provider_created("oauth2_auth_code", 0);

        Ok(Arc::new(Self {
            client,
            scope,
            audience,
            storage,
            http: reqwest::Client::new(),
            registry,
            acquiring: Mutex::new(()),
            refresh_scheduler: std::sync::Mutex::new(None),
            active_states: std::sync::Mutex::new(std::collections::HashSet::new()),
        }))
    }

    /// Starts the proactive refresh timer (spec.md §4.6). A no-op until the
    /// first authorization flow completes and a refresh token lands in
    /// storage — `refresh()` fails fast with `InvalidGrant` until then, which
    /// the scheduler logs and retries rather than treating as fatal.
    pub fn start_background_refresh(self: &Arc<Self>) {
        let provider = self.clone();
        let storage = self.storage.clone();
        let scheduler = RefreshScheduler::spawn(storage, DEFAULT_LEAD, move || {
            let provider = provider.clone();
            async move { provider.refresh().await.map_err(|e| e.to_string()) }
        });
        *self.refresh_scheduler.lock().unwrap() = Some(scheduler);
    }

    /// Begins a new authorization flow: generates the PKCE pair and `state`,
    /// registers this provider with the global registry under that `state`
    /// (spec.md §4.5 steps 2-3), and returns the fully-constructed authorization
    /// URL (step 4). The caller is responsible for writing the URL to the
    /// operator console exactly once; the actual token exchange happens later,
    /// dispatched through [`ProviderRegistry::complete`].
    pub async fn begin_authorization(self: &Arc<Self>) -> String {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request =
            self.client.authorize_url(CsrfToken::new_random).set_pkce_challenge(pkce_challenge);
        if let Some(scope) = &self.scope {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if let Some(audience) = &self.audience {
            request = request.add_extra_param("audience", audience.clone());
        }
        let (auth_url, csrf_token) = request.url();
        let state = csrf_token.secret().clone();

        self.active_states.lock().unwrap().insert(state.clone());
        let completer: Arc<dyn FlowCompleter> = self.clone();
        self.registry.begin(state, pkce_verifier.secret().clone(), completer).await;

        info!(
            event = "auth:oauth_authorization_required",
            url = %crate::redact::sanitize_str(auth_url.as_str()),
            "authorization required; open this URL to continue"
        );

        auth_url.to_string()
    }

    async fn do_exchange_code(&self, code: String, code_verifier: String) -> Result<()> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(code_verifier))
            .request_async(&self.http)
            .await
            .map_err(map_oauth_error)?;

        let expires_in = token_result
            .expires_in()
            .map(|d| TimeDuration::seconds(d.as_secs() as i64))
            .unwrap_or(TimeDuration::seconds(3600));

        let token = TokenData {
            access_token: secrecy::SecretString::from(token_result.access_token().secret().clone()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: token_result
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")),
            refresh_token: token_result
                .refresh_token()
                .map(|rt| secrecy::SecretString::from(rt.secret().clone())),
        };

        self.storage.store(token).await;
        Ok(())
    }

    /// Cancels any in-flight flow this provider registered under `state`.
    pub async fn cancel_authorization(&self, state: &str) {
        self.registry.cancel(state).await;
        self.active_states.lock().unwrap().remove(state);
    }

    /// Cancels every flow this provider has outstanding. Called when the
    /// upstream connection it authenticates is torn down, so a callback that
    /// arrives afterward finds nothing to complete.
    pub async fn cancel_all_pending(&self) {
        let states: Vec<String> = self.active_states.lock().unwrap().drain().collect();
        for state in states {
            self.registry.cancel(&state).await;
        }
    }
}

#[async_trait]
impl FlowCompleter for OAuth2AuthCodeProvider {
    async fn exchange_code(&self, state: String, code: String, code_verifier: String) -> Result<()> {
        let _guard = self.acquiring.lock().await;
        let result = self.do_exchange_code(code, code_verifier).await;
        self.active_states.lock().unwrap().remove(&state);
        result
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
impl AuthProvider for OAuth2AuthCodeProvider {
    async fn get_headers(&self) -> Result<Headers> {
        let token = self
            .storage
            .retrieve()
            .await
            .filter(|t| !t.is_expired(OffsetDateTime::now_utc(), DEFAULT_SKEW))
            .ok_or_else(|| {
                FunnelError::auth(
                    AuthErrorCode::InvalidGrant,
                    "no valid token cached; complete an authorization flow first",
                )
            })?;
        let mut headers = Headers::new();
        headers.insert("Authorization".to_string(), token.authorization_header());
        Ok(headers)
    }

    async fn is_valid(&self) -> bool {
        !self.storage.is_expired(DEFAULT_SKEW).await
    }

    async fn refresh(&self) -> Result<()> {
        let _guard = self.acquiring.lock().await;
        let Some(token) = self.storage.retrieve().await else {
            return Err(FunnelError::auth(AuthErrorCode::InvalidGrant, "no token to refresh"));
        };
        let Some(refresh_token) = token.refresh_token.clone() else {
            return Err(FunnelError::auth(AuthErrorCode::InvalidGrant, "no refresh token available"));
        };
        use oauth2::RefreshToken;
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose_secret().to_string()))
            .request_async(&self.http)
            .await
            .map_err(map_oauth_error)?;

        let expires_in = token_result
            .expires_in()
            .map(|d| TimeDuration::seconds(d.as_secs() as i64))
            .unwrap_or(TimeDuration::seconds(3600));

        let refreshed = TokenData {
            access_token: secrecy::SecretString::from(token_result.access_token().secret().clone()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: token.scope.clone(),
            refresh_token: token_result
                .refresh_token()
                .map(|rt| secrecy::SecretString::from(rt.secret().clone()))
                .or(Some(refresh_token)),
        };
        self.storage.store(refreshed).await;
        Ok(())
    }

    fn destroy(&self) {
        if let Some(mut scheduler) = self.refresh_scheduler.lock().unwrap().take() {
            scheduler.destroy();
        }
    }
}
