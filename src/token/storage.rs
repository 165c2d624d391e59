//! `ITokenStorage` contract and its in-memory implementation.
//! Keychain-backed persistence is an explicit external collaborator, out of
//! scope here.

use async_trait::async_trait;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::RwLock;

use super::TokenData;

/// Storage contract a provider uses to cache minted tokens. Implementations must
/// be safe for concurrent `retrieve`/`store`.
#[async_trait]
pub trait ITokenStorage: Send + Sync {
    async fn store(&self, token: TokenData);
    async fn retrieve(&self) -> Option<TokenData>;
    async fn clear(&self);

    /// True if the stored token is missing, or present but expired given `skew`
    /// (default 60s).
    async fn is_expired(&self, skew: TimeDuration) -> bool {
        match self.retrieve().await {
            Some(token) => token.is_expired(OffsetDateTime::now_utc(), skew),
            None => true,
        }
    }
}

/// Process-local token cache. The only implementation this crate ships —
/// keychain-backed persistence is out of scope.
#[derive(Default)]
pub struct InMemoryTokenStorage {
    slot: RwLock<Option<TokenData>>,
}

impl InMemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ITokenStorage for InMemoryTokenStorage {
    async fn store(&self, token: TokenData) {
        *self.slot.write().await = Some(token);
    }

    async fn retrieve(&self) -> Option<TokenData> {
        self.slot.read().await.clone()
    }

    async fn clear(&self) {
        *self.slot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn token(expires_in: TimeDuration) -> TokenData {
        TokenData {
            access_token: SecretString::from("A".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: None,
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let storage = InMemoryTokenStorage::new();
        let t = token(TimeDuration::seconds(3600));
        storage.store(t.clone()).await;
        let retrieved = storage.retrieve().await.unwrap();
        assert_eq!(retrieved, t);
    }

    #[tokio::test]
    async fn clear_empties_storage() {
        let storage = InMemoryTokenStorage::new();
        storage.store(token(TimeDuration::seconds(3600))).await;
        storage.clear().await;
        assert!(storage.retrieve().await.is_none());
    }

    #[tokio::test]
    async fn empty_storage_is_expired() {
        let storage = InMemoryTokenStorage::new();
        assert!(storage.is_expired(TimeDuration::seconds(60)).await);
    }
}
