//! Token storage and proactive refresh scheduling.

mod scheduler;
mod storage;

pub use scheduler::{RefreshScheduler, DEFAULT_LEAD};
pub use storage::{InMemoryTokenStorage, ITokenStorage};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A minted or cached OAuth2 access token. `expires_at` is always an
/// absolute timestamp so the token survives a store/retrieve round-trip across
/// processes without drifting relative to an elapsed-time counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    #[serde(with = "secret_string")]
    pub access_token: SecretString,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub scope: Option<String>,
    #[serde(with = "optional_secret_string", default)]
    pub refresh_token: Option<SecretString>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenData {
    /// True once `now >= expires_at - skew`.
    pub fn is_expired(&self, now: OffsetDateTime, skew: time::Duration) -> bool {
        now >= self.expires_at - skew
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.expose_secret())
    }
}

impl PartialEq for TokenData {
    fn eq(&self, other: &Self) -> bool {
        self.access_token.expose_secret() == other.access_token.expose_secret()
            && self.token_type == other.token_type
            && self.expires_at == other.expires_at
            && self.scope == other.scope
            && self.refresh_token.as_ref().map(ExposeSecret::expose_secret)
                == other.refresh_token.as_ref().map(ExposeSecret::expose_secret)
    }
}

mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SecretString::from(raw))
    }
}

mod optional_secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(v.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretString>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(SecretString::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration as TimeDuration;

    fn token(expires_in: TimeDuration) -> TokenData {
        TokenData {
            access_token: SecretString::from("A".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: OffsetDateTime::now_utc() + expires_in,
            scope: None,
            refresh_token: None,
        }
    }

    #[test]
    fn is_expired_honors_skew() {
        let t = token(TimeDuration::seconds(30));
        let skew = TimeDuration::seconds(60);
        assert!(t.is_expired(OffsetDateTime::now_utc(), skew));

        let t = token(TimeDuration::seconds(3600));
        assert!(!t.is_expired(OffsetDateTime::now_utc(), skew));
    }

    #[test]
    fn authorization_header_formats_bearer_token() {
        let t = token(TimeDuration::seconds(3600));
        assert_eq!(t.authorization_header(), "Bearer A");
    }
}
