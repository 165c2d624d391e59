//! Error taxonomy for the funnel core.
//!
//! One variant family per failure domain, matching the propagation policy: config
//! errors are fatal at init, auth errors carry a structured code, transport errors
//! are retried by the reconnection manager when policy allows, and timeout/cancel
//! are terminal outcomes for a single pending request.

use thiserror::Error;

/// OAuth2 error codes as returned by a token endpoint, plus local construction
/// failures. Mirrors RFC 6749 §5.2's `error` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    MissingToken,
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    AccessDenied,
    UnauthorizedClient,
    UnsupportedGrantType,
    InvalidScope,
    UnsupportedResponseType,
    ServerError,
    TemporarilyUnavailable,
    UnknownError,
}

impl AuthErrorCode {
    /// Maps an RFC 6749 `error` field value to a code; unrecognized strings
    /// degrade to `UnknownError` rather than failing to parse.
    pub fn from_oauth_error(value: &str) -> Self {
        match value {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "access_denied" => Self::AccessDenied,
            "unauthorized_client" => Self::UnauthorizedClient,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_scope" => Self::InvalidScope,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "server_error" => Self::ServerError,
            "temporarily_unavailable" => Self::TemporarilyUnavailable,
            _ => Self::UnknownError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidClient => "INVALID_CLIENT",
            Self::InvalidGrant => "INVALID_GRANT",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::UnauthorizedClient => "UNAUTHORIZED_CLIENT",
            Self::UnsupportedGrantType => "UNSUPPORTED_GRANT_TYPE",
            Self::InvalidScope => "INVALID_SCOPE",
            Self::UnsupportedResponseType => "UNSUPPORTED_RESPONSE_TYPE",
            Self::ServerError => "SERVER_ERROR",
            Self::TemporarilyUnavailable => "TEMPORARILY_UNAVAILABLE",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    InvalidUrl,
    ConnectionFailed,
    NotConnected,
    SendFailed,
    Timeout,
    ProtocolError,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidUrl => "invalid url",
            Self::ConnectionFailed => "connection failed",
            Self::NotConnected => "not connected",
            Self::SendFailed => "send failed",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum FunnelError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("auth error [{code}]: {message}")]
    Auth { code: AuthErrorCode, message: String },

    #[error("transport error [{kind}]: {message}")]
    Transport { kind: TransportErrorKind, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,
}

impl FunnelError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn auth(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self::Auth { code, message: message.into() }
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport { kind, message: message.into() }
    }

    /// True for failures the reconnection manager should treat as connection loss
    /// rather than a request-level failure to surface to the caller.
    pub fn is_retryable_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::ConnectionFailed | TransportErrorKind::Timeout,
                ..
            }
        )
    }
}

impl From<url::ParseError> for FunnelError {
    fn from(source: url::ParseError) -> Self {
        Self::config(format!("invalid url: {source}"))
    }
}

impl From<serde_json::Error> for FunnelError {
    fn from(source: serde_json::Error) -> Self {
        Self::config(format!("invalid json: {source}"))
    }
}

pub type Result<T> = std::result::Result<T, FunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_error_codes_round_trip_known_values() {
        for raw in [
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
        ] {
            let code = AuthErrorCode::from_oauth_error(raw);
            assert_eq!(code.as_str().to_lowercase(), raw);
        }
    }

    #[test]
    fn unrecognized_oauth_error_degrades_to_unknown() {
        assert_eq!(AuthErrorCode::from_oauth_error("bogus"), AuthErrorCode::UnknownError);
    }

    #[test]
    fn connection_failed_and_timeout_are_retryable() {
        let err = FunnelError::transport(TransportErrorKind::ConnectionFailed, "refused");
        assert!(err.is_retryable_connection_error());
        let err = FunnelError::transport(TransportErrorKind::SendFailed, "oops");
        assert!(!err.is_retryable_connection_error());
    }
}
