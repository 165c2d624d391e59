//! Typed configuration data model and `${VAR}` environment
//! interpolation. The file-format parser and the CLI surface that
//! would load one of these into a running supervisor are out of scope here; this
//! module only defines the shapes and the interpolation algorithm a caller applies
//! after reading its own config file.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FunnelError, Result};

/// One of the four wire protocols a transport can speak to an upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportConfig {
    #[serde(rename_all = "camelCase")]
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    Sse {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        reconnect: ReconnectConfig,
    },
    #[serde(rename_all = "camelCase")]
    WebSocket {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default = "default_ping_interval_ms")]
        ping_interval_ms: u64,
        #[serde(default)]
        reconnect: ReconnectConfig,
    },
    #[serde(rename_all = "camelCase")]
    StreamableHttp {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        reconnect: ReconnectConfig,
    },
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

impl TransportConfig {
    /// The reconnect policy configured for this transport, if any (`Stdio` has
    /// none — a dead child process is reported as a closed connection, not
    /// retried by the reconnection manager's own timer).
    pub fn reconnect(&self) -> Option<&ReconnectConfig> {
        match self {
            Self::Stdio { .. } => None,
            Self::Sse { reconnect, .. }
            | Self::WebSocket { reconnect, .. }
            | Self::StreamableHttp { reconnect, .. } => Some(reconnect),
        }
    }

    /// Validates URL-bearing variants; `localhost` is exempt from the HTTPS/WSS
    /// requirement that otherwise applies in production.
    pub fn validate(&self, allow_plaintext_localhost: bool) -> Result<()> {
        match self {
            Self::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(FunnelError::config("stdio transport command must not be empty"));
                }
                Ok(())
            }
            Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => {
                validate_http_url(url, allow_plaintext_localhost)
            }
            Self::WebSocket { url, .. } => validate_ws_url(url, allow_plaintext_localhost),
        }
    }
}

pub(crate) fn validate_http_url(raw: &str, allow_plaintext_localhost: bool) -> Result<()> {
    let parsed = url::Url::parse(raw)?;
    let is_localhost = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "::1"));
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if allow_plaintext_localhost && is_localhost => Ok(()),
        other => Err(FunnelError::config(format!(
            "unsupported scheme '{other}': plaintext http is only allowed against localhost"
        ))),
    }
}

fn validate_ws_url(raw: &str, allow_plaintext_localhost: bool) -> Result<()> {
    let parsed = url::Url::parse(raw)?;
    let is_localhost = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "::1"));
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if allow_plaintext_localhost && is_localhost => Ok(()),
        other => Err(FunnelError::config(format!(
            "unsupported scheme '{other}': plaintext ws is only allowed against localhost"
        ))),
    }
}

/// Reconnection policy. Defaults: 10 attempts, 1s initial delay, 30s cap,
/// 2x multiplier, 25% jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Credential configuration for an upstream. All string fields admit
/// `${VAR}` interpolation, resolved at config load time via [`interpolate_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    OAuth2ClientCredentials {
        client_id: String,
        client_secret: String,
        token_endpoint: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    OAuth2AuthCode {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        authorization_endpoint: String,
        token_endpoint: String,
        redirect_uri: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::None
    }
}

/// One configured upstream server: a name, a transport, and optional auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Resolves `${VAR}` references against `env`, re-resolving the substitution's own
/// output up to `max_depth` times so a variable may itself expand to another
/// reference. An unresolved required variable is a fatal config error.
pub fn interpolate_env(input: &str, env: &HashMap<String, String>, max_depth: u8) -> Result<String> {
    let mut current = input.to_string();
    for _ in 0..max_depth {
        let (next, replaced_any) = interpolate_once(&current, env)?;
        if !replaced_any {
            return Ok(next);
        }
        current = next;
    }
    if contains_reference(&current) {
        return Err(FunnelError::config(format!(
            "'${{VAR}}' interpolation did not converge within {max_depth} passes"
        )));
    }
    Ok(current)
}

fn contains_reference(s: &str) -> bool {
    s.contains("${")
}

fn interpolate_once(input: &str, env: &HashMap<String, String>) -> Result<(String, bool)> {
    let mut out = String::with_capacity(input.len());
    let mut replaced_any = false;
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                let value = env.get(name).ok_or_else(|| {
                    FunnelError::config(format!("unresolved required variable '${{{name}}}'"))
                })?;
                out.push_str(value);
                replaced_any = true;
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok((out, replaced_any))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn interpolates_single_variable() {
        let env = env(&[("TOKEN", "secret-value")]);
        let out = interpolate_env("Bearer ${TOKEN}", &env, 10).unwrap();
        assert_eq!(out, "Bearer secret-value");
    }

    #[test]
    fn interpolates_nested_variable() {
        let env = env(&[("OUTER", "${INNER}"), ("INNER", "resolved")]);
        let out = interpolate_env("${OUTER}", &env, 10).unwrap();
        assert_eq!(out, "resolved");
    }

    #[test]
    fn unresolved_required_variable_is_fatal() {
        let env = env(&[]);
        let err = interpolate_env("${MISSING}", &env, 10).unwrap_err();
        assert!(matches!(err, FunnelError::Config { .. }));
    }

    #[test]
    fn default_reconnect_config_matches_spec_defaults() {
        let cfg = ReconnectConfig::default();
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.initial_delay_ms, 1_000);
        assert_eq!(cfg.max_delay_ms, 30_000);
        assert_eq!(cfg.backoff_multiplier, 2.0);
        assert_eq!(cfg.jitter, 0.25);
    }

    #[test]
    fn stdio_transport_reconnect_is_none() {
        let cfg = TransportConfig::Stdio {
            command: "echo".into(),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(cfg.reconnect().is_none());
    }

    #[test]
    fn https_url_validates_plaintext_http_requires_localhost() {
        let cfg = TransportConfig::Sse {
            url: "http://api.example.com/events".into(),
            timeout_ms: None,
            reconnect: ReconnectConfig::default(),
        };
        assert!(cfg.validate(false).is_err());

        let cfg = TransportConfig::Sse {
            url: "http://localhost/events".into(),
            timeout_ms: None,
            reconnect: ReconnectConfig::default(),
        };
        assert!(cfg.validate(true).is_ok());
    }
}
