use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use lmux_common::{ErrorCategory, GatewayError};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta};

use crate::auth::Auth;

/// Ordered header list. Order matters to fingerprint-sensitive upstreams, so
/// this stays a Vec rather than a map.
pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, existing)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *existing = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let index = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(index).1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response at all.
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// Non-2xx captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

impl UpstreamFailure {
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamFailure::Http { status, .. } => Some(*status),
            UpstreamFailure::Transport { .. } => None,
        }
    }

    pub fn body_text(&self) -> String {
        match self {
            UpstreamFailure::Http { body, .. } => String::from_utf8_lossy(body).into_owned(),
            UpstreamFailure::Transport { message, .. } => message.clone(),
        }
    }
}

/// `Retry-After` comes as either delta-seconds or an HTTP-date.
pub fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

/// Default §7 classification; providers override only where their error
/// bodies diverge.
pub fn classify_failure(failure: &UpstreamFailure) -> GatewayError {
    match failure {
        UpstreamFailure::Http {
            status,
            headers,
            body,
        } => {
            let message = String::from_utf8_lossy(body).into_owned();
            match *status {
                400 => GatewayError::user(message),
                401 | 403 => {
                    let category = if crate::registry::is_revoke_message(&message) {
                        ErrorCategory::AuthRevoked
                    } else {
                        ErrorCategory::AuthError
                    };
                    GatewayError::new(category, message).with_status(*status)
                }
                404 => GatewayError::not_found(message),
                429 => GatewayError::quota(message, parse_retry_after(headers)),
                status if (500..600).contains(&status) => {
                    GatewayError::new(ErrorCategory::Transient, message).with_status(status)
                }
                status => GatewayError::new(ErrorCategory::Unknown, message).with_status(status),
            }
        }
        UpstreamFailure::Transport { kind, message } => match kind {
            TransportErrorKind::Timeout
            | TransportErrorKind::ReadTimeout
            | TransportErrorKind::Connect
            | TransportErrorKind::Dns
            | TransportErrorKind::Tls => GatewayError::new(ErrorCategory::Transient, message.clone()),
            TransportErrorKind::Other => GatewayError::new(ErrorCategory::Unknown, message.clone()),
        },
    }
}

/// Per-stream decode state. One instance per upstream response; feeds raw
/// frame payloads (SSE `data:` values or NDJSON lines) and yields IR deltas.
pub trait StreamDecoder: Send {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamDelta>, GatewayError>;
    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError>;
}

/// Token material coming back from a refresh flow.
#[derive(Debug, Clone, Default)]
pub struct RefreshUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds; 0 = upstream gave no expiry.
    pub expires_at: i64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    /// Refresh endpoint said the grant is dead; disable the auth.
    #[error("refresh rejected: {0}")]
    Revoked(String),
    /// Network or upstream trouble; keep the old token and back off.
    #[error("refresh failed: {0}")]
    Transient(String),
}

/// One implementation per provider: builds wire requests in the provider's
/// native format, decodes its responses, and runs its OAuth refresh.
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// How far before token expiry the refresher should act.
    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    /// Canonical model name → the id this upstream expects.
    fn resolve_model(&self, canonical: &str) -> String {
        canonical.to_string()
    }

    fn build_chat(&self, auth: &Auth, request: &ChatRequest) -> Result<UpstreamHttpRequest, GatewayError>;

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError>;

    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Classify an upstream failure; default follows §7, override for
    /// provider-specific error envelopes.
    fn classify(&self, failure: &UpstreamFailure) -> GatewayError {
        classify_failure(failure)
    }

    async fn refresh(&self, auth: &Auth) -> Result<RefreshUpdate, RefreshError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds_and_http_date() {
        let headers = vec![("Retry-After".to_string(), "120".to_string())];
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        let future = SystemTime::now() + Duration::from_secs(300);
        let headers = vec![("retry-after".to_string(), httpdate::fmt_http_date(future))];
        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed > Duration::from_secs(290) && parsed <= Duration::from_secs(301));
    }

    #[test]
    fn classification_follows_status() {
        let failure = UpstreamFailure::Http {
            status: 429,
            headers: vec![("retry-after".into(), "60".into())],
            body: Bytes::from_static(b"slow down"),
        };
        let err = classify_failure(&failure);
        assert_eq!(err.category, ErrorCategory::QuotaError);
        assert_eq!(err.retry_after, Some(Duration::from_secs(60)));

        let failure = UpstreamFailure::Http {
            status: 401,
            headers: Vec::new(),
            body: Bytes::from_static(b"OAuth token has been revoked"),
        };
        assert_eq!(classify_failure(&failure).category, ErrorCategory::AuthRevoked);

        let failure = UpstreamFailure::Http {
            status: 401,
            headers: Vec::new(),
            body: Bytes::from_static(b"Unauthorized"),
        };
        assert_eq!(classify_failure(&failure).category, ErrorCategory::AuthError);

        let failure = UpstreamFailure::Http {
            status: 503,
            headers: Vec::new(),
            body: Bytes::new(),
        };
        assert_eq!(classify_failure(&failure).category, ErrorCategory::Transient);
    }

    #[test]
    fn header_helpers_are_case_insensitive() {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", "Bearer a");
        header_set(&mut headers, "authorization", "Bearer b");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "AUTHORIZATION"), Some("Bearer b"));
        assert_eq!(header_remove(&mut headers, "authorization").as_deref(), Some("Bearer b"));
        assert!(headers.is_empty());
    }
}
