//! Shared pieces of the RFC 6749 refresh flows. Each provider knows its own
//! endpoint and parameters; the response envelope and failure mapping are
//! the same everywhere.

use serde::Deserialize;
use time::OffsetDateTime;

use lmux_provider_core::{RefreshError, RefreshUpdate};

use crate::http_client::oauth_client;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    pub fn into_update(self, fallback_refresh_token: &str) -> RefreshUpdate {
        let expires_at = self
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| OffsetDateTime::now_utc().unix_timestamp() + secs)
            .unwrap_or(0);
        RefreshUpdate {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .filter(|token| !token.is_empty())
                .or_else(|| {
                    (!fallback_refresh_token.is_empty())
                        .then(|| fallback_refresh_token.to_string())
                }),
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RefreshBody<'a> {
    Form(&'a [(&'a str, &'a str)]),
    Json(&'a serde_json::Value),
}

/// POST a refresh grant and map the response per §7: `invalid_grant` (or any
/// 400/401 naming a dead grant) is terminal, everything else is transient.
pub(crate) async fn post_refresh(
    url: &str,
    body: RefreshBody<'_>,
    headers: &[(&str, &str)],
) -> Result<TokenResponse, RefreshError> {
    let client = oauth_client(None)?;
    let mut request = client.post(url);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let request = match body {
        RefreshBody::Form(fields) => {
            let encoded = fields
                .iter()
                .map(|(k, v)| {
                    format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                })
                .collect::<Vec<_>>()
                .join("&");
            request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encoded)
        }
        RefreshBody::Json(value) => {
            let payload = serde_json::to_vec(value)
                .map_err(|err| RefreshError::Transient(err.to_string()))?;
            request
                .header("Content-Type", "application/json")
                .body(payload)
        }
    };

    let response = request
        .send()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| RefreshError::Transient(err.to_string()))?;

    if !(200..300).contains(&status) {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if (status == 400 || status == 401) && looks_revoked(&text) {
            return Err(RefreshError::Revoked(text));
        }
        tracing::warn!(url, status, "token refresh endpoint unhappy");
        return Err(RefreshError::Transient(format!(
            "refresh endpoint returned {status}: {text}"
        )));
    }

    let parsed: TokenResponse = serde_json::from_slice(&bytes)
        .map_err(|err| RefreshError::Transient(format!("bad token response: {err}")))?;
    if let Some(error) = parsed.error.as_deref() {
        let detail = parsed.error_description.clone().unwrap_or_default();
        let text = format!("{error}: {detail}");
        if looks_revoked(&text) {
            return Err(RefreshError::Revoked(text));
        }
        return Err(RefreshError::Transient(text));
    }
    if parsed.access_token.is_empty() {
        return Err(RefreshError::Transient(
            "token response carried no access_token".to_string(),
        ));
    }
    Ok(parsed)
}

fn looks_revoked(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    lowered.contains("invalid_grant")
        || lowered.contains("revoked")
        || lowered.contains("deleted_client")
        || lowered.contains("unauthorized_client")
}
