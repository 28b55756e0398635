use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use lmux_common::{ErrorCategory, GatewayError, provider};
use lmux_protocol::claude as wire;
use lmux_provider_core::{
    Auth, Headers, HttpMethod, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    UpstreamFailure, UpstreamHttpRequest, classify_failure, header_set,
};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta, Thinking, alias, claude, sanitize};

use crate::fingerprint;
use crate::oauth::{RefreshBody, post_refresh};

const API_BASE: &str = "https://api.anthropic.com";
const CONSOLE_BASE: &str = "https://console.anthropic.com";
const AUTHORIZE_BASE: &str = "https://claude.ai/oauth/authorize";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_SCOPE: &str = "org:create_api_key user:profile user:inference";
const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Budget applied when a `-reasoning` model alias asks for thinking without
/// naming one; Anthropic has no dynamic sentinel.
const DEFAULT_THINKING_BUDGET: i64 = 8192;

pub(crate) struct ClaudeExecutor;

impl ClaudeExecutor {
    pub fn new() -> Self {
        Self
    }

    fn auth_headers(auth: &Auth, stream: bool) -> Headers {
        let mut headers = Headers::new();
        if !auth.metadata.access_token.is_empty() {
            header_set(
                &mut headers,
                "Authorization",
                format!("Bearer {}", auth.metadata.access_token),
            );
            header_set(&mut headers, "anthropic-beta", OAUTH_BETA);
        } else if !auth.metadata.api_key.is_empty() {
            header_set(&mut headers, "x-api-key", auth.metadata.api_key.clone());
        }
        header_set(&mut headers, "anthropic-version", ANTHROPIC_VERSION);
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(
            &mut headers,
            "Accept",
            if stream { "text/event-stream" } else { "application/json" },
        );
        fingerprint::apply_cli_headers(&mut headers, &auth.id);
        headers
    }
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn name(&self) -> &'static str {
        provider::CLAUDE
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(4 * 3600)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        let (base, _) = alias::split_reasoning_suffix(canonical);
        alias::resolve(base)
            .into_iter()
            .find(|route| route.provider == provider::CLAUDE)
            .map(|route| route.upstream_id.to_string())
            .unwrap_or_else(|| base.to_string())
    }

    fn build_chat(
        &self,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        let (_, reasoning) = alias::split_reasoning_suffix(&request.model);
        let model_id = self.resolve_model(&request.model);

        let mut ir = request.clone();
        ir.model = model_id.clone();
        if reasoning && ir.thinking.is_none() {
            ir.thinking = Some(Thinking {
                budget: Some(DEFAULT_THINKING_BUDGET),
                include_thoughts: true,
                level: None,
            });
        }

        let mut body = serde_json::to_value(claude::request_from_ir(&ir))
            .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?;
        sanitize::sanitize(provider::CLAUDE, &model_id, &mut body);

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{API_BASE}/v1/messages"),
            headers: Self::auth_headers(auth, ir.stream),
            body: Some(
                serde_json::to_vec(&body)
                    .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?
                    .into(),
            ),
            is_stream: ir.stream,
        })
    }

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError> {
        let parsed: wire::MessagesResponse = serde_json::from_slice(body).map_err(|err| {
            GatewayError::new(ErrorCategory::Unknown, format!("bad messages response: {err}"))
        })?;
        Ok(claude::response_to_ir(parsed))
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ClaudeSseDecoder {
            inner: claude::StreamDecoder::new(),
        })
    }

    fn classify(&self, failure: &UpstreamFailure) -> GatewayError {
        if let UpstreamFailure::Http { status, body, .. } = failure
            && let Ok(envelope) = serde_json::from_slice::<wire::ErrorResponse>(body)
        {
            let mut err = error_from_body(&envelope.error);
            err.status = Some(*status);
            return err;
        }
        classify_failure(failure)
    }

    async fn refresh(&self, auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        if auth.metadata.refresh_token.is_empty() {
            return Err(RefreshError::Revoked(
                "no refresh token on record".to_string(),
            ));
        }
        let payload = serde_json::json!({
            "grant_type": "refresh_token",
            "client_id": CLIENT_ID,
            "refresh_token": auth.metadata.refresh_token,
        });
        let response = post_refresh(
            &format!("{CONSOLE_BASE}/v1/oauth/token"),
            RefreshBody::Json(&payload),
            &[("accept", "application/json, text/plain, */*")],
        )
        .await?;
        Ok(response.into_update(&auth.metadata.refresh_token))
    }
}

fn error_from_body(error: &wire::ErrorBody) -> GatewayError {
    match error.kind.as_str() {
        "rate_limit_error" => GatewayError::quota(error.message.clone(), None),
        "overloaded_error" | "api_error" => {
            GatewayError::new(ErrorCategory::Transient, error.message.clone())
        }
        "authentication_error" | "permission_error" => {
            let category = if lmux_provider_core::is_revoke_message(&error.message) {
                ErrorCategory::AuthRevoked
            } else {
                ErrorCategory::AuthError
            };
            GatewayError::new(category, error.message.clone())
        }
        "not_found_error" => GatewayError::not_found(error.message.clone()),
        "invalid_request_error" => GatewayError::user(error.message.clone()),
        _ => GatewayError::new(ErrorCategory::Unknown, error.message.clone()),
    }
}

struct ClaudeSseDecoder {
    inner: claude::StreamDecoder,
}

impl StreamDecoder for ClaudeSseDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamDelta>, GatewayError> {
        let event: wire::StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            // Unknown event shapes are forward-compatible noise.
            Err(_) => return Ok(Vec::new()),
        };
        if let wire::StreamEvent::Error { error } = &event {
            return Err(error_from_body(error));
        }
        Ok(self.inner.decode(event))
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError> {
        Ok(Vec::new())
    }
}

/// PKCE pieces for `lmux login claude`. The handshake itself is interactive;
/// these helpers build the URL and exchange the pasted code.
pub struct LoginChallenge {
    pub url: String,
    pub verifier: String,
}

pub fn login_challenge(state: &str) -> LoginChallenge {
    // The verifier doubles as entropy source; derive it from the state so
    // callers control randomness.
    let verifier = URL_SAFE_NO_PAD.encode(Sha256::digest(format!("verifier:{state}")));
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    let url = format!(
        "{AUTHORIZE_BASE}?code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(REDIRECT_URI),
        urlencoding::encode(OAUTH_SCOPE),
        urlencoding::encode(&challenge),
        urlencoding::encode(state),
    );
    LoginChallenge { url, verifier }
}

pub async fn exchange_login_code(
    code: &str,
    state: &str,
    verifier: &str,
) -> Result<RefreshUpdate, RefreshError> {
    // Pasted callback values often carry fragments or extra params.
    let code = code.split(['#', '&']).next().unwrap_or(code);
    let payload = serde_json::json!({
        "grant_type": "authorization_code",
        "client_id": CLIENT_ID,
        "code": code,
        "redirect_uri": REDIRECT_URI,
        "code_verifier": verifier,
        "state": state,
    });
    let response = post_refresh(
        &format!("{CONSOLE_BASE}/v1/oauth/token"),
        RefreshBody::Json(&payload),
        &[("accept", "application/json, text/plain, */*")],
    )
    .await?;
    Ok(response.into_update(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_model_resolves_to_dated_id() {
        let executor = ClaudeExecutor::new();
        assert_eq!(
            executor.resolve_model("claude-sonnet-4-5"),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(
            executor.resolve_model("claude-sonnet-4-5-reasoning"),
            "claude-sonnet-4-5-20250929"
        );
        assert_eq!(executor.resolve_model("claude-3-opus"), "claude-3-opus");
    }

    #[test]
    fn oauth_token_gets_bearer_and_beta() {
        let executor = ClaudeExecutor::new();
        let mut auth = Auth::new("claude", "c1");
        auth.metadata.access_token = "at".into();
        let request = executor
            .build_chat(
                &auth,
                &ChatRequest {
                    model: "claude-sonnet-4-5".into(),
                    messages: vec![lmux_transform::Message::text(
                        lmux_transform::ir::Role::User,
                        "hi",
                    )],
                    max_tokens: Some(32),
                    ..Default::default()
                },
            )
            .unwrap();
        let headers = &request.headers;
        assert!(
            lmux_provider_core::header_get(headers, "authorization")
                .unwrap()
                .starts_with("Bearer ")
        );
        assert_eq!(
            lmux_provider_core::header_get(headers, "anthropic-beta"),
            Some(OAUTH_BETA)
        );
        assert!(lmux_provider_core::header_get(headers, "user-agent").is_some());
        assert!(request.url.ends_with("/v1/messages"));
    }

    #[test]
    fn stream_error_event_becomes_gateway_error() {
        let executor = ClaudeExecutor::new();
        let mut decoder = executor.stream_decoder();
        let err = decoder
            .decode(r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#)
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::QuotaError);
    }
}
