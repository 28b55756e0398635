use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use lmux_common::{ErrorCategory, GatewayError, provider};
use lmux_protocol::gemini as wire;
use lmux_provider_core::{
    Auth, Headers, HttpMethod, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    UpstreamFailure, UpstreamHttpRequest, classify_failure, header_set, parse_retry_after,
};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta, Thinking, alias, gemini, sanitize};

use crate::oauth::{RefreshBody, post_refresh};

pub(crate) const CODE_ASSIST_BASE: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GEMINI_CLI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GEMINI_CLI_CLIENT_SECRET: &str = "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";
const GEMINI_CLI_UA: &str = "GeminiCLI/0.9.4 (linux; x64)";

/// The code-assist endpoint wraps the public generateContent schema in a
/// `{model, project, request}` envelope and answers with `{response}`.
#[derive(Debug, serde::Serialize)]
struct CodeAssistRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    request: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CodeAssistEnvelope {
    #[serde(default)]
    response: Option<wire::GenerateContentResponse>,
}

pub(crate) struct GeminiCliExecutor;

impl GeminiCliExecutor {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn build_code_assist_chat(
    provider_name: &'static str,
    user_agent: &'static str,
    auth: &Auth,
    request: &ChatRequest,
    model_id: &str,
) -> Result<UpstreamHttpRequest, GatewayError> {
    let (_, reasoning) = alias::split_reasoning_suffix(&request.model);
    let mut ir = request.clone();
    ir.model = model_id.to_string();
    if reasoning && ir.thinking.is_none() {
        ir.thinking = Some(Thinking {
            budget: Some(-1),
            include_thoughts: true,
            level: None,
        });
    }

    let mut inner = serde_json::to_value(gemini::request_from_ir(&ir))
        .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?;
    sanitize::sanitize(provider_name, model_id, &mut inner);

    let envelope = CodeAssistRequest {
        model: model_id,
        project: auth.metadata.project_id.as_deref(),
        request: inner,
    };

    let action = if ir.stream {
        ":streamGenerateContent?alt=sse"
    } else {
        ":generateContent"
    };

    let mut headers = Headers::new();
    header_set(
        &mut headers,
        "Authorization",
        format!("Bearer {}", auth.metadata.access_token),
    );
    header_set(&mut headers, "Content-Type", "application/json");
    header_set(&mut headers, "User-Agent", user_agent);

    Ok(UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: format!("{CODE_ASSIST_BASE}{action}"),
        headers,
        body: Some(
            serde_json::to_vec(&envelope)
                .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?
                .into(),
        ),
        is_stream: ir.stream,
    })
}

pub(crate) fn parse_code_assist_response(body: &[u8]) -> Result<ChatResponse, GatewayError> {
    if let Ok(envelope) = serde_json::from_slice::<CodeAssistEnvelope>(body)
        && let Some(response) = envelope.response
    {
        return Ok(gemini::response_to_ir(response));
    }
    let direct: wire::GenerateContentResponse = serde_json::from_slice(body).map_err(|err| {
        GatewayError::new(ErrorCategory::Unknown, format!("bad generate response: {err}"))
    })?;
    Ok(gemini::response_to_ir(direct))
}

pub(crate) fn classify_google_failure(failure: &UpstreamFailure) -> GatewayError {
    if let UpstreamFailure::Http {
        status,
        headers,
        body,
    } = failure
        && let Ok(envelope) = serde_json::from_slice::<wire::ErrorResponse>(body)
    {
        let message = envelope.error.message;
        let category = match envelope.error.status.as_deref() {
            Some("RESOURCE_EXHAUSTED") => ErrorCategory::QuotaError,
            Some("UNAUTHENTICATED") => {
                if lmux_provider_core::is_revoke_message(&message) {
                    ErrorCategory::AuthRevoked
                } else {
                    ErrorCategory::AuthError
                }
            }
            Some("PERMISSION_DENIED") => ErrorCategory::AuthError,
            Some("NOT_FOUND") => ErrorCategory::NotFound,
            Some("INVALID_ARGUMENT") => ErrorCategory::UserError,
            Some("UNAVAILABLE") | Some("INTERNAL") => ErrorCategory::Transient,
            _ => return classify_failure(failure),
        };
        let mut err = GatewayError::new(category, message).with_status(*status);
        if category == ErrorCategory::QuotaError {
            err.retry_after = parse_retry_after(headers);
        }
        return err;
    }
    classify_failure(failure)
}

pub(crate) async fn google_refresh(auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
    if auth.metadata.refresh_token.is_empty() {
        return Err(RefreshError::Revoked("no refresh token on record".to_string()));
    }
    let response = post_refresh(
        GOOGLE_TOKEN_URL,
        RefreshBody::Form(&[
            ("grant_type", "refresh_token"),
            ("client_id", GEMINI_CLI_CLIENT_ID),
            ("client_secret", GEMINI_CLI_CLIENT_SECRET),
            ("refresh_token", &auth.metadata.refresh_token),
        ]),
        &[],
    )
    .await?;
    Ok(response.into_update(&auth.metadata.refresh_token))
}

#[async_trait]
impl ProviderExecutor for GeminiCliExecutor {
    fn name(&self) -> &'static str {
        provider::GEMINI
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        let (base, _) = alias::split_reasoning_suffix(canonical);
        alias::resolve(base)
            .into_iter()
            .find(|route| route.provider == provider::GEMINI)
            .map(|route| route.upstream_id.to_string())
            .unwrap_or_else(|| base.to_string())
    }

    fn build_chat(
        &self,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        let model_id = self.resolve_model(&request.model);
        build_code_assist_chat(provider::GEMINI, GEMINI_CLI_UA, auth, request, &model_id)
    }

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError> {
        parse_code_assist_response(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleSseDecoder {
            inner: gemini::StreamDecoder::new(),
        })
    }

    fn classify(&self, failure: &UpstreamFailure) -> GatewayError {
        classify_google_failure(failure)
    }

    async fn refresh(&self, auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        google_refresh(auth).await
    }
}

pub(crate) struct GoogleSseDecoder {
    pub(crate) inner: gemini::StreamDecoder,
}

impl StreamDecoder for GoogleSseDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamDelta>, GatewayError> {
        if let Ok(envelope) = serde_json::from_str::<wire::ErrorResponse>(data) {
            let category = match envelope.error.status.as_deref() {
                Some("RESOURCE_EXHAUSTED") => ErrorCategory::QuotaError,
                _ => ErrorCategory::Transient,
            };
            return Err(GatewayError::new(category, envelope.error.message));
        }
        let chunk = match serde_json::from_str::<CodeAssistEnvelope>(data) {
            Ok(CodeAssistEnvelope {
                response: Some(chunk),
            }) => chunk,
            _ => match serde_json::from_str::<wire::GenerateContentResponse>(data) {
                Ok(chunk) => chunk,
                Err(_) => return Ok(Vec::new()),
            },
        };
        Ok(self.inner.decode(chunk))
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError> {
        Ok(self.inner.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_project_envelope() {
        let executor = GeminiCliExecutor::new();
        let mut auth = Auth::new("gemini", "g1");
        auth.metadata.access_token = "at".into();
        auth.metadata.project_id = Some("companion-123".into());

        let request = executor
            .build_chat(
                &auth,
                &ChatRequest {
                    model: "gemini-2.5-pro".into(),
                    messages: vec![lmux_transform::Message::text(
                        lmux_transform::ir::Role::User,
                        "hi",
                    )],
                    stream: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(request.url.ends_with(":streamGenerateContent?alt=sse"));
        let body: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["project"], "companion-123");
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert!(body["request"]["contents"].is_array());
    }

    #[test]
    fn resource_exhausted_is_quota() {
        let failure = UpstreamFailure::Http {
            status: 429,
            headers: vec![("retry-after".into(), "30".into())],
            body: bytes::Bytes::from_static(
                br#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#,
            ),
        };
        let err = classify_google_failure(&failure);
        assert_eq!(err.category, ErrorCategory::QuotaError);
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn stream_decoder_unwraps_envelope() {
        let mut decoder = GoogleSseDecoder {
            inner: gemini::StreamDecoder::new(),
        };
        let deltas = decoder
            .decode(r#"{"response":{"candidates":[{"content":{"role":"model","parts":[{"text":"hi"}]}}]}}"#)
            .unwrap();
        assert!(deltas.iter().any(|d| matches!(d, StreamDelta::Text { .. })));
    }
}
