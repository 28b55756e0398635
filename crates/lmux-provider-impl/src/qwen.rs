use std::time::Duration;

use async_trait::async_trait;

use lmux_common::{GatewayError, provider};
use lmux_provider_core::{
    Auth, Headers, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    UpstreamHttpRequest, header_set,
};
use lmux_transform::{ChatRequest, ChatResponse};

use crate::oauth::{RefreshBody, post_refresh};
use crate::openai_compat;

const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
const CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
const DEFAULT_BASE: &str = "https://portal.qwen.ai/v1";

pub(crate) struct QwenExecutor;

impl QwenExecutor {
    pub fn new() -> Self {
        Self
    }

    /// The device flow hands back a per-account gateway base.
    fn chat_url(auth: &Auth) -> String {
        let base = auth
            .metadata
            .extra
            .get("resource_url")
            .and_then(|value| value.as_str())
            .map(|value| {
                if value.starts_with("http") {
                    value.trim_end_matches('/').to_string()
                } else {
                    format!("https://{}/v1", value.trim_end_matches('/'))
                }
            })
            .unwrap_or_else(|| DEFAULT_BASE.to_string());
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ProviderExecutor for QwenExecutor {
    fn name(&self) -> &'static str {
        provider::QWEN
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        openai_compat::resolve_for(provider::QWEN, canonical)
    }

    fn build_chat(
        &self,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        let model_id = self.resolve_model(&request.model);
        let mut headers = Headers::new();
        header_set(
            &mut headers,
            "Authorization",
            format!("Bearer {}", auth.metadata.access_token),
        );
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, "User-Agent", "QwenCode/0.10.0 (linux; x64)");
        openai_compat::build_chat(
            provider::QWEN,
            &Self::chat_url(auth),
            headers,
            request,
            &model_id,
        )
    }

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError> {
        openai_compat::parse_response(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(openai_compat::CompatStreamDecoder::new())
    }

    async fn refresh(&self, auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        if auth.metadata.refresh_token.is_empty() {
            return Err(RefreshError::Revoked(
                "no refresh token on record".to_string(),
            ));
        }
        let response = post_refresh(
            TOKEN_URL,
            RefreshBody::Form(&[
                ("grant_type", "refresh_token"),
                ("client_id", CLIENT_ID),
                ("refresh_token", &auth.metadata.refresh_token),
            ]),
            &[("accept", "application/json")],
        )
        .await?;
        Ok(response.into_update(&auth.metadata.refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_url_overrides_default_base() {
        let mut auth = Auth::new("qwen", "q1");
        assert_eq!(
            QwenExecutor::chat_url(&auth),
            "https://portal.qwen.ai/v1/chat/completions"
        );
        auth.metadata
            .extra
            .insert("resource_url".into(), "portal-eu.qwen.ai".into());
        assert_eq!(
            QwenExecutor::chat_url(&auth),
            "https://portal-eu.qwen.ai/v1/chat/completions"
        );
    }
}
