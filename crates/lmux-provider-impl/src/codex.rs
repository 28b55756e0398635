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

const CHAT_URL: &str = "https://chatgpt.com/backend-api/codex/chat/completions";
const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const ORIGINATOR: &str = "codex_cli_rs";

pub(crate) struct CodexExecutor;

impl CodexExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn name(&self) -> &'static str {
        provider::CODEX
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(60 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        openai_compat::resolve_for(provider::CODEX, canonical)
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
        header_set(&mut headers, "originator", ORIGINATOR);
        if let Some(account_id) = auth.metadata.account_id.as_deref() {
            header_set(&mut headers, "chatgpt-account-id", account_id);
        }
        openai_compat::build_chat(provider::CODEX, CHAT_URL, headers, request, &model_id)
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
                ("scope", "openid profile email"),
            ]),
            &[],
        )
        .await?;
        Ok(response.into_update(&auth.metadata.refresh_token))
    }
}
