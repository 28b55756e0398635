use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use lmux_common::{GatewayError, provider};
use lmux_provider_core::{
    Auth, Headers, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    UpstreamHttpRequest, header_set,
};
use lmux_transform::{ChatRequest, ChatResponse};

use crate::oauth::{RefreshBody, post_refresh};
use crate::openai_compat;

const CHAT_URL: &str = "https://apis.iflow.cn/v1/chat/completions";
const TOKEN_URL: &str = "https://iflow.cn/oauth/token";
const CLIENT_ID: &str = "10009311001";
const CLIENT_SECRET: &str = "4Z3YjXycVsQvyGF6etEidlBB2F6TtoOh";

pub(crate) struct IFlowExecutor;

impl IFlowExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for IFlowExecutor {
    fn name(&self) -> &'static str {
        provider::IFLOW
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        openai_compat::resolve_for(provider::IFLOW, canonical)
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
        openai_compat::build_chat(provider::IFLOW, CHAT_URL, headers, request, &model_id)
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
        let basic = STANDARD.encode(format!("{CLIENT_ID}:{CLIENT_SECRET}"));
        let authorization = format!("Basic {basic}");
        let response = post_refresh(
            TOKEN_URL,
            RefreshBody::Form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &auth.metadata.refresh_token),
            ]),
            &[("Authorization", authorization.as_str())],
        )
        .await?;
        Ok(response.into_update(&auth.metadata.refresh_token))
    }
}
