use std::time::Duration;

use async_trait::async_trait;

use lmux_common::{GatewayError, provider};
use lmux_provider_core::{
    Auth, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder, UpstreamFailure,
    UpstreamHttpRequest,
};
use lmux_transform::{ChatRequest, ChatResponse, alias, gemini};

use crate::gemini::{
    GoogleSseDecoder, build_code_assist_chat, classify_google_failure, google_refresh,
    parse_code_assist_response,
};

const ANTIGRAVITY_UA: &str = "Antigravity/1.13.3 (linux; x64)";

/// Same code-assist wire as the Gemini CLI, different product surface. Load
/// balancing is score-driven with sticky disabled (the strategy handles
/// that); this executor only differs in identity and lead.
pub(crate) struct AntigravityExecutor;

impl AntigravityExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for AntigravityExecutor {
    fn name(&self) -> &'static str {
        provider::ANTIGRAVITY
    }

    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(20 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        let (base, _) = alias::split_reasoning_suffix(canonical);
        alias::resolve(base)
            .into_iter()
            .find(|route| route.provider == provider::ANTIGRAVITY)
            .map(|route| route.upstream_id.to_string())
            .unwrap_or_else(|| base.to_string())
    }

    fn build_chat(
        &self,
        auth: &Auth,
        request: &ChatRequest,
    ) -> Result<UpstreamHttpRequest, GatewayError> {
        let model_id = self.resolve_model(&request.model);
        build_code_assist_chat(provider::ANTIGRAVITY, ANTIGRAVITY_UA, auth, request, &model_id)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_3_routes_to_preview_id() {
        let executor = AntigravityExecutor::new();
        assert_eq!(executor.resolve_model("gemini-3-pro"), "gemini-3-pro-preview");
    }
}
