use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use lmux_common::{GatewayError, provider};
use lmux_provider_core::{
    Auth, Headers, ProviderExecutor, RefreshError, RefreshUpdate, StreamDecoder,
    UpstreamHttpRequest, header_set,
};
use lmux_transform::{ChatRequest, ChatResponse};

use crate::http_client::oauth_client;
use crate::openai_compat;

const CHAT_URL: &str = "https://api.individual.githubcopilot.com/chat/completions";
const TOKEN_EXCHANGE_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const EDITOR_VERSION: &str = "vscode/1.104.0";
const EDITOR_PLUGIN: &str = "copilot-chat/0.31.3";

/// Copilot "refresh" is a token exchange: the long-lived GitHub OAuth token
/// (kept in `refresh_token`) buys a short-lived chat bearer.
#[derive(Debug, Deserialize)]
struct CopilotToken {
    token: String,
    #[serde(default)]
    expires_at: i64,
}

pub(crate) struct CopilotExecutor;

impl CopilotExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderExecutor for CopilotExecutor {
    fn name(&self) -> &'static str {
        provider::COPILOT
    }

    // Exchanged tokens live about thirty minutes.
    fn refresh_lead(&self) -> Duration {
        Duration::from_secs(10 * 60)
    }

    fn resolve_model(&self, canonical: &str) -> String {
        openai_compat::resolve_for(provider::COPILOT, canonical)
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
        header_set(&mut headers, "Editor-Version", EDITOR_VERSION);
        header_set(&mut headers, "Editor-Plugin-Version", EDITOR_PLUGIN);
        header_set(&mut headers, "Copilot-Integration-Id", "vscode-chat");
        header_set(&mut headers, "Openai-Intent", "conversation-panel");
        openai_compat::build_chat(provider::COPILOT, CHAT_URL, headers, request, &model_id)
    }

    fn parse_response(&self, body: &[u8]) -> Result<ChatResponse, GatewayError> {
        openai_compat::parse_response(body)
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(openai_compat::CompatStreamDecoder::new())
    }

    async fn refresh(&self, auth: &Auth) -> Result<RefreshUpdate, RefreshError> {
        let github_token = auth.metadata.refresh_token.trim();
        if github_token.is_empty() {
            return Err(RefreshError::Revoked(
                "no github oauth token on record".to_string(),
            ));
        }
        let client = oauth_client(None)?;
        let response = client
            .get(TOKEN_EXCHANGE_URL)
            .header("Authorization", format!("token {github_token}"))
            .header("Editor-Version", EDITOR_VERSION)
            .header("Editor-Plugin-Version", EDITOR_PLUGIN)
            .header("User-Agent", "GithubCopilot/1.155.0")
            .send()
            .await
            .map_err(|err| RefreshError::Transient(err.to_string()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RefreshError::Transient(err.to_string()))?;
        if status == 401 || status == 403 {
            return Err(RefreshError::Revoked(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        if !(200..300).contains(&status) {
            return Err(RefreshError::Transient(format!(
                "token exchange returned {status}"
            )));
        }
        let token: CopilotToken = serde_json::from_slice(&bytes)
            .map_err(|err| RefreshError::Transient(format!("bad exchange response: {err}")))?;
        Ok(RefreshUpdate {
            access_token: token.token,
            refresh_token: None,
            expires_at: token.expires_at,
        })
    }
}
