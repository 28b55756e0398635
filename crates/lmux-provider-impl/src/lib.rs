//! Concrete provider executors. Each module knows one upstream's wire
//! format, auth headers, and OAuth refresh flow; all of them build
//! [`lmux_provider_core::UpstreamHttpRequest`]s and leave transport to the
//! core's upstream client. The only IO here is token refresh.

mod antigravity;
mod claude;
mod codex;
mod copilot;
mod fingerprint;
mod gemini;
mod http_client;
mod iflow;
mod oauth;
mod openai_compat;
mod qwen;

use std::collections::HashMap;
use std::sync::Arc;

use lmux_common::provider;
use lmux_provider_core::ProviderExecutor;

pub use fingerprint::{FingerprintPreset, preset_for};

/// Interactive login pieces the CLI drives.
pub mod claude_login {
    pub use crate::claude::{LoginChallenge, exchange_login_code, login_challenge};
}

/// Every executor this build ships, keyed by provider name.
pub fn executors() -> HashMap<String, Arc<dyn ProviderExecutor>> {
    let mut map: HashMap<String, Arc<dyn ProviderExecutor>> = HashMap::new();
    map.insert(
        provider::CLAUDE.to_string(),
        Arc::new(claude::ClaudeExecutor::new()),
    );
    map.insert(
        provider::GEMINI.to_string(),
        Arc::new(gemini::GeminiCliExecutor::new()),
    );
    map.insert(
        provider::ANTIGRAVITY.to_string(),
        Arc::new(antigravity::AntigravityExecutor::new()),
    );
    map.insert(
        provider::COPILOT.to_string(),
        Arc::new(copilot::CopilotExecutor::new()),
    );
    map.insert(
        provider::CODEX.to_string(),
        Arc::new(codex::CodexExecutor::new()),
    );
    map.insert(
        provider::QWEN.to_string(),
        Arc::new(qwen::QwenExecutor::new()),
    );
    map.insert(
        provider::IFLOW.to_string(),
        Arc::new(iflow::IFlowExecutor::new()),
    );
    map
}
