//! Shared builder/decoder for upstreams that speak the chat-completions
//! wire: Copilot, Codex, Qwen, iFlow. Each executor supplies its base URL
//! and header set; body shaping and stream decoding are identical.

use lmux_common::{ErrorCategory, GatewayError};
use lmux_protocol::frame::DONE_SENTINEL;
use lmux_protocol::openai as wire;
use lmux_provider_core::{
    Headers, HttpMethod, StreamDecoder, UpstreamHttpRequest,
};
use lmux_transform::{ChatRequest, ChatResponse, StreamDelta, alias, openai, sanitize};

pub(crate) fn resolve_for(provider_name: &str, canonical: &str) -> String {
    let (base, _) = alias::split_reasoning_suffix(canonical);
    alias::resolve(base)
        .into_iter()
        .find(|route| route.provider == provider_name)
        .map(|route| route.upstream_id.to_string())
        .unwrap_or_else(|| base.to_string())
}

pub(crate) fn build_chat(
    provider_name: &str,
    url: &str,
    headers: Headers,
    request: &ChatRequest,
    model_id: &str,
) -> Result<UpstreamHttpRequest, GatewayError> {
    let (_, reasoning) = alias::split_reasoning_suffix(&request.model);
    let mut ir = request.clone();
    ir.model = model_id.to_string();
    if reasoning && ir.thinking.is_none() {
        ir.thinking = Some(lmux_transform::Thinking {
            budget: Some(-1),
            include_thoughts: true,
            level: Some("high".to_string()),
        });
    }

    let mut body = serde_json::to_value(openai::request_from_ir(&ir))
        .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?;
    if ir.stream {
        // Ask for usage on the final chunk; several compat upstreams omit it
        // otherwise.
        body["stream_options"] = serde_json::json!({"include_usage": true});
    }
    sanitize::sanitize(provider_name, model_id, &mut body);

    Ok(UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: url.to_string(),
        headers,
        body: Some(
            serde_json::to_vec(&body)
                .map_err(|err| GatewayError::new(ErrorCategory::Unknown, err.to_string()))?
                .into(),
        ),
        is_stream: ir.stream,
    })
}

pub(crate) fn parse_response(body: &[u8]) -> Result<ChatResponse, GatewayError> {
    if let Ok(envelope) = serde_json::from_slice::<wire::ErrorResponse>(body) {
        return Err(GatewayError::new(
            ErrorCategory::Unknown,
            envelope.error.message,
        ));
    }
    let parsed: wire::ChatCompletionResponse = serde_json::from_slice(body).map_err(|err| {
        GatewayError::new(ErrorCategory::Unknown, format!("bad chat response: {err}"))
    })?;
    Ok(openai::response_to_ir(parsed))
}

pub(crate) struct CompatStreamDecoder {
    inner: openai::ChunkDecoder,
    done: bool,
}

impl CompatStreamDecoder {
    pub fn new() -> Self {
        Self {
            inner: openai::ChunkDecoder::new(),
            done: false,
        }
    }
}

impl StreamDecoder for CompatStreamDecoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamDelta>, GatewayError> {
        if data.trim() == DONE_SENTINEL {
            self.done = true;
            return Ok(self.inner.finish());
        }
        if let Ok(envelope) = serde_json::from_str::<wire::ErrorResponse>(data) {
            return Err(GatewayError::new(
                ErrorCategory::Transient,
                envelope.error.message,
            ));
        }
        match serde_json::from_str::<wire::ChatCompletionChunk>(data) {
            Ok(chunk) => Ok(self.inner.decode(chunk)),
            Err(_) => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<StreamDelta>, GatewayError> {
        if self.done {
            return Ok(Vec::new());
        }
        Ok(self.inner.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_options_injected_for_streams() {
        let request = ChatRequest {
            model: "qwen3-coder".into(),
            stream: true,
            ..Default::default()
        };
        let built = build_chat("qwen", "https://example/v1/chat/completions", Headers::new(), &request, "qwen3-coder-plus").unwrap();
        let body: serde_json::Value = serde_json::from_slice(built.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["model"], "qwen3-coder-plus");
    }

    #[test]
    fn done_sentinel_flushes_finish() {
        let mut decoder = CompatStreamDecoder::new();
        decoder
            .decode(r#"{"id":"1","object":"chat.completion.chunk","created":1,"model":"m","choices":[{"index":0,"delta":{"content":"x"},"finish_reason":null}]}"#)
            .unwrap();
        let tail = decoder.decode("[DONE]").unwrap();
        assert!(tail.iter().any(|d| matches!(d, StreamDelta::Finish { .. })));
        assert!(decoder.finish().unwrap().is_empty());
    }
}
