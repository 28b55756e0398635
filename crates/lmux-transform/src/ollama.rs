//! Ollama chat/generate ↔ IR. Inbound only; no upstream speaks this format.

use serde_json::Value;

use lmux_protocol::ollama::{
    ChatRequest as OllamaChatRequest, ChatResponse as OllamaChatResponse, GenerateRequest,
    GenerateResponse, Message as OllamaMessage, ToolCall, ToolCallFunction,
};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Thinking,
    ToolSpec,
};

pub fn chat_request_to_ir(req: OllamaChatRequest) -> ChatRequest {
    let mut messages = Vec::new();
    for message in req.messages {
        messages.push(message_to_ir(message));
    }

    let options = req.options.unwrap_or_default();
    let mut tools = Vec::new();
    for tool in req.tools.unwrap_or_default() {
        if let Some(function) = tool.get("function") {
            tools.push(ToolSpec {
                name: function
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                description: function
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                schema: function.get("parameters").cloned(),
            });
        }
    }

    ChatRequest {
        model: req.model,
        messages,
        temperature: options.temperature,
        top_p: options.top_p,
        max_tokens: options.num_predict,
        stop: options.stop.unwrap_or_default(),
        thinking: req.think.unwrap_or(false).then(|| Thinking {
            budget: Some(-1),
            include_thoughts: true,
            level: None,
        }),
        tools,
        tool_choice: None,
        // Ollama streams unless told otherwise.
        stream: req.stream.unwrap_or(true),
        metadata: Default::default(),
    }
}

fn message_to_ir(message: OllamaMessage) -> Message {
    let role = match message.role.as_str() {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    };
    let mut blocks = Vec::new();
    if role == Role::Tool {
        blocks.push(ContentBlock::ToolResult {
            tool_use_id: String::new(),
            content: Value::String(message.content),
            is_error: false,
        });
        return Message { role, blocks };
    }
    if !message.content.is_empty() {
        blocks.push(ContentBlock::Text {
            text: message.content,
        });
    }
    for image in message.images.unwrap_or_default() {
        blocks.push(ContentBlock::Image {
            media_type: "image/png".to_string(),
            data: image,
        });
    }
    for (i, call) in message.tool_calls.unwrap_or_default().into_iter().enumerate() {
        blocks.push(ContentBlock::ToolUse {
            id: format!("call_{i}"),
            name: call.function.name,
            input: call.function.arguments,
        });
    }
    Message { role, blocks }
}

pub fn generate_request_to_ir(req: GenerateRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system {
        messages.push(Message::text(Role::System, system));
    }
    messages.push(Message::text(Role::User, req.prompt));

    let options = req.options.unwrap_or_default();
    ChatRequest {
        model: req.model,
        messages,
        temperature: options.temperature,
        top_p: options.top_p,
        max_tokens: options.num_predict,
        stop: options.stop.unwrap_or_default(),
        thinking: req.think.unwrap_or(false).then(|| Thinking {
            budget: Some(-1),
            include_thoughts: true,
            level: None,
        }),
        stream: req.stream.unwrap_or(true),
        ..Default::default()
    }
}

pub fn chat_response_from_ir(resp: &ChatResponse, created_at: &str) -> OllamaChatResponse {
    let mut tool_calls = Vec::new();
    for block in &resp.blocks {
        if let ContentBlock::ToolUse { name, input, .. } = block {
            tool_calls.push(ToolCall {
                function: ToolCallFunction {
                    name: name.clone(),
                    arguments: input.clone(),
                },
            });
        }
    }
    OllamaChatResponse {
        model: resp.model.clone(),
        created_at: created_at.to_string(),
        message: OllamaMessage {
            role: "assistant".to_string(),
            content: resp.text(),
            thinking: resp.thinking_text(),
            images: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        },
        done: true,
        done_reason: Some(done_reason_from_ir(resp.stop_reason.as_ref())),
        prompt_eval_count: Some(resp.usage.input),
        eval_count: Some(resp.usage.output),
    }
}

pub fn generate_response_from_ir(resp: &ChatResponse, created_at: &str) -> GenerateResponse {
    GenerateResponse {
        model: resp.model.clone(),
        created_at: created_at.to_string(),
        response: resp.text(),
        done: true,
        done_reason: Some(done_reason_from_ir(resp.stop_reason.as_ref())),
        thinking: resp.thinking_text(),
        prompt_eval_count: Some(resp.usage.input),
        eval_count: Some(resp.usage.output),
    }
}

pub fn done_reason_from_ir(reason: Option<&StopReason>) -> String {
    match reason {
        Some(StopReason::MaxTokens) => "length",
        _ => "stop",
    }
    .to_string()
}

/// Encodes IR deltas as NDJSON chat chunks.
#[derive(Debug, Default)]
pub struct ChatStreamEncoder {
    model: String,
    created_at: String,
}

impl ChatStreamEncoder {
    pub fn new(created_at: impl Into<String>) -> Self {
        Self {
            model: String::new(),
            created_at: created_at.into(),
        }
    }

    fn chunk(&self, message: OllamaMessage, done: bool) -> OllamaChatResponse {
        OllamaChatResponse {
            model: self.model.clone(),
            created_at: self.created_at.clone(),
            message,
            done,
            done_reason: None,
            prompt_eval_count: None,
            eval_count: None,
        }
    }

    pub fn encode(&mut self, delta: &StreamDelta) -> Option<OllamaChatResponse> {
        match delta {
            StreamDelta::Start { model } => {
                self.model = model.clone();
                None
            }
            StreamDelta::Text { text, .. } => Some(self.chunk(
                OllamaMessage {
                    role: "assistant".to_string(),
                    content: text.clone(),
                    thinking: None,
                    images: None,
                    tool_calls: None,
                },
                false,
            )),
            StreamDelta::Thinking { text, .. } => Some(self.chunk(
                OllamaMessage {
                    role: "assistant".to_string(),
                    content: String::new(),
                    thinking: Some(text.clone()),
                    images: None,
                    tool_calls: None,
                },
                false,
            )),
            StreamDelta::Finish { stop_reason, usage } => {
                let mut chunk = self.chunk(
                    OllamaMessage {
                        role: "assistant".to_string(),
                        content: String::new(),
                        thinking: None,
                        images: None,
                        tool_calls: None,
                    },
                    true,
                );
                chunk.done_reason = Some(done_reason_from_ir(stop_reason.as_ref()));
                if let Some(usage) = usage {
                    chunk.prompt_eval_count = Some(usage.input);
                    chunk.eval_count = Some(usage.output);
                }
                Some(chunk)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults_to_streaming() {
        let req: OllamaChatRequest = serde_json::from_value(serde_json::json!({
            "model": "qwen3-coder",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let ir = chat_request_to_ir(req);
        assert!(ir.stream);
        assert_eq!(ir.messages.len(), 1);
    }

    #[test]
    fn generate_request_builds_system_plus_user() {
        let req = GenerateRequest {
            model: "m".into(),
            prompt: "p".into(),
            system: Some("s".into()),
            stream: Some(false),
            options: None,
            think: None,
        };
        let ir = generate_request_to_ir(req);
        assert_eq!(ir.messages[0].role, Role::System);
        assert_eq!(ir.messages[1].role, Role::User);
        assert!(!ir.stream);
    }
}
