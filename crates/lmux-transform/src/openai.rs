//! OpenAI chat-completions ↔ IR. Used both for inbound clients and for
//! OpenAI-compatible upstreams (Copilot, Qwen, iFlow).

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use lmux_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChunkChoice,
    ChunkDelta, ChunkFunctionCall, ChunkToolCall, Choice, CompletionChoice, CompletionRequest,
    CompletionResponse, CompletionTokensDetails, ContentPart, FunctionCall, FunctionDef,
    MessageContent, PromptTokensDetails, ResponseMessage, StopSequences, Tool, ToolCall, Usage,
};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Thinking,
    TokenUsage, ToolSpec,
};

pub fn request_to_ir(req: ChatCompletionRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(req.messages.len());
    for message in req.messages {
        messages.push(message_to_ir(message));
    }

    let thinking = req.reasoning_effort.as_ref().map(|effort| Thinking {
        budget: None,
        include_thoughts: false,
        level: Some(effort.clone()),
    });

    let mut metadata = std::collections::BTreeMap::new();
    for (key, value) in req.extra {
        metadata.insert(key, value);
    }

    ChatRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        stop: req.stop.map(StopSequences::into_vec).unwrap_or_default(),
        thinking,
        tools: req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.function.name,
                description: tool.function.description,
                schema: tool.function.parameters,
            })
            .collect(),
        tool_choice: req.tool_choice,
        stream: req.stream.unwrap_or(false),
        metadata,
    }
}

fn message_to_ir(message: ChatMessage) -> Message {
    let role = match message.role.as_str() {
        "system" | "developer" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    };

    let mut blocks = Vec::new();
    if role == Role::Tool {
        let content = match message.content {
            Some(MessageContent::Text(text)) => Value::String(text),
            Some(MessageContent::Parts(parts)) => Value::String(parts_text(&parts)),
            None => Value::Null,
        };
        blocks.push(ContentBlock::ToolResult {
            tool_use_id: message.tool_call_id.unwrap_or_default(),
            content,
            is_error: false,
        });
        return Message { role, blocks };
    }

    match message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text });
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => blocks.push(ContentBlock::Text { text }),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(block) = data_url_to_block(&image_url.url) {
                            blocks.push(block);
                        } else {
                            debug!(url = %image_url.url, "dropping non-data image url");
                        }
                    }
                }
            }
        }
        None => {}
    }

    for call in message.tool_calls.unwrap_or_default() {
        let input =
            serde_json::from_str(&call.function.arguments).unwrap_or(Value::Object(Default::default()));
        blocks.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    Message { role, blocks }
}

fn parts_text(parts: &[ContentPart]) -> String {
    let mut out = String::new();
    for part in parts {
        if let ContentPart::Text { text } = part {
            out.push_str(text);
        }
    }
    out
}

fn data_url_to_block(url: &str) -> Option<ContentBlock> {
    let rest = url.strip_prefix("data:")?;
    let (media_type, data) = rest.split_once(";base64,")?;
    Some(ContentBlock::Image {
        media_type: media_type.to_string(),
        data: data.to_string(),
    })
}

/// IR → chat-completions body, for OpenAI-compatible upstreams.
pub fn request_from_ir(req: &ChatRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    for message in &req.messages {
        messages.extend(message_from_ir(message));
    }

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        stop: if req.stop.is_empty() {
            None
        } else {
            Some(StopSequences::Many(req.stop.clone()))
        },
        stream: req.stream.then_some(true),
        stream_options: None,
        tools: if req.tools.is_empty() {
            None
        } else {
            Some(
                req.tools
                    .iter()
                    .map(|tool| Tool {
                        kind: "function".to_string(),
                        function: FunctionDef {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.schema.clone(),
                        },
                    })
                    .collect(),
            )
        },
        tool_choice: req.tool_choice.clone(),
        reasoning_effort: req.thinking.as_ref().and_then(|t| t.level.clone()),
        extra: Default::default(),
    }
}

fn message_from_ir(message: &Message) -> Vec<ChatMessage> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in &message.blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(MessageContent::Text(value_text(content))),
                name: None,
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
            ContentBlock::Image { media_type, data } => out.push(ChatMessage {
                role: message.role.as_str().to_string(),
                content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                    image_url: lmux_protocol::openai::ImageUrl {
                        url: format!("data:{media_type};base64,{data}"),
                        detail: None,
                    },
                }])),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }),
            // Reasoning traces are never echoed back upstream.
            ContentBlock::Thinking { .. } => {}
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() {
        out.push(ChatMessage {
            role: message.role.as_str().to_string(),
            content: (!text.is_empty()).then_some(MessageContent::Text(text)),
            name: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn response_to_ir(resp: ChatCompletionResponse) -> ChatResponse {
    let mut blocks = Vec::new();
    let mut stop_reason = None;
    if let Some(choice) = resp.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning_content {
            if !reasoning.is_empty() {
                blocks.push(ContentBlock::Thinking {
                    text: reasoning,
                    signature: None,
                });
            }
        }
        if let Some(content) = choice.message.content {
            if !content.is_empty() {
                blocks.push(ContentBlock::Text { text: content });
            }
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or(Value::Object(Default::default()));
            blocks.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        stop_reason = choice.finish_reason.as_deref().map(finish_reason_to_ir);
    }

    ChatResponse {
        model: resp.model,
        blocks,
        stop_reason,
        usage: resp.usage.map(usage_to_ir).unwrap_or_default(),
        metadata: Default::default(),
    }
}

pub fn response_from_ir(resp: &ChatResponse, id: &str, created: i64) -> ChatCompletionResponse {
    let mut tool_calls = Vec::new();
    for block in &resp.blocks {
        if let ContentBlock::ToolUse { id, name, input } = block {
            tool_calls.push(ToolCall {
                id: id.clone(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            });
        }
    }
    let text = resp.text();

    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty()).then_some(text),
                reasoning_content: resp.thinking_text(),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            finish_reason: Some(finish_reason_from_ir(resp.stop_reason.as_ref())),
        }],
        usage: Some(usage_from_ir(resp.usage)),
    }
}

pub fn completion_request_to_ir(req: CompletionRequest) -> ChatRequest {
    let prompt = match req.prompt {
        Value::String(text) => text,
        Value::Array(parts) => parts
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };
    ChatRequest {
        model: req.model,
        messages: vec![Message::text(Role::User, prompt)],
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        stop: req.stop.map(StopSequences::into_vec).unwrap_or_default(),
        stream: req.stream.unwrap_or(false),
        ..Default::default()
    }
}

pub fn completion_response_from_ir(
    resp: &ChatResponse,
    id: &str,
    created: i64,
) -> CompletionResponse {
    CompletionResponse {
        id: id.to_string(),
        object: "text_completion".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![CompletionChoice {
            index: 0,
            text: resp.text(),
            finish_reason: Some(finish_reason_from_ir(resp.stop_reason.as_ref())),
        }],
        usage: Some(usage_from_ir(resp.usage)),
    }
}

pub fn finish_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::ContentFilter,
        other => StopReason::Other(other.to_string()),
    }
}

pub fn finish_reason_from_ir(reason: Option<&StopReason>) -> String {
    match reason {
        Some(StopReason::MaxTokens) => "length",
        Some(StopReason::ToolUse) => "tool_calls",
        Some(StopReason::ContentFilter) => "content_filter",
        Some(StopReason::Other(other)) => other.as_str(),
        Some(StopReason::EndTurn) | Some(StopReason::StopSequence) | None => "stop",
    }
    .to_string()
}

pub fn usage_to_ir(usage: Usage) -> TokenUsage {
    TokenUsage {
        input: usage.prompt_tokens,
        output: usage.completion_tokens,
        cached: usage
            .prompt_tokens_details
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0),
        reasoning: usage
            .completion_tokens_details
            .and_then(|d| d.reasoning_tokens)
            .unwrap_or(0),
    }
}

pub fn usage_from_ir(usage: TokenUsage) -> Usage {
    Usage {
        prompt_tokens: usage.input,
        completion_tokens: usage.output,
        total_tokens: usage.total(),
        prompt_tokens_details: (usage.cached > 0).then_some(PromptTokensDetails {
            cached_tokens: Some(usage.cached),
        }),
        completion_tokens_details: (usage.reasoning > 0).then_some(CompletionTokensDetails {
            reasoning_tokens: Some(usage.reasoning),
        }),
    }
}

// Fixed IR block indices for the chat-completions stream, which has no block
// structure of its own: thinking 0, text 1, tool calls from 2 up.
const THINKING_INDEX: u32 = 0;
const TEXT_INDEX: u32 = 1;
const TOOL_INDEX_BASE: u32 = 2;

/// Decodes upstream chat-completion chunks into IR deltas.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    started: bool,
    text_open: bool,
    thinking_open: bool,
    tools_seen: HashMap<u32, u32>,
    usage: Option<TokenUsage>,
    finish: Option<StopReason>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: ChatCompletionChunk) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(StreamDelta::Start {
                model: chunk.model.clone(),
            });
        }
        if let Some(usage) = chunk.usage {
            let usage = usage_to_ir(usage);
            self.usage = Some(match self.usage {
                Some(mut existing) => {
                    existing.merge(usage);
                    existing
                }
                None => usage,
            });
        }

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    if !self.thinking_open {
                        self.thinking_open = true;
                        out.push(StreamDelta::BlockStart {
                            index: THINKING_INDEX,
                            block: ContentBlock::Thinking {
                                text: String::new(),
                                signature: None,
                            },
                        });
                    }
                    out.push(StreamDelta::Thinking {
                        index: THINKING_INDEX,
                        text: reasoning,
                    });
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    if !self.text_open {
                        self.text_open = true;
                        out.push(StreamDelta::BlockStart {
                            index: TEXT_INDEX,
                            block: ContentBlock::Text {
                                text: String::new(),
                            },
                        });
                    }
                    out.push(StreamDelta::Text {
                        index: TEXT_INDEX,
                        text: content,
                    });
                }
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                let ir_index = TOOL_INDEX_BASE + call.index;
                if !self.tools_seen.contains_key(&call.index) {
                    self.tools_seen.insert(call.index, ir_index);
                    out.push(StreamDelta::BlockStart {
                        index: ir_index,
                        block: ContentBlock::ToolUse {
                            id: call.id.clone().unwrap_or_default(),
                            name: call
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                            input: Value::Object(Default::default()),
                        },
                    });
                }
                if let Some(arguments) = call.function.and_then(|f| f.arguments) {
                    if !arguments.is_empty() {
                        out.push(StreamDelta::ToolInput {
                            index: ir_index,
                            partial_json: arguments,
                        });
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(finish_reason_to_ir(&reason));
            }
        }
        out
    }

    /// Emit the terminal delta once the upstream stream ends.
    pub fn finish(&mut self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if self.thinking_open {
            out.push(StreamDelta::BlockStop {
                index: THINKING_INDEX,
            });
        }
        if self.text_open {
            out.push(StreamDelta::BlockStop { index: TEXT_INDEX });
        }
        for ir_index in self.tools_seen.values() {
            out.push(StreamDelta::BlockStop { index: *ir_index });
        }
        out.push(StreamDelta::Finish {
            stop_reason: self.finish.take(),
            usage: self.usage.take(),
        });
        out
    }
}

/// Encodes IR deltas as client-facing chat-completion chunks.
#[derive(Debug)]
pub struct ChunkEncoder {
    id: String,
    created: i64,
    model: String,
    tool_order: HashMap<u32, u32>,
}

impl ChunkEncoder {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
            model: String::new(),
            tool_order: HashMap::new(),
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn encode(&mut self, delta: &StreamDelta) -> Option<ChatCompletionChunk> {
        match delta {
            StreamDelta::Start { model } => {
                self.model = model.clone();
                Some(self.chunk(
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    },
                    None,
                ))
            }
            StreamDelta::BlockStart { index, block } => match block {
                ContentBlock::ToolUse { id, name, .. } => {
                    let wire_index = self.tool_order.len() as u32;
                    self.tool_order.insert(*index, wire_index);
                    Some(self.chunk(
                        ChunkDelta {
                            tool_calls: Some(vec![ChunkToolCall {
                                index: wire_index,
                                id: Some(id.clone()),
                                kind: Some("function".to_string()),
                                function: Some(ChunkFunctionCall {
                                    name: Some(name.clone()),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    ))
                }
                _ => None,
            },
            StreamDelta::Text { text, .. } => Some(self.chunk(
                ChunkDelta {
                    content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            )),
            StreamDelta::Thinking { text, .. } => Some(self.chunk(
                ChunkDelta {
                    reasoning_content: Some(text.clone()),
                    ..Default::default()
                },
                None,
            )),
            StreamDelta::ToolInput {
                index,
                partial_json,
            } => {
                let wire_index = *self.tool_order.get(index)?;
                Some(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ChunkToolCall {
                            index: wire_index,
                            id: None,
                            kind: None,
                            function: Some(ChunkFunctionCall {
                                name: None,
                                arguments: Some(partial_json.clone()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                ))
            }
            StreamDelta::BlockStop { .. } => None,
            StreamDelta::Finish { stop_reason, usage } => {
                let mut chunk = self.chunk(
                    ChunkDelta::default(),
                    Some(finish_reason_from_ir(stop_reason.as_ref())),
                );
                chunk.usage = usage.map(usage_from_ir);
                Some(chunk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"},
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"}
            ],
            "max_tokens": 256,
            "stream": true
        }))
        .unwrap()
    }

    #[test]
    fn request_round_trip_preserves_structure() {
        let ir = request_to_ir(sample_request());
        assert_eq!(ir.messages.len(), 4);
        assert_eq!(ir.system_text().as_deref(), Some("be brief"));
        assert!(ir.stream);

        let back = request_from_ir(&ir);
        let ir_again = request_to_ir(back);
        assert_eq!(ir, ir_again);
    }

    #[test]
    fn tool_call_arguments_parse_into_input() {
        let ir = request_to_ir(sample_request());
        let assistant = &ir.messages[2];
        match &assistant.blocks[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(input["q"], "x");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn chunk_decoder_emits_start_text_finish() {
        let mut decoder = ChunkDecoder::new();
        let chunk: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": null}]
        }))
        .unwrap();
        let deltas = decoder.decode(chunk);
        assert!(matches!(deltas[0], StreamDelta::Start { .. }));
        assert!(matches!(deltas[1], StreamDelta::BlockStart { .. }));
        assert!(
            matches!(&deltas[2], StreamDelta::Text { text, .. } if text == "hi")
        );

        let tail: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5, "total_tokens": 8}
        }))
        .unwrap();
        decoder.decode(tail);
        let end = decoder.finish();
        match end.last().unwrap() {
            StreamDelta::Finish { stop_reason, usage } => {
                assert_eq!(stop_reason, &Some(StopReason::EndTurn));
                assert_eq!(usage.unwrap().output, 5);
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }
}
