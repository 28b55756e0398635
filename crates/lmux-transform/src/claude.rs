//! Anthropic messages ↔ IR.

use std::collections::HashMap;

use serde_json::Value;

use lmux_protocol::claude::{
    BlockDelta, ContentBlock as WireBlock, CountTokensRequest, ImageSource, MessageContent,
    MessageDeltaBody, MessageParam, MessagesRequest, MessagesResponse, StreamEvent, SystemPrompt,
    ThinkingConfig, ToolDef, Usage,
};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Thinking,
    TokenUsage, ToolSpec,
};

/// Anthropic requires `max_tokens`; applied when the IR carries none.
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub fn request_to_ir(req: MessagesRequest) -> ChatRequest {
    let mut messages = Vec::new();
    match req.system {
        Some(SystemPrompt::Text(text)) => messages.push(Message::text(Role::System, text)),
        Some(SystemPrompt::Blocks(blocks)) => {
            let blocks: Vec<ContentBlock> = blocks.into_iter().filter_map(block_to_ir).collect();
            if !blocks.is_empty() {
                messages.push(Message {
                    role: Role::System,
                    blocks,
                });
            }
        }
        None => {}
    }
    for message in req.messages {
        messages.push(message_to_ir(message));
    }

    let thinking = match req.thinking {
        Some(ThinkingConfig::Enabled { budget_tokens }) => Some(Thinking {
            budget: Some(budget_tokens as i64),
            include_thoughts: true,
            level: None,
        }),
        Some(ThinkingConfig::Disabled) | None => None,
    };

    ChatRequest {
        model: req.model,
        messages,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: Some(req.max_tokens),
        stop: req.stop_sequences.unwrap_or_default(),
        thinking,
        tools: req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| ToolSpec {
                name: tool.name,
                description: tool.description,
                schema: tool.input_schema,
            })
            .collect(),
        tool_choice: req.tool_choice,
        stream: req.stream.unwrap_or(false),
        metadata: Default::default(),
    }
}

pub fn count_tokens_request_to_ir(req: CountTokensRequest) -> ChatRequest {
    request_to_ir(MessagesRequest {
        model: req.model,
        max_tokens: DEFAULT_MAX_TOKENS,
        messages: req.messages,
        system: req.system,
        temperature: None,
        top_p: None,
        stop_sequences: None,
        stream: None,
        thinking: None,
        tools: req.tools,
        tool_choice: None,
        metadata: None,
    })
}

fn message_to_ir(message: MessageParam) -> Message {
    let role = match message.role.as_str() {
        "assistant" => Role::Assistant,
        _ => Role::User,
    };
    let blocks = match message.content {
        MessageContent::Text(text) => vec![ContentBlock::Text { text }],
        MessageContent::Blocks(blocks) => blocks.into_iter().filter_map(block_to_ir).collect(),
    };
    Message { role, blocks }
}

fn block_to_ir(block: WireBlock) -> Option<ContentBlock> {
    match block {
        WireBlock::Text { text } => Some(ContentBlock::Text { text }),
        WireBlock::Image { source } => match source {
            ImageSource::Base64 { media_type, data } => {
                Some(ContentBlock::Image { media_type, data })
            }
            ImageSource::Url { .. } => None,
        },
        WireBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse { id, name, input }),
        WireBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(ContentBlock::ToolResult {
            tool_use_id,
            content: content.unwrap_or(Value::Null),
            is_error: is_error.unwrap_or(false),
        }),
        WireBlock::Thinking { thinking, signature } => Some(ContentBlock::Thinking {
            text: thinking,
            signature,
        }),
        WireBlock::RedactedThinking { .. } => None,
    }
}

pub fn request_from_ir(req: &ChatRequest) -> MessagesRequest {
    let mut messages = Vec::new();
    for message in req.conversation() {
        let blocks: Vec<WireBlock> = message.blocks.iter().map(block_from_ir).collect();
        if blocks.is_empty() {
            continue;
        }
        messages.push(MessageParam {
            role: match message.role {
                Role::Assistant => "assistant".to_string(),
                // Anthropic carries tool results inside user turns.
                _ => "user".to_string(),
            },
            content: MessageContent::Blocks(blocks),
        });
    }

    MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: req.system_text().map(SystemPrompt::Text),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        stream: req.stream.then_some(true),
        thinking: req.thinking.as_ref().and_then(|thinking| {
            thinking.budget.map(|budget| ThinkingConfig::Enabled {
                budget_tokens: budget.max(0) as u32,
            })
        }),
        tools: (!req.tools.is_empty()).then(|| {
            req.tools
                .iter()
                .map(|tool| ToolDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.schema.clone(),
                })
                .collect()
        }),
        tool_choice: req.tool_choice.clone(),
        metadata: None,
    }
}

fn block_from_ir(block: &ContentBlock) -> WireBlock {
    match block {
        ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
        ContentBlock::Image { media_type, data } => WireBlock::Image {
            source: ImageSource::Base64 {
                media_type: media_type.clone(),
                data: data.clone(),
            },
        },
        ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => WireBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: (!content.is_null()).then(|| content.clone()),
            is_error: (*is_error).then_some(true),
        },
        ContentBlock::Thinking { text, signature } => WireBlock::Thinking {
            thinking: text.clone(),
            signature: signature.clone(),
        },
    }
}

pub fn response_to_ir(resp: MessagesResponse) -> ChatResponse {
    ChatResponse {
        model: resp.model,
        blocks: resp.content.into_iter().filter_map(block_to_ir).collect(),
        stop_reason: resp.stop_reason.as_deref().map(stop_reason_to_ir),
        usage: usage_to_ir(&resp.usage),
        metadata: Default::default(),
    }
}

pub fn response_from_ir(resp: &ChatResponse, id: &str) -> MessagesResponse {
    MessagesResponse {
        id: id.to_string(),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model.clone(),
        content: resp.blocks.iter().map(block_from_ir).collect(),
        stop_reason: Some(stop_reason_from_ir(resp.stop_reason.as_ref())),
        stop_sequence: None,
        usage: usage_from_ir(resp.usage),
    }
}

pub fn stop_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::ContentFilter,
        other => StopReason::Other(other.to_string()),
    }
}

pub fn stop_reason_from_ir(reason: Option<&StopReason>) -> String {
    match reason {
        Some(StopReason::MaxTokens) => "max_tokens",
        Some(StopReason::StopSequence) => "stop_sequence",
        Some(StopReason::ToolUse) => "tool_use",
        Some(StopReason::ContentFilter) => "refusal",
        Some(StopReason::Other(other)) => other.as_str(),
        Some(StopReason::EndTurn) | None => "end_turn",
    }
    .to_string()
}

pub fn usage_to_ir(usage: &Usage) -> TokenUsage {
    TokenUsage {
        input: usage.input_tokens.unwrap_or(0),
        output: usage.output_tokens.unwrap_or(0),
        cached: usage.cache_read_input_tokens.unwrap_or(0),
        reasoning: 0,
    }
}

pub fn usage_from_ir(usage: TokenUsage) -> Usage {
    Usage {
        input_tokens: Some(usage.input),
        output_tokens: Some(usage.output),
        cache_read_input_tokens: (usage.cached > 0).then_some(usage.cached),
        cache_creation_input_tokens: None,
    }
}

/// Decodes Anthropic stream events into IR deltas.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    input_usage: TokenUsage,
    finish: Option<StopReason>,
    final_usage: Option<TokenUsage>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, event: StreamEvent) -> Vec<StreamDelta> {
        match event {
            StreamEvent::MessageStart { message } => {
                self.input_usage = usage_to_ir(&message.usage);
                vec![StreamDelta::Start {
                    model: message.model,
                }]
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => block_to_ir(content_block)
                .map(|block| vec![StreamDelta::BlockStart { index, block }])
                .unwrap_or_default(),
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![StreamDelta::Text { index, text }],
                BlockDelta::ThinkingDelta { thinking } => vec![StreamDelta::Thinking {
                    index,
                    text: thinking,
                }],
                BlockDelta::InputJsonDelta { partial_json } => vec![StreamDelta::ToolInput {
                    index,
                    partial_json,
                }],
                BlockDelta::SignatureDelta { .. } => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => vec![StreamDelta::BlockStop { index }],
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.finish = Some(stop_reason_to_ir(reason));
                }
                if let Some(usage) = usage {
                    let mut merged = self.input_usage;
                    merged.merge(usage_to_ir(&usage));
                    self.final_usage = Some(merged);
                }
                Vec::new()
            }
            StreamEvent::MessageStop => vec![StreamDelta::Finish {
                stop_reason: self.finish.take(),
                usage: self.final_usage.take(),
            }],
            StreamEvent::Ping | StreamEvent::Error { .. } => Vec::new(),
        }
    }
}

/// Encodes IR deltas as Anthropic stream events, renumbering blocks into the
/// contiguous sequence the wire format expects.
#[derive(Debug)]
pub struct StreamEncoder {
    id: String,
    model: String,
    indices: HashMap<u32, u32>,
    next_index: u32,
    finished: bool,
}

impl StreamEncoder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: String::new(),
            indices: HashMap::new(),
            next_index: 0,
            finished: false,
        }
    }

    fn wire_index(&mut self, ir_index: u32) -> u32 {
        if let Some(index) = self.indices.get(&ir_index) {
            return *index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(ir_index, index);
        index
    }

    pub fn encode(&mut self, delta: &StreamDelta) -> Vec<StreamEvent> {
        match delta {
            StreamDelta::Start { model } => {
                self.model = model.clone();
                vec![StreamEvent::MessageStart {
                    message: MessagesResponse {
                        id: self.id.clone(),
                        kind: "message".to_string(),
                        role: "assistant".to_string(),
                        model: self.model.clone(),
                        content: Vec::new(),
                        stop_reason: None,
                        stop_sequence: None,
                        usage: Usage::default(),
                    },
                }]
            }
            StreamDelta::BlockStart { index, block } => {
                let wire = self.wire_index(*index);
                vec![StreamEvent::ContentBlockStart {
                    index: wire,
                    content_block: block_from_ir(block),
                }]
            }
            StreamDelta::Text { index, text } => {
                let wire = self.wire_index(*index);
                vec![StreamEvent::ContentBlockDelta {
                    index: wire,
                    delta: BlockDelta::TextDelta { text: text.clone() },
                }]
            }
            StreamDelta::Thinking { index, text } => {
                let wire = self.wire_index(*index);
                vec![StreamEvent::ContentBlockDelta {
                    index: wire,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                }]
            }
            StreamDelta::ToolInput {
                index,
                partial_json,
            } => {
                let wire = self.wire_index(*index);
                vec![StreamEvent::ContentBlockDelta {
                    index: wire,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: partial_json.clone(),
                    },
                }]
            }
            StreamDelta::BlockStop { index } => {
                let wire = self.wire_index(*index);
                vec![StreamEvent::ContentBlockStop { index: wire }]
            }
            StreamDelta::Finish { stop_reason, usage } => {
                self.finished = true;
                vec![
                    StreamEvent::MessageDelta {
                        delta: MessageDeltaBody {
                            stop_reason: Some(stop_reason_from_ir(stop_reason.as_ref())),
                            stop_sequence: None,
                        },
                        usage: usage.map(usage_from_ir),
                    },
                    StreamEvent::MessageStop,
                ]
            }
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_is_identity_on_ir() {
        let raw = serde_json::json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 512,
            "system": "stay close to the sources",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "summarize"},
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok"}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "search", "input": {"q": "a"}}
                ]}
            ],
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        });
        let req: MessagesRequest = serde_json::from_value(raw).unwrap();
        let ir = request_to_ir(req);
        let back = request_from_ir(&ir);
        let ir_again = request_to_ir(back);
        assert_eq!(ir, ir_again);
    }

    #[test]
    fn stream_decode_tracks_usage_and_stop() {
        let mut decoder = StreamDecoder::new();
        let start: StreamEvent = serde_json::from_str(
            r#"{"type":"message_start","message":{"id":"m","type":"message","role":"assistant","model":"claude-sonnet-4-5","content":[],"usage":{"input_tokens":7}}}"#,
        )
        .unwrap();
        let deltas = decoder.decode(start);
        assert!(matches!(&deltas[0], StreamDelta::Start { model } if model == "claude-sonnet-4-5"));

        let md: StreamEvent = serde_json::from_str(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":12}}"#,
        )
        .unwrap();
        assert!(decoder.decode(md).is_empty());

        let stop: StreamEvent = serde_json::from_str(r#"{"type":"message_stop"}"#).unwrap();
        let deltas = decoder.decode(stop);
        match &deltas[0] {
            StreamDelta::Finish { stop_reason, usage } => {
                assert_eq!(stop_reason, &Some(StopReason::EndTurn));
                let usage = usage.unwrap();
                assert_eq!(usage.input, 7);
                assert_eq!(usage.output, 12);
            }
            other => panic!("unexpected delta: {other:?}"),
        }
    }

    #[test]
    fn encoder_renumbers_sparse_indices() {
        let mut encoder = StreamEncoder::new("msg_1");
        encoder.encode(&StreamDelta::Start {
            model: "m".to_string(),
        });
        let events = encoder.encode(&StreamDelta::BlockStart {
            index: 5,
            block: ContentBlock::Text {
                text: String::new(),
            },
        });
        assert!(matches!(
            events[0],
            StreamEvent::ContentBlockStart { index: 0, .. }
        ));
    }
}
