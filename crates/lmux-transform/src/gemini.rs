//! Gemini generateContent ↔ IR.

use std::collections::HashMap;

use serde_json::Value;

use lmux_protocol::gemini::{
    Blob, Candidate, Content, CountTokensResponse, FunctionCall, FunctionDeclaration,
    FunctionResponse, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part,
    ThinkingConfig, Tool, UsageMetadata,
};

use crate::ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Thinking,
    TokenUsage, ToolSpec,
};

pub fn request_to_ir(model: &str, req: GenerateContentRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = req.system_instruction {
        let text = content_text(&system);
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }
    for content in req.contents {
        messages.push(content_to_ir(content));
    }

    let config = req.generation_config.unwrap_or_default();
    let thinking = config.thinking_config.map(|tc| Thinking {
        budget: tc.thinking_budget,
        include_thoughts: tc.include_thoughts.unwrap_or(false),
        level: tc.thinking_level,
    });

    let mut tools = Vec::new();
    for tool in req.tools.unwrap_or_default() {
        for declaration in tool.function_declarations.unwrap_or_default() {
            tools.push(ToolSpec {
                name: declaration.name,
                description: declaration.description,
                schema: declaration.parameters,
            });
        }
    }

    ChatRequest {
        model: model.to_string(),
        messages,
        temperature: config.temperature,
        top_p: config.top_p,
        max_tokens: config.max_output_tokens,
        stop: config.stop_sequences.unwrap_or_default(),
        thinking,
        tools,
        tool_choice: None,
        stream: false,
        metadata: Default::default(),
    }
}

fn content_text(content: &Content) -> String {
    let mut out = String::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            out.push_str(text);
        }
    }
    out
}

fn content_to_ir(content: Content) -> Message {
    let role = match content.role.as_deref() {
        Some("model") => Role::Assistant,
        _ => Role::User,
    };
    let mut blocks = Vec::new();
    for part in content.parts {
        if let Some(call) = part.function_call {
            blocks.push(ContentBlock::ToolUse {
                id: call.id.unwrap_or_else(|| call.name.clone()),
                name: call.name,
                input: call.args.unwrap_or(Value::Object(Default::default())),
            });
            continue;
        }
        if let Some(response) = part.function_response {
            blocks.push(ContentBlock::ToolResult {
                tool_use_id: response.id.unwrap_or_else(|| response.name.clone()),
                content: response.response,
                is_error: false,
            });
            continue;
        }
        if let Some(blob) = part.inline_data {
            blocks.push(ContentBlock::Image {
                media_type: blob.mime_type,
                data: blob.data,
            });
            continue;
        }
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                blocks.push(ContentBlock::Thinking {
                    text,
                    signature: part.thought_signature,
                });
            } else {
                blocks.push(ContentBlock::Text { text });
            }
        }
    }
    Message { role, blocks }
}

pub fn request_from_ir(req: &ChatRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    for message in req.conversation() {
        contents.push(content_from_ir(message));
    }

    let thinking_config = req.thinking.as_ref().map(|thinking| ThinkingConfig {
        thinking_budget: thinking.budget,
        include_thoughts: thinking.include_thoughts.then_some(true),
        thinking_level: thinking.level.clone(),
    });

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_tokens,
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        thinking_config,
    };
    let has_config = generation_config.temperature.is_some()
        || generation_config.top_p.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.stop_sequences.is_some()
        || generation_config.thinking_config.is_some();

    GenerateContentRequest {
        contents,
        system_instruction: req.system_text().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text),
                ..Default::default()
            }],
        }),
        generation_config: has_config.then_some(generation_config),
        tools: (!req.tools.is_empty()).then(|| {
            vec![Tool {
                function_declarations: Some(
                    req.tools
                        .iter()
                        .map(|tool| FunctionDeclaration {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.schema.clone(),
                        })
                        .collect(),
                ),
            }]
        }),
        tool_config: None,
        safety_settings: None,
    }
}

fn content_from_ir(message: &Message) -> Content {
    let role = match message.role {
        Role::Assistant => "model",
        _ => "user",
    };
    let mut parts = Vec::new();
    for block in &message.blocks {
        match block {
            ContentBlock::Text { text } => parts.push(Part {
                text: Some(text.clone()),
                ..Default::default()
            }),
            ContentBlock::Image { media_type, data } => parts.push(Part {
                inline_data: Some(Blob {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            }),
            ContentBlock::ToolUse { id, name, input } => parts.push(Part {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    args: Some(input.clone()),
                    id: (id != name).then(|| id.clone()),
                }),
                ..Default::default()
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => parts.push(Part {
                function_response: Some(FunctionResponse {
                    name: tool_use_id.clone(),
                    response: normalize_function_response(content),
                    id: None,
                }),
                ..Default::default()
            }),
            ContentBlock::Thinking { text, signature } => parts.push(Part {
                text: Some(text.clone()),
                thought: Some(true),
                thought_signature: signature.clone(),
                ..Default::default()
            }),
        }
    }
    Content {
        role: Some(role.to_string()),
        parts,
    }
}

// Gemini requires functionResponse.response to be an object.
fn normalize_function_response(content: &Value) -> Value {
    match content {
        Value::Object(_) => content.clone(),
        other => serde_json::json!({ "result": other }),
    }
}

pub fn response_to_ir(resp: GenerateContentResponse) -> ChatResponse {
    let model = resp.model_version.clone().unwrap_or_default();
    let mut blocks = Vec::new();
    let mut stop_reason = None;
    if let Some(candidate) = resp.candidates.into_iter().next() {
        if let Some(content) = candidate.content {
            blocks = content_to_ir(content).blocks;
        }
        stop_reason = candidate.finish_reason.as_deref().map(finish_reason_to_ir);
    }
    ChatResponse {
        model,
        blocks,
        stop_reason,
        usage: resp.usage_metadata.map(usage_to_ir).unwrap_or_default(),
        metadata: Default::default(),
    }
}

pub fn response_from_ir(resp: &ChatResponse) -> GenerateContentResponse {
    let content = content_from_ir(&Message {
        role: Role::Assistant,
        blocks: resp.blocks.clone(),
    });
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(content),
            finish_reason: Some(finish_reason_from_ir(resp.stop_reason.as_ref())),
            index: Some(0),
        }],
        usage_metadata: Some(usage_from_ir(resp.usage)),
        model_version: (!resp.model.is_empty()).then(|| resp.model.clone()),
        response_id: None,
    }
}

pub fn count_tokens_response_from_ir(total_tokens: u32) -> CountTokensResponse {
    CountTokensResponse { total_tokens }
}

pub fn finish_reason_to_ir(reason: &str) -> StopReason {
    match reason {
        "STOP" => StopReason::EndTurn,
        "MAX_TOKENS" => StopReason::MaxTokens,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => StopReason::ContentFilter,
        other => StopReason::Other(other.to_string()),
    }
}

pub fn finish_reason_from_ir(reason: Option<&StopReason>) -> String {
    match reason {
        Some(StopReason::MaxTokens) => "MAX_TOKENS",
        Some(StopReason::ContentFilter) => "SAFETY",
        Some(StopReason::Other(other)) => other.as_str(),
        // Tool calls finish with STOP on this wire; the functionCall part is
        // the signal.
        _ => "STOP",
    }
    .to_string()
}

pub fn usage_to_ir(usage: UsageMetadata) -> TokenUsage {
    TokenUsage {
        input: usage.prompt_token_count.unwrap_or(0),
        output: usage.candidates_token_count.unwrap_or(0),
        cached: usage.cached_content_token_count.unwrap_or(0),
        reasoning: usage.thoughts_token_count.unwrap_or(0),
    }
}

pub fn usage_from_ir(usage: TokenUsage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: Some(usage.input),
        candidates_token_count: Some(usage.output),
        cached_content_token_count: (usage.cached > 0).then_some(usage.cached),
        thoughts_token_count: (usage.reasoning > 0).then_some(usage.reasoning),
        total_token_count: Some(usage.total()),
    }
}

const THINKING_INDEX: u32 = 0;
const TEXT_INDEX: u32 = 1;
const TOOL_INDEX_BASE: u32 = 2;

/// Decodes streamed `GenerateContentResponse` chunks into IR deltas.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    started: bool,
    text_open: bool,
    thinking_open: bool,
    tools_emitted: u32,
    finish: Option<StopReason>,
    usage: Option<TokenUsage>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: GenerateContentResponse) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(StreamDelta::Start {
                model: chunk.model_version.clone().unwrap_or_default(),
            });
        }
        if let Some(usage) = chunk.usage_metadata {
            let incoming = usage_to_ir(usage);
            self.usage = Some(match self.usage {
                Some(mut existing) => {
                    existing.merge(incoming);
                    existing
                }
                None => incoming,
            });
        }

        for candidate in chunk.candidates {
            if let Some(content) = candidate.content {
                for part in content.parts {
                    self.decode_part(part, &mut out);
                }
            }
            if let Some(reason) = candidate.finish_reason {
                self.finish = Some(finish_reason_to_ir(&reason));
            }
        }
        out
    }

    fn decode_part(&mut self, part: Part, out: &mut Vec<StreamDelta>) {
        if let Some(call) = part.function_call {
            let index = TOOL_INDEX_BASE + self.tools_emitted;
            self.tools_emitted += 1;
            let args = call.args.unwrap_or(Value::Object(Default::default()));
            out.push(StreamDelta::BlockStart {
                index,
                block: ContentBlock::ToolUse {
                    id: call.id.unwrap_or_else(|| call.name.clone()),
                    name: call.name,
                    input: Value::Object(Default::default()),
                },
            });
            out.push(StreamDelta::ToolInput {
                index,
                partial_json: args.to_string(),
            });
            out.push(StreamDelta::BlockStop { index });
            return;
        }
        let Some(text) = part.text else {
            return;
        };
        if text.is_empty() {
            return;
        }
        if part.thought.unwrap_or(false) {
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
                text,
            });
        } else {
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
                text,
            });
        }
    }

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
        out.push(StreamDelta::Finish {
            stop_reason: self.finish.take(),
            usage: self.usage.take(),
        });
        out
    }
}

/// Encodes IR deltas as streamed Gemini chunks. Tool input is buffered until
/// its block closes because this wire carries whole `functionCall` objects.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    model: String,
    pending_tools: HashMap<u32, (String, String, String)>,
}

impl StreamEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn chunk(&self, parts: Vec<Part>, finish: Option<String>, usage: Option<UsageMetadata>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content {
                    role: Some("model".to_string()),
                    parts,
                }),
                finish_reason: finish,
                index: Some(0),
            }],
            usage_metadata: usage,
            model_version: (!self.model.is_empty()).then(|| self.model.clone()),
            response_id: None,
        }
    }

    pub fn encode(&mut self, delta: &StreamDelta) -> Option<GenerateContentResponse> {
        match delta {
            StreamDelta::Start { model } => {
                self.model = model.clone();
                None
            }
            StreamDelta::BlockStart { index, block } => {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    self.pending_tools
                        .insert(*index, (id.clone(), name.clone(), String::new()));
                }
                None
            }
            StreamDelta::Text { text, .. } => Some(self.chunk(
                vec![Part {
                    text: Some(text.clone()),
                    ..Default::default()
                }],
                None,
                None,
            )),
            StreamDelta::Thinking { text, .. } => Some(self.chunk(
                vec![Part {
                    text: Some(text.clone()),
                    thought: Some(true),
                    ..Default::default()
                }],
                None,
                None,
            )),
            StreamDelta::ToolInput {
                index,
                partial_json,
            } => {
                if let Some((_, _, buffer)) = self.pending_tools.get_mut(index) {
                    buffer.push_str(partial_json);
                }
                None
            }
            StreamDelta::BlockStop { index } => {
                let (id, name, buffer) = self.pending_tools.remove(index)?;
                let args = serde_json::from_str(&buffer)
                    .unwrap_or(Value::Object(Default::default()));
                Some(self.chunk(
                    vec![Part {
                        function_call: Some(FunctionCall {
                            name: name.clone(),
                            args: Some(args),
                            id: (id != name).then_some(id),
                        }),
                        ..Default::default()
                    }],
                    None,
                    None,
                ))
            }
            StreamDelta::Finish { stop_reason, usage } => Some(self.chunk(
                Vec::new(),
                Some(finish_reason_from_ir(stop_reason.as_ref())),
                usage.map(usage_from_ir),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip_is_identity_on_ir() {
        let raw = serde_json::json!({
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "search", "args": {"q": "a"}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "search", "response": {"hits": 3}}}
                ]}
            ],
            "systemInstruction": {"parts": [{"text": "be exact"}]},
            "generationConfig": {"maxOutputTokens": 99, "thinkingConfig": {"thinkingBudget": -1}}
        });
        let req: GenerateContentRequest = serde_json::from_value(raw).unwrap();
        let ir = request_to_ir("gemini-2.5-pro", req);
        assert_eq!(ir.thinking.as_ref().unwrap().budget, Some(-1));
        let back = request_from_ir(&ir);
        let ir_again = request_to_ir("gemini-2.5-pro", back);
        assert_eq!(ir, ir_again);
    }

    #[test]
    fn stream_decoder_separates_thought_parts() {
        let mut decoder = StreamDecoder::new();
        let chunk: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "pondering", "thought": true},
                {"text": "answer"}
            ]}}]
        }))
        .unwrap();
        let deltas = decoder.decode(chunk);
        assert!(deltas.iter().any(|d| matches!(d, StreamDelta::Thinking { .. })));
        assert!(deltas.iter().any(|d| matches!(d, StreamDelta::Text { .. })));
    }

    #[test]
    fn encoder_buffers_tool_input_until_stop() {
        let mut encoder = StreamEncoder::new();
        encoder.encode(&StreamDelta::Start {
            model: "gemini-2.5-pro".into(),
        });
        assert!(
            encoder
                .encode(&StreamDelta::BlockStart {
                    index: 2,
                    block: ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "search".into(),
                        input: Value::Object(Default::default()),
                    },
                })
                .is_none()
        );
        assert!(
            encoder
                .encode(&StreamDelta::ToolInput {
                    index: 2,
                    partial_json: "{\"q\":\"a\"}".into(),
                })
                .is_none()
        );
        let chunk = encoder.encode(&StreamDelta::BlockStop { index: 2 }).unwrap();
        let call = chunk.candidates[0].content.as_ref().unwrap().parts[0]
            .function_call
            .as_ref()
            .unwrap();
        assert_eq!(call.args.as_ref().unwrap()["q"], "a");
    }
}
