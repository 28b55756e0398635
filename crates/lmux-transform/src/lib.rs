//! The canonical intermediate representation and the per-format mappers.
//!
//! Every client format maps into [`ir::ChatRequest`] on the way in and out of
//! [`ir::ChatResponse`] / [`ir::StreamDelta`] on the way back, so N client
//! formats and M upstream formats cost N + M mappers instead of N × M
//! pairwise transforms.

pub mod alias;
pub mod claude;
pub mod gemini;
pub mod ir;
pub mod ollama;
pub mod openai;
pub mod sanitize;
pub mod usage;

pub use ir::{
    ChatRequest, ChatResponse, ContentBlock, Message, Role, StopReason, StreamDelta, Thinking,
    TokenUsage, ToolSpec,
};
pub use usage::UsageAccumulator;
