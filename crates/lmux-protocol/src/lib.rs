//! Wire-level DTOs for the client-facing formats lmux speaks: OpenAI chat
//! completions, Anthropic messages, Gemini generateContent, and Ollama.
//!
//! These structs are deliberately tolerant on input (unknown fields ride in
//! `extra` maps) and conservative on output (`skip_serializing_if` on every
//! optional), because the gateway sits between many clients of wildly
//! different strictness.

pub mod claude;
pub mod frame;
pub mod gemini;
pub mod ollama;
pub mod openai;
