//! Upstream payload sanitation.
//!
//! Subscription upstreams reject bodies carrying fields outside their schema,
//! and some popular clients serialize JavaScript `undefined` as a literal
//! string. Before a body leaves the gateway it passes through a whitelist
//! keyed by (provider, model family), null stripping, and thinking-config
//! normalization for families whose knobs drifted.

use serde_json::Value;
use tracing::debug;

const CLAUDE_MESSAGE_FIELDS: &[&str] = &[
    "model",
    "max_tokens",
    "messages",
    "system",
    "temperature",
    "top_p",
    "top_k",
    "stop_sequences",
    "stream",
    "thinking",
    "tools",
    "tool_choice",
    "metadata",
];

const GEMINI_GENERATE_FIELDS: &[&str] = &[
    "contents",
    "systemInstruction",
    "generationConfig",
    "tools",
    "toolConfig",
    "safetySettings",
    "cachedContent",
];

const OPENAI_CHAT_FIELDS: &[&str] = &[
    "model",
    "messages",
    "temperature",
    "top_p",
    "max_tokens",
    "max_completion_tokens",
    "stop",
    "stream",
    "stream_options",
    "tools",
    "tool_choice",
    "reasoning_effort",
    "n",
    "user",
];

fn whitelist_for(provider: &str) -> Option<&'static [&'static str]> {
    match provider {
        "claude" => Some(CLAUDE_MESSAGE_FIELDS),
        "gemini" | "antigravity" | "vertex" => Some(GEMINI_GENERATE_FIELDS),
        "copilot" | "codex" | "qwen" | "iflow" => Some(OPENAI_CHAT_FIELDS),
        _ => None,
    }
}

/// Sanitize an upstream request body in place.
pub fn sanitize(provider: &str, model: &str, body: &mut Value) {
    scrub_undefined(body);
    if let Some(allowed) = whitelist_for(provider) {
        apply_whitelist(provider, body, allowed);
    }
    if matches!(provider, "gemini" | "antigravity" | "vertex") {
        normalize_gemini_thinking(model, body);
    }
}

fn apply_whitelist(provider: &str, body: &mut Value, allowed: &[&str]) {
    let Value::Object(map) = body else {
        return;
    };
    let dropped: Vec<String> = map
        .keys()
        .filter(|key| !allowed.contains(&key.as_str()))
        .cloned()
        .collect();
    for key in dropped {
        debug!(provider, field = %key, "dropping field outside upstream schema");
        map.remove(&key);
    }
}

/// Remove literal `"undefined"` / `"[undefined]"` strings and null object
/// members, recursively.
pub fn scrub_undefined(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let bad: Vec<String> = map
                .iter()
                .filter(|(_, v)| is_undefined(v) || v.is_null())
                .map(|(k, _)| k.clone())
                .collect();
            for key in bad {
                map.remove(&key);
            }
            for child in map.values_mut() {
                scrub_undefined(child);
            }
        }
        Value::Array(items) => {
            items.retain(|item| !is_undefined(item));
            for item in items {
                scrub_undefined(item);
            }
        }
        _ => {}
    }
}

fn is_undefined(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == "undefined" || s == "[undefined]")
}

/// Gemini 3 takes a `thinkingLevel` enum where earlier generations take an
/// integer `thinkingBudget`; a body built for one family must not carry the
/// other's knob.
fn normalize_gemini_thinking(model: &str, body: &mut Value) {
    let Some(config) = body
        .get_mut("generationConfig")
        .and_then(|config| config.get_mut("thinkingConfig"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    if is_gemini_3(model) {
        if !config.contains_key("thinkingLevel") {
            let level = match config.get("thinkingBudget").and_then(Value::as_i64) {
                Some(budget) if budget == 0 => "low",
                Some(budget) if (1..=4096).contains(&budget) => "low",
                _ => "high",
            };
            config.insert("thinkingLevel".to_string(), Value::String(level.to_string()));
        }
        config.remove("thinkingBudget");
    } else {
        config.remove("thinkingLevel");
    }
}

fn is_gemini_3(model: &str) -> bool {
    model.starts_with("gemini-3")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn undefined_strings_are_scrubbed() {
        let mut body = json!({
            "model": "claude-sonnet-4-5",
            "metadata": {"user_id": "undefined"},
            "system": "[undefined]",
            "temperature": null,
            "messages": []
        });
        scrub_undefined(&mut body);
        assert!(body.get("system").is_none());
        assert!(body.get("temperature").is_none());
        assert!(body["metadata"].get("user_id").is_none());
    }

    #[test]
    fn whitelist_drops_foreign_fields() {
        let mut body = json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 64,
            "messages": [],
            "logit_bias": {"1": 2},
            "frequency_penalty": 0.5
        });
        sanitize("claude", "claude-sonnet-4-5", &mut body);
        assert!(body.get("logit_bias").is_none());
        assert!(body.get("frequency_penalty").is_none());
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn gemini_3_budget_becomes_level() {
        let mut body = json!({
            "contents": [],
            "generationConfig": {"thinkingConfig": {"thinkingBudget": -1}}
        });
        sanitize("gemini", "gemini-3-pro-preview", &mut body);
        let config = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(config["thinkingLevel"], "high");
        assert!(config.get("thinkingBudget").is_none());
    }

    #[test]
    fn gemini_2_keeps_budget_drops_level() {
        let mut body = json!({
            "contents": [],
            "generationConfig": {"thinkingConfig": {"thinkingBudget": 2048, "thinkingLevel": "high"}}
        });
        sanitize("gemini", "gemini-2.5-pro", &mut body);
        let config = &body["generationConfig"]["thinkingConfig"];
        assert_eq!(config["thinkingBudget"], 2048);
        assert!(config.get("thinkingLevel").is_none());
    }
}
