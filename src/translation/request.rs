//! Request translation between OpenAI and Anthropic dialects
//!
//! # Key differences
//!
//! | OpenAI                        | Anthropic                      |
//! |-------------------------------|--------------------------------|
//! | `messages[].role: "system"`   | Top-level `system` string      |
//! | `max_tokens` (optional)       | `max_tokens` (required)        |
//! | `temperature` (optional)      | `temperature` (optional)       |
//! | `top_p`                       | `top_p`                        |
//! | `stream`                      | `stream`                       |
//! | content string or part list   | content string or block list   |
//!
//! Multiple system messages concatenate with a blank line. List content is
//! preserved as blocks when the target accepts them (Anthropic) and
//! collapsed to space-joined text otherwise (OpenAI).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `max_tokens` applied when the source request omits it; Anthropic requires
/// the field.
const DEFAULT_MAX_TOKENS: u32 = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI request types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<Content>,
}

/// Message content in either dialect: plain string or a list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Parts(Vec<Value>),
}

impl Content {
    /// Text parts joined by a single space (lossy for non-text parts)
    fn collapsed(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p.get("type").and_then(|t| t.as_str()) {
                    Some("text") => p.get("text").and_then(|t| t.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Text parts as Anthropic text blocks; non-text parts are dropped
    fn as_anthropic_blocks(&self) -> Value {
        match self {
            Content::Text(text) => Value::String(text.clone()),
            Content::Parts(parts) => {
                let blocks: Vec<Value> = parts
                    .iter()
                    .filter_map(|p| match p.get("type").and_then(|t| t.as_str()) {
                        Some("text") => p.get("text").and_then(|t| t.as_str()).map(|text| {
                            serde_json::json!({"type": "text", "text": text})
                        }),
                        _ => None,
                    })
                    .collect();
                Value::Array(blocks)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic request types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Content,
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation functions
// ─────────────────────────────────────────────────────────────────────────────

/// Translate an OpenAI chat-completions request into Anthropic messages shape
pub fn openai_to_anthropic(body: &Value) -> Result<Value> {
    let request: OpenAiChatRequest =
        serde_json::from_value(body.clone()).context("Failed to parse OpenAI request")?;

    // System messages move to the top-level `system` string
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in &request.messages {
        let Some(content) = &msg.content else {
            continue;
        };

        if msg.role == "system" {
            system_parts.push(content.collapsed());
        } else {
            messages.push(serde_json::json!({
                "role": msg.role,
                "content": content.as_anthropic_blocks(),
            }));
        }
    }

    let mut out = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
    });

    if !system_parts.is_empty() {
        out["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(t) = request.temperature {
        out["temperature"] = serde_json::json!(t);
    }
    if let Some(p) = request.top_p {
        out["top_p"] = serde_json::json!(p);
    }
    if let Some(s) = request.stream {
        out["stream"] = Value::Bool(s);
    }

    Ok(out)
}

/// Translate an Anthropic messages request into OpenAI chat-completions shape
pub fn anthropic_to_openai(body: &Value) -> Result<Value> {
    let request: AnthropicRequest =
        serde_json::from_value(body.clone()).context("Failed to parse Anthropic request")?;

    let mut messages: Vec<Value> = Vec::new();

    // The top-level system string becomes a leading system message
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }

    for msg in &request.messages {
        messages.push(serde_json::json!({
            "role": msg.role,
            "content": msg.content.collapsed(),
        }));
    }

    let mut out = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "temperature": request.temperature.unwrap_or(1.0),
    });

    if let Some(p) = request.top_p {
        out["top_p"] = serde_json::json!(p);
    }
    if let Some(s) = request.stream {
        out["stream"] = Value::Bool(s);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_openai_to_anthropic() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hello"}]
        });

        let out = openai_to_anthropic(&body).unwrap();
        assert_eq!(out["model"], "gpt-4");
        assert_eq!(out["messages"][0]["role"], "user");
        assert_eq!(out["messages"][0]["content"], "Hello");
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(out.get("system").is_none());
    }

    #[test]
    fn test_system_extraction_and_concat() {
        let body = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "Be helpful"},
                {"role": "system", "content": "Be terse"},
                {"role": "user", "content": "Hi"}
            ]
        });

        let out = openai_to_anthropic(&body).unwrap();
        assert_eq!(out["system"], "Be helpful\n\nBe terse");
        assert_eq!(out["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_openai_parts_preserved_as_blocks() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "part one"},
                    {"type": "text", "text": "part two"}
                ]
            }]
        });

        let out = openai_to_anthropic(&body).unwrap();
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["text"], "part two");
    }

    #[test]
    fn test_anthropic_to_openai_with_system() {
        let body = json!({
            "model": "gpt-4",
            "max_tokens": 10,
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "Ping"}]
        });

        let out = anthropic_to_openai(&body).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Be terse.");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Ping");
        assert_eq!(out["max_tokens"], 10);
        assert_eq!(out["temperature"], 1.0);
    }

    #[test]
    fn test_anthropic_blocks_collapse_to_joined_text() {
        let body = json!({
            "model": "claude-3-haiku-20240307",
            "max_tokens": 64,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "first"},
                    {"type": "text", "text": "second"}
                ]
            }]
        });

        let out = anthropic_to_openai(&body).unwrap();
        assert_eq!(out["messages"][0]["content"], "first second");
    }

    #[test]
    fn test_round_trip_preserves_model_and_messages() {
        let original = json!({
            "model": "gpt-3.5-turbo",
            "messages": [
                {"role": "system", "content": "Answer in one word"},
                {"role": "user", "content": "Capital of France?"}
            ],
            "max_tokens": 5
        });

        let anthropic = openai_to_anthropic(&original).unwrap();
        let back = anthropic_to_openai(&anthropic).unwrap();

        assert_eq!(back["model"], original["model"]);
        // System collapse is order-preserving: system first, then the rest
        assert_eq!(back["messages"][0]["role"], "system");
        assert_eq!(back["messages"][0]["content"], "Answer in one word");
        assert_eq!(back["messages"][1]["content"], "Capital of France?");
        assert!(back["max_tokens"].as_u64().unwrap() >= original["max_tokens"].as_u64().unwrap());
    }

    #[test]
    fn test_stream_flag_carried_through() {
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true
        });

        let out = openai_to_anthropic(&body).unwrap();
        assert_eq!(out["stream"], true);
    }

    #[test]
    fn test_malformed_request_is_an_error() {
        let body = json!({"messages": "nope"});
        assert!(openai_to_anthropic(&body).is_err());
        assert!(anthropic_to_openai(&body).is_err());
    }
}
