//! Buffered response translation between dialects
//!
//! Rewrites a complete upstream JSON body into the client's dialect. The
//! pre-translation (upstream-native) body is what telemetry stores; the
//! translated body is ephemeral and exists only on the client wire.
//!
//! Stop-reason mapping (Anthropic → OpenAI): `end_turn` → `stop`,
//! `max_tokens` → `length`, anything else passes through.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Anthropic response types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI response types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation functions
// ─────────────────────────────────────────────────────────────────────────────

/// Map an Anthropic stop reason to OpenAI's finish_reason vocabulary
pub fn map_stop_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" => "stop".to_string(),
        "max_tokens" => "length".to_string(),
        other => other.to_string(),
    }
}

/// Translate an Anthropic messages response into chat-completion shape
pub fn anthropic_to_openai(body: &Value) -> Result<Value> {
    let response: AnthropicResponse =
        serde_json::from_value(body.clone()).context("Failed to parse Anthropic response")?;

    // Joined text of all text content blocks
    let text: String = response
        .content
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();

    let finish_reason = response
        .stop_reason
        .as_deref()
        .map(map_stop_reason)
        .unwrap_or_else(|| "stop".to_string());

    let mut out = json!({
        "id": response.id,
        "object": "chat.completion",
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
    });

    if let Some(usage) = response.usage {
        out["usage"] = json!({
            "prompt_tokens": usage.input_tokens,
            "completion_tokens": usage.output_tokens,
            "total_tokens": usage.input_tokens + usage.output_tokens,
        });
    }

    Ok(out)
}

/// Translate a chat-completion response into Anthropic messages shape
pub fn openai_to_anthropic(body: &Value) -> Result<Value> {
    let response: OpenAiResponse =
        serde_json::from_value(body.clone()).context("Failed to parse OpenAI response")?;

    let text = response
        .choices
        .first()
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.content.clone())
        .unwrap_or_default();

    let mut out = json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": [{ "type": "text", "text": text }],
        "stop_reason": "end_turn",
    });

    if let Some(usage) = response.usage {
        out["usage"] = json!({
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_to_openai_joins_text_blocks() {
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-haiku-20240307",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 8, "output_tokens": 3}
        });

        let out = anthropic_to_openai(&body).unwrap();
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(out["choices"][0]["message"]["role"], "assistant");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["prompt_tokens"], 8);
        assert_eq!(out["usage"]["completion_tokens"], 3);
        assert_eq!(out["usage"]["total_tokens"], 11);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("stop_sequence"), "stop_sequence");
    }

    #[test]
    fn test_max_tokens_stop_becomes_length() {
        let body = json!({
            "id": "msg_02",
            "model": "claude-3-haiku-20240307",
            "content": [{"type": "text", "text": "truncat"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 5, "output_tokens": 5}
        });

        let out = anthropic_to_openai(&body).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn test_openai_to_anthropic_shape() {
        let body = json!({
            "id": "chatcmpl-xyz",
            "object": "chat.completion",
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Pong"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10}
        });

        let out = openai_to_anthropic(&body).unwrap();
        assert_eq!(out["type"], "message");
        assert_eq!(out["role"], "assistant");
        assert_eq!(out["content"][0]["type"], "text");
        assert_eq!(out["content"][0]["text"], "Pong");
        assert_eq!(out["stop_reason"], "end_turn");
        assert_eq!(out["usage"]["input_tokens"], 9);
        assert_eq!(out["usage"]["output_tokens"], 1);
    }

    #[test]
    fn test_non_text_blocks_are_skipped() {
        let body = json!({
            "id": "msg_03",
            "model": "claude-3-sonnet-20240229",
            "content": [
                {"type": "thinking", "thinking": "internal"},
                {"type": "text", "text": "visible"}
            ],
            "stop_reason": "end_turn"
        });

        let out = anthropic_to_openai(&body).unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "visible");
    }

    #[test]
    fn test_empty_choices_yield_empty_text() {
        let body = json!({"id": "chatcmpl-0", "model": "gpt-4", "choices": []});
        let out = openai_to_anthropic(&body).unwrap();
        assert_eq!(out["content"][0]["text"], "");
    }
}
