//! Streaming chunk translation
//!
//! Chunk-to-chunk conversion between dialects, stateless beyond the current
//! chunk. The pipeline owns all cross-chunk concerns (aggregation, framing,
//! the terminal sentinel); this module only rewrites one chunk at a time.
//!
//! # Event mapping
//!
//! | Upstream (Anthropic)                         | Downstream (OpenAI)           |
//! |----------------------------------------------|-------------------------------|
//! | `content_block_delta` / `text_delta`         | `choices[0].delta.content`    |
//! | anything else (ping, starts, stops, deltas)  | suppressed                    |
//!
//! | Upstream (OpenAI)                            | Downstream (Anthropic)        |
//! |----------------------------------------------|-------------------------------|
//! | chunk with `choices[0].delta.content` text   | `content_block_delta`         |
//! | control frame (role opener, finish marker)   | `{"type":"ping"}`             |
//!
//! Control frames never inject empty text downstream.

use super::{Dialect, TranslateMode};
use serde_json::{json, Value};

/// Translate one upstream chunk for the client, or drop it.
///
/// Returns `None` when the chunk is a control frame with no downstream
/// representation. Never emits a terminal sentinel; that is a transport
/// concern handled by the pipeline.
pub fn translate_chunk(chunk: &Value, mode: TranslateMode) -> Option<Value> {
    match mode {
        TranslateMode::Passthrough => Some(chunk.clone()),
        TranslateMode::OpenAiToAnthropic => anthropic_chunk_to_openai(chunk),
        TranslateMode::AnthropicToOpenAi => openai_chunk_to_anthropic(chunk),
    }
}

/// Anthropic upstream chunk → OpenAI client chunk
///
/// Only text deltas carry over; Anthropic's envelope events have no OpenAI
/// equivalent and are suppressed.
fn anthropic_chunk_to_openai(chunk: &Value) -> Option<Value> {
    if chunk.get("type").and_then(|t| t.as_str()) != Some("content_block_delta") {
        return None;
    }

    let delta = chunk.get("delta")?;
    if delta.get("type").and_then(|t| t.as_str()) != Some("text_delta") {
        return None;
    }

    let text = delta.get("text").and_then(|t| t.as_str())?;
    if text.is_empty() {
        return None;
    }

    Some(json!({
        "choices": [{
            "index": 0,
            "delta": { "content": text },
        }]
    }))
}

/// OpenAI upstream chunk → Anthropic client chunk
///
/// Text deltas become `content_block_delta`; role openers and finish markers
/// become pings so the client connection stays warm without fake text.
fn openai_chunk_to_anthropic(chunk: &Value) -> Option<Value> {
    let content = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str());

    match content {
        Some(text) if !text.is_empty() => Some(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": text },
        })),
        _ => Some(json!({"type": "ping"})),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk inspection (used by the pipeline for aggregation)
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the text a chunk carries in the given dialect, if any
pub fn chunk_text(chunk: &Value, dialect: Dialect) -> Option<String> {
    match dialect {
        Dialect::Anthropic => {
            if chunk.get("type").and_then(|t| t.as_str()) == Some("content_block_delta") {
                chunk
                    .get("delta")
                    .filter(|d| d.get("type").and_then(|t| t.as_str()) == Some("text_delta"))
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                    .filter(|t| !t.is_empty())
                    .map(String::from)
            } else {
                None
            }
        }
        Dialect::OpenAi => chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .filter(|t| !t.is_empty())
            .map(String::from),
    }
}

/// Running usage totals accumulated across a stream
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl StreamUsage {
    /// Fold usage hints from one chunk into the running totals.
    ///
    /// Anthropic reports input in `message_start` and output in
    /// `message_delta`; OpenAI reports a full usage object on the final
    /// chunk when the client asked for it.
    pub fn update(&mut self, chunk: &Value, dialect: Dialect) {
        match dialect {
            Dialect::Anthropic => {
                if let Some(usage) = chunk.get("message").and_then(|m| m.get("usage")) {
                    if let Some(v) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
                        self.input_tokens = Some(v);
                    }
                    if let Some(v) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
                        self.output_tokens = Some(v);
                    }
                }
                if let Some(usage) = chunk.get("usage") {
                    if let Some(v) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
                        self.input_tokens = Some(v);
                    }
                    if let Some(v) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
                        self.output_tokens = Some(v);
                    }
                }
            }
            Dialect::OpenAi => {
                if let Some(usage) = chunk.get("usage") {
                    if let Some(v) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                        self.input_tokens = Some(v);
                    }
                    if let Some(v) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                        self.output_tokens = Some(v);
                    }
                }
            }
        }
    }
}

/// Extract a stop/finish reason from a chunk in the given dialect
pub fn chunk_stop_reason(chunk: &Value, dialect: Dialect) -> Option<String> {
    match dialect {
        Dialect::Anthropic => chunk
            .get("delta")
            .and_then(|d| d.get("stop_reason"))
            .and_then(|s| s.as_str())
            .map(String::from),
        Dialect::OpenAi => chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|f| f.as_str())
            .map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_delta_to_openai() {
        let chunk = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "A"}
        });

        let out = translate_chunk(&chunk, TranslateMode::OpenAiToAnthropic).unwrap();
        assert_eq!(out["choices"][0]["index"], 0);
        assert_eq!(out["choices"][0]["delta"]["content"], "A");
    }

    #[test]
    fn test_anthropic_control_frames_suppressed() {
        for chunk in [
            json!({"type": "message_start", "message": {"model": "claude-3-haiku-20240307"}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}),
            json!({"type": "message_stop"}),
            json!({"type": "ping"}),
        ] {
            assert!(
                translate_chunk(&chunk, TranslateMode::OpenAiToAnthropic).is_none(),
                "control frame must not reach an OpenAI client: {chunk}"
            );
        }
    }

    #[test]
    fn test_openai_delta_to_anthropic() {
        let chunk = json!({
            "choices": [{"index": 0, "delta": {"content": "Hi"}}]
        });

        let out = translate_chunk(&chunk, TranslateMode::AnthropicToOpenAi).unwrap();
        assert_eq!(out["type"], "content_block_delta");
        assert_eq!(out["delta"]["type"], "text_delta");
        assert_eq!(out["delta"]["text"], "Hi");
    }

    #[test]
    fn test_openai_control_frames_become_pings() {
        let role_opener = json!({
            "choices": [{"index": 0, "delta": {"role": "assistant"}}]
        });
        let finish = json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
        });

        for chunk in [role_opener, finish] {
            let out = translate_chunk(&chunk, TranslateMode::AnthropicToOpenAi).unwrap();
            assert_eq!(out["type"], "ping");
            assert!(out.get("delta").is_none(), "pings carry no text");
        }
    }

    #[test]
    fn test_translated_text_is_identical() {
        let text = "exact bytes preserved: 漢字 & émoji";
        let chunk = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": text}
        });

        let out = translate_chunk(&chunk, TranslateMode::OpenAiToAnthropic).unwrap();
        assert_eq!(out["choices"][0]["delta"]["content"], text);
    }

    #[test]
    fn test_passthrough_clones_chunk() {
        let chunk = json!({"type": "ping"});
        let out = translate_chunk(&chunk, TranslateMode::Passthrough).unwrap();
        assert_eq!(out, chunk);
    }

    #[test]
    fn test_chunk_text_extraction() {
        let anthropic = json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "B"}
        });
        assert_eq!(chunk_text(&anthropic, Dialect::Anthropic).as_deref(), Some("B"));

        let openai = json!({"choices": [{"delta": {"content": "C"}}]});
        assert_eq!(chunk_text(&openai, Dialect::OpenAi).as_deref(), Some("C"));

        let control = json!({"type": "ping"});
        assert!(chunk_text(&control, Dialect::Anthropic).is_none());
    }

    #[test]
    fn test_stream_usage_accumulation() {
        let mut usage = StreamUsage::default();
        usage.update(
            &json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}),
            Dialect::Anthropic,
        );
        usage.update(
            &json!({"type": "message_delta", "usage": {"output_tokens": 7}}),
            Dialect::Anthropic,
        );

        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(7));
    }

    #[test]
    fn test_stop_reason_extraction() {
        let anthropic = json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}});
        assert_eq!(
            chunk_stop_reason(&anthropic, Dialect::Anthropic).as_deref(),
            Some("end_turn")
        );

        let openai = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        assert_eq!(
            chunk_stop_reason(&openai, Dialect::OpenAi).as_deref(),
            Some("stop")
        );
    }
}
