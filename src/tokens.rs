//! Token estimation for request/response content
//!
//! Provides tiktoken-like token counting without external dependencies:
//! word and punctuation boundaries plus one unit per CJK codepoint, with a
//! small per-family bias (Claude tokenizers run slightly denser).
//!
//! # Accuracy
//!
//! This is an *estimator*, not an exact counter. For exact counts, use the
//! API's `usage` response field; estimates exist so the cache estimator and
//! analytics have something to work with before (or without) upstream truth.

use regex::Regex;
use std::sync::OnceLock;

/// Fixed token charge for an image content part.
///
/// Image token accounting is provider-specific and not observable from the
/// request alone; a flat base charge keeps multimodal prompts from counting
/// as zero input.
pub const IMAGE_PART_TOKENS: u32 = 85;

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+|[^\w\s]").expect("valid token pattern"))
}

/// Estimate token count for raw text
///
/// Splits on word boundaries and punctuation (each run of word characters
/// and each punctuation mark is one unit), then adds one unit per CJK
/// codepoint since those are not whitespace-delimited.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let base = word_pattern().find_iter(text).count();
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();

    (base + cjk) as u32
}

/// Estimate token count with a per-model bias
pub fn estimate_tokens_for_model(text: &str, model: &str) -> u32 {
    apply_model_bias(estimate_tokens(text), model)
}

/// Claude tokenizers typically produce slightly fewer tokens than the
/// GPT family for the same text; apply a 0.95 factor for `claude*` models.
fn apply_model_bias(count: u32, model: &str) -> u32 {
    if model.starts_with("claude") {
        (count as f64 * 0.95) as u32
    } else {
        count
    }
}

/// Estimate tokens for a single message `content` value
///
/// String content is counted directly. List-of-parts content contributes its
/// text parts plus a fixed charge per image part; unknown part types count 0.
pub fn estimate_content_tokens(content: &serde_json::Value) -> u32 {
    match content {
        serde_json::Value::String(text) => estimate_tokens(text),
        serde_json::Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("type").and_then(|t| t.as_str()) {
                Some("text") => part
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(estimate_tokens)
                    .unwrap_or(0),
                Some("image") | Some("image_url") => IMAGE_PART_TOKENS,
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Estimate total tokens across a message list (text parts only for lists)
pub fn estimate_messages_tokens(messages: &[serde_json::Value]) -> u32 {
    messages
        .iter()
        .filter_map(|msg| msg.get("content"))
        .map(estimate_content_tokens)
        .sum()
}

/// Message-list estimate with the per-model bias applied
pub fn estimate_messages_tokens_for_model(messages: &[serde_json::Value], model: &str) -> u32 {
    apply_model_bias(estimate_messages_tokens(messages), model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_text() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_words_and_punctuation() {
        // "Hello" "," "world" "!" = 4 units
        assert_eq!(estimate_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_cjk_codepoints() {
        let count = estimate_tokens("你好");
        assert!(count >= 2, "CJK text must count at least one per codepoint");
    }

    #[test]
    fn test_claude_bias() {
        let text = "The quick brown fox jumps over the lazy dog repeatedly";
        let gpt = estimate_tokens_for_model(text, "gpt-4");
        let claude = estimate_tokens_for_model(text, "claude-3-opus-20240229");
        assert!(claude <= gpt);
        assert_eq!(gpt, estimate_tokens(text));
    }

    #[test]
    fn test_multimodal_content() {
        let content = json!([
            {"type": "text", "text": "describe this"},
            {"type": "image_url", "image_url": {"url": "data:image/png;base64,xxx"}}
        ]);
        let count = estimate_content_tokens(&content);
        assert_eq!(count, estimate_tokens("describe this") + IMAGE_PART_TOKENS);
    }

    #[test]
    fn test_messages_total() {
        let messages = vec![
            json!({"role": "system", "content": "Be terse."}),
            json!({"role": "user", "content": "Ping"}),
        ];
        let total = estimate_messages_tokens(&messages);
        assert_eq!(total, estimate_tokens("Be terse.") + estimate_tokens("Ping"));
    }

    #[test]
    fn test_biased_messages_total_never_exceeds_plain() {
        let messages = vec![json!({"role": "user", "content": "A reasonably long sentence here"})];
        let plain = estimate_messages_tokens(&messages);
        let biased = estimate_messages_tokens_for_model(&messages, "claude-3-opus-20240229");
        assert!(biased <= plain);
    }
}
