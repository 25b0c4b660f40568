//! API dialect translation - bidirectional conversion between protocols
//!
//! The gateway speaks two dialects (OpenAI Chat Completions and Anthropic
//! Messages) on both its client and upstream sides. When they differ, these
//! modules rewrite bodies in flight:
//!
//! ```text
//! Client request (client dialect)
//!     ↓ request::*            - before the upstream call
//! [upstream call in provider dialect]
//!     ↓ response::* / stream::* - buffered body or per-chunk
//! Client response (client dialect)
//! ```
//!
//! Translators are pure functions over JSON bodies. Streaming translation is
//! strictly chunk-to-chunk with no cross-chunk state; aggregation for
//! logging lives in the request pipeline, not here.

pub mod request;
pub mod response;
pub mod stream;

use serde_json::{json, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Dialects
// ─────────────────────────────────────────────────────────────────────────────

/// Supported API dialect identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// OpenAI Chat Completions API (`/v1/chat/completions`)
    OpenAi,
    /// Anthropic Messages API (`/v1/messages`)
    Anthropic,
}

impl Dialect {
    /// Canonical endpoint path for this dialect
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "/v1/chat/completions",
            Dialect::Anthropic => "/v1/messages",
        }
    }

    /// Endpoint name as recorded in telemetry
    pub fn endpoint_name(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "chat/completions",
            Dialect::Anthropic => "messages",
        }
    }

    /// Human-readable name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "OpenAI",
            Dialect::Anthropic => "Anthropic",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translation mode
// ─────────────────────────────────────────────────────────────────────────────

/// How a request/response pair must be rewritten between client and provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    /// Client and provider share a dialect; bodies pass through untouched
    Passthrough,
    /// OpenAI client, Anthropic provider
    OpenAiToAnthropic,
    /// Anthropic client, OpenAI provider
    AnthropicToOpenAi,
}

impl TranslateMode {
    /// Decide the mode from the two endpoint dialects
    pub fn for_dialects(client: Dialect, provider: Dialect) -> Self {
        match (client, provider) {
            (Dialect::OpenAi, Dialect::Anthropic) => TranslateMode::OpenAiToAnthropic,
            (Dialect::Anthropic, Dialect::OpenAi) => TranslateMode::AnthropicToOpenAi,
            _ => TranslateMode::Passthrough,
        }
    }

}

// ─────────────────────────────────────────────────────────────────────────────
// Error envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// Build an error body in the given dialect's vocabulary
pub fn error_envelope(dialect: Dialect, message: &str) -> Value {
    match dialect {
        Dialect::Anthropic => json!({
            "type": "error",
            "error": { "type": "api_error", "message": message }
        }),
        Dialect::OpenAi => json!({
            "error": { "message": message, "type": "api_error" }
        }),
    }
}

/// Pull a human-readable message out of an error body in either dialect
pub fn extract_error_message(body: &Value) -> Option<String> {
    // Anthropic: {"type":"error","error":{"type":..,"message":..}}
    // OpenAI:    {"error":{"message":..}} or {"error":"..."}
    match body.get("error") {
        Some(Value::Object(err)) => err
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from),
        Some(Value::String(msg)) => Some(msg.clone()),
        _ => None,
    }
}

/// Re-wrap an upstream error body into the client's dialect
///
/// Clients must only ever see their own vocabulary; if the body carries no
/// recognizable message, its compact serialization becomes the message.
pub fn translate_error_body(body: &Value, target: Dialect) -> Value {
    let message = extract_error_message(body).unwrap_or_else(|| body.to_string());
    error_envelope(target, &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_for_dialects() {
        assert_eq!(
            TranslateMode::for_dialects(Dialect::OpenAi, Dialect::OpenAi),
            TranslateMode::Passthrough
        );
        assert_eq!(
            TranslateMode::for_dialects(Dialect::Anthropic, Dialect::Anthropic),
            TranslateMode::Passthrough
        );
        assert_eq!(
            TranslateMode::for_dialects(Dialect::OpenAi, Dialect::Anthropic),
            TranslateMode::OpenAiToAnthropic
        );
        assert_eq!(
            TranslateMode::for_dialects(Dialect::Anthropic, Dialect::OpenAi),
            TranslateMode::AnthropicToOpenAi
        );
    }

    #[test]
    fn test_endpoint_paths() {
        assert_eq!(Dialect::OpenAi.endpoint_path(), "/v1/chat/completions");
        assert_eq!(Dialect::Anthropic.endpoint_path(), "/v1/messages");
    }

    #[test]
    fn test_error_envelope_shapes() {
        let anthropic = error_envelope(Dialect::Anthropic, "boom");
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["message"], "boom");

        let openai = error_envelope(Dialect::OpenAi, "boom");
        assert_eq!(openai["error"]["message"], "boom");
    }

    #[test]
    fn test_error_body_round_trips_between_dialects() {
        let upstream = error_envelope(Dialect::Anthropic, "invalid x-api-key");
        let for_client = translate_error_body(&upstream, Dialect::OpenAi);
        assert_eq!(for_client["error"]["message"], "invalid x-api-key");

        let back = translate_error_body(&for_client, Dialect::Anthropic);
        assert_eq!(back["error"]["message"], "invalid x-api-key");
        assert_eq!(back["type"], "error");
    }

    #[test]
    fn test_unrecognized_error_body_is_preserved_as_message() {
        let odd = serde_json::json!({"detail": "not found"});
        let wrapped = translate_error_body(&odd, Dialect::OpenAi);
        assert!(wrapped["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not found"));
    }
}
