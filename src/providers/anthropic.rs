//! Anthropic-compatible upstream client
//!
//! Speaks the Messages dialect. Usage is reported as
//! `input_tokens`/`output_tokens` and is normalized to the uniform shape for
//! telemetry; the native fields stay untouched in the stored raw response.

use super::{http_error, sse_json_stream, ChunkStream, EndpointKind, Provider, ProviderError, Usage};
use crate::translation::Dialect;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// API version header Anthropic requires on every call
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, api_key: String, base_url: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn with_stream_flag(request: &Value, stream: bool) -> Value {
        let mut body = request.clone();
        body["stream"] = Value::Bool(stream);
        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn dialect(&self) -> Dialect {
        Dialect::Anthropic
    }

    fn default_endpoint_url(&self, kind: EndpointKind) -> String {
        match kind {
            EndpointKind::Messages => format!("{}/messages", self.base_url),
            // Requests arriving in chat/completions shape are translated
            // before the upstream call, so both kinds land on messages.
            EndpointKind::ChatCompletions => format!("{}/messages", self.base_url),
        }
    }

    fn redacted_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("x-api-key".to_string(), "[redacted]".to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }

    async fn send_buffered(&self, request: &Value) -> Result<Value, ProviderError> {
        let url = self.default_endpoint_url(EndpointKind::Messages);
        let body = Self::with_stream_flag(request, false);

        let response = self.request_builder(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        response.json::<Value>().await.map_err(Into::into)
    }

    async fn send_streaming(&self, request: &Value) -> Result<ChunkStream, ProviderError> {
        let url = self.default_endpoint_url(EndpointKind::Messages);
        let body = Self::with_stream_flag(request, true);

        let response = self.request_builder(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(sse_json_stream(response))
    }

    fn parse_usage(&self, response: &Value) -> Option<Usage> {
        let usage = response.get("usage")?;
        let input = usage.get("input_tokens").and_then(|v| v.as_u64())?;
        let output = usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Some(Usage::new(input, output))
    }

    fn parse_cache_info(&self, response: &Value) -> Option<Value> {
        let usage = response.get("usage")?;
        let cached = usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())?;
        let input = usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        // Cache reads are billed separately from fresh input, so the prompt
        // total is their sum.
        let prompt_total = input + cached;
        let hit_rate = if prompt_total > 0 {
            cached as f64 / prompt_total as f64
        } else {
            0.0
        };

        Some(serde_json::json!({
            "cached_tokens": cached,
            "cache_hit_rate": hit_rate,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(reqwest::Client::new(), "sk-ant-test".into(), None)
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            provider().default_endpoint_url(EndpointKind::Messages),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn test_usage_normalization() {
        let response = json!({
            "usage": {"input_tokens": 8, "output_tokens": 3}
        });
        let usage = provider().parse_usage(&response).unwrap();
        assert_eq!(usage.prompt_tokens, 8);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 11);
    }

    #[test]
    fn test_cache_info_from_cache_read_tokens() {
        let response = json!({
            "usage": {
                "input_tokens": 60,
                "output_tokens": 10,
                "cache_read_input_tokens": 40
            }
        });
        let info = provider().parse_cache_info(&response).unwrap();
        assert_eq!(info["cached_tokens"], 40);
        assert!((info["cache_hit_rate"].as_f64().unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_no_cache_info_without_field() {
        let response = json!({"usage": {"input_tokens": 5, "output_tokens": 1}});
        assert!(provider().parse_cache_info(&response).is_none());
    }

    #[test]
    fn test_headers_are_redacted() {
        let headers = provider().redacted_headers();
        assert_eq!(headers["x-api-key"], "[redacted]");
    }

    #[test]
    fn test_estimate_cost_for_claude_model() {
        let usage = Usage::new(1000, 500);
        let cost = provider().estimate_cost(&usage, "claude-3-haiku-20240307");
        // 1.0 * 0.00025 + 0.5 * 0.00125 = 0.000875
        assert!((cost - 0.000875).abs() < 1e-9);
    }
}
