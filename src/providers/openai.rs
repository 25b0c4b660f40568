//! OpenAI-compatible upstream client
//!
//! Speaks the Chat Completions dialect against api.openai.com or any
//! compatible endpoint (a custom `base_url` covers Azure-style gateways and
//! local servers).

use super::{http_error, sse_json_stream, ChunkStream, EndpointKind, Provider, ProviderError, Usage};
use crate::translation::Dialect;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
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
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    /// Force the stream flag without mutating the caller's body
    fn with_stream_flag(request: &Value, stream: bool) -> Value {
        let mut body = request.clone();
        body["stream"] = Value::Bool(stream);
        body
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn dialect(&self) -> Dialect {
        Dialect::OpenAi
    }

    fn default_endpoint_url(&self, kind: EndpointKind) -> String {
        match kind {
            EndpointKind::ChatCompletions => format!("{}/chat/completions", self.base_url),
            // OpenAI-compatible backends have no messages endpoint; requests
            // routed here are translated first, so this points at the same
            // chat surface.
            EndpointKind::Messages => format!("{}/chat/completions", self.base_url),
        }
    }

    fn redacted_headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("authorization".to_string(), "Bearer [redacted]".to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ])
    }

    async fn send_buffered(&self, request: &Value) -> Result<Value, ProviderError> {
        let url = self.default_endpoint_url(EndpointKind::ChatCompletions);
        let body = Self::with_stream_flag(request, false);

        let response = self.request_builder(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        response.json::<Value>().await.map_err(Into::into)
    }

    async fn send_streaming(&self, request: &Value) -> Result<ChunkStream, ProviderError> {
        let url = self.default_endpoint_url(EndpointKind::ChatCompletions);
        let body = Self::with_stream_flag(request, true);

        let response = self.request_builder(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }

        Ok(sse_json_stream(response))
    }

    fn parse_usage(&self, response: &Value) -> Option<Usage> {
        let usage = response.get("usage")?;
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        Some(Usage::new(prompt, completion))
    }

    fn parse_cache_info(&self, response: &Value) -> Option<Value> {
        // Some OpenAI-compatible backends report cached prompt tokens under
        // prompt_tokens_details
        let usage = response.get("usage")?;
        let cached = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64())?;
        let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64())?;

        let hit_rate = if prompt > 0 {
            cached as f64 / prompt as f64
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

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(reqwest::Client::new(), "sk-test".into(), None)
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            provider().default_endpoint_url(EndpointKind::ChatCompletions),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_custom_base_url() {
        let p = OpenAiProvider::new(
            reqwest::Client::new(),
            "sk-test".into(),
            Some("http://localhost:11434/v1".into()),
        );
        assert_eq!(
            p.default_endpoint_url(EndpointKind::ChatCompletions),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_usage() {
        let response = json!({
            "usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}
        });
        let usage = provider().parse_usage(&response).unwrap();
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn test_parse_usage_missing() {
        assert!(provider().parse_usage(&json!({"choices": []})).is_none());
    }

    #[test]
    fn test_parse_cache_info() {
        let response = json!({
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 10,
                "prompt_tokens_details": {"cached_tokens": 40}
            }
        });
        let info = provider().parse_cache_info(&response).unwrap();
        assert_eq!(info["cached_tokens"], 40);
        assert!((info["cache_hit_rate"].as_f64().unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_headers_are_redacted() {
        let headers = provider().redacted_headers();
        assert!(!headers["authorization"].contains("sk-test"));
    }

    #[test]
    fn test_estimate_cost_delegates_to_table() {
        let usage = Usage::new(2, 1);
        let cost = provider().estimate_cost(&usage, "gpt-3.5-turbo");
        assert!((cost - 0.000005).abs() < 1e-9);
    }
}
