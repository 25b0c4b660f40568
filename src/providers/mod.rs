//! Upstream provider clients
//!
//! A provider handle is the gateway's only view of an upstream LLM endpoint:
//! it issues buffered and streaming calls in the provider's native dialect,
//! normalizes usage reporting, and prices calls. Two implementations cover
//! the routed world (OpenAI-compatible, Anthropic-compatible); adding a
//! third dialect means one more module here plus its translator directions,
//! never a conditional chain in the pipeline.

pub mod anthropic;
pub mod openai;

use crate::config::ProxySettings;
use crate::pricing;
use crate::translation::Dialect;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;

/// Lazy sequence of parsed upstream chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, ProviderError>> + Send>>;

/// Errors an upstream call can surface
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Upstream answered with a non-2xx status; body is the parsed error
    /// envelope (or a string wrapper when unparsable)
    #[error("upstream returned HTTP {status}")]
    Http { status: u16, body: Value },

    /// Connect failure, timeout, or transport-level error
    #[error("upstream network error: {0}")]
    Network(String),

    /// The stream arrived but could not be decoded
    #[error("malformed upstream stream: {0}")]
    Protocol(String),

    /// The caller went away before the stream finished
    #[error("upstream call canceled by client disconnect")]
    Canceled,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}

/// Token usage normalized to the OpenAI shape regardless of the reporting
/// dialect. The upstream's native fields stay in the stored raw response.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Which upstream endpoint a URL is being built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ChatCompletions,
    Messages,
}

/// Capability set every upstream exposes to the pipeline
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable dialect tag for routing and logging
    fn dialect(&self) -> Dialect;

    /// Endpoint URL this handle would call for the given kind
    fn default_endpoint_url(&self, kind: EndpointKind) -> String;

    /// Headers sent upstream, with credentials redacted (for telemetry)
    fn redacted_headers(&self) -> std::collections::HashMap<String, String>;

    /// Issue a non-streaming call in the provider's native dialect
    async fn send_buffered(&self, request: &Value) -> Result<Value, ProviderError>;

    /// Issue a streaming call; chunks arrive until the upstream sentinel
    async fn send_streaming(&self, request: &Value) -> Result<ChunkStream, ProviderError>;

    /// Extract token counts from a native response into the uniform shape
    fn parse_usage(&self, response: &Value) -> Option<Usage>;

    /// Upstream-reported cache reuse, when the dialect exposes it
    fn parse_cache_info(&self, _response: &Value) -> Option<Value> {
        None
    }

    /// USD cost for the call; delegates to the canonical pricing table
    fn estimate_cost(&self, usage: &Usage, model: &str) -> f64 {
        pricing::calculate_cost(model, usage.prompt_tokens, usage.completion_tokens)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared HTTP machinery
// ─────────────────────────────────────────────────────────────────────────────

/// Build the pooled HTTP client all calls to one provider share.
///
/// Connections are reused across calls (keepalive); the proxy configuration
/// applies to every request the client makes.
pub fn build_http_client(proxy: &ProxySettings, max_connections: usize) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(proxy.timeout_secs))
        .pool_max_idle_per_host(max_connections);

    if let Some(url) = proxy.active_proxy_url() {
        let mut p = reqwest::Proxy::all(url.as_str())
            .with_context(|| format!("Invalid proxy URL: {url}"))?;
        if let Some((user, pass)) = proxy.basic_auth() {
            p = p.basic_auth(user, pass);
        }
        builder = builder.proxy(p);
    }

    builder.build().context("Failed to create HTTP client")
}

/// Read a non-2xx response into a `ProviderError::Http`, keeping the parsed
/// error envelope when the body is JSON.
pub(crate) async fn http_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
        Err(_) => Value::Null,
    };
    ProviderError::Http { status, body }
}

/// Decode an SSE response body into a stream of JSON chunk objects.
///
/// Lines are reassembled across TCP chunk boundaries; only `data:` payloads
/// are yielded. The OpenAI `[DONE]` sentinel ends the stream without being
/// yielded; Anthropic streams end at EOF.
pub(crate) fn sse_json_stream(response: reqwest::Response) -> ChunkStream {
    use futures::StreamExt;

    Box::pin(async_stream::stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(next) = bytes.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ProviderError::Network(e.to_string()));
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    // "event:" lines and blank separators carry no payload
                    continue;
                };

                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    return;
                }

                match serde_json::from_str::<Value>(data) {
                    Ok(value) => yield Ok(value),
                    Err(e) => {
                        yield Err(ProviderError::Protocol(format!(
                            "undecodable SSE data line: {e}"
                        )));
                        return;
                    }
                }
            }
        }
    })
}
