//! Request pipeline - one client call, one upstream call, one log record
//!
//! Orchestrates routing, dialect translation, the upstream call, timing,
//! cache estimation, and telemetry assembly for both the buffered and the
//! streaming paths.
//!
//! # Streaming
//!
//! ```text
//! upstream chunks ──→ pump task ──→ mpsc(1) ──→ client Body
//!                       │
//!                       ├─ record_token() per chunk
//!                       ├─ translate per chunk (pure)
//!                       ├─ aggregate text + running usage
//!                       └─ on settle: build CallLog, enqueue
//! ```
//!
//! The channel has capacity one, so the client sees chunks in arrival order
//! with no buffering beyond a single frame. A failed channel send means the
//! client went away; dropping the upstream stream cancels the call, and the
//! log is still written with whatever was observed.

use super::error::{GatewayError, GatewayErrorKind};
use super::GatewayState;
use crate::perf::PerformanceTracker;
use crate::providers::{ChunkStream, EndpointKind, ProviderError, Usage};
use crate::router::Route;
use crate::telemetry::{generate_request_id, CacheAnalysis, CallLog, EstimatedAnalysis};
use crate::translation::{self, stream, Dialect, TranslateMode};
use axum::{
    body::{Body, Bytes},
    http::{Request, Response},
    response::IntoResponse,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Everything captured from the client's HTTP request for the raw record
#[derive(Debug, Clone, Default)]
struct HttpContext {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    client_addr: Option<String>,
    user_agent: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

/// Per-call state threaded through the pipeline
struct CallContext {
    state: GatewayState,
    client_dialect: Dialect,
    route: Route,
    request_id: String,
    tracker: PerformanceTracker,
    http: HttpContext,
    /// Client request body, in the client's dialect
    request_body: Value,
    /// Request body after translation, in the provider's dialect
    upstream_request: Value,
    model: String,
}

/// Entry point used by the endpoint handlers
pub async fn handle_call(
    state: GatewayState,
    client_dialect: Dialect,
    addr: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    match dispatch(state, client_dialect, addr, req).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn dispatch(
    state: GatewayState,
    client_dialect: Dialect,
    addr: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let (parts, body) = req.into_parts();

    let body_bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| GatewayError::bad_request(client_dialect, format!("Failed to read request body: {e}")))?;

    let request_body: Value = serde_json::from_slice(&body_bytes)
        .map_err(|_| GatewayError::bad_request(client_dialect, "Malformed JSON body"))?;

    let model = request_body
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| GatewayError::bad_request(client_dialect, "Model is required"))?
        .to_string();

    // Nothing has happened upstream yet, so routing failures produce no log
    let route = state
        .registry
        .route(&model, client_dialect)
        .map_err(|e| GatewayError::no_provider(client_dialect, e.to_string()))?;

    let request_id = generate_request_id();

    if let Some(messages) = request_body.get("messages").and_then(|m| m.as_array()) {
        tracing::debug!(
            "Request {} -> provider '{}': {} message(s), ~{} prompt tokens",
            request_id,
            route.provider_name,
            messages.len(),
            crate::tokens::estimate_messages_tokens_for_model(messages, &model),
        );
    }

    let mut tracker = PerformanceTracker::new();
    tracker.start();

    let upstream_request = match route.mode {
        TranslateMode::Passthrough => request_body.clone(),
        TranslateMode::OpenAiToAnthropic => translation::request::openai_to_anthropic(&request_body)
            .map_err(|e| GatewayError::bad_request(client_dialect, e.to_string()))?,
        TranslateMode::AnthropicToOpenAi => translation::request::anthropic_to_openai(&request_body)
            .map_err(|e| GatewayError::bad_request(client_dialect, e.to_string()))?,
    };

    let streaming = request_body
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    let ctx = CallContext {
        state,
        client_dialect,
        route,
        request_id,
        tracker,
        http: capture_http_context(&parts, addr),
        request_body,
        upstream_request,
        model,
    };

    if streaming {
        handle_streaming(ctx).await
    } else {
        handle_buffered(ctx).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffered path
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_buffered(ctx: CallContext) -> Result<Response<Body>, GatewayError> {
    let provider = ctx.route.provider.clone();

    let upstream_response = match provider.send_buffered(&ctx.upstream_request).await {
        Ok(response) => response,
        Err(error) => {
            let gateway_error = GatewayError::from_provider(ctx.client_dialect, error);
            enqueue_log(&ctx.state, build_failure_log(&ctx, &gateway_error));
            return Err(gateway_error);
        }
    };

    let perf = if ctx.state.config.analysis.enable_performance_tracking {
        ctx.tracker.non_streaming_metrics()
    } else {
        Default::default()
    };
    let cache = estimate_cache(&ctx.state, &ctx.request_body);

    let usage = provider.parse_usage(&upstream_response);
    let estimated_cost_usd = usage
        .map(|u| provider.estimate_cost(&u, &ctx.model))
        .unwrap_or(0.0);

    let mut log = build_log_base(&ctx);
    let serialized_len = upstream_response.to_string().len() as u64;
    log.raw.raw_response = upstream_response.clone();
    log.raw.response_status = Some(200);
    log.raw.response_headers =
        HashMap::from([("content-type".to_string(), "application/json".to_string())]);
    log.raw.response_size_bytes = Some(serialized_len);
    log.raw.upstream_status = Some(200);
    log.raw.extracted_usage = usage.map(|u| serde_json::to_value(u).unwrap_or(Value::Null));
    log.raw.extracted_cache_info = provider.parse_cache_info(&upstream_response);
    log.estimated = EstimatedAnalysis {
        perf,
        cache,
        estimated_cost_usd,
        analysis_timestamp: Utc::now(),
    };

    // The raw log keeps the upstream-native body; only the client sees the
    // translated one.
    let client_body = match ctx.route.mode {
        TranslateMode::Passthrough => upstream_response,
        TranslateMode::OpenAiToAnthropic => {
            translation::response::anthropic_to_openai(&upstream_response)
                .map_err(|e| translation_failure(&ctx, &mut log, e))?
        }
        TranslateMode::AnthropicToOpenAi => {
            translation::response::openai_to_anthropic(&upstream_response)
                .map_err(|e| translation_failure(&ctx, &mut log, e))?
        }
    };

    enqueue_log(&ctx.state, log);

    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(Body::from(client_body.to_string()))
        .map_err(|e| GatewayError::internal(ctx.client_dialect, e.to_string()))
}

/// Mark the log failed and build the protocol error for an untranslatable
/// upstream body. The log is enqueued here because the caller returns early.
fn translation_failure(ctx: &CallContext, log: &mut CallLog, error: anyhow::Error) -> GatewayError {
    log.success = false;
    log.error_message = Some(format!("response translation failed: {error}"));
    enqueue_log(&ctx.state, log.clone());

    GatewayError {
        dialect: ctx.client_dialect,
        kind: GatewayErrorKind::Protocol(error.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming path
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_streaming(mut ctx: CallContext) -> Result<Response<Body>, GatewayError> {
    let provider = ctx.route.provider.clone();

    let mut upstream = match provider.send_streaming(&ctx.upstream_request).await {
        Ok(stream) => stream,
        Err(error) => {
            let gateway_error = GatewayError::from_provider(ctx.client_dialect, error);
            enqueue_log(&ctx.state, build_failure_log(&ctx, &gateway_error));
            return Err(gateway_error);
        }
    };

    // Peek one item so failures before any chunk surface as plain HTTP
    // errors instead of a 200 with an error event.
    let first = match upstream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(error)) => {
            let gateway_error = GatewayError::from_provider(ctx.client_dialect, error);
            enqueue_log(&ctx.state, build_failure_log(&ctx, &gateway_error));
            return Err(gateway_error);
        }
        None => None,
    };

    // Capacity 1: the client sees chunks in arrival order and nothing is
    // buffered beyond the frame in flight.
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(1);
    let client_dialect = ctx.client_dialect;

    tokio::spawn(async move {
        pump_stream(&mut ctx, first, upstream, tx).await;
    });

    Response::builder()
        .status(200)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| GatewayError::internal(client_dialect, e.to_string()))
}

/// Outcome of a stream pump, for telemetry
#[derive(Default)]
struct StreamAggregate {
    text: String,
    usage: stream::StreamUsage,
    stop_reason: Option<String>,
    upstream_error: Option<String>,
    client_disconnected: bool,
}

async fn pump_stream(
    ctx: &mut CallContext,
    first: Option<Value>,
    mut upstream: ChunkStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let provider_dialect = ctx.route.provider.dialect();
    let mut agg = StreamAggregate::default();
    let mut pending = first;

    loop {
        let item = match pending.take() {
            Some(chunk) => Some(Ok(chunk)),
            None => upstream.next().await,
        };
        let Some(item) = item else {
            break; // clean upstream end
        };

        match item {
            Ok(chunk) => {
                ctx.tracker.record_token();

                if let Some(text) = stream::chunk_text(&chunk, provider_dialect) {
                    agg.text.push_str(&text);
                }
                agg.usage.update(&chunk, provider_dialect);
                if let Some(reason) = stream::chunk_stop_reason(&chunk, provider_dialect) {
                    agg.stop_reason = Some(reason);
                }

                if let Some(downstream) = stream::translate_chunk(&chunk, ctx.route.mode) {
                    let frame = format!("data: {downstream}\n\n");
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        agg.client_disconnected = true;
                        tracing::debug!(
                            "Request {}: {}",
                            ctx.request_id,
                            ProviderError::Canceled
                        );
                        break;
                    }
                }
            }
            Err(error) => {
                let message = error.to_string();
                let frame = mid_stream_error_frame(ctx.client_dialect, &message);
                let _ = tx.send(Ok(Bytes::from(frame))).await;
                agg.upstream_error = Some(message);
                break;
            }
        }
    }

    if agg.upstream_error.is_none() && !agg.client_disconnected {
        let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
    }

    // Dropping the stream tears down the upstream connection on cancel
    drop(upstream);
    drop(tx);

    finalize_stream_log(ctx, agg);
}

/// Build and enqueue the CallLog once the stream settles (complete, client
/// gone, or upstream failed). Telemetry writing stays off the response path.
fn finalize_stream_log(ctx: &CallContext, agg: StreamAggregate) {
    let observed = ctx.tracker.observed_chunks();
    let perf = if ctx.state.config.analysis.enable_performance_tracking {
        ctx.tracker.streaming_metrics(observed)
    } else {
        Default::default()
    };
    let cache = estimate_cache(&ctx.state, &ctx.request_body);

    let provider_dialect = ctx.route.provider.dialect();
    let synthesized = synthesize_stream_response(
        provider_dialect,
        &ctx.model,
        &agg.text,
        agg.usage,
        agg.stop_reason.as_deref(),
    );

    let usage = match (agg.usage.input_tokens, agg.usage.output_tokens) {
        (None, None) => None,
        (input, output) => Some(Usage::new(input.unwrap_or(0), output.unwrap_or(0))),
    };
    let estimated_cost_usd = usage
        .map(|u| ctx.route.provider.estimate_cost(&u, &ctx.model))
        .unwrap_or(0.0);

    let mut log = build_log_base(ctx);
    log.raw.raw_response = synthesized;
    log.raw.response_status = Some(200);
    log.raw.response_headers = HashMap::from([(
        "content-type".to_string(),
        "text/event-stream".to_string(),
    )]);
    log.raw.upstream_status = Some(200);
    log.raw.extracted_usage = usage.map(|u| serde_json::to_value(u).unwrap_or(Value::Null));
    log.estimated = EstimatedAnalysis {
        perf,
        cache,
        estimated_cost_usd,
        analysis_timestamp: Utc::now(),
    };

    // Client disconnect is a successful partial call; an upstream error is not
    if let Some(message) = agg.upstream_error {
        log.success = false;
        log.error_message = Some(message);
    }

    enqueue_log(&ctx.state, log);
}

/// Mid-stream error event in the client's dialect, framed for the SSE wire
fn mid_stream_error_frame(dialect: Dialect, message: &str) -> String {
    let payload = match dialect {
        Dialect::Anthropic => json!({
            "type": "error",
            "error": { "type": "api_error", "message": message }
        }),
        Dialect::OpenAi => json!({ "error": message }),
    };
    format!("data: {payload}\n\n")
}

/// Reassemble a non-stream-shaped response from stream aggregates, in the
/// provider's native dialect. For logging only; the client already got the
/// chunks.
fn synthesize_stream_response(
    provider_dialect: Dialect,
    model: &str,
    text: &str,
    usage: stream::StreamUsage,
    stop_reason: Option<&str>,
) -> Value {
    match provider_dialect {
        Dialect::Anthropic => {
            let mut out = json!({
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [{ "type": "text", "text": text }],
                "stop_reason": stop_reason,
                "_note": "Assembled from SSE stream",
            });
            if usage.input_tokens.is_some() || usage.output_tokens.is_some() {
                out["usage"] = json!({
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                });
            }
            out
        }
        Dialect::OpenAi => {
            let mut out = json!({
                "object": "chat.completion",
                "model": model,
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": text },
                    "finish_reason": stop_reason,
                }],
                "_note": "Assembled from SSE stream",
            });
            if let (Some(input), Some(output)) = (usage.input_tokens, usage.output_tokens) {
                out["usage"] = json!({
                    "prompt_tokens": input,
                    "completion_tokens": output,
                    "total_tokens": input + output,
                });
            }
            out
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Log assembly
// ─────────────────────────────────────────────────────────────────────────────

fn build_log_base(ctx: &CallContext) -> CallLog {
    let mut log = CallLog::new(
        ctx.request_id.clone(),
        ctx.route.provider_name.clone(),
        ctx.model.clone(),
        ctx.client_dialect.endpoint_name().to_string(),
    );

    log.raw.request_method = ctx.http.method.clone();
    log.raw.request_url = ctx.http.url.clone();
    log.raw.request_headers = ctx.http.headers.clone();
    log.raw.request_query = ctx.http.query.clone();
    log.raw.raw_request = ctx.request_body.clone();
    log.raw.client_addr = ctx.http.client_addr.clone();
    log.raw.user_agent = ctx.http.user_agent.clone();

    let endpoint_kind = match ctx.route.provider.dialect() {
        Dialect::Anthropic => EndpointKind::Messages,
        Dialect::OpenAi => EndpointKind::ChatCompletions,
    };
    log.raw.upstream_url = Some(ctx.route.provider.default_endpoint_url(endpoint_kind));
    log.raw.upstream_request_headers = ctx.route.provider.redacted_headers();

    log.proxy_used = ctx.state.config.proxy.label();
    log.user_id = ctx.http.user_id.clone();
    log.session_id = ctx.http.session_id.clone();

    log
}

/// Failure log per the error matrix: upstream status/body captured when
/// present, estimates still attempted, cost zero.
fn build_failure_log(ctx: &CallContext, error: &GatewayError) -> CallLog {
    let mut log = build_log_base(ctx);
    log.success = false;
    log.error_message = Some(error.log_message());

    if let GatewayErrorKind::Upstream { status, body } = &error.kind {
        log.raw.response_status = Some(*status);
        log.raw.upstream_status = Some(*status);
        log.raw.raw_response = body.clone();
    }

    log.estimated = EstimatedAnalysis {
        perf: if ctx.state.config.analysis.enable_performance_tracking {
            ctx.tracker.non_streaming_metrics()
        } else {
            Default::default()
        },
        cache: estimate_cache(&ctx.state, &ctx.request_body),
        estimated_cost_usd: 0.0,
        analysis_timestamp: Utc::now(),
    };

    log
}

fn estimate_cache(state: &GatewayState, request_body: &Value) -> CacheAnalysis {
    if !state.config.analysis.enable_cache_estimation {
        return CacheAnalysis::default();
    }

    let messages: Vec<Value> = request_body
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    state.cache_estimator.estimate(&messages)
}

fn enqueue_log(state: &GatewayState, log: CallLog) {
    if let Some(store) = &state.telemetry {
        store.record(log);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP context capture
// ─────────────────────────────────────────────────────────────────────────────

fn capture_http_context(parts: &axum::http::request::Parts, addr: SocketAddr) -> HttpContext {
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            let value = value.to_str().ok()?;
            // Credentials are hashed for identity, never stored in the clear
            let stored = if name == "authorization" || name == "x-api-key" {
                "[redacted]".to_string()
            } else {
                value.to_string()
            };
            Some((name, stored))
        })
        .collect();

    HttpContext {
        method: parts.method.to_string(),
        url: parts.uri.to_string(),
        query: parts.uri.query().map(parse_query).unwrap_or_default(),
        client_addr: Some(addr.to_string()),
        user_agent: headers.get("user-agent").cloned(),
        user_id: extract_user_id(&parts.headers),
        session_id: headers.get("x-session-id").cloned(),
        headers,
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Stable user identity from the API key hash (never the key itself)
fn extract_user_id(headers: &axum::http::HeaderMap) -> Option<String> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .filter(|s| s.starts_with("Bearer "))
                .map(|s| s[7..].to_string())
        })?;

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    Some(format!("{:x}", hash)[..16].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let query = parse_query("a=1&b=two&flag");
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "two");
        assert_eq!(query["flag"], "");
    }

    #[test]
    fn test_mid_stream_error_frames() {
        let anthropic = mid_stream_error_frame(Dialect::Anthropic, "boom");
        assert!(anthropic.starts_with("data: "));
        assert!(anthropic.ends_with("\n\n"));
        let payload: Value =
            serde_json::from_str(anthropic.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(payload["type"], "error");
        assert_eq!(payload["error"]["type"], "api_error");
        assert_eq!(payload["error"]["message"], "boom");

        let openai = mid_stream_error_frame(Dialect::OpenAi, "boom");
        let payload: Value =
            serde_json::from_str(openai.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(payload["error"], "boom");
    }

    #[test]
    fn test_synthesize_anthropic_stream_response() {
        let mut usage = stream::StreamUsage::default();
        usage.input_tokens = Some(10);
        usage.output_tokens = Some(3);

        let out = synthesize_stream_response(
            Dialect::Anthropic,
            "claude-3-haiku-20240307",
            "ABC",
            usage,
            Some("end_turn"),
        );
        assert_eq!(out["type"], "message");
        assert_eq!(out["content"][0]["text"], "ABC");
        assert_eq!(out["usage"]["input_tokens"], 10);
        assert_eq!(out["stop_reason"], "end_turn");
    }

    #[test]
    fn test_synthesize_openai_stream_response_without_usage() {
        let out = synthesize_stream_response(
            Dialect::OpenAi,
            "gpt-4",
            "partial",
            stream::StreamUsage::default(),
            None,
        );
        assert_eq!(out["object"], "chat.completion");
        assert_eq!(out["choices"][0]["message"]["content"], "partial");
        assert!(out.get("usage").is_none());
    }

    #[test]
    fn test_extract_user_id_is_a_hash() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-api-key", "sk-secret-key".parse().unwrap());

        let id = extract_user_id(&headers).unwrap();
        assert_eq!(id.len(), 16);
        assert!(!id.contains("secret"));

        // Same key, same identity
        assert_eq!(extract_user_id(&headers).unwrap(), id);
    }

    #[test]
    fn test_extract_user_id_from_bearer() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("authorization", "Bearer tok-123".parse().unwrap());
        assert!(extract_user_id(&headers).is_some());

        let mut basic = axum::http::HeaderMap::new();
        basic.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(extract_user_id(&basic).is_none());
    }
}
