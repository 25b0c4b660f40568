//! HTTP endpoint handlers
//!
//! The two chat endpoints delegate to the request pipeline with their
//! dialect pinned; the rest are small read-only surfaces over configuration
//! and telemetry.

use super::pipeline;
use super::GatewayState;
use crate::translation::Dialect;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;

/// POST /v1/chat/completions - OpenAI-dialect clients
pub async fn chat_completions(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    pipeline::handle_call(state, Dialect::OpenAi, addr, req).await
}

/// POST /v1/messages - Anthropic-dialect clients
pub async fn messages(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    pipeline::handle_call(state, Dialect::Anthropic, addr, req).await
}

/// GET /v1/models - synthesized from configured providers
pub async fn list_models(State(state): State<GatewayState>) -> Json<Value> {
    let mut models: Vec<Value> = Vec::new();

    for (_, dialect) in state.registry.dialects() {
        match dialect {
            Dialect::OpenAi => {
                models.push(json!({"id": "gpt-4", "object": "model", "owned_by": "openai"}));
                models.push(json!({"id": "gpt-3.5-turbo", "object": "model", "owned_by": "openai"}));
            }
            Dialect::Anthropic => {
                models.push(json!({
                    "id": "claude-3-opus-20240229", "object": "model", "owned_by": "anthropic"
                }));
                models.push(json!({
                    "id": "claude-3-sonnet-20240229", "object": "model", "owned_by": "anthropic"
                }));
            }
        }
    }

    Json(json!({ "data": models }))
}

/// GET /health
pub async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "providers": state.registry.names(),
        "logging_enabled": state.config.logging.enabled,
        "cache_analysis_enabled": state.config.analysis.enable_cache_estimation,
    }))
}

/// GET /stats - snapshot of aggregate telemetry
pub async fn stats(State(state): State<GatewayState>) -> Response {
    let Some(query) = &state.query else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "Logging not enabled"})),
        )
            .into_response();
    };

    let database = query
        .get_database_stats(&state.config.logging.db_path)
        .unwrap_or_else(|e| json!({"error": e.to_string()}));
    let performance = query
        .get_performance_stats(None, None, 7)
        .unwrap_or_else(|e| json!({"error": e.to_string()}));
    let cache_analysis = query
        .get_cache_analysis_summary(7)
        .unwrap_or_else(|e| json!({"error": e.to_string()}));
    let recent_logs = query
        .get_recent_logs(10)
        .unwrap_or_else(|e| vec![json!({"error": e.to_string()})]);

    let writer = state.telemetry.as_ref().map(|t| {
        let m = t.metrics();
        json!({
            "logs_stored": m.logs_stored,
            "logs_dropped": m.logs_dropped,
            "logs_failed": m.logs_failed,
        })
    });

    Json(json!({
        "database": database,
        "performance": performance,
        "cache_analysis": cache_analysis,
        "recent_logs": recent_logs,
        "writer": writer,
        "pricing_version": crate::pricing::PRICING_VERSION,
    }))
    .into_response()
}
