//! Gateway error types and HTTP response mapping
//!
//! Every error a handler can surface carries the client's dialect so the
//! response body is always in the vocabulary that client speaks. Upstream
//! HTTP errors mirror the upstream status; everything transport-level maps
//! to 502.

use crate::providers::ProviderError;
use crate::translation::{error_envelope, translate_error_body, Dialect};
use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

/// An error response bound for a specific client
#[derive(Debug)]
pub struct GatewayError {
    pub dialect: Dialect,
    pub kind: GatewayErrorKind,
}

#[derive(Debug)]
pub enum GatewayErrorKind {
    /// Missing `model`, malformed body, untranslatable request
    BadRequest(String),
    /// Router could not resolve the model to a provider
    NoProvider(String),
    /// Upstream returned non-2xx; status is mirrored to the client
    Upstream { status: u16, body: serde_json::Value },
    /// Connect failure or timeout talking upstream
    Network(String),
    /// Upstream response/stream could not be decoded
    Protocol(String),
    /// Anything that should never happen
    Internal(String),
}

impl GatewayError {
    pub fn bad_request(dialect: Dialect, message: impl Into<String>) -> Self {
        Self {
            dialect,
            kind: GatewayErrorKind::BadRequest(message.into()),
        }
    }

    pub fn no_provider(dialect: Dialect, message: impl Into<String>) -> Self {
        Self {
            dialect,
            kind: GatewayErrorKind::NoProvider(message.into()),
        }
    }

    pub fn internal(dialect: Dialect, message: impl Into<String>) -> Self {
        Self {
            dialect,
            kind: GatewayErrorKind::Internal(message.into()),
        }
    }

    /// Map a provider error onto the client-facing surface
    pub fn from_provider(dialect: Dialect, error: ProviderError) -> Self {
        let kind = match error {
            ProviderError::Http { status, body } => GatewayErrorKind::Upstream { status, body },
            ProviderError::Network(msg) => GatewayErrorKind::Network(msg),
            ProviderError::Protocol(msg) => GatewayErrorKind::Protocol(msg),
            ProviderError::Canceled => GatewayErrorKind::Network("upstream call canceled".into()),
        };
        Self { dialect, kind }
    }

    /// Message recorded in the CallLog for this error
    pub fn log_message(&self) -> String {
        match &self.kind {
            GatewayErrorKind::BadRequest(m) => m.clone(),
            GatewayErrorKind::NoProvider(m) => m.clone(),
            GatewayErrorKind::Upstream { status, body } => {
                match crate::translation::extract_error_message(body) {
                    Some(msg) => format!("upstream returned HTTP {status}: {msg}"),
                    None => format!("upstream returned HTTP {status}"),
                }
            }
            GatewayErrorKind::Network(m) => format!("upstream network error: {m}"),
            GatewayErrorKind::Protocol(m) => format!("malformed upstream response: {m}"),
            GatewayErrorKind::Internal(m) => m.clone(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let (status, body) = match &self.kind {
            GatewayErrorKind::BadRequest(msg) | GatewayErrorKind::NoProvider(msg) => (
                StatusCode::BAD_REQUEST,
                error_envelope(self.dialect, msg),
            ),
            GatewayErrorKind::Upstream { status, body } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                translate_error_body(body, self.dialect),
            ),
            GatewayErrorKind::Network(msg) => (
                StatusCode::BAD_GATEWAY,
                error_envelope(self.dialect, msg),
            ),
            GatewayErrorKind::Protocol(msg) => (
                StatusCode::BAD_GATEWAY,
                error_envelope(self.dialect, msg),
            ),
            GatewayErrorKind::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_envelope(self.dialect, msg),
            ),
        };

        tracing::error!("Gateway error: {} - {}", status, self.log_message());

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
