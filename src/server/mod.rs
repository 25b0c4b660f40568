//! Gateway HTTP server
//!
//! Axum application exposing the two client endpoints plus models, health,
//! and stats. All cross-request state lives in [`GatewayState`]; everything
//! in it is either read-only after startup or internally synchronized.

pub mod error;
pub mod handlers;
pub mod pipeline;

use crate::cache::CacheEstimator;
use crate::config::Config;
use crate::router::ProviderRegistry;
use crate::telemetry::query::TelemetryQuery;
use crate::telemetry::store::{StoreConfig, TelemetryStore};
use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Shared state for the gateway server
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Configured upstream providers, read-only after startup
    pub registry: Arc<ProviderRegistry>,
    /// Shared cache-reuse estimator (the one stateful hot-path singleton)
    pub cache_estimator: Arc<CacheEstimator>,
    /// Telemetry write handle; None when logging is disabled
    pub telemetry: Option<Arc<TelemetryStore>>,
    /// Telemetry read handle for /stats and the viewer
    pub query: Option<Arc<TelemetryQuery>>,
}

/// A gateway with its listener bound and state built, ready to serve.
///
/// Construction covers everything that can fail at startup (configuration,
/// provider registry, telemetry database, socket bind), so callers can map
/// those errors to a startup exit code and everything after to a runtime one.
pub struct Gateway {
    state: GatewayState,
    listener: TcpListener,
}

impl Gateway {
    pub async fn bind(config: Config) -> Result<Self> {
        let bind_addr = config.server.bind_addr()?;

        let registry = Arc::new(ProviderRegistry::from_config(&config)?);
        if registry.is_empty() {
            tracing::warn!("No providers configured; every call will fail to route");
        }

        let cache_estimator = Arc::new(CacheEstimator::new(config.analysis.cache_tuning));

        let (telemetry, query) = if config.logging.enabled {
            let (store, reader) = TelemetryStore::open(StoreConfig {
                db_path: config.logging.db_path.clone(),
                ..StoreConfig::default()
            })?;
            (
                Some(Arc::new(store)),
                Some(Arc::new(TelemetryQuery::new(reader))),
            )
        } else {
            tracing::info!("Call logging disabled");
            (None, None)
        };

        let state = GatewayState {
            config: Arc::new(config),
            registry,
            cache_estimator,
            telemetry,
            query,
        };

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {bind_addr}"))?;

        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("No local address")
    }

    /// Serve until the shutdown signal fires, then flush telemetry
    pub async fn serve(self, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        let app = Router::new()
            .route(
                crate::translation::Dialect::OpenAi.endpoint_path(),
                post(handlers::chat_completions),
            )
            .route(
                crate::translation::Dialect::Anthropic.endpoint_path(),
                post(handlers::messages),
            )
            .route("/v1/models", get(handlers::list_models))
            .route("/health", get(handlers::health))
            .route("/stats", get(handlers::stats))
            .with_state(self.state.clone());

        tracing::info!("Gateway listening on {}", self.local_addr()?);

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

        // Flush telemetry before reporting a clean exit
        if let Some(store) = &self.state.telemetry {
            store.shutdown();
        }

        tracing::info!("Gateway shut down gracefully");
        Ok(())
    }
}
