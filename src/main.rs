// crossgate - transparent LLM API gateway with dual-track telemetry
//
// Sits between client applications and upstream LLM providers (OpenAI- and
// Anthropic-compatible), translating request/response dialects in flight and
// recording one telemetry record per call to an embedded analytical database.
//
// Architecture:
// - Server (axum): client endpoints, request pipeline, streaming passthrough
// - Providers (reqwest): uniform interface over upstream endpoints
// - Translation: pure bidirectional dialect conversion, per-chunk for streams
// - Analysis: token/cost/cache/latency estimation alongside upstream truth
// - Telemetry (DuckDB): append-only dual-track schema + analytics views

mod cache;
mod cli;
mod config;
mod gui;
mod perf;
mod pricing;
mod providers;
mod router;
mod server;
mod startup;
mod telemetry;
mod tokens;
mod translation;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Precedence: RUST_LOG env var > config file level > "info".
    // The viewer stays quiet so log lines never garble the alternate screen.
    let default_level = match &cli.command {
        cli::Commands::Gui { .. } => "error".to_string(),
        cli::Commands::Server { config, .. } => config::Config::load(config.as_deref())
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
        _ => "info".to_string(),
    };
    let default_filter = format!("crossgate={default_level},tower_http=debug,axum=debug");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = cli::run(cli).await;
    std::process::exit(code);
}
