// CLI module - command-line argument parsing and command handlers
//
// Subcommands:
// - server: start the gateway
// - test:   check proxy/provider connectivity
// - init:   write a configuration template
// - gui:    launch the terminal analytics viewer
//
// Exit codes: 0 success, 1 configuration/startup error, 2 runtime error.

use crate::config::{Config, VERSION};
use crate::{gui, server, startup};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;

/// crossgate - transparent LLM API gateway with call telemetry
#[derive(Parser)]
#[command(name = "crossgate")]
#[command(version = VERSION)]
#[command(about = "Transparent LLM API gateway with dual-track telemetry", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Server {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Test proxy and provider connectivity
    Test {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Write a configuration template
    Init {
        /// Output file path
        #[arg(long, default_value = "crossgate.toml")]
        output: PathBuf,
    },

    /// Launch the terminal analytics viewer
    Gui {
        /// Path to configuration file (for the database location)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Telemetry database path (overrides the config)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Export telemetry to a Parquet file
    Export {
        /// Path to configuration file (for the database location)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Telemetry database path (overrides the config)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Output Parquet file
        #[arg(long, default_value = "crossgate_export.parquet")]
        output: PathBuf,

        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<String>,

        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<String>,

        /// Only rows for this model
        #[arg(long)]
        model: Option<String>,

        /// Only rows for this provider
        #[arg(long)]
        provider: Option<String>,

        /// Only successful calls
        #[arg(long)]
        success_only: bool,
    },
}

/// Dispatch the parsed command; returns the process exit code
pub async fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Server { config, host, port } => run_server(config, host, port).await,
        Commands::Test { config } => run_test(config).await,
        Commands::Init { output } => run_init(output),
        Commands::Gui { config, db } => run_gui(config, db),
        Commands::Export {
            config,
            db,
            output,
            start_date,
            end_date,
            model,
            provider,
            success_only,
        } => run_export(
            config,
            db,
            output,
            crate::telemetry::query::ExportFilters {
                start_date,
                end_date,
                model,
                provider,
                success_only,
            },
        ),
    }
}

async fn run_server(config_path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> i32 {
    let mut config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return EXIT_CONFIG;
        }
    };
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    startup::print_startup(&config);

    let gateway = match server::Gateway::bind(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Error starting server: {e:#}");
            return EXIT_CONFIG;
        }
    };

    // Ctrl+C triggers graceful shutdown (in-flight requests finish,
    // telemetry flushes)
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    match gateway.serve(shutdown_rx).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Server error: {e:#}");
            EXIT_RUNTIME
        }
    }
}

async fn run_test(config_path: Option<PathBuf>) -> i32 {
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let client = match crate::providers::build_http_client(&config.proxy, config.http.max_connections)
    {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error building HTTP client: {e:#}");
            return EXIT_CONFIG;
        }
    };

    let proxy_label = config
        .proxy
        .label()
        .unwrap_or_else(|| "direct".to_string());
    println!("Testing connectivity (proxy: {proxy_label})");

    let test_url = "https://httpbin.org/get";
    let started = std::time::Instant::now();
    match client.get(test_url).send().await {
        Ok(response) => {
            println!(
                "✓ Connectivity test successful ({} in {:.0}ms)",
                response.status(),
                started.elapsed().as_secs_f64() * 1000.0
            );
        }
        Err(e) => {
            println!("✗ Connectivity test failed: {e}");
            return EXIT_RUNTIME;
        }
    }

    if config.providers.is_empty() {
        println!("No providers configured (run `crossgate init` for a template)");
    } else {
        let mut names: Vec<&String> = config.providers.keys().collect();
        names.sort();
        for name in names {
            let settings = &config.providers[name];
            println!(
                "  provider '{}': dialect={:?}, base_url={}",
                name,
                settings.dialect,
                settings.base_url.as_deref().unwrap_or("(default)")
            );
        }
    }

    EXIT_OK
}

fn run_init(output: PathBuf) -> i32 {
    if output.exists() {
        eprintln!("Refusing to overwrite existing file: {}", output.display());
        return EXIT_CONFIG;
    }

    if let Err(e) = std::fs::write(&output, Config::template()) {
        eprintln!("Error writing template: {e}");
        return EXIT_CONFIG;
    }

    println!("Configuration template written to {}", output.display());
    println!("Set OPENAI_API_KEY / ANTHROPIC_API_KEY or edit the file, then run:");
    println!("  crossgate server --config {}", output.display());
    EXIT_OK
}

fn run_gui(config_path: Option<PathBuf>, db: Option<PathBuf>) -> i32 {
    let db_path = match resolve_db_path(config_path, db) {
        Ok(path) => path,
        Err(code) => return code,
    };

    match gui::run_viewer(&db_path) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("Viewer error: {e:#}");
            EXIT_RUNTIME
        }
    }
}

fn run_export(
    config_path: Option<PathBuf>,
    db: Option<PathBuf>,
    output: PathBuf,
    filters: crate::telemetry::query::ExportFilters,
) -> i32 {
    let db_path = match resolve_db_path(config_path, db) {
        Ok(path) => path,
        Err(code) => return code,
    };

    let query = match crate::telemetry::query::open_readonly(&db_path) {
        Ok(conn) => crate::telemetry::query::TelemetryQuery::new(conn),
        Err(e) => {
            eprintln!("Error opening database: {e:#}");
            return EXIT_CONFIG;
        }
    };

    match query.export_parquet(&output, &filters) {
        Ok(()) => {
            println!("Exported telemetry to {}", output.display());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("Export error: {e:#}");
            EXIT_RUNTIME
        }
    }
}

/// Database location from --db, or the configured logging path
fn resolve_db_path(config_path: Option<PathBuf>, db: Option<PathBuf>) -> Result<PathBuf, i32> {
    let db_path = match db {
        Some(path) => path,
        None => match Config::load(config_path.as_deref()) {
            Ok(config) => config.logging.db_path,
            Err(e) => {
                eprintln!("Error loading configuration: {e:#}");
                return Err(EXIT_CONFIG);
            }
        },
    };

    if !db_path.exists() {
        eprintln!(
            "Telemetry database not found: {} (start the server first, or pass --db)",
            db_path.display()
        );
        return Err(EXIT_CONFIG);
    }

    Ok(db_path)
}
