// Startup module - banner and module loading status
//
// Printed before the server starts serving, so a glance at the terminal
// shows what is configured: providers, telemetry, analysis features, proxy.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const MAGENTA: &str = "\x1b[35m";
}

struct ModuleStatus {
    name: &'static str,
    enabled: bool,
    description: &'static str,
}

/// Print the startup banner and module loading status
pub fn print_startup(config: &Config) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}crossgate{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Transparent LLM API gateway with dual-track telemetry{RESET}");
    println!();

    println!("  {DIM}Loading modules...{RESET}");
    for module in module_status(config) {
        let icon = if module.enabled {
            format!("{GREEN}✓{RESET}")
        } else {
            format!("{DIM}○{RESET}")
        };
        println!(
            "    {icon} {:<12} {DIM}{}{RESET}",
            module.name, module.description
        );
    }
    println!();

    if config.providers.is_empty() {
        println!("  {DIM}Providers:{RESET} none configured");
    } else {
        let mut names: Vec<&String> = config.providers.keys().collect();
        names.sort();
        for name in names {
            println!("  {MAGENTA}▸{RESET} provider {BOLD}{name}{RESET}");
        }
    }

    println!(
        "  {MAGENTA}▸{RESET} Listening on {BOLD}{}:{}{RESET}",
        config.server.host, config.server.port
    );
    println!();
}

fn module_status(config: &Config) -> Vec<ModuleStatus> {
    vec![
        ModuleStatus {
            name: "router",
            enabled: true,
            description: "Model-prefix provider routing",
        },
        ModuleStatus {
            name: "translate",
            enabled: true,
            description: "OpenAI ⇄ Anthropic dialects",
        },
        ModuleStatus {
            name: "telemetry",
            enabled: config.logging.enabled,
            description: "Call logging (DuckDB)",
        },
        ModuleStatus {
            name: "cache-est",
            enabled: config.analysis.enable_cache_estimation,
            description: "Prompt-cache estimation",
        },
        ModuleStatus {
            name: "perf",
            enabled: config.analysis.enable_performance_tracking,
            description: "TTFT/TPOT tracking",
        },
        ModuleStatus {
            name: "proxy",
            enabled: config.proxy.active_proxy_url().is_some(),
            description: "Outbound proxy",
        },
    ]
}
