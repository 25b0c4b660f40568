//! Configuration for the gateway
//!
//! Configuration is loaded from a TOML file (`crossgate.toml` by default,
//! `--config` to override) merged over built-in defaults. `${VAR}` inside
//! any string value is resolved from the environment at load time, so API
//! keys never have to live in the file itself.

use crate::cache::CacheTuning;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "crossgate.toml";

// ─────────────────────────────────────────────────────────────────────────────
// Application configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerSettings,
    pub proxy: ProxySettings,
    pub providers: HashMap<String, ProviderSettings>,
    pub logging: LoggingSettings,
    pub analysis: AnalysisSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

/// Outbound proxy for upstream calls. SOCKS takes precedence when both are
/// set, matching the connectivity tester.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    pub http_proxy: Option<String>,
    pub socks_proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl ProxySettings {
    pub fn active_proxy_url(&self) -> Option<&String> {
        self.socks_proxy.as_ref().or(self.http_proxy.as_ref())
    }

    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or("")))
    }

    /// Label recorded in telemetry (`proxy_used`)
    pub fn label(&self) -> Option<String> {
        self.active_proxy_url().cloned()
    }

    fn validate(&self) -> Result<()> {
        if let Some(socks) = &self.socks_proxy {
            if !socks.starts_with("socks4://") && !socks.starts_with("socks5://") {
                bail!("Invalid SOCKS proxy format: {socks}");
            }
        }
        if let Some(http) = &self.http_proxy {
            if !http.starts_with("http://") && !http.starts_with("https://") {
                bail!("Invalid HTTP proxy format: {http}");
            }
        }
        if self.http_proxy.is_some() && self.socks_proxy.is_some() {
            tracing::warn!("Both HTTP and SOCKS proxy configured; SOCKS takes precedence");
        }
        Ok(())
    }
}

/// Which dialect an upstream endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectHint {
    OpenAiCompatible,
    AnthropicCompatible,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    pub dialect: DialectHint,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Whether call telemetry is recorded at all
    pub enabled: bool,
    /// Log verbosity when RUST_LOG is unset
    pub level: String,
    /// Telemetry database path
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub enable_cache_estimation: bool,
    pub enable_performance_tracking: bool,
    pub cache_tuning: CacheTuning,
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Connection pool size per upstream host
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            proxy: ProxySettings {
                http_proxy: None,
                socks_proxy: None,
                username: None,
                password: None,
                timeout_secs: 30,
            },
            providers: HashMap::new(),
            logging: LoggingSettings {
                enabled: true,
                level: "info".to_string(),
                db_path: PathBuf::from("./crossgate_logs.db"),
            },
            analysis: AnalysisSettings {
                enable_cache_estimation: true,
                enable_performance_tracking: true,
                cache_tuning: CacheTuning::default(),
            },
            http: HttpSettings {
                max_connections: 10,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure; every field optional so partial files work
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    server: Option<FileServer>,
    proxy: Option<FileProxy>,
    #[serde(default)]
    providers: HashMap<String, ProviderSettings>,
    logging: Option<FileLogging>,
    analysis: Option<FileAnalysis>,
    http: Option<FileHttp>,
}

#[derive(Debug, Deserialize, Default)]
struct FileServer {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct FileProxy {
    http_proxy: Option<String>,
    socks_proxy: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    enabled: Option<bool>,
    level: Option<String>,
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FileAnalysis {
    enable_cache_estimation: Option<bool>,
    enable_performance_tracking: Option<bool>,
    #[serde(default)]
    cache_tuning: Option<CacheTuning>,
}

#[derive(Debug, Deserialize, Default)]
struct FileHttp {
    max_connections: Option<usize>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from the given file, or from `crossgate.toml` in
    /// the working directory when present, or defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Configuration file not found: {}", p.display()))?;
                Self::from_toml(&raw)
            }
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    let raw = std::fs::read_to_string(default)?;
                    Self::from_toml(&raw)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse a TOML document, resolving `${VAR}` in string values first
    pub fn from_toml(raw: &str) -> Result<Self> {
        let mut value: toml::Value = toml::from_str(raw).context("Invalid TOML in config file")?;
        interpolate_env(&mut value);

        let file: FileConfig = value
            .try_into()
            .context("Config file does not match the expected structure")?;

        let mut config = Self::default();

        if let Some(server) = file.server {
            if let Some(host) = server.host {
                config.server.host = host;
            }
            if let Some(port) = server.port {
                config.server.port = port;
            }
        }

        if let Some(proxy) = file.proxy {
            config.proxy.http_proxy = proxy.http_proxy;
            config.proxy.socks_proxy = proxy.socks_proxy;
            config.proxy.username = proxy.username;
            config.proxy.password = proxy.password;
            if let Some(t) = proxy.timeout_secs {
                config.proxy.timeout_secs = t;
            }
        }

        config.providers = file.providers;

        if let Some(logging) = file.logging {
            if let Some(enabled) = logging.enabled {
                config.logging.enabled = enabled;
            }
            if let Some(level) = logging.level {
                config.logging.level = level;
            }
            if let Some(db_path) = logging.db_path {
                config.logging.db_path = PathBuf::from(db_path);
            }
        }

        if let Some(analysis) = file.analysis {
            if let Some(v) = analysis.enable_cache_estimation {
                config.analysis.enable_cache_estimation = v;
            }
            if let Some(v) = analysis.enable_performance_tracking {
                config.analysis.enable_performance_tracking = v;
            }
            if let Some(tuning) = analysis.cache_tuning {
                config.analysis.cache_tuning = tuning;
            }
        }

        if let Some(http) = file.http {
            if let Some(v) = http.max_connections {
                config.http.max_connections = v;
            }
        }

        config.proxy.validate()?;
        config.server.bind_addr()?;

        Ok(config)
    }

    /// Commented configuration template emitted by `crossgate init`
    pub fn template() -> &'static str {
        r#"# crossgate configuration

[server]
host = "0.0.0.0"
port = 8000

[proxy]
# http_proxy = "http://proxy.example.com:8080"
# socks_proxy = "socks5://127.0.0.1:1080"
# username = "user"
# password = "${PROXY_PASSWORD}"
timeout_secs = 30

# Providers keyed by a logical name. ${VAR} is resolved from the
# environment when the file loads.
[providers.openai]
api_key = "${OPENAI_API_KEY}"
dialect = "openai_compatible"
# base_url = "https://api.openai.com/v1"

[providers.anthropic]
api_key = "${ANTHROPIC_API_KEY}"
dialect = "anthropic_compatible"
# base_url = "https://api.anthropic.com/v1"

[logging]
enabled = true
level = "info"
db_path = "./crossgate_logs.db"

[analysis]
enable_cache_estimation = true
enable_performance_tracking = true

# Reuse probabilities for the conversation-history cache bucket.
# [analysis.cache_tuning]
# history_base_p = 0.3
# system_bonus_p = 0.5
# short_bonus_p = 0.2
# medium_bonus_p = 0.1
# repetition_bonus_p = 0.2

[http]
max_connections = 10
"#
    }
}

/// Recursively resolve `${VAR}` in string values. Unset variables leave the
/// placeholder intact so misconfiguration is visible, not silent.
fn interpolate_env(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if s.starts_with("${") && s.ends_with('}') {
                let var = &s[2..s.len() - 1];
                if let Ok(resolved) = std::env::var(var) {
                    *s = resolved;
                }
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                interpolate_env(v);
            }
        }
        toml::Value::Array(array) => {
            for v in array.iter_mut() {
                interpolate_env(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.proxy.timeout_secs, 30);
        assert!(config.logging.enabled);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9100
        "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.logging.enabled);
    }

    #[test]
    fn test_provider_sections() {
        let config = Config::from_toml(
            r#"
            [providers.openai]
            api_key = "sk-123"
            dialect = "openai_compatible"

            [providers.claude]
            api_key = "sk-ant-456"
            dialect = "anthropic_compatible"
            base_url = "https://gateway.internal/v1"
        "#,
        )
        .unwrap();

        assert_eq!(config.providers.len(), 2);
        assert_eq!(
            config.providers["openai"].dialect,
            DialectHint::OpenAiCompatible
        );
        assert_eq!(
            config.providers["claude"].base_url.as_deref(),
            Some("https://gateway.internal/v1")
        );
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("CROSSGATE_TEST_KEY", "resolved-secret");
        let config = Config::from_toml(
            r#"
            [providers.openai]
            api_key = "${CROSSGATE_TEST_KEY}"
            dialect = "openai_compatible"
        "#,
        )
        .unwrap();
        assert_eq!(config.providers["openai"].api_key, "resolved-secret");
    }

    #[test]
    fn test_unset_env_var_left_intact() {
        let config = Config::from_toml(
            r#"
            [providers.openai]
            api_key = "${CROSSGATE_DEFINITELY_UNSET_VAR}"
            dialect = "openai_compatible"
        "#,
        )
        .unwrap();
        assert_eq!(
            config.providers["openai"].api_key,
            "${CROSSGATE_DEFINITELY_UNSET_VAR}"
        );
    }

    #[test]
    fn test_invalid_socks_proxy_rejected() {
        let result = Config::from_toml(
            r#"
            [proxy]
            socks_proxy = "tcp://127.0.0.1:1080"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_template_parses() {
        // The template must itself be loadable (with placeholders intact)
        let config = Config::from_toml(Config::template()).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_cache_tuning_overrides() {
        let config = Config::from_toml(
            r#"
            [analysis.cache_tuning]
            history_base_p = 0.5
        "#,
        )
        .unwrap();
        assert_eq!(config.analysis.cache_tuning.history_base_p, 0.5);
        // Unspecified knobs keep their defaults
        assert_eq!(config.analysis.cache_tuning.system_bonus_p, 0.5);
    }
}
