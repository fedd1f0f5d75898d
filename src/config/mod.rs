use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::limiter::LimiterConfig;

const DEFAULT_PORT: u16 = 4310;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_REQUESTS: u64 = 5;
const DEFAULT_WINDOW_SECS: u64 = 60;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `[limiter]` section of config.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterToml {
    /// Admissions per identity per rolling window (default: 5).
    pub max_requests: u64,
    /// Rolling window length in seconds (default: 60).
    pub window_seconds: u64,
    /// Fixed cooldown added on rejection, seconds (default: 0 = disabled).
    pub block_seconds: u64,
}

impl Default for LimiterToml {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_seconds: DEFAULT_WINDOW_SECS,
            block_seconds: 0,
        }
    }
}

/// `{data_dir}/config.toml`; all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP server port (default: 4310).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1"; use "0.0.0.0" behind a proxy).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,chatrelay=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// Assistant backend endpoint URL.
    backend_url: Option<String>,
    /// Bearer token for the backend. Prefer the env var for secrets.
    backend_api_key: Option<String>,
    /// Backend call timeout in seconds (default: 120).
    call_timeout_seconds: Option<u64>,
    /// Rate limiter settings (`[limiter]`).
    limiter: Option<LimiterToml>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml, using defaults");
            None
        }
    }
}

// ─── RelayConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (default) | "json".
    pub log_format: String,
    /// Assistant backend endpoint (CHATRELAY_BACKEND_URL env var).
    pub backend_url: String,
    /// Bearer token sent on every backend call (CHATRELAY_BACKEND_API_KEY).
    /// Empty string means the Authorization header carries an empty token;
    /// the backend will reject it.
    pub backend_api_key: String,
    /// Single fixed timeout for backend calls, seconds (default: 120).
    pub call_timeout_seconds: u64,
    /// Sliding-window admission settings.
    pub limiter: LimiterConfig,
}

impl RelayConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env, passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
        backend_url: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = bind_address
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("CHATRELAY_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let backend_url = backend_url
            .or(std::env::var("CHATRELAY_BACKEND_URL").ok().filter(|s| !s.is_empty()))
            .or(toml.backend_url)
            .unwrap_or_default();

        let backend_api_key = std::env::var("CHATRELAY_BACKEND_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.backend_api_key)
            .unwrap_or_default();

        let call_timeout_seconds = std::env::var("CHATRELAY_CALL_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(toml.call_timeout_seconds)
            .unwrap_or(DEFAULT_CALL_TIMEOUT_SECS);

        let limiter_toml = toml.limiter.unwrap_or_default();
        let limiter = LimiterConfig {
            max_requests: std::env::var("CHATRELAY_MAX_REQUESTS_PER_WINDOW")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(limiter_toml.max_requests),
            window_seconds: std::env::var("CHATRELAY_WINDOW_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(limiter_toml.window_seconds),
            block_seconds: std::env::var("CHATRELAY_BLOCK_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(limiter_toml.block_seconds),
        };

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            backend_url,
            backend_api_key,
            call_timeout_seconds,
            limiter,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/chatrelay
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("chatrelay");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/chatrelay or ~/.local/share/chatrelay
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("chatrelay");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("chatrelay");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\chatrelay
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("chatrelay");
        }
    }
    // Fallback
    PathBuf::from(".chatrelay")
}
