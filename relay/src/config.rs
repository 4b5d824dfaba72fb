//! Configuration management.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure that matches the TOML file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    sessions: SessionsConfig,
    #[serde(default)]
    backend: BackendConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_port")]
    port: u16,
    /// Prefix put in front of the submission path announced to clients
    #[serde(default)]
    public_base_path: String,
    #[serde(default)]
    cors_allowed_origins: Vec<String>,
    #[serde(default = "default_keep_alive_secs")]
    keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_base_path: String::new(),
            cors_allowed_origins: Vec::new(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionsConfig {
    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,
    #[serde(default = "default_janitor_interval_secs")]
    janitor_interval_secs: u64,
    #[serde(default = "default_drain_grace_ms")]
    drain_grace_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            janitor_interval_secs: default_janitor_interval_secs(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackendConfig {
    #[serde(default = "default_backend_timeout_secs")]
    timeout_secs: u64,
    /// Hosts clients may ask to be relayed to (empty = any)
    #[serde(default)]
    allowed_hosts: Vec<String>,
    /// Capability flags merged into `initialize` replies. Left out of the
    /// serialized defaults so a configured table replaces the built-in one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capabilities: Option<Value>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_backend_timeout_secs(),
            allowed_hosts: Vec::new(),
            capabilities: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LoggingConfig {
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    log_file: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    /// If not set, uses RUST_LOG environment variable or defaults to "info"
    log_level: Option<String>,
}

fn default_port() -> u16 {
    mcp_relay_types::DEFAULT_PORT
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_janitor_interval_secs() -> u64 {
    30
}

fn default_drain_grace_ms() -> u64 {
    2000
}

fn default_backend_timeout_secs() -> u64 {
    30
}

fn default_capabilities() -> Value {
    json!({
        "experimental": {
            "relay": { "streaming": true }
        }
    })
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Prefix for the submission address sent in the `endpoint` event
    pub public_base_path: String,
    /// CORS origins (empty = any origin)
    pub cors_allowed_origins: Vec<String>,
    /// Interval between keep-alive comments on open streams
    pub keep_alive: Duration,
    /// Sessions without activity for this long are evicted
    pub idle_timeout: Duration,
    /// How often the janitor scans for idle sessions
    pub janitor_interval: Duration,
    /// How long a disconnected session waits for in-flight replies
    pub drain_grace: Duration,
    /// Hard timeout for each backend call
    pub backend_timeout: Duration,
    /// Backend hosts clients may target (empty = any)
    pub allowed_backend_hosts: Vec<String>,
    /// Capability flags merged into `initialize` replies
    pub capabilities: Value,
    /// Path to log file (if set, logs will be written to file in addition to stdout)
    pub log_file: Option<PathBuf>,
    /// Log level (if set, overrides RUST_LOG environment variable)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with full priority chain: CLI args > env vars > config files > defaults.
    ///
    /// Config files are searched in this order:
    /// 1. `config.toml` in user config directory (~/.config/mcp-relay/ on Linux)
    /// 2. `.mcp-relay.toml` in current directory
    /// 3. the explicit `config_file`, if given
    ///
    /// Environment variables use the `MCP_RELAY_` prefix with `__` between
    /// section and key, e.g. `MCP_RELAY_SESSIONS__IDLE_TIMEOUT_SECS=600`.
    pub fn from_figment(
        config_file: Option<PathBuf>,
        port: Option<u16>,
        idle_timeout_secs: Option<u64>,
        log_level: Option<String>,
    ) -> anyhow::Result<Self> {
        // Find config file paths
        let local_config = std::env::current_dir()
            .ok()
            .map(|d| d.join(".mcp-relay.toml"));
        let user_config = directories::ProjectDirs::from("", "", "mcp-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        // 1. Start with defaults
        let mut figment = Figment::new().merge(Serialized::defaults(ConfigFile::default()));

        // 2. Merge user config file if it exists
        if let Some(ref path) = user_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // 3. Merge local config file if it exists
        if let Some(ref path) = local_config {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }

        // 4. Merge explicitly requested config file
        if let Some(ref path) = config_file {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        // 5. Merge environment variables (MCP_RELAY_* prefix)
        figment = figment.merge(Env::prefixed("MCP_RELAY_").split("__"));

        // 6. Merge CLI arguments (highest priority)
        if let Some(p) = port {
            figment = figment.merge(Serialized::default("server.port", p));
        }
        if let Some(secs) = idle_timeout_secs {
            figment = figment.merge(Serialized::default("sessions.idle_timeout_secs", secs));
        }
        if let Some(ref level) = log_level {
            figment = figment.merge(Serialized::default("logging.log_level", level));
        }

        let config_file: ConfigFile = figment.extract()?;
        Self::from_file(config_file)
    }

    fn from_file(file: ConfigFile) -> anyhow::Result<Self> {
        if file.sessions.idle_timeout_secs == 0 {
            anyhow::bail!("sessions.idle_timeout_secs must be greater than zero");
        }
        if file.sessions.janitor_interval_secs == 0 {
            anyhow::bail!("sessions.janitor_interval_secs must be greater than zero");
        }
        if file.backend.timeout_secs == 0 {
            anyhow::bail!("backend.timeout_secs must be greater than zero");
        }
        let capabilities = file
            .backend
            .capabilities
            .unwrap_or_else(default_capabilities);
        if !capabilities.is_object() {
            anyhow::bail!("backend.capabilities must be a table");
        }

        Ok(Self {
            port: file.server.port,
            public_base_path: file.server.public_base_path.trim_end_matches('/').to_string(),
            cors_allowed_origins: file.server.cors_allowed_origins,
            keep_alive: Duration::from_secs(file.server.keep_alive_secs.max(1)),
            idle_timeout: Duration::from_secs(file.sessions.idle_timeout_secs),
            janitor_interval: Duration::from_secs(file.sessions.janitor_interval_secs),
            drain_grace: Duration::from_millis(file.sessions.drain_grace_ms),
            backend_timeout: Duration::from_secs(file.backend.timeout_secs),
            allowed_backend_hosts: file.backend.allowed_hosts,
            capabilities,
            log_file: file.logging.log_file,
            log_level: file.logging.log_level,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let file = ConfigFile::default();
        Self {
            port: file.server.port,
            public_base_path: file.server.public_base_path,
            cors_allowed_origins: file.server.cors_allowed_origins,
            keep_alive: Duration::from_secs(file.server.keep_alive_secs),
            idle_timeout: Duration::from_secs(file.sessions.idle_timeout_secs),
            janitor_interval: Duration::from_secs(file.sessions.janitor_interval_secs),
            drain_grace: Duration::from_millis(file.sessions.drain_grace_ms),
            backend_timeout: Duration::from_secs(file.backend.timeout_secs),
            allowed_backend_hosts: file.backend.allowed_hosts,
            capabilities: default_capabilities(),
            log_file: file.logging.log_file,
            log_level: file.logging.log_level,
        }
    }
}
