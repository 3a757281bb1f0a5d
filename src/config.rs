//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AGENTD_API_KEY`, `AGENTD_LISTEN`,
//!    `AGENTD_DB_PATH`, `AGENTD_AGENT_BIN`
//! 2. **Config file** — path via `--config <path>`, or `agentd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7317"
//! max_sessions = 20
//! replay_buffer_bytes = 65536
//! idle_timeout_secs = 1800
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [agent]
//! binary = "claude"
//! allowed_tools = ["Bash", "Edit", "Write"]
//!
//! [store]
//! db_path = "/var/lib/agentd/agentd.db"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and session-resource settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:7317`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections (default 64).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum concurrent live PTY sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Replay buffer capacity per session, in bytes (default 64 KiB).
    #[serde(default = "default_replay_buffer_bytes")]
    pub replay_buffer_bytes: usize,
    /// Seconds a detached session may idle before the janitor closes it
    /// (default 1800 = 30 minutes).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Seconds between janitor sweeps (default 30).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Default terminal rows for new sessions (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_terminal_rows: u16,
    /// Default terminal columns for new sessions (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_terminal_cols: u16,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `AGENTD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Agent CLI invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI binary (default `claude`). Override with `AGENTD_AGENT_BIN`.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Tools the agent is permitted to use, passed via `--allowedTools`.
    /// Empty means the flag is omitted.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Extra environment variables merged into the agent's inherited env.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Milliseconds to wait before injecting `/new-milestone` into a
    /// pre-existing session (default 500).
    #[serde(default = "default_milestone_delay_ms")]
    pub milestone_delay_ms: u64,
    /// Output lines to scan for the agent's init frame before giving up
    /// (default 100).
    #[serde(default = "default_capture_max_lines")]
    pub capture_max_lines: usize,
    /// Seconds to scan for the agent's init frame before giving up
    /// (default 10).
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    /// Grace period in seconds between SIGTERM and SIGKILL on session close
    /// (default 3).
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Override with `AGENTD_DB_PATH`.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:7317".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_max_sessions() -> usize {
    20
}
fn default_replay_buffer_bytes() -> usize {
    64 * 1024
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_agent_binary() -> String {
    "claude".to_string()
}
fn default_milestone_delay_ms() -> u64 {
    500
}
fn default_capture_max_lines() -> usize {
    100
}
fn default_capture_timeout_secs() -> u64 {
    10
}
fn default_close_grace_secs() -> u64 {
    3
}
fn default_db_path() -> String {
    "/var/lib/agentd/agentd.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_sessions: default_max_sessions(),
            replay_buffer_bytes: default_replay_buffer_bytes(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            default_terminal_rows: default_terminal_rows(),
            default_terminal_cols: default_terminal_cols(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            allowed_tools: Vec::new(),
            env: HashMap::new(),
            milestone_delay_ms: default_milestone_delay_ms(),
            capture_max_lines: default_capture_max_lines(),
            capture_timeout_secs: default_capture_timeout_secs(),
            close_grace_secs: default_close_grace_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `agentd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("agentd.toml").exists() {
            let content =
                std::fs::read_to_string("agentd.toml").expect("Failed to read agentd.toml");
            toml::from_str(&content).expect("Failed to parse agentd.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                agent: AgentConfig::default(),
                store: StoreConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("AGENTD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("AGENTD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(db_path) = std::env::var("AGENTD_DB_PATH") {
            config.store.db_path = db_path;
        }
        if let Ok(bin) = std::env::var("AGENTD_AGENT_BIN") {
            config.agent.binary = bin;
        }

        config
    }

    /// Sanity-check the loaded configuration. Returns human-readable errors;
    /// an empty vec means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.auth.api_key.is_empty() {
            errors.push("auth.api_key must not be empty".to_string());
        }
        if self.agent.binary.is_empty() {
            errors.push("agent.binary must not be empty".to_string());
        }
        if self.server.max_sessions == 0 {
            errors.push("server.max_sessions must be at least 1".to_string());
        }
        if self.server.replay_buffer_bytes == 0 {
            errors.push("server.replay_buffer_bytes must be at least 1".to_string());
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7317");
        assert_eq!(config.server.replay_buffer_bytes, 64 * 1024);
        assert_eq!(config.server.idle_timeout_secs, 1800);
        assert_eq!(config.agent.binary, "claude");
        assert_eq!(config.agent.milestone_delay_ms, 500);
        assert_eq!(config.agent.capture_max_lines, 100);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Config = toml::from_str(
            r#"
            [server]
            max_sessions = 3

            [agent]
            binary = "/usr/local/bin/claude"
            allowed_tools = ["Bash", "Edit"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.max_sessions, 3);
        // Untouched fields keep their defaults
        assert_eq!(config.server.default_terminal_rows, 24);
        assert_eq!(config.agent.binary, "/usr/local/bin/claude");
        assert_eq!(config.agent.allowed_tools, vec!["Bash", "Edit"]);
    }

    #[test]
    fn test_validate_rejects_empty_binary() {
        let config: Config = toml::from_str("[agent]\nbinary = \"\"").unwrap();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("agent.binary"));
    }
}
