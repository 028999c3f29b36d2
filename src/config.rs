//! Provider configuration loading.
//!
//! Reads `mcp-servers.json` (or `.yaml`) and resolves environment variables,
//! so credentials can be supplied from the environment instead of living in
//! the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mcp_client::types::LaunchSpec;

/// Environment variable that points straight at a config file.
pub const CONFIG_ENV_VAR: &str = "SYNAPSE_MCP_CONFIG";

const CONFIG_FILE_NAMES: &[&str] = &["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"];

/// Configuration loading or validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not found: {reason}")]
    NotFound { reason: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Timeouts applied to every provider session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Budget for spawn + `initialize` handshake.
    #[serde(default = "default_init_ms")]
    pub init_ms: u64,
    /// Budget for one `tools/list` page or `tools/call`.
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    /// Grace period after closing stdin before the process is killed.
    #[serde(default = "default_shutdown_ms")]
    pub shutdown_ms: u64,
}

fn default_init_ms() -> u64 {
    30_000
}
fn default_call_ms() -> u64 {
    30_000
}
fn default_shutdown_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_ms: default_init_ms(),
            call_ms: default_call_ms(),
            shutdown_ms: default_shutdown_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

/// Top-level provider configuration file.
///
/// Providers are keyed by name. A `BTreeMap` keeps iteration order stable
/// so batch connects always start providers in the same order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, LaunchSpec>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the provider config file.
///
/// 1. `SYNAPSE_MCP_CONFIG` if set and the file exists.
/// 2. Walk upward from `start` looking for `mcp-servers.{json,yaml,yml}`.
/// 3. The platform config dir (`<config>/synapse-mcp/`).
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        if let Some(found) = first_existing(&dir) {
            return Ok(found);
        }
        if !dir.pop() {
            break;
        }
    }

    if let Some(found) = dirs::config_dir()
        .map(|d| d.join("synapse-mcp"))
        .and_then(|d| first_existing(&d))
    {
        return Ok(found);
    }

    Err(ConfigError::NotFound {
        reason: format!(
            "no {} found from {} upward or in the user config dir",
            CONFIG_FILE_NAMES.join(" / "),
            start.display()
        ),
    })
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Load and parse a provider config file.
///
/// YAML is used for `.yaml`/`.yml`, JSON otherwise. `${VAR}` and
/// `${VAR:-default}` are interpolated before parsing.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let parsed = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    };

    let config: McpServersConfig = parsed.map_err(|reason| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    })?;

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded provider config"
    );

    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
