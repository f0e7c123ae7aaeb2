//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use therm_core::IllusionKind;
use tracing::{info, warn};

/// Tool configuration. File: `./therm-tool.toml` or `~/.config/therm/tool.toml`.
/// Env overrides: THERM_TOOL_SUITE_HOST, THERM_TOOL_SUITE_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default = "default_suite_host")]
    pub suite_host: String,
    /// Suite listen port (default 25568).
    #[serde(default = "default_suite_port")]
    pub suite_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Must match the Suite's; fixes the number of questions per trial.
    #[serde(default = "default_illusion")]
    pub illusion: IllusionKind,
}

fn default_suite_host() -> String {
    "127.0.0.1".to_string()
}
fn default_suite_port() -> u16 {
    25568
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_illusion() -> IllusionKind {
    IllusionKind::Funneling
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            suite_host: default_suite_host(),
            suite_port: default_suite_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            illusion: default_illusion(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ToolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides; unparsable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("THERM_TOOL_SUITE_HOST") {
            self.suite_host = s;
        }
        if let Some(p) = var("THERM_TOOL_SUITE_PORT").and_then(|s| s.parse().ok()) {
            self.suite_port = p;
        }
    }

    pub fn suite_addr(&self) -> String {
        format!("{}:{}", self.suite_host, self.suite_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Load config: defaults, then the config file, then env vars.
pub fn load(path: Option<&Path>) -> Result<ToolConfig, ConfigError> {
    let mut c = match path {
        Some(p) => ToolConfig::from_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("therm-tool.toml")];
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/therm/tool.toml"));
    }
    out
}

fn load_default_file() -> Option<ToolConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match ToolConfig::from_file(&path) {
        Ok(c) => {
            info!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(error) => {
            warn!(%error, "ignoring config file");
            None
        }
    }
}
