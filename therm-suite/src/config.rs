//! Load config from file and environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use therm_core::{IllusionKind, SuiteSettings, VoltageMap};
use tracing::{info, warn};

/// Suite configuration. File: `./therm-suite.toml` or `~/.config/therm/suite.toml`.
/// Env overrides: THERM_SUITE_DEVICE_HOST, THERM_SUITE_DEVICE_PORT, THERM_SUITE_TOOL_PORT,
/// THERM_SUITE_STUDY_FOLDER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Holds `trial_info/` and `trial_responses/`.
    #[serde(default = "default_study_folder")]
    pub study_folder: PathBuf,
    #[serde(default = "default_illusion")]
    pub illusion: IllusionKind,
    /// Trial set loaded at start-up.
    #[serde(default)]
    pub participant: Option<u32>,
    #[serde(default = "default_device_host")]
    pub device_host: String,
    /// Device TCP port (default 25567).
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default = "default_tool_bind")]
    pub tool_bind: String,
    /// Tool listen port (default 25568, 0 for ephemeral).
    #[serde(default = "default_tool_port")]
    pub tool_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub base_temperature: i32,
    /// Replaces the table voltage of hot trials.
    #[serde(default)]
    pub override_hot_voltage: Option<f32>,
    #[serde(default = "default_trial_overhead_ms")]
    pub trial_overhead_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub auto_advance: bool,
    /// Target temperature (as a string key) to volts. Empty selects the coarse offset table.
    #[serde(default)]
    pub voltage_table: BTreeMap<String, f32>,
}

fn default_study_folder() -> PathBuf {
    PathBuf::from("study")
}
fn default_illusion() -> IllusionKind {
    IllusionKind::Funneling
}
fn default_device_host() -> String {
    "127.0.0.1".to_string()
}
fn default_device_port() -> u16 {
    25567
}
fn default_tool_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_tool_port() -> u16 {
    25568
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_trial_overhead_ms() -> u64 {
    3750
}
fn default_cooldown_ms() -> u64 {
    5000
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            study_folder: default_study_folder(),
            illusion: default_illusion(),
            participant: None,
            device_host: default_device_host(),
            device_port: default_device_port(),
            tool_bind: default_tool_bind(),
            tool_port: default_tool_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            base_temperature: 0,
            override_hot_voltage: None,
            trial_overhead_ms: default_trial_overhead_ms(),
            cooldown_ms: default_cooldown_ms(),
            auto_advance: false,
            voltage_table: BTreeMap::new(),
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
    #[error("voltage_table key {0:?} is not an integer temperature")]
    VoltageKey(String),
}

impl SuiteConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.voltage_map()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Apply environment overrides; unparsable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("THERM_SUITE_DEVICE_HOST") {
            self.device_host = s;
        }
        if let Some(p) = var("THERM_SUITE_DEVICE_PORT").and_then(|s| s.parse().ok()) {
            self.device_port = p;
        }
        if let Some(p) = var("THERM_SUITE_TOOL_PORT").and_then(|s| s.parse().ok()) {
            self.tool_port = p;
        }
        if let Some(s) = var("THERM_SUITE_STUDY_FOLDER") {
            self.study_folder = PathBuf::from(s);
        }
    }

    pub fn voltage_map(&self) -> Result<VoltageMap, ConfigError> {
        if self.voltage_table.is_empty() {
            return Ok(VoltageMap::coarse());
        }
        let mut entries = BTreeMap::new();
        for (key, volts) in &self.voltage_table {
            let t: i32 = key
                .trim()
                .parse()
                .map_err(|_| ConfigError::VoltageKey(key.clone()))?;
            entries.insert(t, *volts);
        }
        Ok(VoltageMap::new(entries))
    }

    pub fn settings(&self) -> SuiteSettings {
        SuiteSettings {
            illusion: self.illusion,
            base_temperature: self.base_temperature,
            override_hot_voltage: self.override_hot_voltage,
            trial_overhead: Duration::from_millis(self.trial_overhead_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            auto_advance: self.auto_advance,
        }
    }

    pub fn device_addr(&self) -> String {
        format!("{}:{}", self.device_host, self.device_port)
    }

    pub fn tool_bind_addr(&self) -> String {
        format!("{}:{}", self.tool_bind, self.tool_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Load config: defaults, then the config file, then env vars.
/// An explicit `path` must load; a default-location file that fails is skipped with a warning.
pub fn load(path: Option<&Path>) -> Result<SuiteConfig, ConfigError> {
    let mut c = match path {
        Some(p) => SuiteConfig::from_file(p)?,
        None => load_default_file().unwrap_or_default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("therm-suite.toml")];
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/therm/suite.toml"));
    }
    out
}

fn load_default_file() -> Option<SuiteConfig> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    match SuiteConfig::from_file(&path) {
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
