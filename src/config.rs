//! Configuration model and loader.
//!
//! Parses the JSON configuration model of the external-interfaces contract:
//! a set of named input configs plus global tunables. Hot-reload and the
//! surrounding config-management service are out of scope — this module only
//! covers a single `load`/`from_str` at startup, including `${NAME}` /
//! `${NAME:default}` environment-variable expansion (escapable via `$$`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unterminated ${{...}} expansion in value: {0}")]
    UnterminatedExpansion(String),
    #[error("undefined environment variable ${{{0}}} with no default")]
    UndefinedVariable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdvancedOptions {
    #[serde(default)]
    pub force_multiconfig: bool,
    #[serde(default)]
    pub blacklist: bool,
    #[serde(default)]
    pub tail_size: Option<u64>,
    #[serde(default)]
    pub batch_send_interval: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomizedOptions {
    #[serde(default)]
    pub data_integrity: bool,
    #[serde(default)]
    pub line_count: bool,
    #[serde(default)]
    pub fuse_mode: bool,
}

/// Recognized per-input options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub config_name: String,
    pub project: String,
    pub logstore: String,
    pub base_path: String,
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    #[serde(default)]
    pub log_type: String,
    #[serde(default)]
    pub timeformat: Option<String>,
    #[serde(default)]
    pub multiline_begin_regex: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub filter_regex: Option<String>,
    #[serde(default)]
    pub topic_format: Option<String>,
    #[serde(default = "default_true")]
    pub preserve: bool,
    #[serde(default)]
    pub preserve_depth: i32,
    #[serde(default = "default_max_depth")]
    pub max_depth: i32,
    #[serde(default)]
    pub dir_blacklist: Vec<String>,
    #[serde(default)]
    pub filepath_blacklist: Vec<String>,
    #[serde(default)]
    pub filename_blacklist: Vec<String>,
    #[serde(default)]
    pub enable_root_path_collection: bool,
    #[serde(default)]
    pub advanced: AdvancedOptions,
    #[serde(default)]
    pub customized: CustomizedOptions,
}

fn default_file_pattern() -> String {
    "*".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_depth() -> i32 {
    -1
}

/// Container-mount metadata for containerized runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerMount {
    #[serde(default)]
    pub host_path: Option<PathBuf>,
    #[serde(default)]
    pub container_path: Option<PathBuf>,
}

/// One outbound endpoint for the default region. Not part of §6's recognized
/// global options proper, but the sender/shipper contract needs somewhere to
/// learn addresses from; kept narrow since full multi-region endpoint
/// management is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    #[serde(default)]
    pub proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CredentialConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub access_key_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_buffer_file_path")]
    pub buffer_file_path: PathBuf,
    #[serde(default = "default_buffer_file_max_size")]
    pub buffer_file_max_size: u64,
    #[serde(default = "default_max_bytes_per_sec")]
    pub max_bytes_per_sec: i64,
    #[serde(default)]
    pub container_mounts: Vec<ContainerMount>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub aliuid: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default = "default_region_concurrency")]
    pub region_concurrency: u32,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("checkpoint.json")
}
fn default_buffer_file_path() -> PathBuf {
    PathBuf::from("buffer")
}
fn default_buffer_file_max_size() -> u64 {
    512 * 1024 * 1024
}
fn default_max_bytes_per_sec() -> i64 {
    -1
}
fn default_region() -> String {
    "cn-hangzhou".to_string()
}
fn default_region_concurrency() -> u32 {
    8
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            checkpoint_path: default_checkpoint_path(),
            buffer_file_path: default_buffer_file_path(),
            buffer_file_max_size: default_buffer_file_max_size(),
            max_bytes_per_sec: default_max_bytes_per_sec(),
            container_mounts: Vec::new(),
            region: default_region(),
            aliuid: String::new(),
            endpoints: Vec::new(),
            credentials: CredentialConfig::default(),
            region_concurrency: default_region_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    pub inputs: Vec<InputConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(raw)?;
        let mut cfg: Config = serde_json::from_str(&expanded)?;
        for input in &mut cfg.inputs {
            input.base_path = expand_env(&input.base_path)?;
        }
        Ok(cfg)
    }

    pub fn by_name(&self, name: &str) -> Option<&InputConfig> {
        self.inputs.iter().find(|c| c.config_name == name)
    }
}

/// Expand `${NAME}` and `${NAME:default}` references using `std::env::var`.
/// `$$` escapes a literal `$`.
pub fn expand_env(input: &str) -> Result<String, ConfigError> {
    expand_env_with(input, |name| std::env::var(name).ok())
}

/// Testable variant that takes an explicit lookup function instead of the
/// real process environment.
pub fn expand_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'$' {
            out.push('$');
            i += 2;
            continue;
        }
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let close = input[i..]
                .find('}')
                .map(|rel| i + rel)
                .ok_or_else(|| ConfigError::UnterminatedExpansion(input.to_string()))?;
            let inner = &input[i + 2..close];
            let (name, default) = match inner.split_once(':') {
                Some((n, d)) => (n, Some(d)),
                None => (inner, None),
            };
            match lookup(name).or_else(|| default.map(str::to_string)) {
                Some(value) => out.push_str(&value),
                None => return Err(ConfigError::UndefinedVariable(name.to_string())),
            }
            i = close + 1;
            continue;
        }
        let ch = input[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}

/// Snapshot of env vars for tests, avoiding a dependency on the real
/// process environment (which is shared, mutable global state).
pub fn lookup_from_map(map: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
    move |name| map.get(name).cloned()
}
