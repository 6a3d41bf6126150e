//! TOML configuration surface: parsing, validation, and the typed
//! daemon/source configuration the rest of the crate consumes.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EgdError, ErrorCategory};

/// A custom, operator-defined per-source scalar field (arbitrary keys
/// beyond the schema's named fields). Exported deterministically to script
/// child environments and echoed verbatim by `config show`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::Str(s) => write!(f, "{s}"),
            ScalarValue::Int(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Raw, not-yet-validated acquisition method as written in TOML. Exactly
/// one variant's required fields may be present on a given source table;
/// which one is present is how the source's kind is determined.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAcquisition {
    pub url: Option<String>,
    pub prefetch: Option<String>,
    pub file: Option<PathBuf>,
    pub command: Option<Vec<String>>,
    pub script_interpreter: Option<String>,
    pub script: Option<String>,
}

/// A validated, exactly-one-of acquisition method.
#[derive(Debug, Clone)]
pub enum Acquisition {
    Url { url: String, prefetch: Option<String> },
    File { path: PathBuf },
    Command { argv: Vec<String> },
    Script { interpreter: String, body: String },
}

impl Acquisition {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Acquisition::Url { .. } => "url",
            Acquisition::File { .. } => "file",
            Acquisition::Command { .. } => "command",
            Acquisition::Script { .. } => "script",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceConfig {
    pub interval_secs: u64,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub min_size: Option<u64>,
    #[serde(default)]
    pub no_compress: bool,
    #[serde(default)]
    pub init_delay_secs: u64,
    #[serde(default)]
    pub disabled: bool,
    /// URL sources only: bypass TLS certificate validation. Strict by
    /// default, per the source contract.
    #[serde(default)]
    pub insecure_tls: bool,
    #[serde(flatten)]
    pub acquisition: RawAcquisition,
    #[serde(flatten)]
    pub custom: HashMap<String, ScalarValue>,
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_entropy")]
    pub max_entropy: i64,
    #[serde(default = "default_pool_path")]
    pub persist_file: PathBuf,
    #[serde(default = "default_persist_interval_secs")]
    pub persist_interval_secs: u64,
    #[serde(default = "default_chunk_capacity")]
    pub pool_chunk_max_entropy: i32,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default)]
    pub sources: HashMap<String, RawSourceConfig>,
}

fn default_max_entropy() -> i64 {
    4096
}
fn default_chunk_capacity() -> i32 {
    256
}
fn default_pool_path() -> PathBuf {
    PathBuf::from("/var/lib/egd/pool.dat")
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("/tmp/egd.lck")
}
fn default_tcp_port() -> u16 {
    8885
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_persist_interval_secs() -> u64 {
    60
}

/// A validated daemon-wide configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_level: String,
    pub max_entropy: i64,
    pub pool_path: PathBuf,
    pub persist_interval_secs: u64,
    pub chunk_capacity: i32,
    pub control_addr: String,
    pub lock_path: PathBuf,
    pub sources: Vec<SourceConfig>,
}

/// A validated, per-source configuration.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub acquisition: Acquisition,
    pub interval_secs: u64,
    pub scale: f64,
    pub size: Option<u64>,
    pub min_size: Option<u64>,
    pub no_compress: bool,
    pub init_delay_secs: u64,
    pub disabled: bool,
    pub insecure_tls: bool,
    pub custom: HashMap<String, ScalarValue>,
}

const MIN_INTERVAL_SECS: u64 = 10;
const MIN_PERSIST_INTERVAL_SECS: u64 = 10;
const MAX_PERSIST_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Parses `text` as TOML and validates it into a [`DaemonConfig`]. Invalid
/// configuration is always a `Fatal` error — the daemon cannot start.
pub fn parse_and_validate(text: &str) -> Result<DaemonConfig, EgdError> {
    let raw: RawConfig = toml::from_str(text).map_err(|e| {
        EgdError::new(ErrorCategory::Fatal, "config", "CONFIG_PARSE_FAILED", e.to_string())
    })?;
    validate(raw)
}

fn invalid(msg: impl Into<String>) -> EgdError {
    EgdError::new(ErrorCategory::Fatal, "config", "CONFIG_INVALID", msg)
}

fn validate_acquisition(name: &str, raw: RawAcquisition) -> Result<Acquisition, EgdError> {
    let present = [
        raw.url.is_some(),
        raw.file.is_some(),
        raw.command.is_some(),
        raw.script_interpreter.is_some() || raw.script.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    if present == 0 {
        return Err(invalid(format!("source '{name}': no data-acquisition method configured")));
    }
    if present > 1 {
        return Err(invalid(format!("source '{name}': exactly one data-acquisition method is required")));
    }

    if raw.prefetch.is_some() && raw.url.is_none() {
        return Err(invalid(format!("source '{name}': 'prefetch' requires 'url'")));
    }
    if raw.script_interpreter.is_some() != raw.script.is_some() {
        return Err(invalid(format!(
            "source '{name}': 'script' and 'script_interpreter' must be set together"
        )));
    }

    if let Some(url) = raw.url {
        Ok(Acquisition::Url { url, prefetch: raw.prefetch })
    } else if let Some(path) = raw.file {
        Ok(Acquisition::File { path })
    } else if let Some(argv) = raw.command {
        if argv.is_empty() {
            return Err(invalid(format!("source '{name}': 'command' must not be empty")));
        }
        Ok(Acquisition::Command { argv })
    } else {
        Ok(Acquisition::Script {
            interpreter: raw.script_interpreter.unwrap(),
            body: raw.script.unwrap(),
        })
    }
}

fn is_env_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_source(name: String, raw: RawSourceConfig) -> Result<SourceConfig, EgdError> {
    if raw.interval_secs < MIN_INTERVAL_SECS {
        return Err(invalid(format!(
            "source '{name}': interval must be at least {MIN_INTERVAL_SECS}s"
        )));
    }
    if !(0.0..=1.0).contains(&raw.scale) {
        return Err(invalid(format!("source '{name}': scale must be in [0.0, 1.0]")));
    }
    if let (Some(size), Some(min_size)) = (raw.size, raw.min_size) {
        if min_size > size {
            return Err(invalid(format!("source '{name}': min_size must be <= size")));
        }
    }
    for key in raw.custom.keys() {
        if !is_env_safe_key(key) {
            return Err(invalid(format!("source '{name}': custom key '{key}' is not environment-safe")));
        }
    }

    let acquisition = validate_acquisition(&name, raw.acquisition)?;
    if raw.insecure_tls && !matches!(acquisition, Acquisition::Url { .. }) {
        return Err(invalid(format!("source '{name}': insecure_tls only applies to url sources")));
    }

    Ok(SourceConfig {
        name,
        acquisition,
        interval_secs: raw.interval_secs,
        scale: raw.scale,
        size: raw.size,
        min_size: raw.min_size,
        no_compress: raw.no_compress,
        init_delay_secs: raw.init_delay_secs,
        disabled: raw.disabled,
        insecure_tls: raw.insecure_tls,
        custom: raw.custom,
    })
}

fn validate(raw: RawConfig) -> Result<DaemonConfig, EgdError> {
    if !matches!(raw.log_level.as_str(), "debug" | "info" | "warn" | "error") {
        return Err(invalid(format!("log_level '{}' must be one of debug/info/warn/error", raw.log_level)));
    }
    if raw.max_entropy <= 0 {
        return Err(invalid("max_entropy must be positive"));
    }
    if raw.pool_chunk_max_entropy <= 0 {
        return Err(invalid("pool_chunk_max_entropy must be positive"));
    }
    if raw.pool_chunk_max_entropy as i64 > raw.max_entropy {
        return Err(invalid("pool_chunk_max_entropy must not exceed max_entropy"));
    }
    if raw.persist_interval_secs < MIN_PERSIST_INTERVAL_SECS || raw.persist_interval_secs > MAX_PERSIST_INTERVAL_SECS
    {
        return Err(invalid(format!(
            "persist_interval_secs must be between {MIN_PERSIST_INTERVAL_SECS} and {MAX_PERSIST_INTERVAL_SECS}"
        )));
    }
    if raw.sources.is_empty() {
        return Err(invalid("at least one source must be configured"));
    }
    if raw.tcp_port == 0 {
        return Err(invalid("tcp_port must be between 1 and 65535"));
    }

    let control_addr = format!("127.0.0.1:{}", raw.tcp_port);

    let mut sources = Vec::with_capacity(raw.sources.len());
    for (name, src) in raw.sources {
        sources.push(validate_source(name, src)?);
    }
    sources.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(DaemonConfig {
        log_level: raw.log_level,
        max_entropy: raw.max_entropy,
        pool_path: raw.persist_file,
        persist_interval_secs: raw.persist_interval_secs,
        chunk_capacity: raw.pool_chunk_max_entropy,
        control_addr,
        lock_path: raw.lock_path,
        sources,
    })
}
