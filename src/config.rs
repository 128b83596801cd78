//! Server configuration.
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults
//! 2. a TOML file (`--config`, or `config.toml` in the platform config dir)
//! 3. `FASTTEXT_SERVING_*` environment variables (`.env` honoured)
//! 4. command-line flags
//!
//! ```toml
//! address = "0.0.0.0"
//! port = 8000
//! default_model = "lid"
//!
//! [[models]]
//! name = "lid"
//! path = "/srv/models/lid.ftsm"
//!
//! [security]
//! mode = "encrypted"
//! key_file = "/etc/fasttext-serving/serving.key"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::daemon::core::ServerOptions;
use crate::daemon::protocol::DEFAULT_PORT;
use crate::daemon::transport::{SharedKey, TransportError, TransportSecurity};
use crate::error::StoreError;
use crate::model::ModelStore;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_SESSIONS: usize = 16;
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Key(#[from] TransportError),
}

/// Transport protection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    #[default]
    Plaintext,
    Encrypted,
}

impl FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" | "insecure" => Ok(Self::Plaintext),
            "encrypted" | "secure" => Ok(Self::Encrypted),
            other => Err(format!("unknown security mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub mode: SecurityMode,
    /// Hex key file, as written by `fasttext-serving keygen`.
    pub key_file: Option<PathBuf>,
}

/// A model to load at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Registry name; the file stem when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
}

impl FromStr for ModelEntry {
    type Err = String;

    /// `path` or `name=path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty model entry".to_string());
        }
        match s.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok(Self {
                name: Some(name.to_string()),
                path: PathBuf::from(path),
            }),
            Some(_) => Err(format!("expected NAME=PATH, got {s:?}")),
            None => Ok(Self {
                name: None,
                path: PathBuf::from(s),
            }),
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub address: String,
    pub port: u16,
    /// Optional plain HTTP batch endpoint.
    pub http_port: Option<u16>,
    pub models: Vec<ModelEntry>,
    pub default_model: Option<String>,
    pub max_message_bytes: usize,
    pub max_sessions: usize,
    pub session_queue_depth: usize,
    /// Per-inference deadline; none by default.
    pub request_timeout_ms: Option<u64>,
    pub security: SecurityConfig,
    /// Tokio worker threads; the runtime default when absent.
    pub worker_threads: Option<usize>,
    /// Directory for daily rolling log files; stderr only when absent.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            http_port: None,
            models: Vec::new(),
            default_model: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_queue_depth: DEFAULT_QUEUE_DEPTH,
            request_timeout_ms: None,
            security: SecurityConfig::default(),
            worker_threads: None,
            log_dir: None,
        }
    }
}

/// `config.toml` in the platform config directory.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "fasttext-serving", "fasttext-serving")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match dotenvy::var(var) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}

impl ServeConfig {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Defaults overlaid with a config file.
    ///
    /// An explicit `path` must exist; the platform default is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let cfg = Self::from_toml_str(&text, &path)?;
                info!(path = %path.display(), "Loaded config file");
                Ok(cfg)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Overlay `FASTTEXT_SERVING_*` environment variables.
    ///
    /// `FASTTEXT_SERVING_MODELS` is a comma-separated list of `path` or
    /// `name=path` entries and replaces the configured list.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = dotenvy::var("FASTTEXT_SERVING_ADDRESS")
            && !addr.trim().is_empty()
        {
            self.address = addr.trim().to_string();
        }
        if let Some(port) = env_parse("FASTTEXT_SERVING_PORT")? {
            self.port = port;
        }
        if let Some(port) = env_parse("FASTTEXT_SERVING_HTTP_PORT")? {
            self.http_port = Some(port);
        }
        if let Ok(list) = dotenvy::var("FASTTEXT_SERVING_MODELS")
            && !list.trim().is_empty()
        {
            self.models = list
                .split(',')
                .filter(|item| !item.trim().is_empty())
                .map(ModelEntry::from_str)
                .collect::<Result<_, _>>()
                .map_err(|_| ConfigError::Env {
                    var: "FASTTEXT_SERVING_MODELS",
                    value: list.clone(),
                })?;
        }
        if let Ok(name) = dotenvy::var("FASTTEXT_SERVING_DEFAULT_MODEL")
            && !name.trim().is_empty()
        {
            self.default_model = Some(name.trim().to_string());
        }
        if let Some(n) = env_parse("FASTTEXT_SERVING_MAX_MESSAGE_BYTES")? {
            self.max_message_bytes = n;
        }
        if let Some(n) = env_parse("FASTTEXT_SERVING_MAX_SESSIONS")? {
            self.max_sessions = n;
        }
        if let Some(n) = env_parse("FASTTEXT_SERVING_QUEUE_DEPTH")? {
            self.session_queue_depth = n;
        }
        if let Some(ms) = env_parse::<u64>("FASTTEXT_SERVING_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = (ms > 0).then_some(ms);
        }
        if let Some(mode) = env_parse("FASTTEXT_SERVING_SECURITY")? {
            self.security.mode = mode;
        }
        if let Ok(path) = dotenvy::var("FASTTEXT_SERVING_KEY_FILE")
            && !path.trim().is_empty()
        {
            self.security.key_file = Some(PathBuf::from(path.trim()));
        }
        if let Some(n) = env_parse("FASTTEXT_SERVING_WORKER_THREADS")? {
            self.worker_threads = Some(n);
        }
        if let Ok(dir) = dotenvy::var("FASTTEXT_SERVING_LOG_DIR")
            && !dir.trim().is_empty()
        {
            self.log_dir = Some(PathBuf::from(dir.trim()));
        }
        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.models.is_empty() {
            return invalid("no models configured (use --model or FASTTEXT_SERVING_MODELS)");
        }
        if self.max_message_bytes == 0 {
            return invalid("max_message_bytes must be positive");
        }
        if self.max_message_bytes > u32::MAX as usize {
            return invalid("max_message_bytes must fit in a 32-bit frame length");
        }
        if self.max_sessions == 0 {
            return invalid("max_sessions must be positive");
        }
        if self.session_queue_depth == 0 {
            return invalid("session_queue_depth must be positive");
        }
        if self.worker_threads == Some(0) {
            return invalid("worker_threads must be positive");
        }
        if self.request_timeout_ms == Some(0) {
            return invalid("request_timeout_ms must be positive when set");
        }
        if self.security.mode == SecurityMode::Encrypted && self.security.key_file.is_none() {
            return invalid("encrypted mode requires security.key_file");
        }
        if self.security.mode == SecurityMode::Encrypted && self.http_port.is_some() {
            return invalid("the HTTP endpoint is plaintext only and cannot run in encrypted mode");
        }
        if self.http_port.is_some() && self.http_port == Some(self.port) && self.port != 0 {
            return invalid("http_port must differ from port");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn http_addr(&self) -> Option<String> {
        self.http_port
            .map(|port| format!("{}:{}", self.address, port))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Read the key file when encryption is on.
    pub fn resolve_security(&self) -> Result<TransportSecurity, ConfigError> {
        match (self.security.mode, &self.security.key_file) {
            (SecurityMode::Plaintext, _) => Ok(TransportSecurity::Plaintext),
            (SecurityMode::Encrypted, Some(path)) => {
                Ok(TransportSecurity::Encrypted(SharedKey::from_file(path)?))
            }
            (SecurityMode::Encrypted, None) => Err(ConfigError::Invalid(
                "encrypted mode requires security.key_file".to_string(),
            )),
        }
    }

    pub fn server_options(&self) -> Result<ServerOptions, ConfigError> {
        Ok(ServerOptions {
            max_message_bytes: self.max_message_bytes,
            max_sessions: self.max_sessions,
            queue_depth: self.session_queue_depth,
            request_timeout: self.request_timeout(),
            security: self.resolve_security()?,
        })
    }

    /// Load every configured model; the first one is the default unless
    /// `default_model` says otherwise.
    pub fn load_store(&self) -> Result<ModelStore, StoreError> {
        let store = ModelStore::new();
        for entry in &self.models {
            store.load(entry.name.as_deref(), &entry.path)?;
        }
        if let Some(name) = &self.default_model {
            store.set_default(name)?;
        }
        Ok(store)
    }
}

/// Scoped environment overrides for tests that touch process env.
#[cfg(test)]
pub(crate) mod testing {
    pub struct EnvGuard(Vec<&'static str>);

    impl EnvGuard {
        pub fn set(vars: &[(&'static str, &str)]) -> Self {
            for (key, value) in vars {
                unsafe { std::env::set_var(key, value) };
            }
            Self(vars.iter().map(|(k, _)| *k).collect())
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in &self.0 {
                unsafe { std::env::remove_var(key) };
            }
        }
    }
}
