//! TOML-based configuration for Quarry.
//!
//! Supports a config file (quarry.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [server]
//! path = "${QUERY_SERVER_HOME}/bin/quarry-server"
//! threads = 4
//! memory_mb = 4096
//! timeout_secs = 600
//! debug = false
//!
//! [history]
//! capacity = 64
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::server::protocol::ResourceLimits;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Query server configuration.
    pub server: ServerSettings,

    /// Evaluation history configuration.
    pub history: HistorySettings,
}

/// Query server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Path to the query server binary (supports ${ENV_VAR} expansion).
    /// When unset, the distribution resolver searches for one.
    pub path: Option<String>,

    /// Number of evaluation threads.
    pub threads: u32,

    /// Memory limit for the evaluator, in megabytes.
    pub memory_mb: u32,

    /// Per-query evaluation timeout enforced by the server, in seconds.
    pub timeout_secs: u64,

    /// Run the server with debug diagnostics enabled.
    pub debug: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            path: None,
            threads: 1,
            memory_mb: 2048,
            timeout_secs: 600,
            debug: false,
        }
    }
}

impl ServerSettings {
    /// Resolve these settings into a config snapshot for one server start.
    ///
    /// Settings changes never mutate a live connection; a new snapshot is
    /// taken on the next (re)start.
    pub fn to_query_server_config(&self) -> Result<QueryServerConfig, SettingsError> {
        let server_path = match &self.path {
            Some(raw) => Some(PathBuf::from(expand_env_vars(raw)?)),
            None => None,
        };
        Ok(QueryServerConfig {
            server_path,
            threads: self.threads,
            memory_mb: self.memory_mb,
            timeout_secs: self.timeout_secs,
            debug: self.debug,
        })
    }
}

/// Evaluation history configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Maximum number of retained evaluation records.
    pub capacity: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Resolved settings snapshot taken when a connection is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryServerConfig {
    /// Explicit server binary path, if configured.
    pub server_path: Option<PathBuf>,

    /// Number of evaluation threads.
    pub threads: u32,

    /// Memory limit in megabytes.
    pub memory_mb: u32,

    /// Evaluation timeout in seconds.
    pub timeout_secs: u64,

    /// Debug diagnostics flag.
    pub debug: bool,
}

impl QueryServerConfig {
    /// Convert to server command-line arguments.
    pub fn to_server_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--threads={}", self.threads),
            format!("--max-memory={}", self.memory_mb),
            format!("--evaluation-timeout={}", self.timeout_secs),
        ];
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }

    /// The resource limits passed to each query execution.
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            threads: self.threads,
            memory_mb: self.memory_mb,
            timeout_secs: self.timeout_secs,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `QUARRY_CONFIG`
    /// 2. `./quarry.toml`
    /// 3. `~/.config/quarry/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("QUARRY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("quarry.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("quarry").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Defaults if no config file found
        Ok(Settings::default())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(ch);
                    chars.next();
                }
                let value = env::var(&var_name)
                    .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                result.push_str(&value);
            } else {
                // $VAR (ends at non-alphanumeric/underscore)
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        var_name.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    // Just a lone $, keep it
                    result.push('$');
                } else {
                    let value = env::var(&var_name)
                        .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                    result.push_str(&value);
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}
