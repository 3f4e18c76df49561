//! Driver configuration
//!
//! Settings for the worker-driver programs, merged from several sources.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (EMBEDLOCK_THREADS, EMBEDLOCK_ITERATIONS, EMBEDLOCK_PAUSE_MS)
//! 3. Config file (embedlock.toml, or --config <FILE>)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use embedlock::util::config::DriverConfig;
//!
//! let config = DriverConfig::from_toml_str("threads = 4").unwrap();
//! assert_eq!(config.threads, 4);
//! assert_eq!(config.iterations, 50);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::logger::LogLevel;

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "embedlock.toml";

/// Worker-driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Number of worker threads
    pub threads: usize,
    /// Acquire/call/release cycles per worker
    pub iterations: usize,
    /// Pause between cycles in milliseconds, spent outside the lock
    pub pause_ms: u64,
    /// Runtime function each cycle calls
    pub function: String,
    /// Length of the input vectors handed to `sum`
    pub vector_len: usize,
    /// Log level: debug, info, warn or error
    pub log_level: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            threads: 20,
            iterations: 50,
            pause_ms: 0,
            function: "sum".to_string(),
            vector_len: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl DriverConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::ParseError)
    }

    /// Defaults of the paced driver: fewer cycles, with a pause between them
    /// so other workers get the lock.
    pub fn paced() -> Self {
        Self {
            iterations: 30,
            pause_ms: 300,
            ..Self::default()
        }
    }

    /// Parse a TOML document on top of `self`; keys it sets win, the rest
    /// keep their current values.
    pub fn overlay_toml_str(
        self,
        content: &str,
    ) -> Result<Self, ConfigError> {
        let overlay: toml::Table = toml::from_str(content).map_err(ConfigError::ParseError)?;
        let mut table = match toml::Value::try_from(&self).map_err(ConfigError::SerializeError)? {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };
        table.extend(overlay);
        toml::Value::Table(table)
            .try_into()
            .map_err(ConfigError::ParseError)
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::default().load_over(path)
    }

    /// Load a config file on top of `self`.
    pub fn load_over(
        self,
        path: &Path,
    ) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        self.overlay_toml_str(&content)
    }

    /// Load `path`, or `embedlock.toml` in the working directory if present,
    /// or the defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::default().discover_over(path)
    }

    /// Like [`discover`](Self::discover), layering the file over `self`
    /// instead of the defaults.
    pub fn discover_over(
        self,
        path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        match path {
            Some(path) => self.load_over(path),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    self.load_over(&default_path)
                } else {
                    Ok(self)
                }
            }
        }
    }

    /// Apply `EMBEDLOCK_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_vars<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EMBEDLOCK_THREADS") {
            self.threads = parse_var("EMBEDLOCK_THREADS", &value)?;
        }
        if let Some(value) = lookup("EMBEDLOCK_ITERATIONS") {
            self.iterations = parse_var("EMBEDLOCK_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("EMBEDLOCK_PAUSE_MS") {
            self.pause_ms = parse_var("EMBEDLOCK_PAUSE_MS", &value)?;
        }
        Ok(())
    }

    /// `vector_len` as a runtime integer.
    pub fn input_len(&self) -> Result<i64, ConfigError> {
        i64::try_from(self.vector_len).map_err(|_| ConfigError::InvalidVar {
            key: "vector_len",
            value: self.vector_len.to_string(),
        })
    }

    /// Parsed log level; unknown names fall back to info.
    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log_level).unwrap_or(LogLevel::Info)
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidVar {
            key,
            value: value.to_string(),
        })
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
    SerializeError(toml::ser::Error),
    InvalidVar { key: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
            ConfigError::InvalidVar { key, value } => {
                write!(f, "Invalid value for {}: {:?}", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
