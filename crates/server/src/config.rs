//! Configuration management for the Fileward server.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/fileward/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use guard::{LockoutPolicy, UploadPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen must be a socket address like 127.0.0.1:8080, got {0}")]
    InvalidListenAddress(String),

    #[error("request_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidRequestTimeout(u64),

    #[error("max_files must be between 1 and 100, got {0}")]
    InvalidMaxFiles(usize),

    #[error("max_file_bytes must be greater than 0, got {0}")]
    InvalidMaxFileBytes(u64),

    #[error("staging_limit_bytes ({staging}) must be at least max_file_bytes ({max_file})")]
    StagingLimitTooSmall { staging: u64, max_file: u64 },

    #[error("allowed_extensions must not be empty")]
    EmptyAllowedExtensions,

    #[error("allowed extension must be lowercase alphanumeric without a dot, got {0:?}")]
    InvalidExtension(String),

    #[error("max_attempts must be between 1 and 100, got {0}")]
    InvalidMaxAttempts(u32),

    #[error("lockout_secs must be between 1 and 86400, got {0}")]
    InvalidLockout(u64),

    #[error("csrf_ttl_secs must be between 60 and 86400, got {0}")]
    InvalidCsrfTtl(u64),

    #[error("session_idle_secs must be between 60 and 604800, got {0}")]
    InvalidSessionIdle(u64),

    #[error("max_sessions must be between 100 and 1000000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("min_password_length must be between 8 and 1024, got {0}")]
    InvalidMinPasswordLength(usize),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Fileward server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings.
    pub server: ServerConfig,

    /// Served root and application data.
    pub storage: StorageConfig,

    /// Upload limits.
    pub upload: UploadConfig,

    /// Authentication and token settings.
    pub security: SecurityConfig,

    /// Logging output.
    pub log: LogConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub listen: String,

    /// Set when a TLS-terminating proxy sits in front of the server.
    /// Enables the `Secure` cookie flag and HSTS.
    pub behind_tls: bool,

    /// Time allowed until response headers are produced.
    pub request_timeout_secs: u64,
}

/// Served root and application data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory exposed through the file manager. Created if missing.
    pub root: PathBuf,

    /// Credential, setup marker, audit log and upload staging.
    pub data_dir: PathBuf,
}

/// Upload limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    /// Files processed per request.
    pub max_files: usize,

    /// Largest accepted file.
    pub max_file_bytes: u64,

    /// Bytes staged per part before the part is cut off as too large.
    pub staging_limit_bytes: u64,

    /// Accepted lowercase extensions.
    pub allowed_extensions: Vec<String>,
}

/// Authentication and token settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Failed logins before a lockout.
    pub max_attempts: u32,

    /// Lockout duration.
    pub lockout_secs: u64,

    /// CSRF token lifetime.
    pub csrf_ttl_secs: u64,

    /// Idle time before a session is discarded.
    pub session_idle_secs: u64,

    /// Sessions held before anonymous ones are evicted.
    pub max_sessions: usize,

    /// Minimum password length at setup.
    pub min_password_length: usize,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Logging output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            behind_tls: false,
            request_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./files"),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        let policy = UploadPolicy::default();
        Self {
            max_files: policy.max_files,
            max_file_bytes: policy.max_file_bytes,
            staging_limit_bytes: 64 * 1024 * 1024, // 64MB
            allowed_extensions: policy.allowed_extensions,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_attempts: guard::session::DEFAULT_MAX_ATTEMPTS,
            lockout_secs: guard::session::DEFAULT_LOCKOUT_SECS as u64,
            csrf_ttl_secs: guard::CSRF_TOKEN_TTL_SECS as u64,
            session_idle_secs: guard::session::DEFAULT_SESSION_IDLE_SECS as u64,
            max_sessions: guard::session::DEFAULT_MAX_SESSIONS,
            min_password_length: guard::MIN_PASSWORD_LENGTH,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl UploadConfig {
    /// Upload rules for the validator.
    pub fn policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_files: self.max_files,
            max_file_bytes: self.max_file_bytes,
            allowed_extensions: self.allowed_extensions.clone(),
        }
    }
}

impl SecurityConfig {
    /// Lockout thresholds for the authenticator.
    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: self.max_attempts,
            lockout_secs: self.lockout_secs as i64,
        }
    }
}

impl StorageConfig {
    /// Audit log directory.
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    /// Upload staging directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileward")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fileward")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - FILEWARD_ROOT: Override the served root directory
    /// - FILEWARD_LISTEN: Override the listen address
    /// - FILEWARD_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("FILEWARD_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage root from environment: {}", root);
                self.storage.root = PathBuf::from(root);
            }
        }

        if let Ok(listen) = std::env::var("FILEWARD_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen address from environment: {}", listen);
                self.server.listen = listen;
            }
        }

        if let Ok(level) = std::env::var("FILEWARD_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddress(self.server.listen.clone()));
        }

        let timeout = self.server.request_timeout_secs;
        if !(1..=3600).contains(&timeout) {
            return Err(ConfigError::InvalidRequestTimeout(timeout));
        }

        let upload = &self.upload;
        if !(1..=100).contains(&upload.max_files) {
            return Err(ConfigError::InvalidMaxFiles(upload.max_files));
        }
        if upload.max_file_bytes == 0 {
            return Err(ConfigError::InvalidMaxFileBytes(upload.max_file_bytes));
        }
        if upload.staging_limit_bytes < upload.max_file_bytes {
            return Err(ConfigError::StagingLimitTooSmall {
                staging: upload.staging_limit_bytes,
                max_file: upload.max_file_bytes,
            });
        }
        if upload.allowed_extensions.is_empty() {
            return Err(ConfigError::EmptyAllowedExtensions);
        }
        for ext in &upload.allowed_extensions {
            let well_formed = !ext.is_empty()
                && ext
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !well_formed {
                return Err(ConfigError::InvalidExtension(ext.clone()));
            }
        }

        let security = &self.security;
        if !(1..=100).contains(&security.max_attempts) {
            return Err(ConfigError::InvalidMaxAttempts(security.max_attempts));
        }
        if !(1..=86_400).contains(&security.lockout_secs) {
            return Err(ConfigError::InvalidLockout(security.lockout_secs));
        }
        if !(60..=86_400).contains(&security.csrf_ttl_secs) {
            return Err(ConfigError::InvalidCsrfTtl(security.csrf_ttl_secs));
        }
        if !(60..=604_800).contains(&security.session_idle_secs) {
            return Err(ConfigError::InvalidSessionIdle(security.session_idle_secs));
        }
        if !(100..=1_000_000).contains(&security.max_sessions) {
            return Err(ConfigError::InvalidMaxSessions(security.max_sessions));
        }
        if !(8..=1024).contains(&security.min_password_length) {
            return Err(ConfigError::InvalidMinPasswordLength(
                security.min_password_length,
            ));
        }

        // Validate log level is a known value
        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// Read `path`, falling back to defaults when it does not exist.
    ///
    /// A file that exists but fails to parse is an error; a typo must not
    /// silently widen what the server exposes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file; using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))
            }
        };

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// [`load`](Self::load) from [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", describe_toml_error(&e)))
    }

    /// Write the configuration to `path`, creating its directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "Configuration written");
        Ok(())
    }

    /// Pretty-printed TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Parser message plus byte offsets when the parser reports them.
fn describe_toml_error(error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => format!("{} (bytes {}..{})", error.message(), span.start, span.end),
        None => error.message().to_string(),
    }
}
