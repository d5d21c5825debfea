//! Configuration file loading and validation.
//!
//! One TOML file with `[session]`, `[source]` and `[sink]` tables. Every key
//! is optional; unknown keys are rejected so typos surface at startup.
//!
//! Lookup order: explicit path (`--config`), then `RFS_CONFIG`, then
//! `<config dir>/rfs/config.toml`. Only the last one may be missing, in which
//! case built-in defaults apply.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sink::{CollisionPolicy, FilenameExpression};
use crate::source::ReadingMode;

pub const CONFIG_ENV_VAR: &str = "RFS_CONFIG";
/// Fallback for `session.password`, so secrets can stay out of the file.
pub const PASSWORD_ENV_VAR: &str = "RFS_PASSWORD";

const APP_DIR_NAME: &str = "rfs";
const CONFIG_FILE_NAME: &str = "config.toml";
const REDACTED: &str = "********";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Sftp,
    /// Plain FTP. Credentials travel unencrypted.
    Ftp,
    /// A local directory standing in for the remote endpoint.
    Local,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sftp => "sftp",
            Self::Ftp => "ftp",
            Self::Local => "local",
        }
    }

    /// Port used when `session.port` is not set.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Sftp => Some(22),
            Self::Ftp => Some(21),
            Self::Local => None,
        }
    }
}

/// Which side opens FTP data connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FtpMode {
    /// The client connects to a port the server offers.
    #[default]
    Passive,
    /// The server connects back to the client.
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub protocol: Protocol,
    pub host: String,
    /// Defaults to 22 for sftp and 21 for ftp.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Private key file for public key authentication.
    pub private_key: Option<PathBuf>,
    /// Root directory for the `local` protocol.
    pub root: Option<PathBuf>,
    pub ftp_mode: FtpMode,
    pub cache_sessions: bool,
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl SessionConfig {
    /// The configured port, or the protocol's well-known one.
    pub fn effective_port(&self) -> u16 {
        self.port
            .or_else(|| self.protocol.default_port())
            .unwrap_or_default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Sftp,
            host: "localhost".into(),
            port: None,
            username: None,
            password: None,
            private_key: None,
            root: None,
            ftp_mode: FtpMode::Passive,
            cache_sessions: false,
            pool_size: 10,
            connect_timeout_ms: 10_000,
            data_timeout_ms: 30_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub remote_dir: String,
    pub local_dir: PathBuf,
    /// Glob matched against file names. Wins over `filename_regex`.
    pub filename_pattern: Option<String>,
    pub filename_regex: Option<String>,
    pub remote_file_separator: String,
    pub preserve_timestamp: bool,
    pub auto_create_local_dir: bool,
    pub tmp_file_suffix: String,
    pub delete_remote_files: bool,
    pub reading_mode: ReadingMode,
    pub metadata_namespace: String,
    /// SQLite file for ingestion records. In-memory when unset.
    pub metadata_db: Option<PathBuf>,
    pub initial_delay_ms: u64,
    pub fixed_delay_ms: u64,
    /// 0 means no limit.
    pub max_files_per_cycle: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            remote_dir: "/".into(),
            local_dir: std::env::temp_dir().join("rfs-source"),
            filename_pattern: None,
            filename_regex: None,
            remote_file_separator: "/".into(),
            preserve_timestamp: true,
            auto_create_local_dir: true,
            tmp_file_suffix: ".tmp".into(),
            delete_remote_files: false,
            reading_mode: ReadingMode::Ref,
            metadata_namespace: "rfs-source".into(),
            metadata_db: None,
            initial_delay_ms: 0,
            fixed_delay_ms: 1_000,
            max_files_per_cycle: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkConfig {
    pub remote_dir: String,
    /// Staging directory for temporary uploads. Defaults to `remote_dir`.
    pub temporary_remote_dir: Option<String>,
    pub tmp_file_suffix: String,
    pub remote_file_separator: String,
    pub use_temporary_filename: bool,
    pub auto_create_dir: bool,
    pub collision_policy: CollisionPolicy,
    /// Remote name template; see [`FilenameExpression`]. Defaults to `{name}`.
    pub filename_expression: Option<String>,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            remote_dir: "/".into(),
            temporary_remote_dir: None,
            tmp_file_suffix: ".tmp".into(),
            remote_file_separator: "/".into(),
            use_temporary_filename: true,
            auto_create_dir: true,
            collision_policy: CollisionPolicy::Replace,
            filename_expression: None,
            retry_max_attempts: 3,
            retry_initial_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub session: SessionConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Flag,
    Env,
    ConfigFile,
    Builtin,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::ConfigFile => "config",
            Self::Builtin => "builtin",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

impl Config {
    /// Locate and read the configuration. Call [`Config::validate`] before
    /// building anything from it.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let (path, source, required) = match explicit {
            Some(path) => (Some(expand_tilde(path)), ConfigSource::Flag, true),
            None => match std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
                Some(value) => (
                    Some(expand_tilde(Path::new(&value))),
                    ConfigSource::Env,
                    true,
                ),
                None => (default_path(), ConfigSource::ConfigFile, false),
            },
        };

        let (mut config, source) = match &path {
            Some(path) if path.exists() => (Self::from_file(path)?, source),
            Some(path) if required => return Err(ConfigError::NotFound(path.clone())),
            _ => (Self::default(), ConfigSource::Builtin),
        };

        if config.session.password.is_none()
            && let Ok(password) = std::env::var(PASSWORD_ENV_VAR)
            && !password.is_empty()
        {
            config.session.password = Some(password);
        }

        tracing::debug!(
            path = ?path,
            source = source.as_str(),
            protocol = ?config.session.protocol,
            "loaded configuration"
        );
        Ok(LoadedConfig {
            config,
            path: if source == ConfigSource::Builtin { None } else { path },
            source,
        })
    }

    /// Read one file. Relative paths inside it resolve against its directory.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.resolve_paths(path.parent());
        Ok(config)
    }

    /// Parse TOML text without touching the filesystem. Paths are kept as
    /// written apart from `~` expansion.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.resolve_paths(None);
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: Option<&Path>) {
        let resolve = |path: &mut PathBuf| *path = resolve_path(path, base_dir);
        if let Some(key) = self.session.private_key.as_mut() {
            resolve(key);
        }
        if let Some(root) = self.session.root.as_mut() {
            resolve(root);
        }
        resolve(&mut self.source.local_dir);
        if let Some(db) = self.source.metadata_db.as_mut() {
            resolve(db);
        }
    }

    /// Check everything that would otherwise fail later, mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        match session.protocol {
            Protocol::Sftp | Protocol::Ftp => {
                if session.host.trim().is_empty() {
                    return invalid("session.host must not be empty");
                }
                if session.port == Some(0) {
                    return invalid("session.port must be between 1 and 65535");
                }
                if session.username.as_deref().is_none_or(|u| u.trim().is_empty()) {
                    return invalid(format!(
                        "session.username is required for {}",
                        session.protocol.as_str()
                    ));
                }
                if session.protocol == Protocol::Ftp && session.private_key.is_some() {
                    return invalid("session.private_key is not supported for ftp");
                }
            }
            Protocol::Local => {
                if session.root.is_none() {
                    return invalid("session.root is required for the local protocol");
                }
            }
        }
        if session.pool_size == 0 {
            return invalid("session.pool_size must be at least 1");
        }

        let source = &self.source;
        check_separator("source.remote_file_separator", &source.remote_file_separator)?;
        if source.tmp_file_suffix.is_empty() {
            return invalid("source.tmp_file_suffix must not be empty");
        }
        if source.metadata_namespace.trim_end_matches('/').is_empty() {
            return invalid("source.metadata_namespace must not be empty");
        }
        if source.fixed_delay_ms == 0 {
            return invalid("source.fixed_delay_ms must be at least 1");
        }
        if let Some(pattern) = source.filename_pattern.as_deref()
            && let Err(e) = glob::Pattern::new(pattern)
        {
            return invalid(format!("source.filename_pattern {pattern:?}: {e}"));
        }
        if let Some(regex) = source.filename_regex.as_deref()
            && let Err(e) = regex::Regex::new(regex)
        {
            return invalid(format!("source.filename_regex {regex:?}: {e}"));
        }

        let sink = &self.sink;
        check_separator("sink.remote_file_separator", &sink.remote_file_separator)?;
        if sink.use_temporary_filename && sink.tmp_file_suffix.is_empty() {
            return invalid("sink.tmp_file_suffix must not be empty when use_temporary_filename is on");
        }
        if sink.retry_max_attempts == 0 {
            return invalid("sink.retry_max_attempts must be at least 1");
        }
        if let Some(template) = sink.filename_expression.as_deref() {
            FilenameExpression::parse(template)
                .map_err(|e| ConfigError::Invalid(format!("sink.filename_expression: {e}")))?;
        }
        Ok(())
    }

    /// Copy safe to print: secrets replaced.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.session.password.is_some() {
            copy.session.password = Some(REDACTED.into());
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn invalid<T>(message: impl Into<String>) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.into()))
}

fn check_separator(key: &str, separator: &str) -> Result<(), ConfigError> {
    if separator.chars().count() != 1 {
        return invalid(format!("{key} must be a single character, got {separator:?}"));
    }
    Ok(())
}

/// `<config dir>/rfs/config.toml`, when the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn resolve_path(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    let path = expand_tilde(path);
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
        _ => path,
    }
}
