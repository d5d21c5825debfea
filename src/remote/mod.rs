//! Remote file-transfer sessions.
//!
//! The source and sink only ever talk to a [`RemoteSession`]. Sessions come
//! from a [`SessionFactory`] and are handed out through a [`SessionPool`].
//!
//! # Backends
//!
//! - **sftp**: SSH file transfer via `ssh2`
//! - **ftp**: plain FTP via `suppaftp`, passive or active data connections
//! - **local**: a directory on this machine standing in for the remote side
//!   (mounted shares, staging areas, end-to-end tests)
//! - **memory**: in-process filesystem with failure injection, for tests and
//!   embedding

pub mod ftp;
pub mod local;
pub mod memory;
pub mod pool;
pub mod sftp;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Protocol, SessionConfig};
use crate::error::SessionError;

pub use ftp::{FtpFactory, FtpSettings};
pub use local::LocalDirFactory;
pub use memory::MemoryFileSystem;
pub use pool::{PoolSettings, PooledSession, SessionPool};
pub use sftp::{SftpFactory, SftpSettings};

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFileMetadata {
    /// Base name as reported by the server.
    pub name: String,
    /// Full remote path of the entry.
    pub path: String,
    /// Size in bytes (0 for directories or when the server does not say).
    pub size: u64,
    /// Last modification time, when the server reports one.
    pub modified: Option<DateTime<Utc>>,
    pub is_directory: bool,
}

impl RemoteFileMetadata {
    pub fn file(dir: &str, name: &str, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.to_string(),
            path: join_remote(dir, name, "/"),
            size,
            modified,
            is_directory: false,
        }
    }

    pub fn directory(dir: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: join_remote(dir, name, "/"),
            size: 0,
            modified: None,
            is_directory: true,
        }
    }
}

/// How [`RemoteSession::write`] treats an existing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

/// A live connection to the remote endpoint.
///
/// A session is used by one operation at a time; the pool enforces that.
pub trait RemoteSession: Send {
    /// List the entries of `dir`, in server order.
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError>;

    fn exists(&mut self, path: &str) -> Result<bool, SessionError>;

    /// Stream the remote file at `path` into `out`. Returns bytes copied.
    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError>;

    /// Stream `input` into the remote file at `path`. Returns bytes copied.
    fn write(
        &mut self,
        path: &str,
        input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError>;

    /// Rename or move `from` to `to`, replacing `to` if it exists.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError>;

    fn remove(&mut self, path: &str) -> Result<(), SessionError>;

    /// Create `dir` and any missing parents.
    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError>;

    /// Whether the session can still be used. Checked before reuse.
    fn is_open(&self) -> bool {
        true
    }

    fn close(&mut self) {}
}

/// Opens new sessions against one endpoint.
pub trait SessionFactory: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SessionError>;

    /// Endpoint description for logs (never includes credentials).
    fn describe(&self) -> String;
}

/// Join a remote directory and a file name with `separator`.
///
/// An empty directory yields the bare name; a directory that already ends
/// with the separator is not doubled.
pub fn join_remote(dir: &str, name: &str, separator: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with(separator) {
        format!("{dir}{name}")
    } else {
        format!("{dir}{separator}{name}")
    }
}

/// Build the session factory described by `config`.
///
/// Call after [`crate::config::Config::validate`]; missing fields fall back
/// to empty values here.
pub fn factory_from_config(config: &SessionConfig) -> Arc<dyn SessionFactory> {
    match config.protocol {
        Protocol::Sftp => Arc::new(SftpFactory::new(SftpSettings {
            host: config.host.clone(),
            port: config.effective_port(),
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone(),
            private_key: config.private_key.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            data_timeout: Duration::from_millis(config.data_timeout_ms),
        })),
        Protocol::Ftp => Arc::new(FtpFactory::new(FtpSettings {
            host: config.host.clone(),
            port: config.effective_port(),
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone(),
            mode: config.ftp_mode,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            data_timeout: Duration::from_millis(config.data_timeout_ms),
        })),
        Protocol::Local => Arc::new(LocalDirFactory::new(
            config.root.clone().unwrap_or_default(),
        )),
    }
}

/// Build the factory and wrap it in a pool configured from `config`.
pub fn pool_from_config(config: &SessionConfig) -> Arc<SessionPool> {
    SessionPool::new(factory_from_config(config), PoolSettings::from(config))
}
