//! Error types shared by the source and sink pipelines.
//!
//! Two layers:
//!
//! - [`SessionError`] is raised by remote sessions and the session pool. It
//!   knows whether a failure is fatal, retryable, or leaves the session unusable.
//! - [`FlowError`] is what the source and sink report to their callers. Every
//!   session failure is classified into one of its kinds on the way up.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::metadata::StoreError;

/// Errors raised by a remote session or by the pool handing sessions out.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote operation timed out: {0}")]
    Timeout(String),

    #[error("Remote path not found: {0}")]
    NotFound(String),

    #[error("No remote session became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Remote server rejected the request: {0}")]
    Protocol(String),

    #[error("Remote I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Connect and authentication failures are reported upward without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Auth(_))
    }

    /// Failures worth re-attempting on the next cycle or with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::PoolExhausted(_) | Self::Io(_))
    }

    /// Whether the session that produced this error must be discarded
    /// instead of going back to the pool.
    pub fn breaks_session(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Auth(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

/// Errors reported by the polling source and the atomic sink.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Connect or authentication failure. Fatal, never retried by the core.
    #[error("Remote connection failed: {0}")]
    Connection(#[source] SessionError),

    /// Network blip or timeout. The source retries on its next cycle, the
    /// sink leaves the decision to its caller.
    #[error("Transient remote failure: {0}")]
    TransientIo(#[source] SessionError),

    /// Terminal sink-side or per-file failure (collision under `fail`,
    /// rejected remote write, missing remote directory).
    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Local I/O failed for {}: {source}", path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Metadata store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to emit file event: {0}")]
    Emit(String),
}

impl FlowError {
    pub fn local_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// Errors that must stop a long-running poller instead of waiting for the
    /// next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Emit(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<SessionError> for FlowError {
    fn from(err: SessionError) -> Self {
        if err.is_fatal() {
            Self::Connection(err)
        } else if err.is_retryable() {
            Self::TransientIo(err)
        } else {
            Self::Transfer(err.to_string())
        }
    }
}
