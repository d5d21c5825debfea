//! Atomic remote file sink.
//!
//! Uploads go to a temporary name (optionally in a separate staging
//! directory) and are renamed into place once complete, so anything listing
//! the target directory sees either nothing or the whole file.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, Shutdown};
use crate::config::{ConfigError, SinkConfig};
use crate::error::FlowError;
use crate::remote::{PooledSession, RemoteSession, SessionPool, WriteMode, join_remote};

/// What to do when the target name already exists remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Refuse the transfer.
    Fail,
    /// Overwrite the existing file.
    #[default]
    Replace,
    /// Drop the transfer and report success.
    Ignore,
    /// Write after the existing content.
    Append,
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "replace" => Ok(Self::Replace),
            "ignore" => Ok(Self::Ignore),
            "append" => Ok(Self::Append),
            other => Err(format!(
                "unknown collision policy '{other}' (expected fail, replace, ignore or append)"
            )),
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fail => "fail",
            Self::Replace => "replace",
            Self::Ignore => "ignore",
            Self::Append => "append",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Keep,
    Upper,
    Lower,
}

impl Case {
    fn apply(self, s: &str) -> String {
        match self {
            Self::Keep => s.to_string(),
            Self::Upper => s.to_uppercase(),
            Self::Lower => s.to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Name(Case),
    Stem(Case),
    Ext,
    Timestamp,
}

/// Template computing the remote file name from the local one.
///
/// Placeholders: `{name}` (local base name), `{stem}` (name without its last
/// extension), `{ext}` (last extension, without the dot), `{timestamp}`
/// (UTC, `YYYYMMDDhhmmss`). `{name}` and `{stem}` take an optional `:upper`
/// or `:lower` modifier. Everything else is copied literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameExpression {
    source: String,
    segments: Vec<Segment>,
}

impl Default for FilenameExpression {
    fn default() -> Self {
        Self {
            source: "{name}".into(),
            segments: vec![Segment::Name(Case::Keep)],
        }
    }
}

impl FilenameExpression {
    pub fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| format!("unclosed '{{' in filename expression {template:?}"))?;
            segments.push(parse_placeholder(&after[..close])?);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            return Err("filename expression is empty".into());
        }
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the remote name for `local`.
    pub fn render(&self, local: &Path, now: DateTime<Utc>) -> Result<String, FlowError> {
        let name = local
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                FlowError::Transfer(format!("{} has no usable file name", local.display()))
            })?;
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, ext),
            _ => (name, ""),
        };

        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Name(case) => out.push_str(&case.apply(name)),
                Segment::Stem(case) => out.push_str(&case.apply(stem)),
                Segment::Ext => out.push_str(ext),
                Segment::Timestamp => out.push_str(&now.format("%Y%m%d%H%M%S").to_string()),
            }
        }

        if out.is_empty() || out == "." || out == ".." {
            return Err(FlowError::Transfer(format!(
                "filename expression {:?} produced {out:?} for {name}",
                self.source
            )));
        }
        Ok(out)
    }
}

fn parse_placeholder(placeholder: &str) -> Result<Segment, String> {
    let (field, modifier) = match placeholder.split_once(':') {
        Some((field, modifier)) => (field, Some(modifier)),
        None => (placeholder, None),
    };
    let case = match modifier {
        None => Case::Keep,
        Some("upper") => Case::Upper,
        Some("lower") => Case::Lower,
        Some(other) => return Err(format!("unknown modifier '{other}' in {{{placeholder}}}")),
    };
    match (field, case) {
        ("name", case) => Ok(Segment::Name(case)),
        ("stem", case) => Ok(Segment::Stem(case)),
        ("ext", Case::Keep) => Ok(Segment::Ext),
        ("timestamp", Case::Keep) => Ok(Segment::Timestamp),
        _ => Err(format!("unknown placeholder {{{placeholder}}}")),
    }
}

/// One transfer, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundTransferRequest {
    pub local_path: PathBuf,
    pub target_remote_dir: String,
    pub target_file_name: String,
    pub collision_policy: CollisionPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum SendOutcome {
    Uploaded { remote_path: String, bytes: u64 },
    Appended { remote_path: String, bytes: u64 },
    /// Target existed under the `ignore` policy; nothing was written.
    Ignored { remote_path: String },
}

impl SendOutcome {
    pub fn remote_path(&self) -> &str {
        match self {
            Self::Uploaded { remote_path, .. }
            | Self::Appended { remote_path, .. }
            | Self::Ignored { remote_path } => remote_path,
        }
    }
}

/// Exponential backoff for [`AtomicRemoteFileSink::send_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Remote paths that a transfer in this process is writing or renaming
/// onto. Claims are all-or-nothing, so two transfers never share a temporary
/// name or race between the collision check and the rename.
#[derive(Default)]
struct InFlight {
    paths: Mutex<HashSet<String>>,
    released: Condvar,
}

impl InFlight {
    /// Block until none of `paths` is claimed, then claim them all.
    fn claim(&self, paths: Vec<String>) -> Claim<'_> {
        let mut held = self.paths.lock();
        while paths.iter().any(|path| held.contains(path)) {
            self.released.wait(&mut held);
        }
        held.extend(paths.iter().cloned());
        Claim {
            in_flight: self,
            paths,
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

struct Claim<'a> {
    in_flight: &'a InFlight,
    paths: Vec<String>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut held = self.in_flight.paths.lock();
        for path in &self.paths {
            held.remove(path);
        }
        drop(held);
        self.in_flight.released.notify_all();
    }
}

/// Uploads local files into a remote directory.
///
/// Transfers through one sink to the same target (or the same temporary
/// name) are serialized. Separate processes writing the same target can
/// still both pass the `Fail` check or overwrite each other's temporary
/// file; give them distinct `tmp_file_suffix` values or target names.
pub struct AtomicRemoteFileSink {
    config: SinkConfig,
    pool: Arc<SessionPool>,
    expression: FilenameExpression,
    clock: Arc<dyn Clock>,
    in_flight: InFlight,
}

impl AtomicRemoteFileSink {
    pub fn new(
        config: SinkConfig,
        pool: Arc<SessionPool>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let expression = match config.filename_expression.as_deref() {
            Some(template) => FilenameExpression::parse(template).map_err(ConfigError::Invalid)?,
            None => FilenameExpression::default(),
        };
        Ok(Self {
            config,
            pool,
            expression,
            clock,
            in_flight: InFlight::default(),
        })
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Resolve where `local` would be uploaded.
    pub fn request_for(&self, local: &Path) -> Result<OutboundTransferRequest, FlowError> {
        Ok(OutboundTransferRequest {
            local_path: local.to_path_buf(),
            target_remote_dir: self.config.remote_dir.clone(),
            target_file_name: self.expression.render(local, self.clock.now())?,
            collision_policy: self.config.collision_policy,
        })
    }

    /// Upload one local file.
    pub fn send(&self, local: &Path) -> Result<SendOutcome, FlowError> {
        let request = self.request_for(local)?;
        self.transfer(&request)
    }

    /// Like [`send`](Self::send), retrying transient failures with
    /// exponential backoff. Other failures are returned at once.
    pub fn send_with_retry(
        &self,
        local: &Path,
        policy: &RetryPolicy,
        shutdown: &Shutdown,
    ) -> Result<SendOutcome, FlowError> {
        let mut attempt = 1;
        loop {
            match self.send(local) {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        file = %local.display(),
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transfer failed; retrying"
                    );
                    if self.clock.sleep(delay, shutdown) {
                        return Err(e);
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Carry out a resolved request.
    pub fn transfer(&self, request: &OutboundTransferRequest) -> Result<SendOutcome, FlowError> {
        let local = &request.local_path;
        let metadata = std::fs::metadata(local).map_err(|e| FlowError::local_io(local, e))?;
        if !metadata.is_file() {
            return Err(FlowError::local_io(
                local,
                io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let mut input = File::open(local).map_err(|e| FlowError::local_io(local, e))?;

        let separator = &self.config.remote_file_separator;
        let target_dir = &request.target_remote_dir;
        let final_path = join_remote(target_dir, &request.target_file_name, separator);
        let staging = self.config.use_temporary_filename.then(|| {
            let temp_dir = self
                .config
                .temporary_remote_dir
                .as_deref()
                .unwrap_or(target_dir);
            let temp_name = format!("{}{}", request.target_file_name, self.config.tmp_file_suffix);
            (temp_dir, join_remote(temp_dir, &temp_name, separator))
        });

        let mut claimed = vec![final_path.clone()];
        claimed.extend(staging.iter().map(|(_, temp_path)| temp_path.clone()));
        let _claim = self.in_flight.claim(claimed);

        let mut session = self.pool.acquire()?;
        self.ensure_dir(&mut session, target_dir)?;

        if session.exists(&final_path)? {
            match request.collision_policy {
                CollisionPolicy::Fail => {
                    return Err(FlowError::Transfer(format!(
                        "remote file {final_path} already exists"
                    )));
                }
                CollisionPolicy::Ignore => {
                    tracing::info!(remote = %final_path, "target exists; ignoring transfer");
                    return Ok(SendOutcome::Ignored {
                        remote_path: final_path,
                    });
                }
                CollisionPolicy::Append => {
                    // An append cannot be staged under another name.
                    let bytes = session.write(&final_path, &mut input, WriteMode::Append)?;
                    tracing::info!(remote = %final_path, bytes, "appended");
                    return Ok(SendOutcome::Appended {
                        remote_path: final_path,
                        bytes,
                    });
                }
                CollisionPolicy::Replace => {}
            }
        }

        let bytes = if let Some((temp_dir, temp_path)) = &staging {
            if *temp_dir != target_dir.as_str() {
                self.ensure_dir(&mut session, temp_dir)?;
            }
            self.upload_then_rename(&mut session, &mut input, temp_path, &final_path)?
        } else {
            session.write(&final_path, &mut input, WriteMode::Truncate)?
        };

        tracing::info!(
            file = %local.display(),
            remote = %final_path,
            bytes,
            "uploaded"
        );
        Ok(SendOutcome::Uploaded {
            remote_path: final_path,
            bytes,
        })
    }

    fn upload_then_rename(
        &self,
        session: &mut PooledSession,
        input: &mut File,
        temp_path: &str,
        final_path: &str,
    ) -> Result<u64, FlowError> {
        let result = session
            .write(temp_path, input, WriteMode::Truncate)
            .and_then(|bytes| session.rename(temp_path, final_path).map(|()| bytes));
        match result {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                if let Err(cleanup) = session.remove(temp_path) {
                    tracing::debug!(remote = %temp_path, error = %cleanup, "could not remove temporary upload");
                }
                Err(e.into())
            }
        }
    }

    fn ensure_dir(&self, session: &mut PooledSession, dir: &str) -> Result<(), FlowError> {
        if dir.is_empty() || session.exists(dir)? {
            return Ok(());
        }
        if !self.config.auto_create_dir {
            return Err(FlowError::Transfer(format!(
                "remote directory {dir} does not exist"
            )));
        }
        session.mkdirs(dir)?;
        tracing::debug!(remote_dir = %dir, "created remote directory");
        Ok(())
    }
}
