//! Polling file source.
//!
//! One [`PollingFileSource::poll_cycle`] is a full pass over the remote
//! directory:
//!
//! 1. **Listing**: one session, one `list`, released straight away.
//! 2. **Filtering**: name filter, then the persistent "already ingested"
//!    filter, entry by entry in listing order.
//! 3. **Downloading**: each accepted entry gets its own session and is
//!    streamed to `<name><tmp suffix>` in the local directory, then renamed.
//! 4. **Emitting**: one [`FileEvent`] per downloaded file, in listing order.
//!
//! Filtering and downloading are interleaved, so a cancelled cycle never
//! leaves accepted-but-not-downloaded entries behind it.
//!
//! # Dedup window
//!
//! The persistent filter records an entry before it is downloaded. If that
//! download fails, the entry is reported in [`CycleReport::failed`] and will
//! not be retried by later cycles until its record is removed
//! (`rfs metadata forget <path>`).

pub mod poller;
pub mod reading;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use filetime::FileTime;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::config::{ConfigError, SourceConfig};
use crate::error::FlowError;
use crate::filter::{FileFilter, FilterChain, PersistentFilter, name_filter};
use crate::metadata::MetadataStore;
use crate::remote::{RemoteFileMetadata, RemoteSession, SessionPool, join_remote};

pub use poller::{Poller, PollerSummary, Trigger};
pub use reading::{EventEmitter, FileEvent, JsonLinesEmitter, LocalStagedFile, Payload, ReadingMode};

/// Where the source is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Idle,
    Listing,
    Filtering,
    Downloading,
    Emitting,
}

/// A file that was accepted but could not be downloaded or read back.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub remote_path: String,
    pub error: String,
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Regular files in the listing.
    pub listed: usize,
    /// Entries that passed every filter.
    pub accepted: usize,
    pub emitted: usize,
    pub failed: Vec<FileFailure>,
    /// The cycle stopped early because cancellation was requested.
    pub cancelled: bool,
    /// Another cycle was already running; nothing was done.
    pub skipped: bool,
    pub duration_ms: u64,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record_failure(&mut self, remote_path: &str, error: &FlowError) {
        self.failed.push(FileFailure {
            remote_path: remote_path.to_string(),
            error: error.to_string(),
        });
    }
}

pub struct PollingFileSource {
    config: SourceConfig,
    pool: Arc<SessionPool>,
    filter: FilterChain,
    state: Mutex<SourceState>,
    cycle: Mutex<()>,
}

impl PollingFileSource {
    /// Build a source whose filter chain is the configured name filter
    /// followed by a [`PersistentFilter`] over `store`.
    pub fn new(
        config: SourceConfig,
        pool: Arc<SessionPool>,
        store: Arc<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let mut filter = FilterChain::new();
        if let Some(names) = name_filter(
            config.filename_pattern.as_deref(),
            config.filename_regex.as_deref(),
        )? {
            filter.push(names);
        }
        filter.push(Box::new(PersistentFilter::new(
            store,
            &config.metadata_namespace,
            clock,
        )));
        Ok(Self::with_filter(config, pool, filter))
    }

    /// Build a source with a caller-supplied filter chain.
    pub fn with_filter(config: SourceConfig, pool: Arc<SessionPool>, filter: FilterChain) -> Self {
        Self {
            config,
            pool,
            filter,
            state: Mutex::new(SourceState::Idle),
            cycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    fn set_state(&self, state: SourceState) {
        *self.state.lock() = state;
    }

    /// Run one cycle, sending events to `emitter`.
    ///
    /// Returns an error when the cycle as a whole failed: the listing failed,
    /// the local directory is unusable, the metadata store failed, the
    /// connection was lost, or the emitter refused an event. Per-file
    /// failures are reported in [`CycleReport::failed`] instead.
    pub fn poll_cycle(
        &self,
        emitter: &mut dyn EventEmitter,
        cancel: &AtomicBool,
    ) -> Result<CycleReport, FlowError> {
        let Some(_running) = self.cycle.try_lock() else {
            tracing::warn!(remote_dir = %self.config.remote_dir, "poll cycle already running; skipping");
            return Ok(CycleReport::skipped());
        };

        let started = Instant::now();
        let mut report = CycleReport::default();
        let result = self.run_cycle(emitter, cancel, &mut report);
        self.set_state(SourceState::Idle);
        report.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::info!(
                    remote_dir = %self.config.remote_dir,
                    listed = report.listed,
                    accepted = report.accepted,
                    emitted = report.emitted,
                    failed = report.failed.len(),
                    cancelled = report.cancelled,
                    duration_ms = report.duration_ms,
                    "poll cycle completed"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(
                    remote_dir = %self.config.remote_dir,
                    emitted = report.emitted,
                    error = %e,
                    "poll cycle aborted"
                );
                Err(e)
            }
        }
    }

    fn run_cycle(
        &self,
        emitter: &mut dyn EventEmitter,
        cancel: &AtomicBool,
        report: &mut CycleReport,
    ) -> Result<(), FlowError> {
        self.prepare_local_dir()?;

        self.set_state(SourceState::Listing);
        let files = self.list()?;
        report.listed = files.len();
        tracing::debug!(remote_dir = %self.config.remote_dir, files = files.len(), "listed remote directory");

        let limit = self.config.max_files_per_cycle;
        let mut staged = Vec::new();
        let mut aborted = None;
        for file in &files {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }
            if limit > 0 && report.accepted >= limit {
                tracing::debug!(limit, "per-cycle file limit reached");
                break;
            }

            self.set_state(SourceState::Filtering);
            match self.filter.accept(file) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    aborted = Some(e);
                    break;
                }
            }
            report.accepted += 1;

            self.set_state(SourceState::Downloading);
            match self.download(file) {
                Ok(local) => staged.push(local),
                Err(e) if e.is_fatal() => {
                    report.record_failure(&file.path, &e);
                    aborted = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(file = %file.path, error = %e, "download failed; file stays recorded");
                    report.record_failure(&file.path, &e);
                }
            }
        }

        // Downloaded files are already recorded, so they are always emitted,
        // even when the cycle is being cut short by a failing store or session.
        self.set_state(SourceState::Emitting);
        for local in staged {
            let remote_path = local.source_remote_path.clone();
            match FileEvent::read(local, self.config.reading_mode) {
                Ok(event) => {
                    emitter.emit(event)?;
                    report.emitted += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %remote_path, error = %e, "could not read staged file");
                    report.record_failure(&remote_path, &e);
                }
            }
        }

        match aborted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete temporary downloads left in the local directory by a process
    /// that died mid-transfer. Returns how many were removed.
    pub fn clean_partial_downloads(&self) -> Result<usize, FlowError> {
        let dir = &self.config.local_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(FlowError::local_io(dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry.map_err(|e| FlowError::local_io(dir, e))?.path();
            if path.is_file() && is_partial_download(&path, &self.config.tmp_file_suffix) {
                fs::remove_file(&path).map_err(|e| FlowError::local_io(&path, e))?;
                tracing::info!(path = %path.display(), "removed stale partial download");
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn prepare_local_dir(&self) -> Result<(), FlowError> {
        let dir = &self.config.local_dir;
        if dir.is_dir() {
            return Ok(());
        }
        if !self.config.auto_create_local_dir {
            return Err(FlowError::local_io(
                dir,
                io::Error::new(io::ErrorKind::NotFound, "local directory does not exist"),
            ));
        }
        fs::create_dir_all(dir).map_err(|e| FlowError::local_io(dir, e))?;
        tracing::debug!(local_dir = %dir.display(), "created local directory");
        Ok(())
    }

    /// Regular files of the remote directory, in listing order, with paths
    /// built using the configured separator.
    fn list(&self) -> Result<Vec<RemoteFileMetadata>, FlowError> {
        let entries = {
            let mut session = self.pool.acquire()?;
            session.list(&self.config.remote_dir)?
        };
        let separator = &self.config.remote_file_separator;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_directory)
            .map(|mut entry| {
                entry.path = join_remote(&self.config.remote_dir, &entry.name, separator);
                entry
            })
            .collect())
    }

    fn download(&self, file: &RemoteFileMetadata) -> Result<LocalStagedFile, FlowError> {
        if !is_plain_name(&file.name) {
            return Err(FlowError::Transfer(format!(
                "refusing to download {:?}: not a plain file name",
                file.name
            )));
        }

        let final_path = self.config.local_dir.join(&file.name);
        let temp_path = self
            .config
            .local_dir
            .join(format!("{}{}", file.name, self.config.tmp_file_suffix));

        let partial = PartialFile::new(temp_path.clone());
        let out = File::create(&temp_path).map_err(|e| FlowError::local_io(&temp_path, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(out));

        let bytes = {
            let mut session = self.pool.acquire()?;
            session.read(&file.path, &mut writer)?
        };

        let (buffered, sha256) = writer.finish();
        let out = buffered
            .into_inner()
            .map_err(|e| FlowError::local_io(&temp_path, e.into_error()))?;
        out.sync_all()
            .map_err(|e| FlowError::local_io(&temp_path, e))?;
        drop(out);

        if self.config.preserve_timestamp
            && let Some(modified) = file.modified
        {
            let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
            filetime::set_file_mtime(&temp_path, mtime)
                .map_err(|e| FlowError::local_io(&temp_path, e))?;
        }

        fs::rename(&temp_path, &final_path).map_err(|e| FlowError::local_io(&final_path, e))?;
        partial.keep();

        tracing::debug!(
            file = %file.path,
            local = %final_path.display(),
            bytes,
            "downloaded"
        );

        if self.config.delete_remote_files {
            self.delete_remote(file, bytes);
        }

        Ok(LocalStagedFile {
            local_path: final_path,
            source_remote_path: file.path.clone(),
            size: bytes,
            modified: file.modified,
            sha256,
        })
    }

    /// Remove the remote original once the local copy is known complete.
    /// Failures only cost a stale remote file, so they are logged.
    fn delete_remote(&self, file: &RemoteFileMetadata, downloaded: u64) {
        if downloaded != file.size {
            tracing::warn!(
                file = %file.path,
                listed = file.size,
                downloaded,
                "size mismatch; keeping remote file"
            );
            return;
        }
        let result = self
            .pool
            .acquire()
            .and_then(|mut session| session.remove(&file.path));
        match result {
            Ok(()) => tracing::debug!(file = %file.path, "deleted remote file"),
            Err(e) => tracing::warn!(file = %file.path, error = %e, "failed to delete remote file"),
        }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Removes a temporary download on drop unless [`PartialFile::keep`] was
/// called after the final rename.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed
            && let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial download");
        }
    }
}

/// Hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Returns `true` when `path` is a temporary download left by this source.
pub fn is_partial_download(path: &Path, tmp_file_suffix: &str) -> bool {
    !tmp_file_suffix.is_empty()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(tmp_file_suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metadata::MemoryMetadataStore;
    use crate::remote::{MemoryFileSystem, PoolSettings};
    use chrono::DateTime;

    struct Fixture {
        remote: MemoryFileSystem,
        store: Arc<MemoryMetadataStore>,
        local: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let remote = MemoryFileSystem::new();
            remote.create_dir("/outbox");
            Self {
                remote,
                store: Arc::new(MemoryMetadataStore::new()),
                local: tempfile::tempdir().unwrap(),
            }
        }

        fn config(&self) -> SourceConfig {
            SourceConfig {
                remote_dir: "/outbox".into(),
                local_dir: self.local.path().join("spool"),
                filename_pattern: Some("*.txt".into()),
                ..SourceConfig::default()
            }
        }

        fn source(&self, config: SourceConfig) -> PollingFileSource {
            let pool = SessionPool::new(Arc::new(self.remote.clone()), PoolSettings::default());
            let clock = Arc::new(ManualClock::new(
                DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            ));
            PollingFileSource::new(config, pool, self.store.clone(), clock).unwrap()
        }
    }

    fn poll(source: &PollingFileSource) -> (CycleReport, Vec<FileEvent>) {
        let mut events = Vec::<FileEvent>::new();
        let report = source
            .poll_cycle(&mut events, &AtomicBool::new(false))
            .unwrap();
        (report, events)
    }

    #[test]
    fn test_download_and_emit_in_listing_order() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/b.txt", b"bbb");
        fx.remote.put_file("/outbox/a.txt", b"a");
        fx.remote.put_file("/outbox/c.csv", b"c");
        fx.remote.create_dir("/outbox/sub.txt");

        let source = fx.source(fx.config());
        let (report, events) = poll(&source);

        assert_eq!(report.listed, 3);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.emitted, 2);
        let names: Vec<_> = events
            .iter()
            .map(|e| e.file.local_path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(events[1].file.size, 3);
        assert_eq!(events[1].file.source_remote_path, "/outbox/b.txt");
        assert_eq!(
            events[0].file.sha256,
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
        assert_eq!(fs::read(&events[1].file.local_path).unwrap(), b"bbb");
        assert_eq!(source.state(), SourceState::Idle);
    }

    #[test]
    fn test_second_poll_emits_nothing() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        let source = fx.source(fx.config());

        assert_eq!(poll(&source).1.len(), 1);
        let (report, events) = poll(&source);
        assert!(events.is_empty());
        assert_eq!(report.accepted, 0);
        assert_eq!(report.listed, 1);
    }

    #[test]
    fn test_failed_download_is_isolated_and_stays_recorded() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        fx.remote.put_file("/outbox/b.txt", b"b");
        fx.remote.put_file("/outbox/c.txt", b"c");
        fx.remote.fail_reads_of("/outbox/b.txt");
        let config = fx.config();
        let spool = config.local_dir.clone();
        let source = fx.source(config);

        let (report, events) = poll(&source);
        assert_eq!(events.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].remote_path, "/outbox/b.txt");
        assert!(!spool.join("b.txt").exists());
        assert!(!spool.join("b.txt.tmp").exists());

        // Documented window: the record was written before the download.
        assert!(fx.store.get("rfs-source//outbox/b.txt").unwrap().is_some());
        assert!(poll(&source).1.is_empty());
    }

    /// Accepts the first `ok` entries, then fails like a broken store.
    struct StoreFailsAfter {
        ok: usize,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl FileFilter for StoreFailsAfter {
        fn accept(&self, _file: &RemoteFileMetadata) -> Result<bool, FlowError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.ok {
                return Ok(true);
            }
            Err(FlowError::Store(crate::metadata::StoreError::Io {
                path: "metadata.db".into(),
                source: io::Error::other("disk full"),
            }))
        }

        fn name(&self) -> &'static str {
            "store-fails-after"
        }
    }

    #[test]
    fn test_store_failure_still_emits_files_already_downloaded() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        fx.remote.put_file("/outbox/b.txt", b"b");
        let pool = SessionPool::new(Arc::new(fx.remote.clone()), PoolSettings::default());
        let filter = FilterChain::new().with(StoreFailsAfter {
            ok: 1,
            calls: Default::default(),
        });
        let source = PollingFileSource::with_filter(fx.config(), pool, filter);

        let mut events = Vec::<FileEvent>::new();
        let err = source
            .poll_cycle(&mut events, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, FlowError::Store(_)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].file.source_remote_path, "/outbox/a.txt");
        assert!(events[0].file.local_path.exists());
        assert_eq!(source.state(), SourceState::Idle);
    }

    #[test]
    fn test_invalid_utf8_in_lines_mode_fails_only_that_file() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"one\ntwo\n");
        fx.remote.put_file("/outbox/b.txt", b"\xff\xfe");
        let config = SourceConfig {
            reading_mode: ReadingMode::Lines,
            ..fx.config()
        };
        let source = fx.source(config);

        let (report, events) = poll(&source);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload,
            Payload::Lines {
                lines: vec!["one".into(), "two".into()]
            }
        );
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].remote_path, "/outbox/b.txt");
    }

    /// Polls the same source again from inside `emit`.
    struct ReentrantEmitter<'a> {
        source: &'a PollingFileSource,
        remote: &'a MemoryFileSystem,
        events: Vec<FileEvent>,
        nested: Vec<CycleReport>,
    }

    impl EventEmitter for ReentrantEmitter<'_> {
        fn emit(&mut self, event: FileEvent) -> Result<(), FlowError> {
            let connections = self.remote.connections();
            let mut inner = Vec::<FileEvent>::new();
            let report = self.source.poll_cycle(&mut inner, &AtomicBool::new(false))?;
            assert!(inner.is_empty());
            assert_eq!(self.remote.connections(), connections, "skipped cycle listed");
            assert_eq!(self.source.state(), SourceState::Emitting);
            self.nested.push(report);
            self.events.push(event);
            Ok(())
        }
    }

    #[test]
    fn test_overlapping_cycle_is_skipped() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        fx.remote.put_file("/outbox/b.txt", b"b");
        let source = fx.source(fx.config());

        let mut emitter = ReentrantEmitter {
            source: &source,
            remote: &fx.remote,
            events: Vec::new(),
            nested: Vec::new(),
        };
        let report = source
            .poll_cycle(&mut emitter, &AtomicBool::new(false))
            .unwrap();

        assert!(!report.skipped);
        assert_eq!(report.emitted, 2);
        assert_eq!(emitter.events.len(), 2);
        assert_eq!(emitter.nested.len(), 2);
        for nested in &emitter.nested {
            assert!(nested.skipped);
            assert_eq!(nested.listed, 0);
            assert_eq!(nested.accepted, 0);
        }
        // Only the outer cycle wrote records.
        assert_eq!(fx.store.len(), 2);
        assert_eq!(source.state(), SourceState::Idle);
    }

    #[test]
    fn test_missing_local_dir_without_auto_create_aborts() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        let config = SourceConfig {
            auto_create_local_dir: false,
            ..fx.config()
        };
        let source = fx.source(config);

        let err = source
            .poll_cycle(&mut Vec::<FileEvent>::new(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, FlowError::LocalIo { .. }));
        assert!(fx.store.is_empty());
    }

    #[test]
    fn test_listing_failure_aborts_cycle() {
        let fx = Fixture::new();
        let config = SourceConfig {
            remote_dir: "/missing".into(),
            ..fx.config()
        };
        let source = fx.source(config);
        let err = source
            .poll_cycle(&mut Vec::<FileEvent>::new(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, FlowError::Transfer(_)));
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let fx = Fixture::new();
        fx.remote.fail_auth(true);
        let source = fx.source(fx.config());
        let err = source
            .poll_cycle(&mut Vec::<FileEvent>::new(), &AtomicBool::new(false))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cancelled_before_first_file() {
        let fx = Fixture::new();
        fx.remote.put_file("/outbox/a.txt", b"a");
        let source = fx.source(fx.config());

        let mut events = Vec::<FileEvent>::new();
        let report = source.poll_cycle(&mut events, &AtomicBool::new(true)).unwrap();
        assert!(report.cancelled);
        assert!(events.is_empty());
        // Nothing was recorded, so the next cycle picks the file up.
        assert!(fx.store.is_empty());
        assert_eq!(poll(&source).1.len(), 1);
    }

    #[test]
    fn test_max_files_per_cycle() {
        let fx = Fixture::new();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fx.remote.put_file(&format!("/outbox/{name}"), b"x");
        }
        let config = SourceConfig {
            max_files_per_cycle: 2,
            ..fx.config()
        };
        let source = fx.source(config);

        assert_eq!(poll(&source).1.len(), 2);
        let (_, events) = poll(&source);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].file.source_remote_path, "/outbox/c.txt");
    }

    #[test]
    fn test_delete_remote_and_preserve_timestamp() {
        let fx = Fixture::new();
        let modified = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        fx.remote.put_file_modified("/outbox/a.txt", b"abc", modified);
        let config = SourceConfig {
            delete_remote_files: true,
            ..fx.config()
        };
        let source = fx.source(config);

        let (_, events) = poll(&source);
        assert_eq!(events.len(), 1);
        assert!(!fx.remote.contains("/outbox/a.txt"));

        let meta = fs::metadata(&events[0].file.local_path).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_600_000_000
        );
    }

    #[test]
    fn test_unsafe_names_are_rejected() {
        assert!(is_plain_name("a.txt"));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("../etc/passwd"));
        assert!(!is_plain_name(r"dir\a.txt"));
        assert!(!is_plain_name(""));
    }

    #[test]
    fn test_is_partial_download() {
        assert!(is_partial_download(Path::new("/spool/a.txt.tmp"), ".tmp"));
        assert!(!is_partial_download(Path::new("/spool/a.txt"), ".tmp"));
        assert!(!is_partial_download(Path::new("/spool/a.txt"), ""));
    }

    #[test]
    fn test_clean_partial_downloads() {
        let fx = Fixture::new();
        let config = fx.config();
        let spool = config.local_dir.clone();
        let source = fx.source(config);
        assert_eq!(source.clean_partial_downloads().unwrap(), 0);

        fs::create_dir_all(&spool).unwrap();
        fs::write(spool.join("a.txt.tmp"), "partial").unwrap();
        fs::write(spool.join("b.txt"), "done").unwrap();

        assert_eq!(source.clean_partial_downloads().unwrap(), 1);
        assert!(!spool.join("a.txt.tmp").exists());
        assert!(spool.join("b.txt").exists());
    }
}
