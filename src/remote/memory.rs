//! In-process remote filesystem.
//!
//! Every clone of a [`MemoryFileSystem`] shares the same tree, so a test can
//! hand one clone to a pool as its [`SessionFactory`] and inspect the result
//! through another. Writes are streamed in chunks with the lock released in
//! between, which lets concurrent readers observe in-progress uploads.
//!
//! Paths are `/`-separated.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{RemoteFileMetadata, RemoteSession, SessionFactory, WriteMode};
use crate::error::SessionError;

const CHUNK_SIZE: usize = 4096;

/// Operations recorded by the filesystem, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Create(String),
    Chunk { path: String, len: usize },
    Rename { from: String, to: String },
    Remove(String),
    Mkdir(String),
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<String, MemoryFile>,
    dirs: BTreeSet<String>,
    journal: Vec<JournalEntry>,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
    write_timeouts: HashMap<String, usize>,
    fail_auth: bool,
    connections: usize,
}

#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite a file, creating parent directories.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.put_file_modified(path, data, Utc::now());
    }

    pub fn put_file_modified(&self, path: &str, data: &[u8], modified: DateTime<Utc>) {
        let path = normalize(path);
        let mut state = self.state.lock();
        add_parents(&mut state.dirs, &path);
        state.files.insert(
            path,
            MemoryFile {
                data: data.to_vec(),
                modified,
            },
        );
    }

    pub fn create_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.state.lock();
        add_parents(&mut state.dirs, &path);
        state.dirs.insert(path);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(&normalize(path))
            .map(|f| f.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = normalize(path);
        let state = self.state.lock();
        state.files.contains_key(&path) || is_dir(&state.dirs, &path)
    }

    /// Names of the files directly under `dir`, sorted.
    pub fn file_names(&self, dir: &str) -> Vec<String> {
        let dir = normalize(dir);
        let state = self.state.lock();
        state
            .files
            .keys()
            .filter(|path| parent_of(path) == dir)
            .map(|path| base_name(path).to_string())
            .collect()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// Number of sessions opened so far.
    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    /// Make reads of `path` fail with a connection reset.
    pub fn fail_reads_of(&self, path: &str) {
        self.state.lock().failing_reads.insert(normalize(path));
    }

    /// Make writes to `path` fail with a permission error after the first chunk.
    pub fn fail_writes_to(&self, path: &str) {
        self.state.lock().failing_writes.insert(normalize(path));
    }

    /// Make the next `times` writes to `path` time out before any byte lands.
    pub fn time_out_writes(&self, path: &str, times: usize) {
        self.state.lock().write_timeouts.insert(normalize(path), times);
    }

    pub fn fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }
}

impl SessionFactory for MemoryFileSystem {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
        let mut state = self.state.lock();
        if state.fail_auth {
            return Err(SessionError::Auth("memory: credentials rejected".into()));
        }
        state.connections += 1;
        Ok(Box::new(MemorySession {
            fs: self.clone(),
            open: true,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

pub struct MemorySession {
    fs: MemoryFileSystem,
    open: bool,
}

impl MemorySession {
    fn state(&self) -> parking_lot::MutexGuard<'_, MemoryState> {
        self.fs.state.lock()
    }
}

impl RemoteSession for MemorySession {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError> {
        let dir = normalize(dir);
        let state = self.state();
        if !is_dir(&state.dirs, &dir) {
            return Err(SessionError::NotFound(dir));
        }

        let mut entries: Vec<RemoteFileMetadata> = state
            .dirs
            .iter()
            .filter(|d| d.as_str() != dir && parent_of(d) == dir)
            .map(|d| RemoteFileMetadata::directory(&dir, base_name(d)))
            .collect();
        entries.extend(
            state
                .files
                .iter()
                .filter(|(path, _)| parent_of(path) == dir)
                .map(|(path, file)| {
                    RemoteFileMetadata::file(
                        &dir,
                        base_name(path),
                        file.data.len() as u64,
                        Some(file.modified),
                    )
                }),
        );
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn exists(&mut self, path: &str) -> Result<bool, SessionError> {
        Ok(self.fs.contains(path))
    }

    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError> {
        let path = normalize(path);
        let data = {
            let state = self.state();
            if state.failing_reads.contains(&path) {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    format!("connection reset while reading {path}"),
                )));
            }
            match state.files.get(&path) {
                Some(file) => file.data.clone(),
                None => return Err(SessionError::NotFound(path)),
            }
        };
        out.write_all(&data)?;
        Ok(data.len() as u64)
    }

    fn write(
        &mut self,
        path: &str,
        input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError> {
        let path = normalize(path);
        {
            let mut state = self.state();
            if let Some(remaining) = state.write_timeouts.get_mut(&path)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(SessionError::Timeout(format!("write {path}")));
            }
            if !is_dir(&state.dirs, &parent_of(&path)) {
                return Err(SessionError::NotFound(parent_of(&path)));
            }
            let now = Utc::now();
            let file = state.files.entry(path.clone()).or_insert(MemoryFile {
                data: Vec::new(),
                modified: now,
            });
            if mode == WriteMode::Truncate {
                file.data.clear();
            }
            file.modified = now;
            state.journal.push(JournalEntry::Create(path.clone()));
        }

        let mut buf = [0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let mut state = self.state();
            match state.files.get_mut(&path) {
                Some(file) => file.data.extend_from_slice(&buf[..n]),
                None => return Err(SessionError::NotFound(path)),
            }
            state.journal.push(JournalEntry::Chunk {
                path: path.clone(),
                len: n,
            });
            total += n as u64;
            if state.failing_writes.contains(&path) {
                return Err(SessionError::Protocol(format!(
                    "permission denied writing {path}"
                )));
            }
        }
        Ok(total)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        let (from, to) = (normalize(from), normalize(to));
        let mut state = self.state();
        if !is_dir(&state.dirs, &parent_of(&to)) {
            return Err(SessionError::NotFound(parent_of(&to)));
        }
        let Some(file) = state.files.remove(&from) else {
            return Err(SessionError::NotFound(from));
        };
        state.files.insert(to.clone(), file);
        state.journal.push(JournalEntry::Rename { from, to });
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), SessionError> {
        let path = normalize(path);
        let mut state = self.state();
        if state.files.remove(&path).is_none() {
            return Err(SessionError::NotFound(path));
        }
        state.journal.push(JournalEntry::Remove(path));
        Ok(())
    }

    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError> {
        let dir = normalize(dir);
        let mut state = self.state();
        if state.files.contains_key(&dir) {
            return Err(SessionError::Protocol(format!("{dir} is a file")));
        }
        add_parents(&mut state.dirs, &dir);
        if state.dirs.insert(dir.clone()) {
            state.journal.push(JournalEntry::Mkdir(dir));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

fn is_dir(dirs: &BTreeSet<String>, path: &str) -> bool {
    path == "/" || dirs.contains(path)
}

fn add_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut parent = parent_of(path);
    while parent != "/" {
        let next = parent_of(&parent);
        dirs.insert(parent);
        parent = next;
    }
}
