//! Local directory backend.
//!
//! Remote paths are resolved under a root directory, so `/outbox/a.txt` maps
//! to `<root>/outbox/a.txt`. Useful for mounted shares and for exercising the
//! whole pipeline without a server.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{RemoteFileMetadata, RemoteSession, SessionFactory, WriteMode};
use crate::error::SessionError;

pub struct LocalDirFactory {
    root: PathBuf,
}

impl LocalDirFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SessionFactory for LocalDirFactory {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
        if !self.root.is_dir() {
            return Err(SessionError::Connect {
                endpoint: self.describe(),
                reason: "root is not a directory".into(),
            });
        }
        Ok(Box::new(LocalDirSession {
            root: self.root.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

pub struct LocalDirSession {
    root: PathBuf,
}

impl LocalDirSession {
    fn resolve(&self, remote: &str) -> PathBuf {
        let relative = remote.trim_start_matches(['/', '\\']);
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn map_io(remote: &str, err: io::Error) -> SessionError {
    match err.kind() {
        io::ErrorKind::NotFound => SessionError::NotFound(remote.to_string()),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AlreadyExists => {
            SessionError::Protocol(format!("{remote}: {err}"))
        }
        _ => SessionError::Io(err),
    }
}

fn entry_metadata(dir: &str, name: &str, path: &Path) -> io::Result<RemoteFileMetadata> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        return Ok(RemoteFileMetadata::directory(dir, name));
    }
    let modified = meta.modified().ok().map(DateTime::<Utc>::from);
    Ok(RemoteFileMetadata::file(dir, name, meta.len(), modified))
}

impl RemoteSession for LocalDirSession {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError> {
        let local = self.resolve(dir);
        let mut entries = Vec::new();
        for entry in fs::read_dir(&local).map_err(|e| map_io(dir, e))? {
            let entry = entry.map_err(|e| map_io(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry_metadata(dir, &name, &entry.path()) {
                Ok(meta) => entries.push(meta),
                // Removed between readdir and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(dir, e)),
            }
        }
        // read_dir order is unspecified; keep listings deterministic.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn exists(&mut self, path: &str) -> Result<bool, SessionError> {
        self.resolve(path).try_exists().map_err(|e| map_io(path, e))
    }

    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError> {
        let mut file = fs::File::open(self.resolve(path)).map_err(|e| map_io(path, e))?;
        io::copy(&mut file, out).map_err(SessionError::Io)
    }

    fn write(
        &mut self,
        path: &str,
        input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError> {
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Truncate => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };
        let mut file = options
            .open(self.resolve(path))
            .map_err(|e| map_io(path, e))?;
        let written = io::copy(input, &mut file).map_err(SessionError::Io)?;
        file.sync_all().map_err(SessionError::Io)?;
        Ok(written)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|e| map_io(from, e))
    }

    fn remove(&mut self, path: &str) -> Result<(), SessionError> {
        fs::remove_file(self.resolve(path)).map_err(|e| map_io(path, e))
    }

    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError> {
        fs::create_dir_all(self.resolve(dir)).map_err(|e| map_io(dir, e))
    }
}
