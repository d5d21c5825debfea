//! FTP backend over `suppaftp`.
//!
//! Binary transfers only. Listings are parsed from `LIST` output (POSIX or
//! DOS style), so names and sizes are whatever the server prints.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::{DateTime, Utc};
use suppaftp::list::File as ListEntry;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, Status};

use super::{RemoteFileMetadata, RemoteSession, SessionFactory, WriteMode, join_remote};
use crate::config::FtpMode;
use crate::error::SessionError;

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Empty when unset; anonymous servers accept anything.
    pub password: Option<String>,
    pub mode: FtpMode,
    pub connect_timeout: Duration,
    /// Read/write timeout on the control connection once logged in.
    pub data_timeout: Duration,
}

pub struct FtpFactory {
    settings: FtpSettings,
}

impl FtpFactory {
    pub fn new(settings: FtpSettings) -> Self {
        Self { settings }
    }

    fn open_control(&self) -> Result<FtpStream, SessionError> {
        let endpoint = self.describe();
        let addrs = (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|e| SessionError::Connect {
                endpoint: endpoint.clone(),
                reason: format!("cannot resolve host: {e}"),
            })?;

        let mut last_error = None;
        for addr in addrs {
            match FtpStream::connect_timeout(addr, self.settings.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(SessionError::Connect {
            endpoint,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "host resolved to no addresses".into()),
        })
    }
}

impl SessionFactory for FtpFactory {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
        let mut stream = self.open_control()?;

        let user = self.settings.username.as_str();
        let password = self.settings.password.as_deref().unwrap_or_default();
        stream.login(user, password).map_err(|e| match e {
            FtpError::UnexpectedResponse(response) => SessionError::Auth(format!(
                "{user}: {}",
                String::from_utf8_lossy(&response.body).trim()
            )),
            other => map_ftp("login", other),
        })?;

        stream.set_mode(match self.settings.mode {
            FtpMode::Passive => Mode::Passive,
            FtpMode::Active => Mode::Active,
        });
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| map_ftp("TYPE I", e))?;

        let control: &TcpStream = stream.get_ref();
        let timeout = Some(self.settings.data_timeout).filter(|t| !t.is_zero());
        control
            .set_read_timeout(timeout)
            .and_then(|()| control.set_write_timeout(timeout))
            .map_err(SessionError::Io)?;

        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            user,
            mode = ?self.settings.mode,
            "ftp session established"
        );
        Ok(Box::new(FtpSession { stream, open: true }))
    }

    fn describe(&self) -> String {
        format!("ftp://{}:{}", self.settings.host, self.settings.port)
    }
}

pub struct FtpSession {
    stream: FtpStream,
    open: bool,
}

fn map_ftp(path: &str, err: FtpError) -> SessionError {
    match err {
        FtpError::ConnectionError(e) => match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                SessionError::Timeout(format!("{path}: {e}"))
            }
            _ => SessionError::Io(e),
        },
        FtpError::UnexpectedResponse(response) => match response.status {
            Status::FileUnavailable => SessionError::NotFound(path.to_string()),
            Status::NotLoggedIn => SessionError::Auth(format!(
                "{path}: {}",
                String::from_utf8_lossy(&response.body).trim()
            )),
            status => SessionError::Protocol(format!(
                "{path}: {} ({status:?})",
                String::from_utf8_lossy(&response.body).trim()
            )),
        },
        other => SessionError::Protocol(format!("{path}: {other}")),
    }
}

/// Turn one `LIST` line into metadata. Unparseable lines (totals, banners)
/// and the `.`/`..` entries yield `None`.
fn parse_list_line(dir: &str, line: &str) -> Option<RemoteFileMetadata> {
    let entry: ListEntry = line.parse().ok()?;
    // Some servers print paths rather than bare names.
    let name = entry.name().rsplit('/').next()?.to_string();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(RemoteFileMetadata {
        path: join_remote(dir, &name, "/"),
        size: entry.size() as u64,
        modified: Some(DateTime::<Utc>::from(entry.modified())),
        is_directory: entry.is_directory(),
        name,
    })
}

/// Split `path` into parent directory and base name.
fn split_parent(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}

impl RemoteSession for FtpSession {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError> {
        let lines = self
            .stream
            .list(Some(dir))
            .map_err(|e| map_ftp(dir, e))?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_list_line(dir, line))
            .collect())
    }

    fn exists(&mut self, path: &str) -> Result<bool, SessionError> {
        let (parent, name) = split_parent(path);
        if name.is_empty() {
            return Ok(true);
        }
        let parent = if parent.is_empty() { "." } else { parent };
        match self.list(parent) {
            Ok(entries) => Ok(entries.iter().any(|e| e.name == name)),
            Err(SessionError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError> {
        self.stream
            .retr(path, |reader| {
                io::copy(reader, &mut *out).map_err(FtpError::ConnectionError)
            })
            .map_err(|e| map_ftp(path, e))
    }

    fn write(
        &mut self,
        path: &str,
        mut input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError> {
        let result = match mode {
            WriteMode::Truncate => self.stream.put_file(path, &mut input),
            WriteMode::Append => self.stream.append_file(path, &mut input),
        };
        result.map_err(|e| map_ftp(path, e))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        match self.stream.rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Many servers refuse RNTO onto an existing file.
                if !self.exists(to)? {
                    return Err(map_ftp(from, e));
                }
                tracing::debug!(from, to, error = %e, "rename refused; replacing target");
                self.remove(to)?;
                self.stream.rename(from, to).map_err(|e| map_ftp(from, e))
            }
        }
    }

    fn remove(&mut self, path: &str) -> Result<(), SessionError> {
        self.stream.rm(path).map_err(|e| map_ftp(path, e))
    }

    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError> {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if dir.starts_with('/') || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);

            if !self.exists(&current)? {
                self.stream
                    .mkdir(&current)
                    .map_err(|e| map_ftp(&current, e))?;
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.stream.quit();
            self.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suppaftp::types::Response;

    #[test]
    fn test_parse_posix_list_lines() {
        let file = parse_list_line(
            "/outbox",
            "-rw-r--r-- 1 ingest staff 1024 Nov 14  2023 report.csv",
        )
        .unwrap();
        assert_eq!(file.name, "report.csv");
        assert_eq!(file.path, "/outbox/report.csv");
        assert_eq!(file.size, 1024);
        assert!(!file.is_directory);
        assert!(file.modified.is_some());

        let dir = parse_list_line("/outbox", "drwxr-xr-x 2 ingest staff 4096 Jan  1  2020 archive")
            .unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.path, "/outbox/archive");
    }

    #[test]
    fn test_parse_list_skips_noise() {
        assert!(parse_list_line("/outbox", "total 8").is_none());
        assert!(parse_list_line("/outbox", "drwxr-xr-x 2 u g 4096 Jan  1  2020 .").is_none());
        assert!(parse_list_line("/outbox", "drwxr-xr-x 2 u g 4096 Jan  1  2020 ..").is_none());
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/outbox/a.txt"), ("/outbox", "a.txt"));
        assert_eq!(split_parent("/a.txt"), ("/", "a.txt"));
        assert_eq!(split_parent("a.txt"), ("", "a.txt"));
        assert_eq!(split_parent("/outbox/"), ("/", "outbox"));
        assert_eq!(split_parent("/"), ("", ""));
    }

    #[test]
    fn test_error_classification() {
        let reply = |status, body: &str| {
            FtpError::UnexpectedResponse(Response::new(status, body.as_bytes().to_vec()))
        };

        let missing = map_ftp("/outbox/a.txt", reply(Status::FileUnavailable, "550 No such file"));
        assert!(matches!(missing, SessionError::NotFound(ref p) if p == "/outbox/a.txt"));

        let denied = map_ftp("login", reply(Status::NotLoggedIn, "530 Login incorrect"));
        assert!(matches!(denied, SessionError::Auth(_)));
        assert!(denied.is_fatal());

        let timeout = map_ftp(
            "/outbox",
            FtpError::ConnectionError(io::Error::from(io::ErrorKind::TimedOut)),
        );
        assert!(matches!(timeout, SessionError::Timeout(_)));
        assert!(timeout.is_retryable());

        let other = map_ftp("/outbox", reply(Status::CommandNotImplemented, "502 no"));
        assert!(matches!(other, SessionError::Protocol(_)));
    }

    #[test]
    fn test_describe_and_unreachable_host() {
        let factory = FtpFactory::new(FtpSettings {
            host: "127.0.0.1".into(),
            port: 1,
            username: "ingest".into(),
            password: None,
            mode: FtpMode::Passive,
            connect_timeout: Duration::from_millis(200),
            data_timeout: Duration::from_secs(1),
        });
        assert_eq!(factory.describe(), "ftp://127.0.0.1:1");
        let err = factory.connect().err().unwrap();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert!(err.is_fatal());
    }
}
