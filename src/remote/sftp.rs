//! SFTP backend over `ssh2`.
//!
//! Authentication order: private key file (with the password as passphrase),
//! then password, then the running SSH agent.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::DateTime;
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};

use super::{RemoteFileMetadata, RemoteSession, SessionFactory, WriteMode, join_remote};
use crate::error::SessionError;

// libssh2 status codes we distinguish.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub connect_timeout: Duration,
    /// Applied to every blocking libssh2 call once connected.
    pub data_timeout: Duration,
}

pub struct SftpFactory {
    settings: SftpSettings,
}

impl SftpFactory {
    pub fn new(settings: SftpSettings) -> Self {
        Self { settings }
    }

    fn open_tcp(&self) -> Result<TcpStream, SessionError> {
        let endpoint = self.describe();
        let addrs = (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|e| SessionError::Connect {
                endpoint: endpoint.clone(),
                reason: format!("cannot resolve host: {e}"),
            })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
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

    fn authenticate(&self, session: &Session) -> Result<(), SessionError> {
        let user = self.settings.username.as_str();
        let result = if let Some(key) = &self.settings.private_key {
            session.userauth_pubkey_file(user, None, key, self.settings.password.as_deref())
        } else if let Some(password) = &self.settings.password {
            session.userauth_password(user, password)
        } else {
            session.userauth_agent(user)
        };

        match result {
            Ok(()) if session.authenticated() => Ok(()),
            Ok(()) => Err(SessionError::Auth(format!("{user}: server did not accept credentials"))),
            Err(e) => Err(SessionError::Auth(format!("{user}: {}", e.message()))),
        }
    }
}

impl SessionFactory for SftpFactory {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
        let tcp = self.open_tcp()?;
        let connect_failed = |e: ssh2::Error| SessionError::Connect {
            endpoint: self.describe(),
            reason: e.message().to_string(),
        };

        let mut session = Session::new().map_err(connect_failed)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.settings.data_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(connect_failed)?;
        self.authenticate(&session)?;

        let sftp = session.sftp().map_err(|e| map_ssh("sftp subsystem", e))?;
        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            user = %self.settings.username,
            "sftp session established"
        );
        Ok(Box::new(SftpSession {
            session,
            sftp,
            open: true,
        }))
    }

    fn describe(&self) -> String {
        format!("sftp://{}:{}", self.settings.host, self.settings.port)
    }
}

pub struct SftpSession {
    session: Session,
    sftp: Sftp,
    open: bool,
}

fn map_ssh(path: &str, err: ssh2::Error) -> SessionError {
    match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH) => {
            SessionError::NotFound(path.to_string())
        }
        ErrorCode::SFTP(_) => SessionError::Protocol(format!("{path}: {}", err.message())),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => SessionError::Timeout(path.to_string()),
        ErrorCode::Session(_) => SessionError::Io(io::Error::from(err)),
    }
}

fn map_io(path: &str, err: io::Error) -> SessionError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            SessionError::Timeout(format!("{path}: {err}"))
        }
        io::ErrorKind::NotFound => SessionError::NotFound(path.to_string()),
        _ => SessionError::Io(err),
    }
}

fn is_not_found(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH)
    )
}

impl RemoteSession for SftpSession {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError> {
        let entries = self
            .sftp
            .readdir(Path::new(dir))
            .map_err(|e| map_ssh(dir, e))?;

        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteFileMetadata {
                    path: join_remote(dir, &name, "/"),
                    size: stat.size.unwrap_or(0),
                    modified: stat
                        .mtime
                        .and_then(|t| DateTime::from_timestamp(t as i64, 0)),
                    is_directory: stat.is_dir(),
                    name,
                })
            })
            .collect())
    }

    fn exists(&mut self, path: &str) -> Result<bool, SessionError> {
        match self.sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(map_ssh(path, e)),
        }
    }

    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError> {
        let mut file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_ssh(path, e))?;
        io::copy(&mut file, out).map_err(|e| map_io(path, e))
    }

    fn write(
        &mut self,
        path: &str,
        input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError> {
        let flags = match mode {
            WriteMode::Truncate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            WriteMode::Append => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND,
        };
        let mut file = self
            .sftp
            .open_mode(Path::new(path), flags, 0o644, OpenType::File)
            .map_err(|e| map_ssh(path, e))?;
        let written = io::copy(input, &mut file).map_err(|e| map_io(path, e))?;
        file.flush().map_err(|e| map_io(path, e))?;
        Ok(written)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        match self
            .sftp
            .rename(Path::new(from), Path::new(to), Some(flags))
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(map_ssh(from, e)),
            Err(e) => {
                // SFTPv3 servers refuse to rename over an existing file.
                if !self.exists(to)? {
                    return Err(map_ssh(from, e));
                }
                tracing::debug!(from, to, error = %e.message(), "rename refused; replacing target");
                self.sftp
                    .unlink(Path::new(to))
                    .map_err(|e| map_ssh(to, e))?;
                self.sftp
                    .rename(Path::new(from), Path::new(to), None)
                    .map_err(|e| map_ssh(from, e))
            }
        }
    }

    fn remove(&mut self, path: &str) -> Result<(), SessionError> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| map_ssh(path, e))
    }

    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError> {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if current.is_empty() && dir.starts_with('/') {
                current.push('/');
            } else if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);

            if !self.exists(&current)? {
                self.sftp
                    .mkdir(Path::new(&current), 0o755)
                    .map_err(|e| map_ssh(&current, e))?;
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.session.disconnect(None, "closing session", None);
            self.open = false;
        }
    }
}
