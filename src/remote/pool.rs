//! Session pool shared by the source and the sink.
//!
//! With caching enabled, idle sessions are reused across polling cycles and
//! transfers, and at most `pool_size` sessions exist at once. Without caching
//! every acquire connects and every release disconnects.
//!
//! A session that reported a connection-level error is closed on release and
//! never handed out again.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{RemoteFileMetadata, RemoteSession, SessionFactory, WriteMode};
use crate::config::SessionConfig;
use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Keep idle sessions for reuse.
    pub cache_sessions: bool,
    /// Upper bound on live sessions when caching.
    pub pool_size: usize,
    /// How long `acquire` waits for a free slot.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cache_sessions: false,
            pool_size: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SessionConfig> for PoolSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            cache_sessions: config.cache_sessions,
            pool_size: config.pool_size.max(1),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Box<dyn RemoteSession>>,
    leased: usize,
}

pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            factory,
            settings,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn endpoint(&self) -> String {
        self.factory.describe()
    }

    /// Check out a session, reusing an idle one when caching is enabled.
    ///
    /// Blocks while the pool is at capacity, up to `acquire_timeout`.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledSession, SessionError> {
        let deadline = Instant::now() + self.settings.acquire_timeout;
        let mut state = self.state.lock();

        loop {
            if self.settings.cache_sessions {
                while let Some(mut session) = state.idle.pop() {
                    if session.is_open() {
                        state.leased += 1;
                        tracing::trace!(endpoint = %self.factory.describe(), "reusing cached session");
                        return Ok(PooledSession::new(Arc::clone(self), session));
                    }
                    session.close();
                }
            }

            if !self.settings.cache_sessions || state.leased < self.settings.pool_size {
                state.leased += 1;
                break;
            }

            if self.available.wait_until(&mut state, deadline).timed_out() {
                tracing::warn!(
                    endpoint = %self.factory.describe(),
                    pool_size = self.settings.pool_size,
                    "session pool exhausted"
                );
                return Err(SessionError::PoolExhausted(self.settings.acquire_timeout));
            }
        }
        drop(state);

        match self.factory.connect() {
            Ok(session) => {
                tracing::debug!(endpoint = %self.factory.describe(), "opened remote session");
                Ok(PooledSession::new(Arc::clone(self), session))
            }
            Err(err) => {
                self.state.lock().leased -= 1;
                self.available.notify_one();
                Err(err)
            }
        }
    }

    /// Return a session to the pool. Equivalent to dropping the handle.
    pub fn release(&self, handle: PooledSession) {
        drop(handle);
    }

    /// Close every idle session. Leased sessions are closed as they come back
    /// only if caching is off or they are broken.
    pub fn close_idle(&self) {
        let idle = std::mem::take(&mut self.state.lock().idle);
        for mut session in idle {
            session.close();
        }
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leased
    }

    fn give_back(&self, mut session: Box<dyn RemoteSession>, broken: bool) {
        let keep = self.settings.cache_sessions && !broken && session.is_open();
        {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            if keep {
                state.idle.push(session);
                self.available.notify_one();
                return;
            }
        }
        if broken {
            tracing::debug!(endpoint = %self.factory.describe(), "discarding broken session");
        }
        session.close();
        self.available.notify_one();
    }
}

/// A checked-out session. Goes back to its pool when dropped.
pub struct PooledSession {
    pool: Arc<SessionPool>,
    session: Option<Box<dyn RemoteSession>>,
    broken: bool,
}

impl PooledSession {
    fn new(pool: Arc<SessionPool>, session: Box<dyn RemoteSession>) -> Self {
        Self {
            pool,
            session: Some(session),
            broken: false,
        }
    }

    /// Force the session to be discarded on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn with_session<T>(
        &mut self,
        op: impl FnOnce(&mut dyn RemoteSession) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let Some(session) = self.session.as_deref_mut() else {
            return Err(SessionError::Protocol("session already released".into()));
        };
        let result = op(session);
        if let Err(err) = &result
            && err.breaks_session()
        {
            self.broken = true;
        }
        result
    }
}

impl RemoteSession for PooledSession {
    fn list(&mut self, dir: &str) -> Result<Vec<RemoteFileMetadata>, SessionError> {
        self.with_session(|s| s.list(dir))
    }

    fn exists(&mut self, path: &str) -> Result<bool, SessionError> {
        self.with_session(|s| s.exists(path))
    }

    fn read(&mut self, path: &str, out: &mut dyn Write) -> Result<u64, SessionError> {
        self.with_session(|s| s.read(path, out))
    }

    fn write(
        &mut self,
        path: &str,
        input: &mut dyn Read,
        mode: WriteMode,
    ) -> Result<u64, SessionError> {
        self.with_session(|s| s.write(path, input, mode))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), SessionError> {
        self.with_session(|s| s.rename(from, to))
    }

    fn remove(&mut self, path: &str) -> Result<(), SessionError> {
        self.with_session(|s| s.remove(path))
    }

    fn mkdirs(&mut self, dir: &str) -> Result<(), SessionError> {
        self.with_session(|s| s.mkdirs(dir))
    }

    fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(session, self.broken);
        }
    }
}
