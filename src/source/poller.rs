//! Periodic driver for a [`PollingFileSource`].
//!
//! A single loop: cycles never overlap, and every wait goes through the
//! injected [`Clock`] so a [`Shutdown`] cuts it short.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::{EventEmitter, PollingFileSource};
use crate::clock::{Clock, Shutdown};
use crate::config::SourceConfig;
use crate::error::FlowError;

/// When cycles run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub initial_delay: Duration,
    /// Pause between the end of one cycle and the start of the next.
    pub fixed_delay: Duration,
    /// Stop after this many cycles. `None` runs until shutdown.
    pub max_cycles: Option<u64>,
}

impl Default for Trigger {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            fixed_delay: Duration::from_secs(1),
            max_cycles: None,
        }
    }
}

impl Trigger {
    pub fn from_config(config: &SourceConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            fixed_delay: Duration::from_millis(config.fixed_delay_ms),
            max_cycles: None,
        }
    }

    pub fn with_max_cycles(mut self, max_cycles: Option<u64>) -> Self {
        self.max_cycles = max_cycles;
        self
    }
}

/// Totals over a poller run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerSummary {
    pub cycles: u64,
    /// Cycles that ended in a non-fatal error.
    pub failed_cycles: u64,
    pub emitted: usize,
    pub failed_files: usize,
}

pub struct Poller {
    source: Arc<PollingFileSource>,
    trigger: Trigger,
    clock: Arc<dyn Clock>,
    shutdown: Shutdown,
}

impl Poller {
    pub fn new(
        source: Arc<PollingFileSource>,
        trigger: Trigger,
        clock: Arc<dyn Clock>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            trigger,
            clock,
            shutdown,
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run cycles until shutdown, `max_cycles`, or a fatal error.
    ///
    /// Fatal errors (lost connection, rejected credentials, a broken emitter)
    /// end the run and are returned. Anything else is logged and retried on
    /// the next tick. A run that reaches `max_cycles` without a single
    /// successful cycle returns the last cycle error.
    pub fn run(&self, emitter: &mut dyn EventEmitter) -> Result<PollerSummary, FlowError> {
        let mut summary = PollerSummary::default();
        let mut last_error = None;

        if !self.trigger.initial_delay.is_zero()
            && self.clock.sleep(self.trigger.initial_delay, &self.shutdown)
        {
            return Ok(summary);
        }

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            match self.source.poll_cycle(emitter, self.shutdown.flag()) {
                Ok(report) => {
                    summary.cycles += 1;
                    summary.emitted += report.emitted;
                    summary.failed_files += report.failed.len();
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, cycles = summary.cycles, "poller stopping on fatal error");
                    return Err(e);
                }
                Err(e) => {
                    summary.cycles += 1;
                    summary.failed_cycles += 1;
                    tracing::warn!(error = %e, retryable = e.is_retryable(), "poll cycle failed; retrying next tick");
                    last_error = Some(e);
                }
            }

            if self
                .trigger
                .max_cycles
                .is_some_and(|max| summary.cycles >= max)
            {
                if summary.failed_cycles == summary.cycles
                    && let Some(e) = last_error.take()
                {
                    tracing::error!(cycles = summary.cycles, error = %e, "every poll cycle failed");
                    return Err(e);
                }
                break;
            }
            if self.clock.sleep(self.trigger.fixed_delay, &self.shutdown) {
                break;
            }
        }

        tracing::info!(
            cycles = summary.cycles,
            emitted = summary.emitted,
            failed_cycles = summary.failed_cycles,
            "poller stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metadata::MemoryMetadataStore;
    use crate::remote::{MemoryFileSystem, PoolSettings, SessionPool};
    use crate::source::FileEvent;
    use chrono::DateTime;

    fn setup(remote: &MemoryFileSystem, local: &std::path::Path) -> (Arc<PollingFileSource>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let config = SourceConfig {
            remote_dir: "/outbox".into(),
            local_dir: local.to_path_buf(),
            ..SourceConfig::default()
        };
        let pool = SessionPool::new(Arc::new(remote.clone()), PoolSettings::default());
        let source = PollingFileSource::new(
            config,
            pool,
            Arc::new(MemoryMetadataStore::new()),
            clock.clone(),
        )
        .unwrap();
        (Arc::new(source), clock)
    }

    #[test]
    fn test_runs_bounded_cycles_on_manual_clock() {
        let remote = MemoryFileSystem::new();
        remote.put_file("/outbox/a.txt", b"a");
        let tmp = tempfile::tempdir().unwrap();
        let (source, clock) = setup(&remote, tmp.path());
        let start = clock.now();

        let trigger = Trigger {
            initial_delay: Duration::from_secs(2),
            fixed_delay: Duration::from_secs(10),
            max_cycles: Some(3),
        };
        let poller = Poller::new(source, trigger, clock.clone(), Shutdown::new());

        let mut events: Vec<FileEvent> = Vec::new();
        let summary = poller.run(&mut events).unwrap();

        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.emitted, 1);
        assert_eq!(events.len(), 1);
        // Initial delay plus two pauses between three cycles.
        assert_eq!(clock.now() - start, chrono::Duration::seconds(22));
    }

    #[test]
    fn test_shutdown_before_start() {
        let remote = MemoryFileSystem::new();
        remote.put_file("/outbox/a.txt", b"a");
        let tmp = tempfile::tempdir().unwrap();
        let (source, clock) = setup(&remote, tmp.path());

        let shutdown = Shutdown::new();
        shutdown.trigger();
        let poller = Poller::new(source, Trigger::default(), clock, shutdown);

        let mut events: Vec<FileEvent> = Vec::new();
        let summary = poller.run(&mut events).unwrap();
        assert_eq!(summary.cycles, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_bounded_run_where_every_cycle_failed_is_an_error() {
        let remote = MemoryFileSystem::new();
        let tmp = tempfile::tempdir().unwrap();
        // No /outbox yet: every listing fails, but not fatally.
        let (source, clock) = setup(&remote, tmp.path());
        let start = clock.now();
        let poller = Poller::new(
            source,
            Trigger::default().with_max_cycles(Some(2)),
            clock.clone(),
            Shutdown::new(),
        );

        let err = poller.run(&mut Vec::<FileEvent>::new()).unwrap_err();
        assert!(matches!(err, FlowError::Transfer(_)));
        assert!(!err.is_fatal());
        // Both cycles ran: one pause between them.
        assert_eq!(clock.now() - start, chrono::Duration::seconds(1));
    }

    #[test]
    fn test_transient_failures_keep_polling_until_shutdown() {
        let remote = MemoryFileSystem::new();
        let tmp = tempfile::tempdir().unwrap();
        let (source, _) = setup(&remote, tmp.path());
        let shutdown = Shutdown::new();
        let poller = Poller::new(
            source,
            Trigger {
                fixed_delay: Duration::from_millis(5),
                ..Trigger::default()
            },
            Arc::new(crate::clock::SystemClock),
            shutdown.clone(),
        );

        let handle = std::thread::spawn(move || poller.run(&mut Vec::<FileEvent>::new()));
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        let summary = handle.join().unwrap().unwrap();
        assert!(summary.cycles >= 1);
        assert_eq!(summary.failed_cycles, summary.cycles);
    }

    #[test]
    fn test_fatal_error_stops_poller() {
        let remote = MemoryFileSystem::new();
        remote.create_dir("/outbox");
        remote.fail_auth(true);
        let tmp = tempfile::tempdir().unwrap();
        let (source, clock) = setup(&remote, tmp.path());
        let poller = Poller::new(source, Trigger::default(), clock, Shutdown::new());

        let err = poller.run(&mut Vec::<FileEvent>::new()).unwrap_err();
        assert!(matches!(err, FlowError::Connection(_)));
    }

    #[test]
    fn test_shutdown_from_another_thread() {
        let remote = MemoryFileSystem::new();
        remote.create_dir("/outbox");
        let tmp = tempfile::tempdir().unwrap();
        let (source, _) = setup(&remote, tmp.path());
        let shutdown = Shutdown::new();
        let poller = Poller::new(
            source,
            Trigger {
                fixed_delay: Duration::from_secs(60),
                ..Trigger::default()
            },
            Arc::new(crate::clock::SystemClock),
            shutdown.clone(),
        );

        let handle = std::thread::spawn(move || poller.run(&mut Vec::<FileEvent>::new()));
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();

        let summary = handle.join().unwrap().unwrap();
        assert!(summary.cycles >= 1);
    }
}
