pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod remote;
pub mod sink;
pub mod source;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::CommandFactory;

use crate::cli::{Cli, Command, ConfigCommand, MetadataCommand, SinkArgs, SourceArgs};
use crate::clock::{Clock, Shutdown, SystemClock};
use crate::config::{Config, LoadedConfig, SourceConfig};
use crate::filter::record_key;
use crate::metadata::{MemoryMetadataStore, MetadataStore, SqliteMetadataStore};
use crate::sink::{AtomicRemoteFileSink, RetryPolicy};
use crate::source::{JsonLinesEmitter, Poller, PollingFileSource, Trigger};

/// Library entrypoint for the `rfs` binary.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "rfs", &mut io::stdout());
            Ok(())
        }
        Command::Config(args) => {
            let loaded = Config::load(cli.config.as_deref())?;
            run_config(args.command, &loaded)
        }
        Command::Metadata(args) => {
            let loaded = Config::load(cli.config.as_deref())?;
            run_metadata(args.command, &loaded.config.source)
        }
        Command::Source(args) => {
            let config = load_validated(cli.config.as_deref())?;
            let shutdown = Shutdown::new();
            watch_ctrl_c(shutdown.clone());
            tokio::task::spawn_blocking(move || run_source(config, &args, shutdown))
                .await
                .context("source task panicked")?
        }
        Command::Sink(args) => {
            let config = load_validated(cli.config.as_deref())?;
            let shutdown = Shutdown::new();
            watch_ctrl_c(shutdown.clone());
            tokio::task::spawn_blocking(move || run_sink(config, args, shutdown))
                .await
                .context("sink task panicked")?
        }
    }
}

fn load_validated(path: Option<&std::path::Path>) -> Result<Config> {
    let loaded = Config::load(path)?;
    loaded.config.validate()?;
    Ok(loaded.config)
}

fn watch_ctrl_c(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing current file");
            shutdown.trigger();
        }
    });
}

fn open_store(config: &SourceConfig) -> Result<Arc<dyn MetadataStore>> {
    match &config.metadata_db {
        Some(path) => Ok(Arc::new(SqliteMetadataStore::open(path).with_context(|| {
            format!("failed to open metadata store {}", path.display())
        })?)),
        None => {
            tracing::warn!("source.metadata_db is not set; ingestion records will not survive a restart");
            Ok(Arc::new(MemoryMetadataStore::new()))
        }
    }
}

fn run_source(config: Config, args: &SourceArgs, shutdown: Shutdown) -> Result<()> {
    let pool = remote::pool_from_config(&config.session);
    let store = open_store(&config.source)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let trigger = Trigger::from_config(&config.source).with_max_cycles(args.cycle_limit());
    let source = PollingFileSource::new(config.source, Arc::clone(&pool), store, Arc::clone(&clock))?;
    let stale = source.clean_partial_downloads()?;
    if stale > 0 {
        tracing::info!(removed = stale, "cleaned partial downloads from a previous run");
    }

    tracing::info!(
        endpoint = %pool.endpoint(),
        remote_dir = %source.config().remote_dir,
        local_dir = %source.config().local_dir.display(),
        "starting source"
    );
    let poller = Poller::new(Arc::new(source), trigger, clock, shutdown);
    let mut emitter = JsonLinesEmitter::new(io::stdout().lock());
    let result = poller.run(&mut emitter);
    pool.close_idle();

    let summary = result?;
    tracing::debug!(
        cycles = summary.cycles,
        emitted = summary.emitted,
        failed_files = summary.failed_files,
        "source finished"
    );
    Ok(())
}

fn run_sink(config: Config, args: SinkArgs, shutdown: Shutdown) -> Result<()> {
    let files = if args.files.is_empty() {
        read_paths(io::stdin().lock())?
    } else {
        args.files
    };
    if files.is_empty() {
        tracing::warn!("no files to upload");
        return Ok(());
    }

    let policy = if args.no_retry {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::from_config(&config.sink)
        }
    } else {
        RetryPolicy::from_config(&config.sink)
    };
    let pool = remote::pool_from_config(&config.session);
    let sink = AtomicRemoteFileSink::new(config.sink, Arc::clone(&pool), Arc::new(SystemClock))?;

    let mut out = io::stdout().lock();
    let mut failed = 0usize;
    for file in &files {
        if shutdown.is_triggered() {
            bail!("interrupted before uploading {}", file.display());
        }
        match sink.send_with_retry(file, &policy, &shutdown) {
            Ok(outcome) => {
                let line = serde_json::json!({ "file": file, "result": outcome });
                writeln!(out, "{line}")?;
            }
            Err(e) if e.is_fatal() => {
                pool.close_idle();
                return Err(e).with_context(|| format!("uploading {}", file.display()));
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "upload failed");
                failed += 1;
            }
        }
    }
    pool.close_idle();

    if failed > 0 {
        bail!("{failed} of {} uploads failed", files.len());
    }
    Ok(())
}

/// One path per non-blank line.
fn read_paths(input: impl BufRead) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for line in input.lines() {
        let line = line.context("failed to read file list from stdin")?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            paths.push(PathBuf::from(trimmed));
        }
    }
    Ok(paths)
}

fn run_metadata(command: MetadataCommand, source: &SourceConfig) -> Result<()> {
    let Some(path) = &source.metadata_db else {
        bail!("source.metadata_db is not set; there are no persisted records to manage");
    };
    let store = SqliteMetadataStore::open(path)
        .with_context(|| format!("failed to open metadata store {}", path.display()))?;
    let prefix = record_key(&source.metadata_namespace, "");

    match command {
        MetadataCommand::List { json } => {
            let mut out = io::stdout().lock();
            for key in store.keys(&prefix)? {
                let remote_path = &key[prefix.len()..];
                let marker = store.get(&key)?.unwrap_or_default();
                let accepted_at = marker
                    .parse::<i64>()
                    .ok()
                    .and_then(chrono::DateTime::from_timestamp_millis);
                if json {
                    let line = serde_json::json!({
                        "remote_path": remote_path,
                        "marker": marker,
                        "accepted_at": accepted_at,
                    });
                    writeln!(out, "{line}")?;
                } else {
                    match accepted_at {
                        Some(at) => writeln!(out, "{}  {remote_path}", at.format("%Y-%m-%d %H:%M:%S"))?,
                        None => writeln!(out, "{marker}  {remote_path}")?,
                    }
                }
            }
        }
        MetadataCommand::Forget { remote_path } => {
            let key = record_key(&source.metadata_namespace, &remote_path);
            if store.remove(&key)? {
                println!("Forgot {remote_path}; it will be ingested again on the next cycle");
            } else {
                println!("No record for {remote_path}");
            }
        }
        MetadataCommand::Clear => {
            let removed = store.clear(&prefix)?;
            println!("Removed {removed} record(s) from namespace {}", source.metadata_namespace);
        }
    }
    Ok(())
}

fn run_config(command: ConfigCommand, loaded: &LoadedConfig) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            match &loaded.path {
                Some(path) => println!("# {} ({})", path.display(), loaded.source.as_str()),
                None => println!("# built-in defaults"),
            }
            print!("{}", loaded.config.redacted().to_toml()?);
        }
        ConfigCommand::Check => {
            loaded.config.validate()?;
            match &loaded.path {
                Some(path) => println!("Configuration OK: {}", path.display()),
                None => println!("Configuration OK: built-in defaults"),
            }
        }
        ConfigCommand::Path => match config::default_path() {
            Some(path) => println!("{}", path.display()),
            None => bail!("no config directory on this platform; pass --config"),
        },
    }
    Ok(())
}
