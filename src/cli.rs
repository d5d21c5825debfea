//! Command-line arguments for `rfs`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(name = "rfs", version, about = "Poll remote directories into a local spool and upload files atomically", long_about = None)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll the source directory and print one JSON event per ingested file.
    Source(SourceArgs),
    /// Upload local files to the sink directory.
    Sink(SinkArgs),
    /// Inspect or repair the ingestion records.
    Metadata(MetadataArgs),
    /// Show or check the effective configuration.
    Config(ConfigArgs),
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Run a single cycle and exit.
    #[arg(long, conflicts_with = "max_cycles")]
    pub once: bool,

    /// Stop after this many cycles.
    #[arg(long, value_name = "N")]
    pub max_cycles: Option<u64>,
}

impl SourceArgs {
    pub fn cycle_limit(&self) -> Option<u64> {
        if self.once { Some(1) } else { self.max_cycles }
    }
}

#[derive(Args, Debug)]
pub struct SinkArgs {
    /// Files to upload. Reads one path per line from stdin when omitted.
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Fail on the first transient error instead of retrying.
    #[arg(long)]
    pub no_retry: bool,
}

#[derive(Args, Debug)]
pub struct MetadataArgs {
    #[command(subcommand)]
    pub command: MetadataCommand,
}

#[derive(Subcommand, Debug)]
pub enum MetadataCommand {
    /// List recorded remote files.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Drop the record for one remote path so the next cycle ingests it again.
    Forget {
        /// Remote path as listed, e.g. /outbox/a.txt
        remote_path: String,
    },
    /// Drop every record in the configured namespace.
    Clear,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML, secrets redacted.
    Show,
    /// Validate the configuration and exit non-zero if it is unusable.
    Check,
    /// Print the default config file location.
    Path,
}
