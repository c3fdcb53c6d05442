// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `monodag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "monodag",
    version,
    about = "Build orchestration for monorepos: project graph, task scheduling and caching.",
    long_about = None
)]
pub struct CliArgs {
    /// Workspace root.
    ///
    /// Default: the nearest directory, upwards from the current one, that
    /// contains `Monodag.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    pub workspace: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `MONODAG_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the project graph as JSON.
    Graph,
    /// Run a target for every project that has it, or for `--projects`.
    Run(RunArgs),
    /// Start the daemon in the background, run it in the foreground, or stop it.
    Daemon(DaemonArgs),
    /// Stop the daemon and delete the cache and workspace data.
    Reset,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Target to run, e.g. `build`.
    pub target: String,

    /// Comma-separated project names.
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    pub projects: Vec<String>,

    #[arg(long, short = 'c', value_name = "NAME")]
    pub configuration: Option<String>,

    /// Hand tasks of batch-capable executors over together.
    #[arg(long)]
    pub batch: bool,

    /// Maximum number of tasks running at once. Default: `[workspace] parallel`.
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Run tasks even when their results are cached.
    #[arg(long)]
    pub skip_cache: bool,

    /// Resolve hashes and cache hits, but execute nothing.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
    /// Serve from this process instead of starting a background one.
    #[arg(long, conflicts_with = "stop")]
    pub foreground: bool,

    #[arg(long)]
    pub stop: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
