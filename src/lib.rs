// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod graph;
pub mod hasher;
pub mod logging;
pub mod plugins;
pub mod types;
pub mod watch;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::cache::fs_ops::remove_path;
use crate::cache::CacheOptions;
use crate::cli::{CliArgs, Command, DaemonArgs, RunArgs};
use crate::config::{find_workspace_root, load_workspace_config, WorkspaceConfig};
use crate::dag::{create_task_graph, TaskGraphRequest};
use crate::engine::{RunContext, RunOptions, RunSummary, Runtime};
use crate::exec::ShellExecutor;
use crate::fs::RealFileSystem;
use crate::graph::{build_project_graph, GraphBuildContext, ProjectGraph};
use crate::plugins::{InProcessLoader, PluginRegistry};
use crate::workspace::{hash_workspace_files, workspace_data_dir, FileMap};

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let workspace_root = match args.workspace {
        Some(root) => root,
        None => find_workspace_root(&std::env::current_dir().context("reading current directory")?),
    };
    debug!(root = ?workspace_root, "resolved workspace root");

    match args.command {
        Command::Graph => {
            let config = load_workspace_config(&workspace_root)?;
            let (graph, _) = load_project_graph(&workspace_root, &config).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
            Ok(0)
        }
        Command::Run(run_args) => run_target(workspace_root, run_args).await,
        Command::Daemon(daemon_args) => run_daemon_command(workspace_root, daemon_args).await,
        Command::Reset => {
            reset(&workspace_root).await?;
            Ok(0)
        }
    }
}

/// The project graph and file map, from the daemon when it is enabled and
/// reachable, computed in-process otherwise.
pub async fn load_project_graph(
    workspace_root: &Path,
    config: &WorkspaceConfig,
) -> Result<(ProjectGraph, FileMap)> {
    #[cfg(unix)]
    if daemon::daemon_enabled(workspace_root, config) {
        match graph_from_daemon(workspace_root).await {
            Ok(loaded) => return Ok(loaded),
            Err(errors::DaemonError::ProjectGraph { message, .. }) => bail!(message),
            Err(e) => {
                warn!(error = %e, "daemon unavailable; computing the project graph in-process")
            }
        }
    }

    let root = workspace_root.to_path_buf();
    let config = config.clone();
    tokio::task::spawn_blocking(move || build_graph_locally(&root, &config)).await?
}

#[cfg(unix)]
async fn graph_from_daemon(
    workspace_root: &Path,
) -> Result<(ProjectGraph, FileMap), errors::DaemonError> {
    let client = daemon::DaemonClient::new(workspace_root);
    let (graph, _) = client.get_project_graph().await?;
    let files = client
        .get_all_file_data()
        .await?
        .into_iter()
        .map(|data| (data.file, data.hash))
        .collect();
    let file_map = workspace::create_file_map(&graph.root_map(), &files);
    Ok((graph, file_map))
}

fn build_graph_locally(
    workspace_root: &Path,
    config: &WorkspaceConfig,
) -> Result<(ProjectGraph, FileMap)> {
    let fs = RealFileSystem;
    let registry = PluginRegistry::load(config, workspace_root, &InProcessLoader::new())?;
    let files = hash_workspace_files(workspace_root, &fs)?;
    let ctx = GraphBuildContext {
        workspace_root,
        config,
        fs: &fs,
        registry: &registry,
    };
    let build = build_project_graph(&ctx, &files)?;
    info!(projects = build.graph.nodes.len(), files = files.len(), "built project graph");
    Ok((build.graph, build.file_map))
}

async fn run_target(workspace_root: PathBuf, args: RunArgs) -> Result<i32> {
    let config = load_workspace_config(&workspace_root)?;
    let (graph, file_map) = load_project_graph(&workspace_root, &config).await?;

    let projects = if args.projects.is_empty() {
        graph
            .nodes
            .values()
            .filter(|node| node.targets.contains_key(&args.target))
            .map(|node| node.name.clone())
            .collect()
    } else {
        args.projects.clone()
    };
    if projects.is_empty() {
        println!("No projects have a '{}' target.", args.target);
        return Ok(0);
    }

    let request = TaskGraphRequest {
        projects,
        targets: vec![args.target.clone()],
        configuration: args.configuration.clone(),
        ignore_cycles: config.workspace.ignore_cycles,
        ..Default::default()
    };
    let task_graph = create_task_graph(&graph, &request)?;

    let options = RunOptions {
        parallel: args.parallel.unwrap_or(config.workspace.parallel),
        batch: args.batch || config.batch_mode(),
        skip_cache: args.skip_cache,
        dry_run: args.dry_run,
    };
    let ctx = RunContext::for_workspace(
        workspace_root,
        Arc::new(graph),
        Arc::new(file_map),
        Arc::new(config),
        Arc::new(RealFileSystem),
    );
    let summary = Runtime::new(ctx, task_graph, ShellExecutor::default(), options)
        .run()
        .await?;

    print_summary(&summary);
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    for result in summary.results.values() {
        if result.status.is_cache_hit() && !result.terminal_output.is_empty() {
            print!("{}", result.terminal_output);
        }
    }
    println!();
    for result in summary.results.values() {
        println!("  {:<40} {}", result.task_id, result.status);
    }
    let failed = summary.failed();
    if failed.is_empty() {
        println!("Successfully ran {} task(s).", summary.results.len());
    } else {
        println!("{} of {} task(s) failed.", failed.len(), summary.results.len());
    }
}

#[cfg(unix)]
async fn run_daemon_command(workspace_root: PathBuf, args: DaemonArgs) -> Result<i32> {
    if args.foreground {
        daemon::run_server(workspace_root).await?;
        return Ok(0);
    }

    let client = daemon::DaemonClient::new(&workspace_root);
    if args.stop {
        client.stop().await?;
        println!("Daemon stopped.");
    } else if client.is_server_available().await {
        println!("Daemon is already running.");
    } else {
        let pid = client.start_in_background().await?;
        println!("Daemon started (pid {pid}).");
    }
    Ok(0)
}

#[cfg(not(unix))]
async fn run_daemon_command(_workspace_root: PathBuf, _args: DaemonArgs) -> Result<i32> {
    bail!("the daemon is only available on unix platforms")
}

async fn reset(workspace_root: &Path) -> Result<()> {
    #[cfg(unix)]
    if let Err(e) = daemon::DaemonClient::new(workspace_root).stop().await {
        warn!(error = %e, "failed to stop the daemon");
    }

    let config = load_workspace_config(workspace_root)?;
    let cache_dir = CacheOptions::from_config(workspace_root, &config).cache_directory;
    for dir in [cache_dir, workspace_data_dir(workspace_root)] {
        remove_path(&dir).with_context(|| format!("removing {}", dir.display()))?;
        info!(dir = ?dir, "removed");
    }
    println!("Cache and workspace data removed.");
    Ok(())
}
