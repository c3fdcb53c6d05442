// src/daemon/server/mod.rs

//! The daemon process: an accept loop over the workspace socket, a file
//! watcher feeding incremental recomputation, and housekeeping that ends
//! the process when it is no longer wanted.

pub mod context;
pub mod handlers;
pub mod recompute;
pub mod watchers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{load_workspace_config, WORKSPACE_CONFIG_FILE};
use crate::daemon::process::{delete_process_record_for, write_process_record};
use crate::daemon::protocol::{read_line, write_message, Request, Response};
use crate::daemon::socket::{kill_socket, socket_path};
use crate::errors::DaemonError;
use crate::fs::RealFileSystem;
use crate::hasher::HashStore;
use crate::plugins::{InProcessLoader, PluginRegistry};
use crate::watch::{spawn_watcher, ChangedFiles};

pub use context::{BackgroundFn, ServerContext, ServerState};
pub use handlers::handle_request;
pub use recompute::{add_changed_files, get_cached_project_graph, GraphFailure, GraphSnapshot};

pub const SERVER_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    pub inactivity_timeout: Duration,
    /// Start a file watcher on the workspace root.
    pub watch_files: bool,
}

impl ServerOptions {
    pub fn for_workspace(workspace_root: &Path) -> Self {
        Self {
            socket_path: socket_path(workspace_root),
            inactivity_timeout: SERVER_INACTIVITY_TIMEOUT,
            watch_files: true,
        }
    }
}

/// Run the daemon for `workspace_root` in the current process until it
/// shuts down.
pub async fn run_server(workspace_root: PathBuf) -> Result<()> {
    let config = load_workspace_config(&workspace_root)?;
    let registry = PluginRegistry::load(&config, &workspace_root, &InProcessLoader::new())?;
    let options = ServerOptions::for_workspace(&workspace_root);
    let ctx = ServerContext::init(workspace_root, Arc::new(RealFileSystem), config, registry);
    serve(ctx, options).await
}

async fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            bail!("a daemon is already listening on {}", path.display());
        }
        kill_socket(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {:?}", parent))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding daemon socket {:?}", path))
}

/// Accept connections until shutdown is requested, the socket file
/// disappears or nobody has connected for the inactivity timeout.
pub async fn serve(ctx: Arc<ServerContext>, options: ServerOptions) -> Result<()> {
    let listener = bind(&options.socket_path).await?;
    if let Err(e) = write_process_record(&ctx.workspace_root) {
        warn!(error = %e, "failed to write daemon process record");
    }

    let _watcher = if options.watch_files {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_watcher(&ctx.workspace_root, tx)?;
        tokio::spawn(file_change_loop(Arc::clone(&ctx), rx));
        Some(handle)
    } else {
        None
    };

    // Warm the graph before the first client asks.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(failure) = get_cached_project_graph(&ctx).await {
                warn!(error = %failure.message, "initial project graph failed");
            }
        });
    }

    info!(socket = ?options.socket_path, pid = std::process::id(), "daemon listening");
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    ctx.touch();
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream).await {
                            debug!(error = %e, "connection ended with an error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
            _ = ctx.shutdown_requested() => break,
            _ = housekeeping.tick() => {
                if !options.socket_path.exists() {
                    ctx.request_shutdown("socket file removed");
                } else if ctx.idle_for() >= options.inactivity_timeout {
                    ctx.request_shutdown("inactivity timeout");
                }
            }
        }
    }

    let reason = ctx.shutdown_reason().unwrap_or_else(|| "unknown".to_string());
    info!(reason = %reason, "daemon shutting down");
    drop(listener);
    kill_socket(&options.socket_path);
    delete_process_record_for(&ctx.workspace_root, std::process::id());
    Ok(())
}

async fn handle_connection(ctx: Arc<ServerContext>, stream: UnixStream) -> Result<(), DaemonError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(line) = read_line(&mut reader).await? {
        if line.trim().is_empty() {
            continue;
        }
        ctx.touch();
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "invalid daemon request");
                write_message(&mut write, &Response::error(format!("invalid request: {e}"))).await?;
                continue;
            }
        };

        match request {
            Request::RegisterFileWatcher { config } => {
                let Some(id) = watchers::register_file_watcher(&ctx, write, config).await else {
                    return Ok(());
                };
                // The client only ever closes this connection.
                while let Ok(Some(_)) = read_line(&mut reader).await {}
                watchers::deregister_file_watcher(&ctx, id).await;
                return Ok(());
            }
            Request::RequestShutdown => {
                write_message(&mut write, &Response::ok()).await?;
                ctx.request_shutdown("requested by client");
                return Ok(());
            }
            request => {
                let response = handle_request(&ctx, request).await;
                write_message(&mut write, &response).await?;
            }
        }
    }
    Ok(())
}

fn touches_workspace_config(changes: &ChangedFiles) -> bool {
    [&changes.created, &changes.updated, &changes.deleted]
        .iter()
        .any(|set| set.contains(WORKSPACE_CONFIG_FILE))
}

async fn file_change_loop(ctx: Arc<ServerContext>, mut rx: mpsc::UnboundedReceiver<ChangedFiles>) {
    while let Some(changes) = rx.recv().await {
        let touched: Vec<String> = changes
            .created
            .iter()
            .chain(&changes.updated)
            .chain(&changes.deleted)
            .cloned()
            .collect();
        if let Ok(mut outputs) = ctx.outputs.lock() {
            if let Err(e) = outputs.invalidate(&touched) {
                warn!(error = %e, "failed to invalidate outputs hashes");
            }
        }

        if touches_workspace_config(&changes) && !reload_workspace_config(&ctx).await {
            return;
        }
        add_changed_files(&ctx, changes).await;
    }
}

/// Pick up an edited workspace config. Returns false when the plugin list
/// changed, in which case the daemon shuts down and the next client starts
/// a fresh one.
async fn reload_workspace_config(ctx: &Arc<ServerContext>) -> bool {
    let config = match load_workspace_config(&ctx.workspace_root) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "ignoring invalid workspace config change");
            return true;
        }
    };
    let mut state = ctx.state.lock().await;
    if state.config.workspace.plugins != config.workspace.plugins {
        info!("workspace plugins changed");
        ctx.request_shutdown("workspace plugins changed");
        return false;
    }
    debug!("reloaded workspace config");
    state.replace_config(config);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn config_reload_drops_the_cached_graph() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "libs/a/project.json",
            r#"{"name": "a", "targets": {"build": {"command": "make"}}}"#,
        );
        let config = WorkspaceConfig::default();
        let registry = PluginRegistry::load(&config, root, &InProcessLoader::new()).unwrap();
        let ctx = ServerContext::init(root, Arc::new(RealFileSystem), config, registry);

        let first = get_cached_project_graph(&ctx).await.unwrap();
        assert_eq!(first.graph.nodes["a"].targets["build"].cache, None);

        write(root, WORKSPACE_CONFIG_FILE, "[target_defaults.build]\ncache = true\n");
        assert!(reload_workspace_config(&ctx).await);
        assert!(ctx.state.lock().await.snapshot.is_none());

        // Nothing pending, yet the graph is rebuilt under the new config.
        let second = get_cached_project_graph(&ctx).await.unwrap();
        assert_eq!(ctx.recomputations(), 2);
        assert_eq!(second.graph.nodes["a"].targets["build"].cache, Some(true));
        assert_ne!(second.configuration_hash, first.configuration_hash);
    }

    #[tokio::test]
    async fn plugin_changes_stop_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let config = WorkspaceConfig::default();
        let registry = PluginRegistry::load(&config, root, &InProcessLoader::new()).unwrap();
        let ctx = ServerContext::init(root, Arc::new(RealFileSystem), config, registry);

        write(root, WORKSPACE_CONFIG_FILE, "[workspace]\nplugins = [\"project-json\"]\n");
        assert!(!reload_workspace_config(&ctx).await);
    }
}
