// src/daemon/server/watchers.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::net::unix::OwnedWriteHalf;
use tracing::{debug, warn};

use crate::daemon::protocol::{write_message, FileWatcherConfig, Response};
use crate::daemon::server::context::{RegisteredWatcher, ServerContext};
use crate::watch::{ChangedFile, ChangedFiles};
use crate::workspace::find_project_for_path;

/// Keep `writer` open for pushes and acknowledge the registration.
pub async fn register_file_watcher(
    ctx: &Arc<ServerContext>,
    mut writer: OwnedWriteHalf,
    config: FileWatcherConfig,
) -> Option<u64> {
    if let Err(e) = write_message(&mut writer, &Response::ok().with("registered", true)).await {
        warn!(error = %e, "failed to acknowledge file watcher");
        return None;
    }
    let id = ctx.next_watcher_id();
    debug!(id, ?config, "registered file watcher");
    ctx.watchers.lock().await.push(RegisteredWatcher { id, config, writer });
    Some(id)
}

pub async fn deregister_file_watcher(ctx: &Arc<ServerContext>, id: u64) {
    ctx.watchers.lock().await.retain(|w| w.id != id);
    debug!(id, "deregistered file watcher");
}

/// What one watcher should hear about `changes`, or `None` if nothing.
///
/// `root_map` maps project root → name and decides which project owns a
/// file. Files owned by no project are sent only to watchers that include
/// global workspace files.
pub fn filter_changes(
    config: &FileWatcherConfig,
    changes: &[ChangedFile],
    root_map: &BTreeMap<String, String>,
) -> Option<(Vec<String>, Vec<ChangedFile>)> {
    let mut projects = BTreeSet::new();
    let mut files = Vec::new();
    for change in changes {
        match find_project_for_path(&change.path, root_map) {
            Some(project) if config.watch_projects.includes(project) => {
                projects.insert(project.clone());
                files.push(change.clone());
            }
            Some(_) => {}
            None if config.include_global_workspace_files => files.push(change.clone()),
            None => {}
        }
    }
    if files.is_empty() {
        None
    } else {
        Some((projects.into_iter().collect(), files))
    }
}

/// Push `changes` to every registered watcher whose filter matches.
/// Watchers whose socket is gone are dropped.
pub async fn notify_file_watchers(
    ctx: &Arc<ServerContext>,
    changes: &ChangedFiles,
    root_map: &BTreeMap<String, String>,
) {
    if changes.is_empty() {
        return;
    }
    let changed = changes.to_changed_files();
    let mut watchers = ctx.watchers.lock().await;
    if watchers.is_empty() {
        return;
    }

    let mut dead = Vec::new();
    for watcher in watchers.iter_mut() {
        let Some((projects, files)) = filter_changes(&watcher.config, &changed, root_map) else {
            continue;
        };
        let message = Response::ok()
            .with("changedProjects", projects)
            .with("changedFiles", files);
        if let Err(e) = write_message(&mut watcher.writer, &message).await {
            debug!(id = watcher.id, error = %e, "file watcher went away");
            dead.push(watcher.id);
        }
    }
    watchers.retain(|w| !dead.contains(&w.id));
}
