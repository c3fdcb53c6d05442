// src/daemon/server/recompute.rs

//! Keeping the project graph current as files change.
//!
//! Watcher batches are collected into the pending set and a single
//! debounce timer is armed. The wait starts at [`MIN_WAIT_PERIOD`] and
//! doubles every time the timer fires, up to [`MAX_WAIT_PERIOD`], so a
//! long burst of changes (a branch switch) costs few rebuilds. A created
//! file or a graph request resets it.
//!
//! Recomputation re-hashes only the changed files. When the merged project
//! configurations hash the same as before, the previous file map is
//! patched; otherwise it is rebuilt.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::WorkspaceConfig;
use crate::daemon::server::context::{ServerContext, ServerState};
use crate::daemon::server::watchers::notify_file_watchers;
use crate::errors::ProjectGraphError;
use crate::graph::{
    build_graph_from_configurations, create_project_configurations, hash_project_configurations,
    GraphBuildContext, ProjectGraph, ProjectGraphBuild,
};
use crate::watch::ChangedFiles;
use crate::workspace::{
    create_file_map, hash_files, hash_workspace_files, is_ignore_file, update_file_map,
    WorkspaceFileHashes, WorkspaceIgnore,
};

pub const MIN_WAIT_PERIOD: Duration = Duration::from_millis(100);
pub const MAX_WAIT_PERIOD: Duration = Duration::from_millis(4000);

/// Why the last recomputation failed, plus whatever graph could be built.
#[derive(Debug, Clone)]
pub struct GraphFailure {
    pub message: String,
    pub partial_graph: Option<Arc<ProjectGraph>>,
}

impl From<ProjectGraphError> for GraphFailure {
    fn from(e: ProjectGraphError) -> Self {
        let partial_graph = e.partial_graph().cloned().map(Arc::new);
        Self {
            message: e.to_string(),
            partial_graph,
        }
    }
}

pub type GraphSnapshot = Result<Arc<ProjectGraphBuild>, GraphFailure>;

/// Record a watcher batch and arm the debounce timer.
///
/// Watchers hear about updates and deletions right away; creations are
/// announced after the recomputation, once the new files have owners.
pub async fn add_changed_files(ctx: &Arc<ServerContext>, changes: ChangedFiles) {
    if changes.is_empty() {
        return;
    }
    let immediate = ChangedFiles {
        created: BTreeSet::new(),
        updated: changes.updated.clone(),
        deleted: changes.deleted.clone(),
    };

    let (root_map, timer) = {
        let mut state = ctx.state.lock().await;
        if !changes.created.is_empty() {
            state.wait_period = MIN_WAIT_PERIOD;
        }
        state.pending.merge(changes);

        let timer = if state.timer_armed {
            None
        } else {
            state.timer_armed = true;
            state.timer_generation += 1;
            Some((state.wait_period, state.timer_generation))
        };
        let root_map = state.current_build().map(|b| b.graph.root_map()).unwrap_or_default();
        (root_map, timer)
    };

    notify_file_watchers(ctx, &immediate, &root_map).await;

    if let Some((wait, generation)) = timer {
        debug!(wait_ms = wait.as_millis() as u64, "scheduling project graph recomputation");
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move { run_timer(ctx, wait, generation).await });
    }
}

async fn run_timer(ctx: Arc<ServerContext>, wait: Duration, generation: u64) {
    tokio::time::sleep(wait).await;

    let (created, snapshot) = {
        let mut state = ctx.state.lock().await;
        if !state.timer_armed || state.timer_generation != generation {
            return;
        }
        state.timer_armed = false;
        state.wait_period = (state.wait_period * 2).min(MAX_WAIT_PERIOD);
        let created = state.pending.created.clone();
        let snapshot = recompute(&ctx, &mut state).await;
        (created, snapshot)
    };

    if !created.is_empty() {
        let root_map = match &snapshot {
            Ok(build) => build.graph.root_map(),
            Err(_) => Default::default(),
        };
        let created = ChangedFiles {
            created,
            ..ChangedFiles::default()
        };
        notify_file_watchers(&ctx, &created, &root_map).await;
    }
}

/// The current graph, recomputing first if changes are pending.
///
/// Cancels a pending debounce timer, since the work happens now.
pub async fn get_cached_project_graph(ctx: &Arc<ServerContext>) -> GraphSnapshot {
    let mut state = ctx.state.lock().await;
    state.cancel_timer();
    state.wait_period = MIN_WAIT_PERIOD;

    if state.pending.is_empty() {
        if let Some(snapshot) = &state.snapshot {
            return snapshot.clone();
        }
    }
    recompute(ctx, &mut state).await
}

/// Workspace file hashes, computing them if the state was reset.
pub async fn current_files(
    ctx: &Arc<ServerContext>,
) -> Result<Arc<WorkspaceFileHashes>, GraphFailure> {
    // Brings pending changes in; a graph failure still leaves file hashes.
    let _ = get_cached_project_graph(ctx).await;
    let mut state = ctx.state.lock().await;
    if let Some(files) = &state.files {
        return Ok(Arc::clone(files));
    }
    let root = ctx.workspace_root.clone();
    let fs = Arc::clone(&ctx.fs);
    let files = tokio::task::spawn_blocking(move || hash_workspace_files(&root, fs.as_ref()))
        .await
        .map_err(|e| failure(format!("file hashing panicked: {e}")))?
        .map_err(|e| failure(format!("{e:#}")))?;
    let files = Arc::new(files);
    state.files = Some(Arc::clone(&files));
    Ok(files)
}

fn failure(message: String) -> GraphFailure {
    GraphFailure {
        message,
        partial_graph: None,
    }
}

/// Rebuild from `state` on a blocking thread and store the outcome.
async fn recompute(ctx: &Arc<ServerContext>, state: &mut ServerState) -> GraphSnapshot {
    let input = RecomputeInput {
        config: state.config.clone(),
        files: state.files.take(),
        pending: std::mem::take(&mut state.pending),
        previous: state.current_build(),
    };

    let worker_ctx = Arc::clone(ctx);
    let outcome = tokio::task::spawn_blocking(move || recompute_blocking(&worker_ctx, input))
        .await
        .unwrap_or_else(|e| {
            let message = format!("project graph computation panicked: {e}");
            (None, Err(failure(message)))
        });

    let (files, snapshot) = outcome;
    match &snapshot {
        Ok(build) => {
            info!(projects = build.graph.nodes.len(), "project graph ready");
            state.files = files;
        }
        Err(failure) => {
            error!(error = %failure.message, "project graph recomputation failed; resetting state");
            state.reset();
            // Files survive a graph failure so the next attempt only
            // re-hashes what changes next.
            state.files = files;
        }
    }
    state.snapshot = Some(snapshot.clone());
    snapshot
}

struct RecomputeInput {
    config: WorkspaceConfig,
    files: Option<Arc<WorkspaceFileHashes>>,
    pending: ChangedFiles,
    previous: Option<Arc<ProjectGraphBuild>>,
}

fn recompute_blocking(
    ctx: &ServerContext,
    input: RecomputeInput,
) -> (Option<Arc<WorkspaceFileHashes>>, GraphSnapshot) {
    ctx.recomputations.fetch_add(1, Ordering::Relaxed);
    let root = ctx.workspace_root.as_path();
    let fs = ctx.fs.as_ref();
    let deleted: Vec<String> = input.pending.deleted.iter().cloned().collect();

    // New ignore rules can bring back (or hide) any file.
    let ignore_changed = input
        .pending
        .created
        .iter()
        .chain(input.pending.updated.iter())
        .chain(input.pending.deleted.iter())
        .any(|f| is_ignore_file(f));
    let previous_files = if ignore_changed { None } else { input.files };

    let (files, changed_hashes) = match previous_files {
        None => match hash_workspace_files(root, fs) {
            Ok(files) => (files, None),
            Err(e) => return (None, Err(failure(format!("{e:#}")))),
        },
        Some(files) => {
            let mut files = Arc::unwrap_or_clone(files);
            for file in &deleted {
                files.remove(file);
            }
            let mut changed: Vec<String> = input
                .pending
                .created
                .iter()
                .chain(input.pending.updated.iter())
                .cloned()
                .collect();
            match WorkspaceIgnore::from_files(root, fs, files.keys()) {
                Ok(ignore) => ignore.retain(&mut changed),
                Err(e) => return (None, Err(failure(format!("{e:#}")))),
            }
            let hashed = match hash_files(root, &changed, fs) {
                Ok(hashed) => hashed,
                Err(e) => return (None, Err(failure(format!("{e:#}")))),
            };
            files.extend(hashed.iter().map(|(k, v)| (k.clone(), v.clone())));
            (files, Some(hashed))
        }
    };
    debug!(
        files = files.len(),
        incremental = changed_hashes.is_some(),
        "recomputing project graph"
    );

    let build_ctx = GraphBuildContext {
        workspace_root: root,
        config: &input.config,
        fs,
        registry: &ctx.registry,
    };
    let file_list: Vec<String> = files.keys().cloned().collect();
    let (configurations, errors) = create_project_configurations(&build_ctx, &file_list);
    let configuration_hash = hash_project_configurations(&configurations.projects);

    let patchable = match (&input.previous, &changed_hashes) {
        (Some(previous), Some(changed)) if previous.configuration_hash == configuration_hash => {
            Some((previous.file_map.clone(), changed))
        }
        _ => None,
    };
    let result = build_graph_from_configurations(&build_ctx, configurations, errors, |root_map| {
        match patchable {
            Some((mut file_map, changed)) => {
                debug!("patching file map");
                update_file_map(&mut file_map, root_map, changed, &deleted);
                file_map
            }
            None => {
                debug!("project configurations changed; rebuilding file map");
                create_file_map(root_map, &files)
            }
        }
    });

    let snapshot = result.map(Arc::new).map_err(GraphFailure::from);
    (Some(Arc::new(files)), snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::RealFileSystem;
    use crate::plugins::{InProcessLoader, PluginRegistry};
    use std::fs;
    use std::path::Path;

    fn context(root: &Path) -> Arc<ServerContext> {
        let config = WorkspaceConfig::default();
        let registry = PluginRegistry::load(&config, root, &InProcessLoader::new()).unwrap();
        ServerContext::init(root, Arc::new(RealFileSystem), config, registry)
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn changed(created: &[&str], updated: &[&str], deleted: &[&str]) -> ChangedFiles {
        let set = |paths: &[&str]| paths.iter().map(|p| p.to_string()).collect();
        ChangedFiles {
            created: set(created),
            updated: set(updated),
            deleted: set(deleted),
        }
    }

    #[tokio::test]
    async fn incremental_updates_patch_the_file_map() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        write(root, "libs/a/src/lib.rs", "one");
        let ctx = context(root);

        let first = get_cached_project_graph(&ctx).await.unwrap();
        let before = first.file_map.files_for_project("a").to_vec();

        write(root, "libs/a/src/lib.rs", "two");
        write(root, "libs/a/src/new.rs", "new");
        let batch = changed(&["libs/a/src/new.rs"], &["libs/a/src/lib.rs"], &[]);
        ctx.state.lock().await.pending.merge(batch);

        let second = get_cached_project_graph(&ctx).await.unwrap();
        assert_eq!(second.configuration_hash, first.configuration_hash);
        let after = second.file_map.files_for_project("a");
        assert_eq!(after.len(), before.len() + 1);
        let lib = |files: &[crate::workspace::FileData]| {
            files.iter().find(|f| f.file == "libs/a/src/lib.rs").unwrap().hash.clone()
        };
        assert_ne!(lib(after), lib(&before));
    }

    #[tokio::test]
    async fn new_projects_rebuild_the_file_map() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        write(root, "libs/b/src/lib.rs", "b");
        let ctx = context(root);

        let first = get_cached_project_graph(&ctx).await.unwrap();
        assert!(first.file_map.non_project_files.iter().any(|f| f.file == "libs/b/src/lib.rs"));

        write(root, "libs/b/project.json", r#"{"name": "b"}"#);
        ctx.state.lock().await.pending.merge(changed(&["libs/b/project.json"], &[], &[]));
        let second = get_cached_project_graph(&ctx).await.unwrap();
        assert_ne!(second.configuration_hash, first.configuration_hash);
        assert_eq!(second.file_map.files_for_project("b").len(), 2);
    }

    #[tokio::test]
    async fn failures_reset_state_and_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        let ctx = context(root);
        get_cached_project_graph(&ctx).await.unwrap();

        write(root, "libs/a/project.json", r#"{"name": "a", "implicitDependencies": ["ghost"]}"#);
        ctx.state.lock().await.pending.merge(changed(&[], &["libs/a/project.json"], &[]));
        let failure = get_cached_project_graph(&ctx).await.unwrap_err();
        assert!(failure.message.contains("ghost"));
        assert!(failure.partial_graph.is_some());
        // Next requester sees the same failure without a rebuild.
        assert!(get_cached_project_graph(&ctx).await.is_err());
        assert!(ctx.state.lock().await.current_build().is_none());

        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        ctx.state.lock().await.pending.merge(changed(&[], &["libs/a/project.json"], &[]));
        assert!(get_cached_project_graph(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn debounce_coalesces_bursts_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        write(root, "libs/a/one.rs", "1");
        write(root, "libs/a/two.rs", "2");
        let ctx = context(root);
        get_cached_project_graph(&ctx).await.unwrap();
        let generation = ctx.state.lock().await.timer_generation;

        add_changed_files(&ctx, changed(&[], &["libs/a/one.rs"], &[])).await;
        add_changed_files(&ctx, changed(&[], &["libs/a/two.rs"], &[])).await;
        {
            let state = ctx.state.lock().await;
            assert!(state.timer_armed);
            // Two batches, one timer.
            assert_eq!(state.timer_generation, generation + 1);
            assert_eq!(state.pending.updated.len(), 2);
        }

        // Let the timer fire and the blocking recomputation finish.
        tokio::time::sleep(MIN_WAIT_PERIOD * 2).await;
        for _ in 0..200 {
            let settled = {
                let state = ctx.state.lock().await;
                !state.timer_armed && state.pending.is_empty()
            };
            if settled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let state = ctx.state.lock().await;
            assert!(state.pending.is_empty());
            assert_eq!(state.wait_period, MIN_WAIT_PERIOD * 2);
        }

        // A created file resets the back-off.
        add_changed_files(&ctx, changed(&["libs/a/three.rs"], &[], &[])).await;
        assert_eq!(ctx.state.lock().await.wait_period, MIN_WAIT_PERIOD);
        // A graph request cancels the timer and does the work now.
        get_cached_project_graph(&ctx).await.unwrap();
        let state = ctx.state.lock().await;
        assert!(!state.timer_armed);
        assert!(state.pending.is_empty());
    }

    /// Wait for the armed timer to fire and its recomputation to finish.
    async fn settle(ctx: &Arc<ServerContext>) {
        loop {
            {
                let state = ctx.state.lock().await;
                if !state.timer_armed && state.pending.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_burst_recomputes_once_with_doubling_wait() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "libs/a/project.json", r#"{"name": "a"}"#);
        write(root, "libs/a/one.rs", "1");
        write(root, "libs/a/two.rs", "2");
        let ctx = context(root);
        get_cached_project_graph(&ctx).await.unwrap();
        assert_eq!(ctx.recomputations(), 1);

        let expected_waits = [100, 200, 400, 800, 1600, 3200, 4000, 4000];
        for (round, wait_ms) in expected_waits.into_iter().enumerate() {
            let wait = Duration::from_millis(wait_ms);
            assert_eq!(ctx.state.lock().await.wait_period, wait, "round {round}");
            let before = ctx.recomputations();
            let started = tokio::time::Instant::now();

            for _ in 0..5 {
                add_changed_files(&ctx, changed(&[], &["libs/a/one.rs"], &[])).await;
                add_changed_files(&ctx, changed(&[], &["libs/a/two.rs"], &[])).await;
            }
            tokio::time::sleep(wait - Duration::from_millis(1)).await;
            assert_eq!(ctx.recomputations(), before, "round {round} fired early");
            assert!(ctx.state.lock().await.timer_armed);

            settle(&ctx).await;
            assert!(started.elapsed() >= wait);
            assert_eq!(ctx.recomputations(), before + 1, "round {round}");
        }
        assert_eq!(ctx.state.lock().await.wait_period, MAX_WAIT_PERIOD);
    }
}
