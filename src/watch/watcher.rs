// src/watch/watcher.rs

use std::path::PathBuf;

use anyhow::Result;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::watch::events::{classify_event, ChangedFiles};

/// Handle for the filesystem watcher.
///
/// Keeps the underlying `RecommendedWatcher` alive; dropping it stops
/// watching and ends the forwarding task.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
    root: PathBuf,
}

impl WatcherHandle {
    /// The canonicalized directory being watched.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").field("root", &self.root).finish()
    }
}

/// Watch `root` recursively and send every non-empty batch of changes to
/// `changes_tx`, relative to `root`.
pub fn spawn_watcher(
    root: impl Into<PathBuf>,
    changes_tx: mpsc::UnboundedSender<ChangedFiles>,
) -> Result<WatcherHandle> {
    let root = root.into();
    // Canonicalize once so event paths strip cleanly.
    let root = root.canonicalize().unwrap_or_else(|_| root.clone());

    // Channel from the blocking notify callback into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if let Err(err) = event_tx.send(event) {
                    eprintln!("monodag: failed to forward notify event: {err}");
                }
            }
            Err(err) => eprintln!("monodag: file watch error: {err}"),
        },
        Config::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(root = ?root, "file watcher started");

    let async_root = root.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let changes = classify_event(&async_root, &event);
            if changes.is_empty() {
                continue;
            }
            debug!(
                created = changes.created.len(),
                updated = changes.updated.len(),
                deleted = changes.deleted.len(),
                "file changes"
            );
            if changes_tx.send(changes).is_err() {
                warn!("file change receiver dropped; stopping watcher loop");
                break;
            }
        }
        debug!("watcher event loop finished");
    });

    Ok(WatcherHandle { _inner: watcher, root })
}
