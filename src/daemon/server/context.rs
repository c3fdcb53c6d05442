// src/daemon/server/context.rs

//! Everything the daemon keeps between requests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::config::WorkspaceConfig;
use crate::daemon::protocol::FileWatcherConfig;
use crate::daemon::server::recompute::{GraphSnapshot, MIN_WAIT_PERIOD};
use crate::fs::FileSystem;
use crate::graph::ProjectGraphBuild;
use crate::hasher::MemoryHashStore;
use crate::plugins::PluginRegistry;
use crate::watch::ChangedFiles;
use crate::workspace::WorkspaceFileHashes;

/// A function clients can run inside the daemon via `PROCESS_IN_BACKGROUND`.
pub type BackgroundFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// Graph and file state, guarded by one async mutex so recomputation and
/// the requests that read its result are serialized.
#[derive(Debug)]
pub struct ServerState {
    pub config: WorkspaceConfig,
    /// Every workspace file with its hash; `None` until first computed or
    /// after a reset.
    pub files: Option<Arc<WorkspaceFileHashes>>,
    /// Result of the last recomputation, handed to the next requester.
    pub snapshot: Option<GraphSnapshot>,
    /// Changes seen since the last recomputation.
    pub pending: ChangedFiles,
    pub wait_period: Duration,
    /// Bumped whenever a debounce timer is armed or cancelled; a timer that
    /// wakes up with a stale generation does nothing.
    pub timer_generation: u64,
    pub timer_armed: bool,
}

impl ServerState {
    fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            files: None,
            snapshot: None,
            pending: ChangedFiles::default(),
            wait_period: MIN_WAIT_PERIOD,
            timer_generation: 0,
            timer_armed: false,
        }
    }

    /// Drop everything derived from the workspace. The config stays.
    pub fn reset(&mut self) {
        self.files = None;
        self.snapshot = None;
        self.pending = ChangedFiles::default();
        self.wait_period = MIN_WAIT_PERIOD;
        self.cancel_timer();
    }

    /// Swap in an edited workspace config. The cached graph, and with it
    /// the configuration hash the next recomputation compares against,
    /// came from the old config and is dropped.
    pub fn replace_config(&mut self, config: WorkspaceConfig) {
        self.config = config;
        self.snapshot = None;
    }

    pub fn cancel_timer(&mut self) {
        self.timer_armed = false;
        self.timer_generation += 1;
    }

    /// The last successful build, if any.
    pub fn current_build(&self) -> Option<Arc<ProjectGraphBuild>> {
        match &self.snapshot {
            Some(Ok(build)) => Some(Arc::clone(build)),
            _ => None,
        }
    }
}

pub(crate) struct RegisteredWatcher {
    pub id: u64,
    pub config: FileWatcherConfig,
    pub writer: OwnedWriteHalf,
}

pub struct ServerContext {
    pub workspace_root: PathBuf,
    pub fs: Arc<dyn FileSystem>,
    pub registry: PluginRegistry,
    pub state: Mutex<ServerState>,
    pub outputs: StdMutex<MemoryHashStore>,
    pub(crate) watchers: Mutex<Vec<RegisteredWatcher>>,
    background: RwLock<HashMap<String, BackgroundFn>>,
    next_watcher_id: AtomicU64,
    pub(crate) recomputations: AtomicU64,
    last_activity: StdMutex<Instant>,
    shutdown: Notify,
    shutdown_reason: StdMutex<Option<String>>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("workspace_root", &self.workspace_root)
            .field("plugins", &self.registry.plugins().len())
            .finish()
    }
}

impl ServerContext {
    pub fn init(
        workspace_root: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        config: WorkspaceConfig,
        registry: PluginRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            workspace_root: workspace_root.into(),
            fs,
            registry,
            state: Mutex::new(ServerState::new(config)),
            outputs: StdMutex::new(MemoryHashStore::new()),
            watchers: Mutex::new(Vec::new()),
            background: RwLock::new(HashMap::new()),
            next_watcher_id: AtomicU64::new(1),
            recomputations: AtomicU64::new(0),
            last_activity: StdMutex::new(Instant::now()),
            shutdown: Notify::new(),
            shutdown_reason: StdMutex::new(None),
        })
    }

    /// How many project graph recomputations have run.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::Relaxed)
    }

    /// Forget the graph, the file hashes and the recorded output hashes.
    pub async fn reset(&self) {
        self.state.lock().await.reset();
        if let Ok(mut outputs) = self.outputs.lock() {
            *outputs = MemoryHashStore::new();
        }
        info!("daemon state reset");
    }

    pub fn register_background_fn(&self, name: impl Into<String>, f: BackgroundFn) {
        if let Ok(mut table) = self.background.write() {
            table.insert(name.into(), f);
        }
    }

    pub fn background_fn(&self, name: &str) -> Option<BackgroundFn> {
        self.background.read().ok()?.get(name).cloned()
    }

    pub(crate) fn next_watcher_id(&self) -> u64 {
        self.next_watcher_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Ask the accept loop to exit. The first reason wins.
    pub fn request_shutdown(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.shutdown_reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.shutdown.notify_one();
    }

    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        self.shutdown_reason.lock().ok()?.clone()
    }
}
