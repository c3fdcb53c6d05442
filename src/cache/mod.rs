// src/cache/mod.rs

//! Content-addressable task cache.
//!
//! Layout under the cache directory:
//!
//! ```text
//! <hash>/terminalOutput
//! <hash>/outputs/**        copies of the task's outputs
//! <hash>/code              exit code
//! <hash>/source            machine id of the writer
//! <hash>.commit            written last; an entry without it does not exist
//! <hash>.tmp-<n>/          outputs being collected before a put moves them
//! terminalOutputs/<hash>   latest terminal output of a run
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::dag::Task;
use crate::errors::CacheError;

pub mod fs_ops;
pub mod machine;
pub mod prune;
pub mod remote;
pub mod retry;

pub use remote::{DirectoryRemoteCache, RemoteCache};
pub use retry::RetryPolicy;

use fs_ops::{copy_path, expand_outputs, remove_path};

pub const TERMINAL_OUTPUTS_DIR: &str = "terminalOutputs";

/// A committed cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub terminal_output: String,
    pub outputs_path: PathBuf,
    pub code: i32,
    /// Came from the remote tier on this lookup.
    pub remote: bool,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub cache_directory: PathBuf,
    pub remote: Option<Arc<dyn RemoteCache>>,
    pub reject_unknown_local_cache: bool,
    pub max_age: Duration,
    pub retry: RetryPolicy,
}

impl CacheOptions {
    /// Options from `[workspace]`, with relative directories resolved
    /// against the workspace root.
    pub fn from_config(workspace_root: &Path, config: &WorkspaceConfig) -> Self {
        let ws = &config.workspace;
        Self {
            cache_directory: workspace_root.join(&ws.cache_directory),
            remote: ws.remote_cache_directory.as_ref().map(|dir| {
                let remote = DirectoryRemoteCache::new(workspace_root.join(dir));
                Arc::new(remote) as Arc<dyn RemoteCache>
            }),
            reject_unknown_local_cache: config.reject_unknown_local_cache(),
            max_age: Duration::from_secs(ws.cache_max_age_days * 24 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    cache_path: PathBuf,
    terminal_outputs_dir: PathBuf,
    options: CacheOptions,
    machine_id: OnceLock<String>,
}

impl Cache {
    /// Open (creating if needed) the cache for the workspace at `root`.
    ///
    /// Each open may start a background pass that prunes old entries.
    pub fn new(root: impl Into<PathBuf>, options: CacheOptions) -> Result<Self, CacheError> {
        let cache_path = options.cache_directory.clone();
        let terminal_outputs_dir = cache_path.join(TERMINAL_OUTPUTS_DIR);
        fs::create_dir_all(&terminal_outputs_dir).map_err(|source| CacheError::Io {
            path: terminal_outputs_dir.clone(),
            source,
        })?;
        prune::maybe_spawn_pruning(&cache_path, options.max_age);

        Ok(Self {
            root: root.into(),
            cache_path,
            terminal_outputs_dir,
            options,
            machine_id: OnceLock::new(),
        })
    }

    /// Pin the machine id instead of detecting it.
    pub fn with_machine_id(self, id: impl Into<String>) -> Self {
        let _ = self.machine_id.set(id.into());
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn current_machine_id(&self) -> &str {
        self.machine_id.get_or_init(machine::current_machine_id)
    }

    /// Look up the entry for the task's hash: locally first, then through the
    /// remote tier into the local directory.
    pub fn get(&self, task: &Task) -> Result<Option<CachedResult>, CacheError> {
        let hash = task_hash(task)?;

        if let Some(hit) = self.get_from_local_dir(hash)? {
            self.assert_local_cache_validity(task, hash)?;
            debug!(task = %task.id, hash = %hash, "local cache hit");
            return Ok(Some(hit));
        }

        let Some(remote) = &self.options.remote else {
            return Ok(None);
        };
        let retrieved = self
            .options
            .retry
            .run(|| remote.retrieve(hash, &self.cache_path))?;
        if !retrieved {
            return Ok(None);
        }
        let hit = self.get_from_local_dir(hash)?.map(|r| CachedResult { remote: true, ..r });
        if hit.is_some() {
            debug!(task = %task.id, hash = %hash, "remote cache hit");
        }
        Ok(hit)
    }

    /// Store the task's outputs and result under its hash.
    pub fn put(
        &self,
        task: &Task,
        terminal_output: Option<&str>,
        outputs: &[String],
        code: i32,
    ) -> Result<(), CacheError> {
        let hash = task_hash(task)?;
        let td = self.cache_path.join(hash);
        let commit = self.commit_path(hash);

        self.options.retry.run(|| -> Result<(), CacheError> {
            // Leftovers of an interrupted put.
            remove_path(&commit)?;
            remove_path(&td)?;

            // Fill a fresh directory, then move it into place.
            let staging = self.cache_path.join(format!("{hash}.tmp-{:08x}", rand::random::<u32>()));
            let outputs_dir = staging.join("outputs");
            create_dir(&outputs_dir)?;
            let terminal_output = terminal_output.unwrap_or("no terminal output");
            write(&staging.join("terminalOutput"), terminal_output)?;

            for output in expand_outputs(&self.root, outputs)? {
                let src = self.root.join(&output);
                if src.exists() {
                    copy_path(&src, &outputs_dir.join(&output))?;
                }
            }
            fs::rename(&staging, &td).map_err(|source| {
                let _ = remove_path(&staging);
                CacheError::Io {
                    path: td.clone(),
                    source,
                }
            })?;

            write(&td.join("code"), &code.to_string())?;
            write(&td.join("source"), self.current_machine_id())?;
            write(&commit, "true")
        })?;
        info!(task = %task.id, hash = %hash, "stored task result in cache");

        if let Some(remote) = &self.options.remote {
            self.options.retry.run(|| remote.store(hash, &self.cache_path))?;
        }

        if let Some(output) = terminal_output {
            write(&self.terminal_outputs_dir.join(hash), output)?;
        }
        Ok(())
    }

    /// Restore cached outputs into the workspace, replacing what is there.
    pub fn copy_files_from_cache(
        &self,
        hash: &str,
        cached: &CachedResult,
        outputs: &[String],
    ) -> Result<(), CacheError> {
        self.options.retry.run(|| -> Result<(), CacheError> {
            for output in expand_outputs(&cached.outputs_path, outputs)? {
                let cached_file = cached.outputs_path.join(&output);
                if cached_file.exists() {
                    let dest = self.root.join(&output);
                    remove_path(&dest)?;
                    copy_path(&cached_file, &dest)?;
                }
            }
            Ok(())
        })?;
        debug!(hash = %hash, "restored outputs from cache");
        Ok(())
    }

    /// Where the latest terminal output of the task is kept.
    pub fn temporary_output_path(&self, task: &Task) -> Result<PathBuf, CacheError> {
        Ok(self.terminal_outputs_dir.join(task_hash(task)?))
    }

    fn commit_path(&self, hash: &str) -> PathBuf {
        self.cache_path.join(format!("{hash}.commit"))
    }

    fn get_from_local_dir(&self, hash: &str) -> Result<Option<CachedResult>, CacheError> {
        if !self.commit_path(hash).exists() {
            return Ok(None);
        }
        let td = self.cache_path.join(hash);
        let terminal_output = read(&td.join("terminalOutput"))?;
        let code = match fs::read_to_string(td.join("code")) {
            Ok(s) => s.trim().parse().unwrap_or(0),
            Err(_) => 0,
        };
        Ok(Some(CachedResult {
            terminal_output,
            outputs_path: td.join("outputs"),
            code,
            remote: false,
        }))
    }

    fn assert_local_cache_validity(&self, task: &Task, hash: &str) -> Result<(), CacheError> {
        let td = self.cache_path.join(hash);
        let source = fs::read_to_string(td.join("source")).unwrap_or_default();
        if source.is_empty() || source == self.current_machine_id() {
            return Ok(());
        }
        if self.options.reject_unknown_local_cache {
            return Err(CacheError::UnknownLocalCache {
                task: task.id.clone(),
                path: td,
            });
        }
        warn!(task = %task.id, "using cache entry produced on another machine");
        Ok(())
    }
}

fn task_hash(task: &Task) -> Result<&str, CacheError> {
    task.hash
        .as_deref()
        .ok_or_else(|| CacheError::MissingHash(task.id.clone()))
}

fn create_dir(path: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), CacheError> {
    fs::write(path, contents).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> Result<String, CacheError> {
    fs::read_to_string(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })
}
