// src/engine/mod.rs

//! Orchestration engine.
//!
//! Runs a task graph: the scheduler decides what is ready, the hasher
//! fills in task hashes, the cache short-circuits work it has seen, and an
//! [`ExecutorBackend`](crate::exec::ExecutorBackend) runs the rest.
//!
//! The pure core state machine (results, failure propagation) lives in
//! [`core`]; the async/IO shell is implemented in [`runtime`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::types::TaskId;

/// How a task ended up in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Success,
    Failure,
    /// Not run: a dependency failed, or this is a dry run.
    Skipped,
    LocalCache,
    /// Cache hit whose outputs were already in place.
    LocalCacheKeptExisting,
    RemoteCache,
}

impl TaskStatus {
    pub fn is_cache_hit(self) -> bool {
        matches!(
            self,
            TaskStatus::LocalCache | TaskStatus::LocalCacheKeptExisting | TaskStatus::RemoteCache
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Skipped => "skipped",
            TaskStatus::LocalCache => "local-cache",
            TaskStatus::LocalCacheKeptExisting => "local-cache-kept-existing",
            TaskStatus::RemoteCache => "remote-cache",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub code: i32,
    pub terminal_output: String,
}

impl TaskResult {
    pub fn new(
        task_id: impl Into<TaskId>,
        status: TaskStatus,
        code: i32,
        terminal_output: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            code,
            terminal_output: terminal_output.into(),
        }
    }

    pub fn failure(task_id: impl Into<TaskId>, message: impl Into<String>) -> Self {
        Self::new(task_id, TaskStatus::Failure, 1, message)
    }
}

/// Knobs for one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Maximum number of tasks (or batches) in flight.
    pub parallel: usize,
    /// Hand tasks of batch-capable executors over together.
    pub batch: bool,
    pub skip_cache: bool,
    /// Resolve hashes and cache hits, but run nothing.
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: 3,
            batch: false,
            skip_cache: false,
            dry_run: false,
        }
    }
}

/// Every task's result once the run is over.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub results: BTreeMap<TaskId, TaskResult>,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.values().filter(|r| r.status == status).count()
    }

    pub fn failed(&self) -> Vec<&TaskId> {
        self.results
            .values()
            .filter(|r| r.status == TaskStatus::Failure)
            .map(|r| &r.task_id)
            .collect()
    }

    /// 0 when nothing failed, otherwise 1.
    pub fn exit_code(&self) -> i32 {
        if self.failed().is_empty() { 0 } else { 1 }
    }
}

/// Events flowing into the core from the runtime's workers.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    TaskCompleted(TaskResult),
    /// Results of every member of one batch.
    BatchCompleted(Vec<TaskResult>),
}

pub mod core;
pub mod runtime;

pub use core::{CoreRuntime, CoreStep};
pub use runtime::{RunContext, Runtime};
