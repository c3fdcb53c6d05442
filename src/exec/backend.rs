// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The engine talks to an `ExecutorBackend` instead of spawning processes
//! itself, so tests can swap in a fake that records what ran and returns
//! canned results.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::dag::Task;
use crate::errors::Result;
use crate::graph::ProjectGraph;
use crate::types::TaskId;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a backend needs to run one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub task: Task,
    pub executor: Option<String>,
    /// Target options, then the selected configuration's options, then the
    /// task overrides.
    pub options: Map<String, Value>,
    pub workspace_root: PathBuf,
}

impl ExecutionRequest {
    pub fn from_task(task: &Task, graph: &ProjectGraph, workspace_root: &Path) -> Self {
        let target = graph
            .node(&task.target.project)
            .and_then(|node| node.targets.get(&task.target.target));

        let mut options = target.and_then(|t| t.options.clone()).unwrap_or_default();
        let configuration = task.target.configuration.as_ref().and_then(|name| {
            target
                .and_then(|t| t.configurations.as_ref())
                .and_then(|configs| configs.get(name))
        });
        if let Some(configuration) = configuration {
            options.extend(configuration.clone());
        }
        options.extend(task.overrides.clone());

        Self {
            task: task.clone(),
            executor: target.and_then(|t| t.executor.clone()),
            options,
            workspace_root: workspace_root.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub code: i32,
    pub terminal_output: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Trait abstracting how tasks are executed.
pub trait ExecutorBackend: Send + Sync {
    fn run_task(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionResult>>;

    /// Run several tasks of one batch-capable executor together.
    ///
    /// `requests` are in dependency order. The default runs them one by
    /// one; a backend that really batches overrides this.
    fn run_batch(
        &self,
        executor: String,
        requests: Vec<ExecutionRequest>,
    ) -> BoxFuture<'_, Result<BTreeMap<TaskId, ExecutionResult>>> {
        Box::pin(async move {
            tracing::debug!(
                executor = %executor,
                tasks = requests.len(),
                "running batch task by task"
            );
            let mut results = BTreeMap::new();
            for request in requests {
                let id = request.task.id.clone();
                results.insert(id, self.run_task(request).await?);
            }
            Ok(results)
        })
    }
}
