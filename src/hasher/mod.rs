// src/hasher/mod.rs

//! Task hashing.
//!
//! A task hash covers the files its inputs match (through the file map), the
//! workspace's global inputs, runtime and env inputs, the task's target and
//! overrides, and optionally files produced by upstream tasks.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::TaskGraph;
use crate::exec::registry::{executor_name_for_task, ExecutorRegistry};

pub mod file_hash;
pub mod inputs;
pub mod store;
pub mod task_hasher;

pub use file_hash::{compute_aggregate_hash, compute_file_hash, hash_str};
pub use inputs::{get_inputs, SplitInputs};
pub use store::{HashStore, MemoryHashStore};
pub use task_hasher::TaskHasher;

/// What went into a task hash, one entry per input source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashDetails {
    pub command: String,
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: BTreeMap<String, String>,
}

impl HashDetails {
    /// Combine every entry into the final hash value.
    pub fn aggregate(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.nodes.len() + self.runtime.len());
        parts.push(self.command.clone());
        parts.extend(self.nodes.iter().map(|(k, v)| format!("{k}={v}")));
        parts.extend(self.runtime.iter().map(|(k, v)| format!("runtime:{k}={v}")));
        compute_aggregate_hash(&parts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHash {
    pub value: String,
    pub details: HashDetails,
}

/// Hash, in parallel, every task whose hash is known before anything runs.
///
/// Skipped (hashed later with [`hash_task`]): tasks whose executor hashes
/// them itself, and tasks with dependencies whose inputs include
/// `dependentTasksOutputFiles`.
pub fn hash_tasks_that_do_not_depend_on_outputs(
    hasher: &TaskHasher<'_>,
    executors: &ExecutorRegistry,
    task_graph: &mut TaskGraph,
) -> Result<()> {
    let mut eager = Vec::new();
    for task in task_graph.tasks.values() {
        let custom = executor_name_for_task(task, hasher.project_graph())
            .and_then(|e| executors.custom_hasher(e))
            .is_some();
        if custom {
            continue;
        }
        let depends_on_outputs = !task_graph.dependencies_of(&task.id).is_empty()
            && !get_inputs(task, hasher.project_graph(), hasher.config())?
                .deps_outputs
                .is_empty();
        if !depends_on_outputs {
            eager.push(task);
        }
    }

    let hashes = hasher.hash_tasks(&eager, task_graph);
    let ids: Vec<String> = eager.iter().map(|t| t.id.clone()).collect();
    debug!(count = ids.len(), "hashed tasks ahead of execution");

    for (id, hash) in ids.into_iter().zip(hashes) {
        let hash = hash?;
        if let Some(task) = task_graph.tasks.get_mut(&id) {
            task.hash = Some(hash.value);
            task.hash_details = Some(hash.details);
        }
    }
    Ok(())
}

/// Hash one task, through its executor's custom hasher when it has one,
/// and store the result on the task.
pub fn hash_task(
    hasher: &TaskHasher<'_>,
    executors: &ExecutorRegistry,
    task_graph: &mut TaskGraph,
    id: &str,
) -> Result<TaskHash> {
    let task = task_graph
        .tasks
        .get(id)
        .ok_or_else(|| anyhow!("task {id} is not in the task graph"))?;

    let default = hasher.hash_task(task, task_graph)?;
    let hash = match executor_name_for_task(task, hasher.project_graph())
        .and_then(|e| executors.custom_hasher(e))
    {
        Some(custom) => custom.hash(task, default)?,
        None => default,
    };

    if let Some(task) = task_graph.tasks.get_mut(id) {
        task.hash = Some(hash.value.clone());
        task.hash_details = Some(hash.details.clone());
    }
    Ok(hash)
}
