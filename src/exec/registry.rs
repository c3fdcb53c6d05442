// src/exec/registry.rs

//! What the orchestrator knows about executors: whether they can run a batch
//! of tasks in one invocation and whether they hash tasks themselves.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::config::WorkspaceConfig;
use crate::dag::Task;
use crate::graph::ProjectGraph;
use crate::hasher::TaskHash;

/// Executor-provided hashing, applied on top of the default task hash.
pub trait CustomHasher: Send + Sync + Debug {
    fn hash(&self, task: &Task, default: TaskHash) -> anyhow::Result<TaskHash>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorInfo {
    pub batch: bool,
    pub hasher: Option<Arc<dyn CustomHasher>>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<String, ExecutorInfo>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `[executors.*]` declarations of the workspace.
    pub fn from_config(config: &WorkspaceConfig) -> Self {
        let executors = config
            .executors
            .iter()
            .map(|(name, section)| {
                (
                    name.clone(),
                    ExecutorInfo {
                        batch: section.batch,
                        hasher: None,
                    },
                )
            })
            .collect();
        Self { executors }
    }

    pub fn register(&mut self, name: impl Into<String>, info: ExecutorInfo) {
        self.executors.insert(name.into(), info);
    }

    pub fn supports_batch(&self, executor: &str) -> bool {
        self.executors.get(executor).map(|e| e.batch).unwrap_or(false)
    }

    pub fn custom_hasher(&self, executor: &str) -> Option<&Arc<dyn CustomHasher>> {
        self.executors.get(executor)?.hasher.as_ref()
    }
}

/// Executor name of the target a task runs.
pub fn executor_name_for_task<'g>(task: &Task, graph: &'g ProjectGraph) -> Option<&'g str> {
    graph
        .node(&task.target.project)?
        .targets
        .get(&task.target.target)?
        .executor
        .as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawWorkspaceConfig;

    #[test]
    fn batch_capability_comes_from_config() {
        let raw: RawWorkspaceConfig = toml::from_str("[executors.jest]\nbatch = true\n").unwrap();
        let registry = ExecutorRegistry::from_config(&WorkspaceConfig::try_from(raw).unwrap());
        assert!(registry.supports_batch("jest"));
        assert!(!registry.supports_batch("run-commands"));
        assert!(registry.custom_hasher("jest").is_none());
    }
}
