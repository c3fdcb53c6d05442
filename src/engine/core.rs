// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! Consumes [`RuntimeEvent`]s and answers with the task ids the scheduler
//! must mark complete. A failure settles every transitive dependent as
//! skipped so they are completed without running.
//!
//! No Tokio, channels, filesystem, or processes in here.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::dag::TaskGraph;
use crate::engine::{RunSummary, RuntimeEvent, TaskResult, TaskStatus};
use crate::types::TaskId;

/// Decision returned by the core after handling a single event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreStep {
    /// Tasks to report to the scheduler as complete, in settlement order.
    pub complete: Vec<TaskId>,
}

#[derive(Debug)]
pub struct CoreRuntime {
    dependents: HashMap<TaskId, Vec<TaskId>>,
    results: BTreeMap<TaskId, TaskResult>,
}

impl CoreRuntime {
    pub fn new(task_graph: &TaskGraph) -> Self {
        Self {
            dependents: task_graph.reverse_dependencies(),
            results: BTreeMap::new(),
        }
    }

    /// Whether the task already has a result (ran, hit the cache, or was
    /// skipped because of a failure).
    pub fn is_settled(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }

    pub fn result(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(id)
    }

    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        let mut step = CoreStep::default();
        match event {
            RuntimeEvent::TaskCompleted(result) => self.record(result, &mut step),
            RuntimeEvent::BatchCompleted(results) => {
                for result in results {
                    self.record(result, &mut step);
                }
            }
        }
        step
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            results: self.results.clone(),
        }
    }

    fn record(&mut self, result: TaskResult, step: &mut CoreStep) {
        let id = result.task_id.clone();
        debug!(task = %id, status = %result.status, code = result.code, "task settled");
        let failed = result.status == TaskStatus::Failure;
        self.results.insert(id.clone(), result);
        step.complete.push(id.clone());

        if failed {
            for skipped in self.skip_dependents_of(&id) {
                step.complete.push(skipped);
            }
        }
    }

    fn skip_dependents_of(&mut self, failed: &str) -> Vec<TaskId> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<&TaskId> = self
            .dependents
            .get(failed)
            .map(|d| d.iter().collect())
            .unwrap_or_default();

        while let Some(id) = queue.pop_front() {
            if self.results.contains_key(id) {
                continue;
            }
            warn!(task = %id, dependency = %failed, "skipping task because a dependency failed");
            self.results.insert(
                id.clone(),
                TaskResult::new(id.clone(), TaskStatus::Skipped, 1, String::new()),
            );
            skipped.push(id.clone());
            if let Some(next) = self.dependents.get(id) {
                queue.extend(next.iter());
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Task, TaskTarget};
    use serde_json::Map;

    fn task(id: &str) -> Task {
        let (project, target) = id.split_once(':').unwrap();
        Task {
            id: id.into(),
            target: TaskTarget {
                project: project.into(),
                target: target.into(),
                configuration: None,
            },
            overrides: Map::new(),
            outputs: vec![],
            project_root: project.into(),
            hash: None,
            hash_details: None,
            cache: true,
        }
    }

    /// a:build <- b:build <- c:build, plus an unrelated d:build.
    fn chain() -> TaskGraph {
        let mut graph = TaskGraph::new();
        for id in ["a:build", "b:build", "c:build", "d:build"] {
            graph.add_task(task(id));
        }
        graph.add_dependency("b:build", "a:build");
        graph.add_dependency("c:build", "b:build");
        graph.recompute_roots();
        graph
    }

    #[test]
    fn success_completes_only_the_task() {
        let mut core = CoreRuntime::new(&chain());
        let step = core.step(RuntimeEvent::TaskCompleted(TaskResult::new(
            "a:build",
            TaskStatus::Success,
            0,
            "ok",
        )));
        assert_eq!(step.complete, vec!["a:build"]);
        assert!(core.is_settled("a:build"));
        assert!(!core.is_settled("b:build"));
    }

    #[test]
    fn failure_skips_transitive_dependents() {
        let mut core = CoreRuntime::new(&chain());
        let step = core.step(RuntimeEvent::TaskCompleted(TaskResult::failure("a:build", "boom")));
        assert_eq!(step.complete, vec!["a:build", "b:build", "c:build"]);
        assert_eq!(core.result("c:build").unwrap().status, TaskStatus::Skipped);
        assert!(!core.is_settled("d:build"));

        let cached = TaskResult::new("d:build", TaskStatus::LocalCache, 0, "");
        core.step(RuntimeEvent::TaskCompleted(cached));
        let summary = core.summary();
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(summary.failed(), vec!["a:build"]);
        assert_eq!(summary.count(TaskStatus::Skipped), 2);
    }

    #[test]
    fn batch_results_are_recorded_together() {
        let mut core = CoreRuntime::new(&chain());
        let step = core.step(RuntimeEvent::BatchCompleted(vec![
            TaskResult::new("a:build", TaskStatus::Success, 0, ""),
            TaskResult::new("b:build", TaskStatus::Success, 0, ""),
        ]));
        assert_eq!(step.complete, vec!["a:build", "b:build"]);
        assert_eq!(core.summary().exit_code(), 0);
    }
}
