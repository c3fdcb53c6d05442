// src/dag/scheduler.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::dag::graph::TaskGraph;
use crate::exec::registry::{executor_name_for_task, ExecutorRegistry};
use crate::graph::operators::{reverse, transitive_dependency_counts};
use crate::graph::ProjectGraph;
use crate::types::TaskId;

/// Tasks sharing one batch-capable executor, handed to it together.
///
/// `task_graph` only holds edges between members of the batch; every
/// dependency outside the batch is already complete.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub executor_name: String,
    pub task_graph: TaskGraph,
}

/// Decides which tasks may run next.
///
/// Every task moves `NotScheduled -> Scheduled -> Completed`. A task is
/// scheduled once all of its dependencies are completed; the caller reports
/// completion (successful or not) with [`TasksSchedule::complete`].
///
/// Individually scheduled tasks are ordered by number of direct dependents,
/// then by number of transitive dependent projects. This favours tasks that
/// unblock more work; it is a heuristic, not an optimal schedule.
#[derive(Debug)]
pub struct TasksSchedule {
    /// Full graph, minus edges inside dependency cycles.
    task_graph: TaskGraph,
    not_scheduled: TaskGraph,
    reverse_task_deps: HashMap<TaskId, Vec<TaskId>>,
    project_dependents: HashMap<String, usize>,
    executor_of: HashMap<TaskId, String>,
    batch_executors: HashSet<String>,
    batch_mode: bool,
    scheduled_tasks: Vec<TaskId>,
    scheduled_batches: VecDeque<Batch>,
    completed: HashSet<TaskId>,
}

impl TasksSchedule {
    pub fn new(
        project_graph: &ProjectGraph,
        task_graph: &TaskGraph,
        executors: &ExecutorRegistry,
        batch_mode: bool,
    ) -> Self {
        let mut task_graph = task_graph.clone();

        // Tasks in a cycle become ready together.
        for group in task_graph.cyclic_groups() {
            warn!(tasks = ?group, "scheduling circular task dependencies as one unit");
            let members: BTreeSet<&TaskId> = group.iter().collect();
            for id in &group {
                if let Some(deps) = task_graph.dependencies.get_mut(id) {
                    deps.retain(|d| !members.contains(d));
                }
            }
        }
        task_graph.recompute_roots();

        let mut executor_of = HashMap::new();
        let mut batch_executors = HashSet::new();
        for (id, task) in &task_graph.tasks {
            if let Some(executor) = executor_name_for_task(task, project_graph) {
                if executors.supports_batch(executor) {
                    batch_executors.insert(executor.to_string());
                }
                executor_of.insert(id.clone(), executor.to_string());
            }
        }

        Self {
            reverse_task_deps: task_graph.reverse_dependencies(),
            project_dependents: transitive_dependency_counts(&reverse(project_graph)),
            not_scheduled: task_graph.clone(),
            task_graph,
            executor_of,
            batch_executors,
            batch_mode,
            scheduled_tasks: Vec::new(),
            scheduled_batches: VecDeque::new(),
            completed: HashSet::new(),
        }
    }

    /// Move every task (and batch) that can run now into the ready queues.
    pub fn schedule_next_tasks(&mut self) {
        if self.batch_mode {
            self.schedule_batches();
        }
        let roots = self.not_scheduled.roots.clone();
        for root in roots {
            if self.can_be_scheduled(&root) {
                self.schedule_task(root);
            }
        }
    }

    /// Mark tasks as done (successfully or not).
    pub fn complete<S: AsRef<str>>(&mut self, ids: &[S]) {
        for id in ids {
            self.completed.insert(id.as_ref().to_string());
        }
        self.not_scheduled.remove_tasks(ids);
    }

    pub fn next_task(&mut self) -> Option<TaskId> {
        if self.scheduled_tasks.is_empty() {
            None
        } else {
            Some(self.scheduled_tasks.remove(0))
        }
    }

    pub fn next_batch(&mut self) -> Option<Batch> {
        self.scheduled_batches.pop_front()
    }

    /// Whether anything is still waiting to be handed out. Tasks and
    /// batches already returned by `next_task`/`next_batch` do not count,
    /// even before they are completed.
    pub fn has_tasks(&self) -> bool {
        !self.scheduled_batches.is_empty()
            || !self.scheduled_tasks.is_empty()
            || !self.not_scheduled.tasks.is_empty()
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    fn can_be_scheduled(&self, id: &str) -> bool {
        self.task_graph
            .dependencies_of(id)
            .iter()
            .all(|d| self.completed.contains(d))
    }

    fn schedule_task(&mut self, id: TaskId) {
        debug!(task = %id, "scheduling task");
        self.not_scheduled.remove_tasks(&[id.as_str()]);
        self.scheduled_tasks.push(id);

        let reverse = &self.reverse_task_deps;
        let dependents = &self.project_dependents;
        let tasks = &self.task_graph.tasks;
        let project_rank = |id: &TaskId| {
            tasks
                .get(id)
                .and_then(|t| dependents.get(&t.target.project))
                .copied()
                .unwrap_or(0)
        };
        let task_rank = |id: &TaskId| reverse.get(id).map(Vec::len).unwrap_or(0);

        self.scheduled_tasks.sort_by(|a, b| {
            task_rank(b)
                .cmp(&task_rank(a))
                .then_with(|| project_rank(b).cmp(&project_rank(a)))
        });
    }

    fn schedule_batches(&mut self) {
        let mut batches: BTreeMap<String, TaskGraph> = BTreeMap::new();
        for root in &self.not_scheduled.roots {
            let Some(executor) = self.executor_of.get(root) else {
                continue;
            };
            self.process_task_for_batches(&mut batches, root, executor, true);
        }

        for (executor_name, mut graph) in batches {
            let members: BTreeSet<TaskId> = graph.tasks.keys().cloned().collect();
            for deps in graph.dependencies.values_mut() {
                deps.retain(|d| members.contains(d));
            }
            graph.recompute_roots();

            let ids: Vec<&TaskId> = members.iter().collect();
            self.not_scheduled.remove_tasks(&ids);
            debug!(executor = %executor_name, tasks = ?ids, "scheduling batch");
            self.scheduled_batches.push_back(Batch {
                executor_name,
                task_graph: graph,
            });
        }
    }

    fn process_task_for_batches(
        &self,
        batches: &mut BTreeMap<String, TaskGraph>,
        id: &str,
        root_executor: &str,
        is_root: bool,
    ) {
        let Some(task) = self.not_scheduled.tasks.get(id) else {
            return;
        };
        if batches.get(root_executor).is_some_and(|b| b.tasks.contains_key(id)) {
            return;
        }
        if !self.can_batch_task_be_scheduled(id, batches.get(root_executor)) {
            return;
        }
        if self.executor_of.get(id).map(String::as_str) != Some(root_executor) {
            return;
        }
        if !self.batch_executors.contains(root_executor) {
            return;
        }

        let batch = batches.entry(root_executor.to_string()).or_default();
        batch.add_task(task.clone());
        batch
            .dependencies
            .insert(id.to_string(), self.not_scheduled.dependencies_of(id).to_vec());
        if is_root {
            batch.roots.push(id.to_string());
        }

        for dependent in self.reverse_task_deps.get(id).into_iter().flatten() {
            self.process_task_for_batches(batches, dependent, root_executor, false);
        }
    }

    /// Every dependency is complete or part of the same batch.
    fn can_batch_task_be_scheduled(&self, id: &str, batch: Option<&TaskGraph>) -> bool {
        self.task_graph.dependencies_of(id).iter().all(|d| {
            self.completed.contains(d) || batch.is_some_and(|b| b.tasks.contains_key(d))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorSection, TargetConfiguration, WorkspaceConfig};
    use crate::dag::graph::{Task, TaskTarget};
    use crate::graph::ProjectNode;
    use crate::types::DependencyType;
    use serde_json::Map;

    fn task(project: &str, target: &str) -> Task {
        Task {
            id: format!("{project}:{target}"),
            target: TaskTarget {
                project: project.into(),
                target: target.into(),
                configuration: None,
            },
            overrides: Map::new(),
            outputs: Vec::new(),
            project_root: format!("libs/{project}"),
            hash: None,
            hash_details: None,
            cache: false,
        }
    }

    /// Projects `names`, each with `build` (run by `executor`) and `test`.
    fn project_graph(names: &[&str], executor: &str, edges: &[(&str, &str)]) -> ProjectGraph {
        let mut graph = ProjectGraph::new();
        for name in names {
            let mut node = ProjectNode {
                name: name.to_string(),
                root: format!("libs/{name}"),
                ..Default::default()
            };
            for target in ["build", "test"] {
                node.targets.insert(
                    target.to_string(),
                    TargetConfiguration {
                        executor: Some(executor.to_string()),
                        ..Default::default()
                    },
                );
            }
            graph.add_node(node);
        }
        for (from, to) in edges {
            graph.add_dependency(*from, *to, DependencyType::Static);
        }
        graph
    }

    fn task_graph(ids: &[(&str, &str)], edges: &[(&str, &str)]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for (p, t) in ids {
            g.add_task(task(p, t));
        }
        for (from, to) in edges {
            g.add_dependency(from, to);
        }
        g.recompute_roots();
        g
    }

    fn drain(schedule: &mut TasksSchedule) -> Vec<TaskId> {
        let mut out = Vec::new();
        while let Some(t) = schedule.next_task() {
            out.push(t);
        }
        out
    }

    #[test]
    fn chain_is_released_one_step_at_a_time() {
        let pg = project_graph(&["a", "b", "c"], "x", &[("b", "a"), ("c", "b")]);
        let tg = task_graph(
            &[("a", "build"), ("b", "build"), ("c", "build")],
            &[("b:build", "a:build"), ("c:build", "b:build")],
        );
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), false);

        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["a:build"]);
        s.schedule_next_tasks();
        assert!(s.next_task().is_none());

        s.complete(&["a:build"]);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["b:build"]);

        s.complete(&["b:build"]);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["c:build"]);

        s.complete(&["c:build"]);
        assert!(!s.has_tasks());
    }

    #[test]
    fn tasks_with_more_dependents_go_first() {
        // b:test and c:test depend on a:build; d:build has no dependents.
        let pg = project_graph(&["a", "b", "c", "d"], "x", &[]);
        let tg = task_graph(
            &[("a", "build"), ("b", "test"), ("c", "test"), ("d", "build")],
            &[("b:test", "a:build"), ("c:test", "a:build")],
        );
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), false);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["a:build", "d:build"]);
    }

    #[test]
    fn ties_prefer_projects_with_more_dependents() {
        // lib is depended on by app (transitively by e2e); app by e2e.
        let pg = project_graph(&["app", "e2e", "lib"], "x", &[("app", "lib"), ("e2e", "app")]);
        let tg = task_graph(&[("app", "test"), ("e2e", "test"), ("lib", "test")], &[]);
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), false);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["lib:test", "app:test", "e2e:test"]);
    }

    #[test]
    fn batches_group_connected_tasks_of_one_executor() {
        let pg = project_graph(&["a", "b", "c"], "jest", &[]);
        let tg = task_graph(
            &[("a", "build"), ("b", "build"), ("c", "build")],
            &[("b:build", "a:build"), ("c:build", "b:build")],
        );
        let mut config = WorkspaceConfig::default();
        config
            .executors
            .insert("jest".to_string(), ExecutorSection { batch: true });
        let registry = ExecutorRegistry::from_config(&config);
        let mut s = TasksSchedule::new(&pg, &tg, &registry, true);

        s.schedule_next_tasks();
        let batch = s.next_batch().expect("batch");
        assert_eq!(batch.executor_name, "jest");
        assert_eq!(batch.task_graph.tasks.len(), 3);
        assert_eq!(batch.task_graph.roots, vec!["a:build"]);
        assert!(s.next_task().is_none());
        // In flight, nothing left to hand out.
        assert!(!s.has_tasks());

        s.complete(&["a:build", "b:build", "c:build"]);
        s.schedule_next_tasks();
        assert!(s.next_batch().is_none());
        assert!(!s.has_tasks());
    }

    #[test]
    fn has_tasks_counts_only_work_not_yet_handed_out() {
        let pg = project_graph(&["a", "b"], "x", &[]);
        let tg = task_graph(&[("a", "build"), ("b", "build")], &[("b:build", "a:build")]);
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), false);

        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["a:build"]);
        // `b` still waits for `a`.
        assert!(s.has_tasks());

        s.complete(&["a:build"]);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["b:build"]);
        assert!(!s.has_tasks());
        assert!(!s.is_completed("b:build"));
    }

    #[test]
    fn non_batch_executors_are_scheduled_individually_in_batch_mode() {
        let pg = project_graph(&["a", "b"], "x", &[]);
        let tg = task_graph(&[("a", "build"), ("b", "build")], &[("b:build", "a:build")]);
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), true);
        s.schedule_next_tasks();
        assert!(s.next_batch().is_none());
        assert_eq!(drain(&mut s), vec!["a:build"]);
    }

    #[test]
    fn cycles_are_released_together() {
        let pg = project_graph(&["a", "b", "c"], "x", &[]);
        let tg = task_graph(
            &[("a", "build"), ("b", "build"), ("c", "build")],
            &[("a:build", "b:build"), ("b:build", "a:build"), ("c:build", "a:build")],
        );
        let mut s = TasksSchedule::new(&pg, &tg, &ExecutorRegistry::new(), false);
        s.schedule_next_tasks();
        let mut first = drain(&mut s);
        first.sort();
        assert_eq!(first, vec!["a:build", "b:build"]);

        s.complete(&["a:build", "b:build"]);
        s.schedule_next_tasks();
        assert_eq!(drain(&mut s), vec!["c:build"]);
    }
}
