// src/engine/runtime.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, CacheOptions};
use crate::config::WorkspaceConfig;
use crate::dag::{Batch, SharedScheduler, Task, TaskGraph, TasksSchedule};
use crate::errors::Result;
use crate::exec::{ExecutionRequest, ExecutionResult, ExecutorBackend, ExecutorRegistry};
use crate::fs::FileSystem;
use crate::graph::ProjectGraph;
use crate::hasher::{
    hash_task, hash_tasks_that_do_not_depend_on_outputs, HashStore, MemoryHashStore, TaskHasher,
};
use crate::types::TaskId;
use crate::workspace::FileMap;

use super::core::CoreRuntime;
use super::{RunOptions, RunSummary, RuntimeEvent, TaskResult, TaskStatus};

/// Everything a run reads besides the task graph.
pub struct RunContext {
    pub workspace_root: PathBuf,
    pub project_graph: Arc<ProjectGraph>,
    pub file_map: Arc<FileMap>,
    pub config: Arc<WorkspaceConfig>,
    pub fs: Arc<dyn FileSystem>,
    pub executors: Arc<ExecutorRegistry>,
    pub cache: Option<Arc<Cache>>,
    pub outputs_store: Arc<Mutex<Box<dyn HashStore>>>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("workspace_root", &self.workspace_root)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Context for a workspace: executors and cache from its config, output
    /// hashes kept for this run only.
    ///
    /// A cache that cannot be opened is logged and the run goes uncached.
    pub fn for_workspace(
        workspace_root: PathBuf,
        project_graph: Arc<ProjectGraph>,
        file_map: Arc<FileMap>,
        config: Arc<WorkspaceConfig>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let cache_options = CacheOptions::from_config(&workspace_root, &config);
        let cache = match Cache::new(&workspace_root, cache_options) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "unable to open the cache; running without it");
                None
            }
        };
        let store: Box<dyn HashStore> = Box::new(MemoryHashStore::new());
        Self {
            executors: Arc::new(ExecutorRegistry::from_config(&config)),
            outputs_store: Arc::new(Mutex::new(store)),
            workspace_root,
            project_graph,
            file_map,
            config,
            fs,
            cache,
        }
    }
}

/// Runs a task graph with up to `parallel` workers pulling from one
/// [`SharedScheduler`], delegating execution to an `ExecutorBackend`.
///
/// Results go through the pure [`CoreRuntime`]; this type only does IO.
pub struct Runtime<E: ExecutorBackend> {
    shared: Arc<Shared<E>>,
}

struct Shared<E> {
    ctx: RunContext,
    task_graph: Mutex<TaskGraph>,
    scheduler: SharedScheduler,
    core: Mutex<CoreRuntime>,
    executor: E,
    options: RunOptions,
    /// Signalled whenever tasks are completed, so idle workers re-check
    /// the scheduler.
    wakeup: Notify,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("ctx", &self.shared.ctx)
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: ExecutorBackend + 'static> Runtime<E> {
    pub fn new(ctx: RunContext, task_graph: TaskGraph, executor: E, options: RunOptions) -> Self {
        let schedule =
            TasksSchedule::new(&ctx.project_graph, &task_graph, &ctx.executors, options.batch);
        let core = CoreRuntime::new(&task_graph);
        Self {
            shared: Arc::new(Shared {
                ctx,
                task_graph: Mutex::new(task_graph),
                scheduler: SharedScheduler::new(schedule),
                core: Mutex::new(core),
                executor,
                options,
                wakeup: Notify::new(),
            }),
        }
    }

    /// Run every task in the graph and report how each one ended.
    ///
    /// Task failures are results, not errors; `Err` means the run itself
    /// could not proceed.
    pub async fn run(self) -> Result<RunSummary> {
        let shared = self.shared;
        let parallel = shared.options.parallel.max(1);
        info!(
            tasks = lock(&shared.task_graph).tasks.len(),
            parallel,
            skip_cache = shared.options.skip_cache,
            dry_run = shared.options.dry_run,
            "run started"
        );

        let eager = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || eager.hash_eagerly())
            .await
            .map_err(anyhow::Error::from)??;

        shared.scheduler.schedule_next_tasks().await;

        let mut workers = JoinSet::new();
        for worker in 0..parallel {
            let shared = Arc::clone(&shared);
            workers.spawn(async move { shared.work(worker).await });
        }
        while let Some(joined) = workers.join_next().await {
            joined.map_err(|e| anyhow!("engine worker failed: {e}"))?;
        }

        let summary = lock(&shared.core).summary();
        info!(
            tasks = summary.results.len(),
            failed = summary.count(TaskStatus::Failure),
            cached = summary.results.values().filter(|r| r.status.is_cache_hit()).count(),
            "run finished"
        );
        Ok(summary)
    }
}

impl<E: ExecutorBackend + 'static> Shared<E> {
    fn hasher(&self) -> TaskHasher<'_> {
        let ctx = &self.ctx;
        TaskHasher::new(
            &ctx.workspace_root,
            &ctx.project_graph,
            &ctx.file_map,
            &ctx.config,
            ctx.fs.as_ref(),
        )
    }

    fn hash_eagerly(&self) -> anyhow::Result<()> {
        let hasher = self.hasher();
        let mut graph = lock(&self.task_graph);
        hash_tasks_that_do_not_depend_on_outputs(&hasher, &self.ctx.executors, &mut graph)
    }

    async fn work(self: Arc<Self>, worker: usize) {
        debug!(worker, "engine worker started");
        loop {
            // Registered before looking at the scheduler so a completion
            // between the check and the wait still wakes us.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.scheduler.next_batch().await {
                self.run_batch(batch).await;
                continue;
            }
            if let Some(id) = self.scheduler.next_task().await {
                self.run_single(id).await;
                continue;
            }
            // Nothing left to hand out. Whatever is still in flight belongs
            // to other workers, and completing it cannot release new work.
            if !self.scheduler.has_tasks().await {
                break;
            }
            notified.await;
        }
        debug!(worker, "engine worker finished");
    }

    async fn settle(&self, event: RuntimeEvent) {
        let step = lock(&self.core).step(event);
        self.complete(&step.complete).await;
    }

    async fn complete(&self, ids: &[TaskId]) {
        if !ids.is_empty() {
            self.scheduler.complete(ids).await;
        }
        self.wakeup.notify_waiters();
    }

    fn is_settled(&self, id: &str) -> bool {
        lock(&self.core).is_settled(id)
    }

    async fn run_single(self: &Arc<Self>, id: TaskId) {
        if self.is_settled(&id) {
            self.complete(&[id]).await;
            return;
        }
        let result = match self.prepare(&id).await {
            Ok(task) => self.process(task).await,
            Err(e) => {
                error!(task = %id, error = %e, "unable to hash task");
                TaskResult::failure(&id, format!("{e:#}"))
            }
        };
        self.settle(RuntimeEvent::TaskCompleted(result)).await;
    }

    /// The task with its hash filled in, hashing it now if that was
    /// deferred until its dependencies ran.
    async fn prepare(self: &Arc<Self>, id: &str) -> anyhow::Result<Task> {
        let needs_hash = lock(&self.task_graph)
            .tasks
            .get(id)
            .map(|t| t.hash.is_none())
            .ok_or_else(|| anyhow!("task {id} is not in the task graph"))?;

        if needs_hash {
            let shared = Arc::clone(self);
            let task_id = id.to_string();
            tokio::task::spawn_blocking(move || {
                let hasher = shared.hasher();
                let mut graph = lock(&shared.task_graph);
                hash_task(&hasher, &shared.ctx.executors, &mut graph, &task_id).map(|_| ())
            })
            .await??;
        }

        lock(&self.task_graph)
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("task {id} is not in the task graph"))
    }

    async fn process(&self, task: Task) -> TaskResult {
        if let Some(hit) = self.from_cache(&task).await {
            return hit;
        }
        if self.options.dry_run {
            info!(task = %task.id, "dry run; not executing");
            return TaskResult::new(&task.id, TaskStatus::Skipped, 0, String::new());
        }

        let request =
            ExecutionRequest::from_task(&task, &self.ctx.project_graph, &self.ctx.workspace_root);
        match self.executor.run_task(request).await {
            Ok(result) => self.after_execution(&task, result).await,
            Err(e) => {
                error!(task = %task.id, error = %e, "task could not be executed");
                TaskResult::failure(&task.id, e.to_string())
            }
        }
    }

    /// Cache hit for the task, with its outputs restored. Lookup and restore
    /// failures are logged and treated as a miss.
    async fn from_cache(&self, task: &Task) -> Option<TaskResult> {
        if !task.cache || self.options.skip_cache {
            return None;
        }
        let cache = self.ctx.cache.clone()?;
        let hash = task.hash.clone()?;

        let lookup = {
            let cache = Arc::clone(&cache);
            let task = task.clone();
            tokio::task::spawn_blocking(move || cache.get(&task)).await
        };
        let cached = match lookup {
            Ok(Ok(Some(cached))) if cached.code == 0 => cached,
            Ok(Ok(_)) => return None,
            Ok(Err(e)) => {
                warn!(task = %task.id, error = %e, "cache lookup failed; treating as a miss");
                return None;
            }
            Err(e) => {
                warn!(task = %task.id, error = %e, "cache lookup did not complete");
                return None;
            }
        };

        let kept_existing = !cached.remote && self.outputs_hashes_match(&task.outputs, &hash);
        if !kept_existing {
            let restore = {
                let cache = Arc::clone(&cache);
                let outputs = task.outputs.clone();
                let cached = cached.clone();
                let hash = hash.clone();
                tokio::task::spawn_blocking(move || {
                    cache.copy_files_from_cache(&hash, &cached, &outputs)
                })
                .await
            };
            match restore {
                Ok(Ok(())) => self.record_outputs_hash(&task.outputs, &hash),
                Ok(Err(e)) => {
                    warn!(
                        task = %task.id,
                        error = %e,
                        "restoring cached outputs failed; running task"
                    );
                    return None;
                }
                Err(e) => {
                    warn!(task = %task.id, error = %e, "restoring cached outputs did not complete");
                    return None;
                }
            }
        }

        let status = if cached.remote {
            TaskStatus::RemoteCache
        } else if kept_existing {
            TaskStatus::LocalCacheKeptExisting
        } else {
            TaskStatus::LocalCache
        };
        info!(task = %task.id, hash = %hash, %status, "using cached result");
        Some(TaskResult::new(&task.id, status, cached.code, cached.terminal_output))
    }

    async fn after_execution(&self, task: &Task, result: ExecutionResult) -> TaskResult {
        if !result.success() {
            let output = result.terminal_output;
            return TaskResult::new(&task.id, TaskStatus::Failure, result.code, output);
        }

        let cache = self.ctx.cache.clone();
        if let (true, Some(cache), Some(hash)) = (task.cache, cache, task.hash.clone()) {
            let put = {
                let task = task.clone();
                let output = result.terminal_output.clone();
                tokio::task::spawn_blocking(move || {
                    cache.put(&task, Some(output.as_str()), &task.outputs, 0)
                })
                .await
            };
            match put {
                Ok(Ok(())) => self.record_outputs_hash(&task.outputs, &hash),
                Ok(Err(e)) => {
                    warn!(task = %task.id, error = %e, "unable to store task result in cache")
                }
                Err(e) => warn!(task = %task.id, error = %e, "cache store did not complete"),
            }
        }
        TaskResult::new(&task.id, TaskStatus::Success, result.code, result.terminal_output)
    }

    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> bool {
        match lock(&self.ctx.outputs_store).outputs_hashes_match(outputs, hash) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "unable to read outputs hashes");
                false
            }
        }
    }

    fn record_outputs_hash(&self, outputs: &[String], hash: &str) {
        if let Err(e) = lock(&self.ctx.outputs_store).record_outputs_hash(outputs, hash) {
            warn!(error = %e, "unable to record outputs hash");
        }
    }

    async fn run_batch(self: &Arc<Self>, batch: Batch) {
        let order = topological_order(&batch.task_graph);
        info!(executor = %batch.executor_name, tasks = order.len(), "running batch");

        let mut settled = Vec::new();
        let mut results = Vec::new();
        let mut blocked: HashSet<TaskId> = HashSet::new();
        let mut to_run = Vec::new();

        for id in order {
            if self.is_settled(&id) {
                settled.push(id);
                continue;
            }
            // Dependents of a member that already failed stay out; the core
            // skips them when that failure is recorded.
            if batch.task_graph.dependencies_of(&id).iter().any(|d| blocked.contains(d)) {
                blocked.insert(id);
                continue;
            }
            let task = match self.prepare(&id).await {
                Ok(task) => task,
                Err(e) => {
                    error!(task = %id, error = %e, "unable to hash task");
                    results.push(TaskResult::failure(&id, format!("{e:#}")));
                    blocked.insert(id);
                    continue;
                }
            };
            if let Some(hit) = self.from_cache(&task).await {
                results.push(hit);
            } else if self.options.dry_run {
                results.push(TaskResult::new(&task.id, TaskStatus::Skipped, 0, String::new()));
            } else {
                to_run.push(task);
            }
        }

        if !to_run.is_empty() {
            let (graph, root) = (&self.ctx.project_graph, &self.ctx.workspace_root);
            let requests = to_run
                .iter()
                .map(|t| ExecutionRequest::from_task(t, graph, root))
                .collect();
            match self.executor.run_batch(batch.executor_name.clone(), requests).await {
                Ok(mut outcomes) => {
                    for task in &to_run {
                        let result = match outcomes.remove(&task.id) {
                            Some(outcome) => self.after_execution(task, outcome).await,
                            None => TaskResult::failure(
                                &task.id,
                                "batch executor returned no result for this task",
                            ),
                        };
                        results.push(result);
                    }
                }
                Err(e) => {
                    error!(
                        executor = %batch.executor_name,
                        error = %e,
                        "batch could not be executed"
                    );
                    let message = e.to_string();
                    results.extend(to_run.iter().map(|t| TaskResult::failure(&t.id, &message)));
                }
            }
        }

        if !settled.is_empty() {
            self.complete(&settled).await;
        }
        self.settle(RuntimeEvent::BatchCompleted(results)).await;
    }
}

/// Tasks ordered so each comes after its dependencies. Members of a cycle
/// come last, in id order.
fn topological_order(graph: &TaskGraph) -> Vec<TaskId> {
    let mut remaining: BTreeMap<&TaskId, BTreeSet<&TaskId>> = graph
        .tasks
        .keys()
        .map(|id| {
            let deps = graph
                .dependencies_of(id)
                .iter()
                .filter(|d| graph.tasks.contains_key(*d))
                .collect();
            (id, deps)
        })
        .collect();

    let mut order = Vec::with_capacity(remaining.len());
    loop {
        let ready: Vec<&TaskId> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            remaining.remove(id);
            for deps in remaining.values_mut() {
                deps.remove(id);
            }
            order.push(id.clone());
        }
    }
    order.extend(remaining.into_keys().cloned());
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskTarget;
    use serde_json::Map;

    fn task(id: &str) -> Task {
        Task {
            id: id.into(),
            target: TaskTarget {
                project: id.into(),
                target: "build".into(),
                configuration: None,
            },
            overrides: Map::new(),
            outputs: vec![],
            project_root: id.into(),
            hash: None,
            hash_details: None,
            cache: false,
        }
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let mut graph = TaskGraph::new();
        for id in ["c", "b", "a", "x", "y"] {
            graph.add_task(task(id));
        }
        graph.add_dependency("c", "b");
        graph.add_dependency("b", "a");
        graph.add_dependency("x", "y");
        graph.add_dependency("y", "x");

        assert_eq!(topological_order(&graph), vec!["a", "b", "c", "x", "y"]);
    }
}
