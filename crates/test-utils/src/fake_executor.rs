use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use monodag::errors::Result;
use monodag::exec::{BoxFuture, ExecutionRequest, ExecutionResult, ExecutorBackend};
use monodag::types::TaskId;

#[derive(Debug, Default)]
struct State {
    executed: Mutex<Vec<TaskId>>,
    batches: Mutex<Vec<(String, Vec<TaskId>)>>,
    exit_codes: Mutex<HashMap<TaskId, i32>>,
    writes: Mutex<HashMap<TaskId, Vec<(String, String)>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A fake executor that:
/// - records which tasks were "run" (and which batches)
/// - answers with a scripted exit code (0 unless told otherwise)
/// - optionally writes files into the workspace, standing in for outputs
///
/// Clones share state, so a test keeps one clone to inspect after the run.
#[derive(Debug, Clone, Default)]
pub struct FakeExecutor {
    state: Arc<State>,
    delay: Option<Duration>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(self, task: &str, code: i32) -> Self {
        self.state.exit_codes.lock().unwrap().insert(task.to_string(), code);
        self
    }

    /// Each run of `task` writes `contents` to `path` (workspace-relative).
    pub fn writes_file(self, task: &str, path: &str, contents: &str) -> Self {
        self.state
            .writes
            .lock()
            .unwrap()
            .entry(task.to_string())
            .or_default()
            .push((path.to_string(), contents.to_string()));
        self
    }

    /// Keep every task "running" for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<TaskId> {
        self.state.executed.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<(String, Vec<TaskId>)> {
        self.state.batches.lock().unwrap().clone()
    }

    /// Most tasks ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let id = request.task.id.clone();
        let running = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let writes = self.state.writes.lock().unwrap().get(&id).cloned().unwrap_or_default();
        for (path, contents) in writes {
            let dest = request.workspace_root.join(path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(dest, contents).unwrap();
        }

        self.state.executed.lock().unwrap().push(id.clone());
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let code = self.state.exit_codes.lock().unwrap().get(&id).copied().unwrap_or(0);
        ExecutionResult {
            code,
            terminal_output: format!("ran {id}\n"),
        }
    }
}

impl ExecutorBackend for FakeExecutor {
    fn run_task(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<ExecutionResult>> {
        Box::pin(async move { Ok(self.execute(request).await) })
    }

    fn run_batch(
        &self,
        executor: String,
        requests: Vec<ExecutionRequest>,
    ) -> BoxFuture<'_, Result<BTreeMap<TaskId, ExecutionResult>>> {
        Box::pin(async move {
            let ids = requests.iter().map(|r| r.task.id.clone()).collect();
            self.state.batches.lock().unwrap().push((executor, ids));

            let mut results = BTreeMap::new();
            for request in requests {
                let id = request.task.id.clone();
                results.insert(id, self.execute(request).await);
            }
            Ok(results)
        })
    }
}
