// src/dag/shared.rs

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::dag::scheduler::{Batch, TasksSchedule};
use crate::types::TaskId;

/// A [`TasksSchedule`] shared between the engine's workers.
///
/// Every call takes the one lock, so `schedule_next_tasks` and `complete`
/// never interleave.
#[derive(Debug, Clone)]
pub struct SharedScheduler {
    inner: Arc<Mutex<TasksSchedule>>,
}

impl SharedScheduler {
    pub fn new(schedule: TasksSchedule) -> Self {
        Self {
            inner: Arc::new(Mutex::new(schedule)),
        }
    }

    pub async fn schedule_next_tasks(&self) {
        self.inner.lock().await.schedule_next_tasks();
    }

    pub async fn complete(&self, ids: &[TaskId]) {
        let mut schedule = self.inner.lock().await;
        schedule.complete(ids);
        schedule.schedule_next_tasks();
    }

    pub async fn next_task(&self) -> Option<TaskId> {
        self.inner.lock().await.next_task()
    }

    pub async fn next_batch(&self) -> Option<Batch> {
        self.inner.lock().await.next_batch()
    }

    pub async fn has_tasks(&self) -> bool {
        self.inner.lock().await.has_tasks()
    }
}
