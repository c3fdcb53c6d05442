// src/dag/mod.rs

//! Task graphs and scheduling.
//!
//! - [`graph`] holds the task DAG (`Task`, `TaskGraph`).
//! - [`expand`] turns requested targets plus `dependsOn` declarations into
//!   a task graph.
//! - [`outputs`] resolves a task's outputs and cacheability.
//! - [`scheduler`] decides which tasks (or batches) are ready to run.
//! - [`shared`] puts the scheduler behind an async lock.

pub mod expand;
pub mod graph;
pub mod outputs;
pub mod scheduler;
pub mod shared;

pub use expand::{create_task_graph, TaskGraphRequest};
pub use graph::{Task, TaskGraph, TaskTarget};
pub use scheduler::{Batch, TasksSchedule};
pub use shared::SharedScheduler;
