// src/exec/mod.rs

//! Executor collaborators.
//!
//! The engine decides what runs and when; how a task's process runs is
//! behind [`ExecutorBackend`].
//!
//! - [`registry`] holds what the scheduler and hasher need to know about
//!   executors (batch capability, custom hashers).
//! - [`backend`] defines the backend trait and the request/result types.
//! - [`task_runner`] is the shell backend for `run-commands` and
//!   `run-script` targets.

pub mod backend;
pub mod registry;
pub mod task_runner;

pub use backend::{BoxFuture, ExecutionRequest, ExecutionResult, ExecutorBackend};
pub use registry::{executor_name_for_task, CustomHasher, ExecutorInfo, ExecutorRegistry};
pub use task_runner::ShellExecutor;
