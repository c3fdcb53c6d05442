// src/errors.rs

//! Crate-wide error types.
//!
//! Each subsystem has its own enum so callers can match on the failure they
//! care about (e.g. a cache error is downgraded to a miss, a partial project
//! graph is still usable). [`MonodagError`] wraps all of them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::graph::ProjectGraph;

#[derive(Error, Debug)]
pub enum MonodagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    ProjectGraph(#[from] ProjectGraphError),

    #[error(transparent)]
    TaskGraph(#[from] TaskGraphError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised while turning plugin output into a project graph.
#[derive(Error, Debug)]
pub enum ProjectGraphError {
    #[error(
        "An error occurred while processing files for the {plugin} plugin.\n{}",
        format_file_errors(.errors)
    )]
    CreateNodes {
        plugin: String,
        /// `(file, message)`; `file` is `None` when the whole plugin failed.
        errors: Vec<(Option<String>, String)>,
    },

    #[error(
        "The {plugin} plugin produced a configuration for {file} \
         that could not be merged: {message}"
    )]
    MergeNodes {
        plugin: String,
        file: String,
        message: String,
    },

    #[error("The {plugin} plugin failed to create dependencies: {message}")]
    CreateDependencies { plugin: String, message: String },

    #[error("The {plugin} plugin failed to create metadata: {message}")]
    CreateMetadata { plugin: String, message: String },

    #[error(
        "The projects in the following directories have no name provided: {}",
        .roots.join(", ")
    )]
    ProjectWithNoName { roots: Vec<String> },

    #[error(
        "The following projects are defined in multiple locations:\n{}",
        format_conflicts(.conflicts)
    )]
    MultipleProjectsWithSameName {
        conflicts: BTreeMap<String, Vec<String>>,
    },

    #[error("{project} has an implicit dependency on {dependency} which does not exist")]
    InvalidImplicitDependency { project: String, dependency: String },

    #[error(
        "Dependency from {source_project} to {target} references a project that does not exist"
    )]
    InvalidDependency {
        source_project: String,
        target: String,
    },

    #[error(
        "Project at {root} should not have executor and command both configured \
         (target {target})"
    )]
    ExecutorAndCommand { root: String, target: String },

    #[error("The {{workspaceRoot}} token is only valid at the beginning of an option ({key})")]
    WorkspaceRootToken { key: String },

    /// Several recoverable problems; the graph built from everything that
    /// could be resolved is attached.
    #[error("Failed to process project graph.\n{}", format_aggregate(.errors))]
    Aggregate {
        errors: Vec<ProjectGraphError>,
        partial_graph: Box<ProjectGraph>,
    },
}

impl ProjectGraphError {
    /// The graph that could still be built, if this is an aggregate error.
    pub fn partial_graph(&self) -> Option<&ProjectGraph> {
        match self {
            ProjectGraphError::Aggregate { partial_graph, .. } => Some(partial_graph),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskGraphError {
    #[error("Cannot find project '{0}'")]
    UnknownProject(String),

    #[error("Cannot find configuration for task {project}:{target}")]
    UnknownTarget { project: String, target: String },

    #[error(
        "dependsOn is improperly configured for {project}:{target}: \
         dependsOn.projects and dependsOn.dependencies cannot be used together"
    )]
    ProjectsAndDependencies { project: String, target: String },

    #[error(
        "Could not execute command because the task graph has a circular dependency: {}",
        .0.join(" --> ")
    )]
    Cycle(Vec<String>),

    #[error("The following outputs are invalid: {}", .0.join(", "))]
    InvalidOutputs(Vec<String>),

    #[error("invalid interpolation pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(
        "Invalid cache directory for task \"{task}\"\n\
         The local cache artifact in \"{path}\" was not generated on this machine.\n\
         As a result, the cache's content integrity cannot be confirmed, \
         which may make cache restoration potentially unsafe.\n\
         If your machine ID has changed since the artifact was cached, \
         run \"monodag reset\" to fix this issue.\n\
         Set reject_unknown_local_cache = false or MONODAG_REJECT_UNKNOWN_LOCAL_CACHE=0 \
         to disable this check."
    )]
    UnknownLocalCache { task: String, path: PathBuf },

    #[error("cache IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote cache error: {0}")]
    Remote(String),

    #[error("task {0} has no hash")]
    MissingHash(String),

    #[error("invalid output pattern: {0}")]
    Pattern(String),

    #[error(transparent)]
    Fs(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(
        "The Daemon Server is not running. \
         The socket for the Daemon Server was not found at {0}"
    )]
    NotRunning(PathBuf),

    #[error(
        "A server instance had not been fully shut down. Please try running the command again."
    )]
    StaleSocket,

    #[error("Unable to connect to the daemon process.")]
    ConnectionReset,

    #[error(
        "Could not deserialize response from the daemon: {message}\n\
         Received: {received_tail}\n\
         Daemon log tail:\n{log_tail}"
    )]
    MalformedResponse {
        message: String,
        received_tail: String,
        log_tail: String,
    },

    #[error("Failed to start or connect to the daemon process. See {0} for details.")]
    FailedToStart(PathBuf),

    #[error("Daemon server error: {0}")]
    Server(String),

    /// The daemon could not build the project graph. Whatever could be
    /// built is attached.
    #[error("{message}")]
    ProjectGraph {
        message: String,
        partial_graph: Option<Box<ProjectGraph>>,
    },

    #[error("daemon IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_file_errors(errors: &[(Option<String>, String)]) -> String {
    errors
        .iter()
        .map(|(file, message)| match file {
            Some(file) => format!("  - {file}: {message}"),
            None => format!("  - {message}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_conflicts(conflicts: &BTreeMap<String, Vec<String>>) -> String {
    conflicts
        .iter()
        .map(|(name, roots)| format!("  - {name}: {}", roots.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_aggregate(errors: &[ProjectGraphError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, MonodagError>;
