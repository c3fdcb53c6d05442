// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ProjectType;

/// File name of the workspace configuration, looked up at the workspace root.
pub const WORKSPACE_CONFIG_FILE: &str = "Monodag.toml";

/// Workspace configuration as read from `Monodag.toml`.
///
/// ```toml
/// [workspace]
/// plugins = ["project-json", { name = "package-json", exclude = ["tools/**"] }]
/// parallel = 3
///
/// [target_defaults.build]
/// dependsOn = ["^build"]
/// cache = true
///
/// [named_inputs]
/// production = ["default", "!{projectRoot}/**/*.spec.ts"]
///
/// [executors.run-commands]
/// batch = false
/// ```
///
/// Target defaults use the same (camelCase) keys as `project.json` targets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWorkspaceConfig {
    #[serde(default)]
    pub workspace: WorkspaceSection,

    #[serde(default)]
    pub target_defaults: BTreeMap<String, TargetConfiguration>,

    #[serde(default)]
    pub named_inputs: BTreeMap<String, Vec<InputDefinition>>,

    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorSection>,
}

/// Validated workspace configuration. Build with `TryFrom<RawWorkspaceConfig>`.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
    pub workspace: WorkspaceSection,
    pub target_defaults: BTreeMap<String, TargetConfiguration>,
    pub named_inputs: BTreeMap<String, Vec<InputDefinition>>,
    pub executors: BTreeMap<String, ExecutorSection>,
}

impl WorkspaceConfig {
    pub(crate) fn new_unchecked(raw: RawWorkspaceConfig) -> Self {
        Self {
            workspace: raw.workspace,
            target_defaults: raw.target_defaults,
            named_inputs: raw.named_inputs,
            executors: raw.executors,
        }
    }

    /// Whether batch mode is on, honouring `MONODAG_BATCH_MODE=true`.
    pub fn batch_mode(&self) -> bool {
        self.workspace.batch
            || std::env::var("MONODAG_BATCH_MODE")
                .map(|v| v == "true")
                .unwrap_or(false)
    }

    /// Whether a cache hit produced on another machine is rejected.
    pub fn reject_unknown_local_cache(&self) -> bool {
        match std::env::var("MONODAG_REJECT_UNKNOWN_LOCAL_CACHE") {
            Ok(v) => v != "0" && v != "false",
            Err(_) => self.workspace.reject_unknown_local_cache,
        }
    }
}

/// `[workspace]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSection {
    /// Plugins in precedence order. Built-ins are appended after these.
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,

    /// Maximum number of tasks executed at the same time.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    #[serde(default)]
    pub batch: bool,

    /// Keep circular task dependencies instead of failing.
    #[serde(default)]
    pub ignore_cycles: bool,

    #[serde(default = "default_true")]
    pub use_daemon_process: bool,

    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    #[serde(default = "default_true")]
    pub reject_unknown_local_cache: bool,

    /// A directory shared between machines that acts as the remote tier.
    #[serde(default)]
    pub remote_cache_directory: Option<PathBuf>,

    #[serde(default = "default_cache_max_age_days")]
    pub cache_max_age_days: u64,

    /// Files whose content is part of every task hash.
    #[serde(default = "default_global_inputs")]
    pub global_inputs: Vec<String>,
}

fn default_parallel() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".monodag/cache")
}

fn default_cache_max_age_days() -> u64 {
    7
}

fn default_global_inputs() -> Vec<String> {
    [
        WORKSPACE_CONFIG_FILE,
        "Cargo.lock",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for WorkspaceSection {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            parallel: default_parallel(),
            batch: false,
            ignore_cycles: false,
            use_daemon_process: true,
            cache_directory: default_cache_directory(),
            reject_unknown_local_cache: true,
            remote_cache_directory: None,
            cache_max_age_days: default_cache_max_age_days(),
            global_inputs: default_global_inputs(),
        }
    }
}

/// A plugin entry: either a bare name or a table with options and file filters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PluginSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        options: Option<Value>,
        #[serde(default)]
        include: Option<Vec<String>>,
        #[serde(default)]
        exclude: Option<Vec<String>>,
    },
}

impl PluginSpec {
    pub fn name(&self) -> &str {
        match self {
            PluginSpec::Name(name) => name,
            PluginSpec::Detailed { name, .. } => name,
        }
    }
}

/// `[executors.<name>]`: what the orchestrator needs to know about an executor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorSection {
    /// Executor can run several tasks in one invocation.
    #[serde(default)]
    pub batch: bool,
}

/// Partial project configuration produced by a plugin (or a `project.json`).
///
/// Every field is optional so that several partial configurations for the
/// same root can be merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub root: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<ProjectType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_dependencies: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<BTreeMap<String, TargetConfiguration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub named_inputs: Option<BTreeMap<String, Vec<InputDefinition>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generators: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// A single target, possibly partial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,

    /// Sugar for `executor = run-commands` with `options.command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurations: Option<BTreeMap<String, Map<String, Value>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_configuration: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<DependsOnEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<InputDefinition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,

    /// Set by the target-defaults plugin: only applies when some other source
    /// defines this target. Never serialized.
    #[serde(skip)]
    pub only_modifies_existing: bool,
}

/// One `dependsOn` entry as written by users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnEntry {
    /// `"^build"`, `"build"`, `"proj:build"` or `"target:with:colons"`.
    Shorthand(String),
    Full(TargetDependencyConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDependencyConfig {
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<DependsOnParams>,
}

/// Whether CLI overrides of the dependent task are forwarded to the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependsOnParams {
    Forward,
    #[default]
    Ignore,
}

/// One entry of a target's (or named input's) `inputs` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputDefinition {
    /// A fileset (`{projectRoot}/**/*.rs`, `!{projectRoot}/**/*.md`) or a
    /// named input reference (`default`, `^production`).
    Plain(String),
    Fileset {
        fileset: String,
    },
    Runtime {
        runtime: String,
    },
    Env {
        env: String,
    },
    #[serde(rename_all = "camelCase")]
    DependentTasksOutputFiles {
        dependent_tasks_output_files: String,
        #[serde(default)]
        transitive: bool,
    },
    /// `{ input: "production", dependencies: true }`, equivalent to `^production`.
    #[serde(rename_all = "camelCase")]
    NamedInput {
        input: String,
        #[serde(default)]
        dependencies: bool,
    },
}
