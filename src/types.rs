use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique project name within a workspace.
pub type ProjectName = String;

/// `project:target[:configuration]`.
pub type TaskId = String;

/// Executor that runs a shell command (`options.command` / `options.commands`).
pub const RUN_COMMANDS_EXECUTOR: &str = "run-commands";

/// Executor that runs a `package.json` script (`options.script`).
pub const RUN_SCRIPT_EXECUTOR: &str = "run-script";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    App,
    Lib,
    E2e,
}

impl Default for ProjectType {
    fn default() -> Self {
        ProjectType::Lib
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "app" | "application" => Ok(ProjectType::App),
            "lib" | "library" => Ok(ProjectType::Lib),
            "e2e" => Ok(ProjectType::E2e),
            other => Err(format!(
                "invalid project type: {other} (expected \"app\", \"lib\" or \"e2e\")"
            )),
        }
    }
}

/// How a project-graph edge was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Declared in a manifest (e.g. `package.json` dependencies).
    Static,
    /// Declared via `implicitDependencies`.
    Implicit,
    /// Found by analysing source (e.g. a lazy import).
    Dynamic,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyType::Static => "static",
            DependencyType::Implicit => "implicit",
            DependencyType::Dynamic => "dynamic",
        };
        f.write_str(s)
    }
}
