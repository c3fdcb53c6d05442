// src/plugins/mod.rs

//! Graph plugins.
//!
//! A plugin contributes to the project graph through up to three
//! capabilities:
//! - `create_nodes`: turn files matching a glob into partial project
//!   configurations (and external nodes).
//! - `create_dependencies`: report edges between projects.
//! - `create_metadata`: attach metadata to built project nodes.
//!
//! Plugins are resolved by name through a [`PluginLoader`] and kept, in
//! precedence order, in a [`PluginRegistry`].

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use serde_json::{Map, Value};

use crate::config::{ProjectConfiguration, WorkspaceConfig};
use crate::fs::FileSystem;
use crate::graph::{ExternalNode, ProjectGraph};
use crate::types::DependencyType;
use crate::workspace::FileMap;

pub mod package_json;
pub mod project_json;
pub mod registry;
pub mod target_defaults;

pub use registry::{InProcessLoader, LoadedPlugin, PluginLoader, PluginRegistry};

/// What a plugin implements. The registry only calls declared capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginCapabilities {
    pub create_nodes: bool,
    pub create_dependencies: bool,
    pub create_metadata: bool,
}

pub struct CreateNodesContext<'a> {
    pub workspace_root: &'a Path,
    pub config: &'a WorkspaceConfig,
    pub fs: &'a dyn FileSystem,
    /// `options` from the plugin's entry in `Monodag.toml`.
    pub options: Option<&'a Value>,
}

/// Projects produced from one config file, keyed by project root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateNodesResult {
    pub projects: BTreeMap<String, ProjectConfiguration>,
    pub external_nodes: BTreeMap<String, ExternalNode>,
    /// Report this file instead of the matched one in source maps.
    pub override_source_file: Option<String>,
}

/// Per-file failures of `create_nodes`, with whatever succeeded.
#[derive(Debug, Clone, Default)]
pub struct AggregateCreateNodesError {
    /// `(file, message)`; `file` is `None` when the plugin failed as a whole.
    pub errors: Vec<(Option<String>, String)>,
    pub partial_results: Vec<(String, CreateNodesResult)>,
}

pub type CreateNodesOutput = Result<Vec<(String, CreateNodesResult)>, AggregateCreateNodesError>;

pub struct CreateDependenciesContext<'a> {
    pub workspace_root: &'a Path,
    pub config: &'a WorkspaceConfig,
    pub fs: &'a dyn FileSystem,
    /// Merged project configurations by project name.
    pub projects: &'a BTreeMap<String, ProjectConfiguration>,
    pub external_nodes: &'a BTreeMap<String, ExternalNode>,
    pub file_map: &'a FileMap,
    pub options: Option<&'a Value>,
}

/// An edge reported by a plugin, validated by the graph builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProjectGraphDependency {
    pub source: String,
    pub target: String,
    pub dependency_type: DependencyType,
    pub source_file: Option<String>,
}

pub struct CreateMetadataContext<'a> {
    pub workspace_root: &'a Path,
    pub config: &'a WorkspaceConfig,
    pub options: Option<&'a Value>,
}

/// Project name → metadata to merge into that project.
pub type ProjectsMetadata = BTreeMap<String, Map<String, Value>>;

pub trait GraphPlugin: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> PluginCapabilities;

    /// Glob (relative to the workspace root) selecting the files handed to
    /// [`GraphPlugin::create_nodes`].
    fn create_nodes_pattern(&self) -> &str {
        ""
    }

    fn create_nodes(&self, _files: &[String], _ctx: &CreateNodesContext<'_>) -> CreateNodesOutput {
        Ok(Vec::new())
    }

    fn create_dependencies(
        &self,
        _ctx: &CreateDependenciesContext<'_>,
    ) -> anyhow::Result<Vec<RawProjectGraphDependency>> {
        Ok(Vec::new())
    }

    fn create_metadata(
        &self,
        _graph: &ProjectGraph,
        _ctx: &CreateMetadataContext<'_>,
    ) -> anyhow::Result<ProjectsMetadata> {
        Ok(ProjectsMetadata::new())
    }
}

/// Run a per-file closure over `files`, collecting failures into an
/// [`AggregateCreateNodesError`] instead of stopping at the first one.
pub fn create_nodes_from_files<F>(files: &[String], mut f: F) -> CreateNodesOutput
where
    F: FnMut(&str) -> anyhow::Result<Option<CreateNodesResult>>,
{
    let mut results = Vec::new();
    let mut errors = Vec::new();

    for file in files {
        match f(file) {
            Ok(Some(result)) => results.push((file.clone(), result)),
            Ok(None) => {}
            Err(e) => errors.push((Some(file.clone()), format!("{e:#}"))),
        }
    }

    if errors.is_empty() {
        Ok(results)
    } else {
        Err(AggregateCreateNodesError {
            errors,
            partial_results: results,
        })
    }
}

/// Directory part of a workspace-relative file path (`"."` for the root).
pub fn project_root_of(file: &str) -> String {
    match file.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ".".to_string(),
    }
}
