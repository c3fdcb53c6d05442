// src/graph/project_graph.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{InputDefinition, TargetConfiguration};
use crate::types::{DependencyType, ProjectName, ProjectType};

/// Graph of projects and the edges between them.
///
/// Invariants (enforced by the builder): every edge's endpoints exist in
/// `nodes` (or `external_nodes` for targets) and project names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraph {
    pub nodes: BTreeMap<ProjectName, ProjectNode>,
    pub dependencies: BTreeMap<ProjectName, Vec<ProjectGraphDependency>>,
    #[serde(default)]
    pub external_nodes: BTreeMap<String, ExternalNode>,
}

/// A fully merged, normalized project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNode {
    pub name: ProjectName,
    pub root: String,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfiguration>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub implicit_dependencies: Vec<String>,
    #[serde(default)]
    pub named_inputs: BTreeMap<String, Vec<InputDefinition>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A dependency outside the workspace (e.g. `npm:react`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectGraphDependency {
    pub source: ProjectName,
    pub target: String,
    #[serde(rename = "type")]
    pub dependency_type: DependencyType,
}

impl ProjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: ProjectNode) {
        self.dependencies.entry(node.name.clone()).or_default();
        self.nodes.insert(node.name.clone(), node);
    }

    /// Add an edge; duplicates (same source, target and type) are ignored.
    pub fn add_dependency(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        dependency_type: DependencyType,
    ) {
        let dep = ProjectGraphDependency {
            source: source.into(),
            target: target.into(),
            dependency_type,
        };
        let edges = self.dependencies.entry(dep.source.clone()).or_default();
        if !edges.contains(&dep) {
            edges.push(dep);
        }
    }

    /// Remove all edges from `source` to `target`.
    pub fn remove_dependency(&mut self, source: &str, target: &str) {
        if let Some(edges) = self.dependencies.get_mut(source) {
            edges.retain(|d| d.target != target);
        }
    }

    pub fn node(&self, name: &str) -> Option<&ProjectNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Names of workspace projects `name` directly depends on (external nodes
    /// are skipped), in edge order without duplicates.
    pub fn project_dependencies_of(&self, name: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for dep in self.dependencies.get(name).into_iter().flatten() {
            if self.nodes.contains_key(&dep.target) && !out.contains(&dep.target.as_str()) {
                out.push(dep.target.as_str());
            }
        }
        out
    }

    /// Lookup table from project root to project name.
    pub fn root_map(&self) -> BTreeMap<String, ProjectName> {
        self.nodes
            .values()
            .map(|n| (n.root.clone(), n.name.clone()))
            .collect()
    }
}
