// src/graph/builder.rs

//! Building the project graph from plugin output.
//!
//! 1. Every plugin's `create_nodes` runs over the workspace files it matches,
//!    in registry order; results are folded into one root map.
//! 2. The root map is validated (names) and normalized (targets).
//! 3. Edges come from plugin `create_dependencies` and from
//!    `implicitDependencies`.
//! 4. Plugin `create_metadata` results are merged into the nodes.
//!
//! Recoverable problems are collected; if there are any the caller gets a
//! [`ProjectGraphError::Aggregate`] carrying the graph that could be built.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::{ProjectConfiguration, WorkspaceConfig};
use crate::errors::ProjectGraphError;
use crate::fs::FileSystem;
use crate::graph::merge::{
    merge_metadata, merge_project_configuration_into_root_map, ConfigurationSourceMaps,
    ProjectRootMap, SourceInformation,
};
use crate::graph::normalize::validate_and_normalize_root_map;
use crate::graph::{ExternalNode, ProjectGraph};
use crate::hasher::file_hash::hash_str;
use crate::plugins::{
    CreateDependenciesContext, CreateMetadataContext, CreateNodesContext, CreateNodesResult,
    PluginRegistry,
};
use crate::types::DependencyType;
use crate::workspace::{create_file_map, FileMap, WorkspaceFileHashes};

/// Merged plugin output before validation.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationResult {
    pub projects: ProjectRootMap,
    pub external_nodes: BTreeMap<String, ExternalNode>,
    pub source_maps: ConfigurationSourceMaps,
}

/// Everything the graph builder produces.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraphBuild {
    pub graph: ProjectGraph,
    pub source_maps: ConfigurationSourceMaps,
    pub file_map: FileMap,
    /// Hash of the merged project configurations.
    pub configuration_hash: String,
}

pub struct GraphBuildContext<'a> {
    pub workspace_root: &'a Path,
    pub config: &'a WorkspaceConfig,
    pub fs: &'a dyn FileSystem,
    pub registry: &'a PluginRegistry,
}

/// Run every plugin's `create_nodes` and merge the results per project root.
pub fn create_project_configurations(
    ctx: &GraphBuildContext<'_>,
    files: &[String],
) -> (ConfigurationResult, Vec<ProjectGraphError>) {
    let mut result = ConfigurationResult::default();
    let mut errors = Vec::new();

    for loaded in ctx.registry.plugins() {
        if !loaded.plugin.capabilities().create_nodes {
            continue;
        }
        let plugin_name = loaded.name().to_string();

        let matching = match loaded.matching_files(files) {
            Ok(m) => m,
            Err(e) => {
                errors.push(ProjectGraphError::CreateNodes {
                    plugin: plugin_name,
                    errors: vec![(None, format!("{e:#}"))],
                });
                continue;
            }
        };
        if matching.is_empty() {
            continue;
        }
        debug!(plugin = %plugin_name, files = matching.len(), "running create_nodes");

        let nodes_ctx = CreateNodesContext {
            workspace_root: ctx.workspace_root,
            config: ctx.config,
            fs: ctx.fs,
            options: loaded.options.as_ref(),
        };
        let outputs = match loaded.plugin.create_nodes(&matching, &nodes_ctx) {
            Ok(outputs) => outputs,
            Err(aggregate) => {
                errors.push(ProjectGraphError::CreateNodes {
                    plugin: plugin_name.clone(),
                    errors: aggregate.errors,
                });
                aggregate.partial_results
            }
        };

        for (file, output) in outputs {
            merge_create_nodes_result(&mut result, &plugin_name, &file, output, &mut errors);
        }
    }

    (result, errors)
}

fn merge_create_nodes_result(
    result: &mut ConfigurationResult,
    plugin: &str,
    file: &str,
    output: CreateNodesResult,
    errors: &mut Vec<ProjectGraphError>,
) {
    let source_file = output.override_source_file.as_deref().unwrap_or(file);
    let source = SourceInformation::new(source_file, plugin);

    for (root, mut project) in output.projects {
        project.root = root;
        if let Err(e) = merge_project_configuration_into_root_map(
            &mut result.projects,
            project,
            Some(&mut result.source_maps),
            &source,
        ) {
            errors.push(ProjectGraphError::MergeNodes {
                plugin: plugin.to_string(),
                file: file.to_string(),
                message: e.to_string(),
            });
        }
    }
    result.external_nodes.extend(output.external_nodes);
}

/// Build the full project graph and file map.
pub fn build_project_graph(
    ctx: &GraphBuildContext<'_>,
    files: &WorkspaceFileHashes,
) -> Result<ProjectGraphBuild, ProjectGraphError> {
    let file_list: Vec<String> = files.keys().cloned().collect();
    let (configurations, errors) = create_project_configurations(ctx, &file_list);
    build_graph_from_configurations(ctx, configurations, errors, |root_map| {
        create_file_map(root_map, files)
    })
}

/// Finish a build from already merged configurations.
///
/// `file_map` receives the project root map (root → name) and returns the
/// file map to use, so a caller holding a previous map can patch it instead
/// of rebuilding.
pub fn build_graph_from_configurations<F>(
    ctx: &GraphBuildContext<'_>,
    configurations: ConfigurationResult,
    mut errors: Vec<ProjectGraphError>,
    file_map: F,
) -> Result<ProjectGraphBuild, ProjectGraphError>
where
    F: FnOnce(&BTreeMap<String, String>) -> FileMap,
{
    let (nodes, normalize_errors) =
        validate_and_normalize_root_map(&configurations.projects, ctx.workspace_root, ctx.fs);
    errors.extend(normalize_errors);

    let mut graph = ProjectGraph::new();
    graph.external_nodes = configurations.external_nodes.clone();
    for node in nodes.into_values() {
        graph.add_node(node);
    }

    let file_map = file_map(&graph.root_map());

    apply_plugin_dependencies(ctx, &configurations, &file_map, &mut graph, &mut errors);
    apply_implicit_dependencies(&mut graph, &mut errors);
    apply_plugin_metadata(ctx, &mut graph, &mut errors);

    info!(
        projects = graph.nodes.len(),
        external = graph.external_nodes.len(),
        errors = errors.len(),
        "project graph built"
    );

    if !errors.is_empty() {
        return Err(ProjectGraphError::Aggregate {
            errors,
            partial_graph: Box::new(graph),
        });
    }

    Ok(ProjectGraphBuild {
        graph,
        source_maps: configurations.source_maps,
        file_map,
        configuration_hash: hash_project_configurations(&configurations.projects),
    })
}

/// Hash of the merged configurations; changes only when a project is added,
/// removed or reconfigured.
pub fn hash_project_configurations(projects: &ProjectRootMap) -> String {
    // BTreeMap serialization is ordered, so this is stable.
    let serialized = serde_json::to_string(projects).unwrap_or_default();
    hash_str(&serialized)
}

fn apply_plugin_dependencies(
    ctx: &GraphBuildContext<'_>,
    configurations: &ConfigurationResult,
    file_map: &FileMap,
    graph: &mut ProjectGraph,
    errors: &mut Vec<ProjectGraphError>,
) {
    let projects_by_name: BTreeMap<String, ProjectConfiguration> = graph
        .nodes
        .values()
        .filter_map(|node| {
            configurations
                .projects
                .get(&node.root)
                .map(|cfg| (node.name.clone(), cfg.clone()))
        })
        .collect();

    for loaded in ctx.registry.plugins() {
        if !loaded.plugin.capabilities().create_dependencies {
            continue;
        }
        let deps_ctx = CreateDependenciesContext {
            workspace_root: ctx.workspace_root,
            config: ctx.config,
            fs: ctx.fs,
            projects: &projects_by_name,
            external_nodes: &graph.external_nodes,
            file_map,
            options: loaded.options.as_ref(),
        };
        let deps = match loaded.plugin.create_dependencies(&deps_ctx) {
            Ok(deps) => deps,
            Err(e) => {
                errors.push(ProjectGraphError::CreateDependencies {
                    plugin: loaded.name().to_string(),
                    message: format!("{e:#}"),
                });
                continue;
            }
        };

        for dep in deps {
            let target_exists = graph.nodes.contains_key(&dep.target)
                || graph.external_nodes.contains_key(&dep.target);
            if !graph.nodes.contains_key(&dep.source) || !target_exists {
                errors.push(ProjectGraphError::InvalidDependency {
                    source_project: dep.source,
                    target: dep.target,
                });
                continue;
            }
            graph.add_dependency(dep.source, dep.target, dep.dependency_type);
        }
    }
}

/// `implicitDependencies`: `name` adds an edge, `!name` removes any edge.
fn apply_implicit_dependencies(graph: &mut ProjectGraph, errors: &mut Vec<ProjectGraphError>) {
    let implicit: Vec<(String, String)> = graph
        .nodes
        .values()
        .flat_map(|node| {
            node.implicit_dependencies
                .iter()
                .map(|dep| (node.name.clone(), dep.clone()))
        })
        .collect();

    for (project, dep) in implicit {
        let (removal, name) = match dep.strip_prefix('!') {
            Some(name) => (true, name.to_string()),
            None => (false, dep.clone()),
        };
        if !graph.contains(&name) {
            errors.push(ProjectGraphError::InvalidImplicitDependency {
                project,
                dependency: dep,
            });
            continue;
        }
        if removal {
            graph.remove_dependency(&project, &name);
        } else {
            graph.add_dependency(project, name, DependencyType::Implicit);
        }
    }
}

fn apply_plugin_metadata(
    ctx: &GraphBuildContext<'_>,
    graph: &mut ProjectGraph,
    errors: &mut Vec<ProjectGraphError>,
) {
    for loaded in ctx.registry.plugins() {
        if !loaded.plugin.capabilities().create_metadata {
            continue;
        }
        let meta_ctx = CreateMetadataContext {
            workspace_root: ctx.workspace_root,
            config: ctx.config,
            options: loaded.options.as_ref(),
        };
        match loaded.plugin.create_metadata(graph, &meta_ctx) {
            Ok(metadata) => {
                for (project, meta) in metadata {
                    match graph.nodes.get_mut(&project) {
                        Some(node) => node.metadata = merge_metadata(&meta, &node.metadata),
                        None => warn!(
                            plugin = %loaded.name(),
                            project = %project,
                            "metadata for unknown project"
                        ),
                    }
                }
            }
            Err(e) => errors.push(ProjectGraphError::CreateMetadata {
                plugin: loaded.name().to_string(),
                message: format!("{e:#}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::plugins::InProcessLoader;

    fn files(fs: &MockFileSystem, entries: &[(&str, &str)]) -> WorkspaceFileHashes {
        let mut out = WorkspaceFileHashes::new();
        for (path, content) in entries {
            fs.add_file(format!("/ws/{path}"), *content);
            out.insert(path.to_string(), hash_str(content));
        }
        out
    }

    fn build(
        fs: &MockFileSystem,
        config: &WorkspaceConfig,
        files: &WorkspaceFileHashes,
    ) -> Result<ProjectGraphBuild, ProjectGraphError> {
        let registry =
            PluginRegistry::load(config, Path::new("/ws"), &InProcessLoader::new()).unwrap();
        let ctx = GraphBuildContext {
            workspace_root: Path::new("/ws"),
            config,
            fs,
            registry: &registry,
        };
        build_project_graph(&ctx, files)
    }

    #[test]
    fn builds_nodes_edges_and_file_map() {
        let fs = MockFileSystem::new();
        let files = files(
            &fs,
            &[
                (
                    "libs/a/project.json",
                    r#"{"name": "a", "targets": {"build": {"command": "make"}}}"#,
                ),
                ("libs/a/src/lib.rs", "fn a() {}"),
                ("libs/b/package.json", r#"{"name": "b", "scripts": {"build": "tsc"}}"#),
                ("libs/c/project.json", r#"{"name": "c", "implicitDependencies": ["a"]}"#),
                (
                    "libs/d/package.json",
                    r#"{
                        "name": "d",
                        "dependencies": {"b": "*"},
                        "monodag": {"implicitDependencies": ["!b"]}
                    }"#,
                ),
                ("libs/e/package.json", r#"{"name": "e", "dependencies": {"b": "*"}}"#),
            ],
        );
        let built = build(&fs, &WorkspaceConfig::default(), &files).unwrap();
        let graph = &built.graph;

        assert_eq!(graph.nodes.len(), 5);
        assert_eq!(graph.nodes["a"].targets["build"].executor.as_deref(), Some("run-commands"));
        assert_eq!(graph.project_dependencies_of("c"), vec!["a"]);
        assert!(graph.project_dependencies_of("d").is_empty());
        assert_eq!(graph.project_dependencies_of("e"), vec!["b"]);
        assert_eq!(built.file_map.files_for_project("a").len(), 2);
        // Local packages win over the external node of the same name.
        assert!(graph.external_nodes.contains_key("npm:b"));
        assert!(graph.dependencies["e"].iter().all(|d| d.target != "npm:b"));
    }

    #[test]
    fn errors_are_aggregated_with_a_partial_graph() {
        let fs = MockFileSystem::new();
        let files = files(
            &fs,
            &[
                ("libs/a/project.json", r#"{"name": "a", "implicitDependencies": ["missing"]}"#),
                ("libs/b/project.json", "{ broken"),
                ("libs/c/project.json", r#"{"name": "a"}"#),
                ("libs/d/project.json", r#"{}"#),
            ],
        );
        let err = build(&fs, &WorkspaceConfig::default(), &files).unwrap_err();
        let partial = err.partial_graph().expect("partial graph");
        assert!(partial.contains("a"));

        let ProjectGraphError::Aggregate { errors, .. } = err else {
            panic!("expected aggregate error");
        };
        let kinds: Vec<&str> = errors
            .iter()
            .map(|e| match e {
                ProjectGraphError::CreateNodes { .. } => "create-nodes",
                ProjectGraphError::MultipleProjectsWithSameName { .. } => "same-name",
                ProjectGraphError::ProjectWithNoName { .. } => "no-name",
                ProjectGraphError::InvalidImplicitDependency { .. } => "implicit",
                _ => "other",
            })
            .collect();
        for kind in ["create-nodes", "same-name", "no-name", "implicit"] {
            assert!(kinds.contains(&kind), "missing {kind} in {kinds:?}");
        }
    }

    #[test]
    fn target_defaults_apply_only_to_defined_targets() {
        let fs = MockFileSystem::new();
        let files = files(
            &fs,
            &[
                (
                    "libs/a/project.json",
                    r#"{"name": "a", "targets": {"build": {"command": "make"}}}"#,
                ),
                ("libs/b/project.json", r#"{"name": "b", "targets": {"test": {"command": "t"}}}"#),
            ],
        );
        let raw: crate::config::RawWorkspaceConfig = toml::from_str(
            "[target_defaults.build]\ncache = true\ndependsOn = [\"^build\"]\n",
        )
        .unwrap();
        let config = WorkspaceConfig::try_from(raw).unwrap();
        let built = build(&fs, &config, &files).unwrap();

        let a_build = &built.graph.nodes["a"].targets["build"];
        assert_eq!(a_build.cache, Some(true));
        assert_eq!(a_build.options.as_ref().unwrap()["command"], "make");
        assert!(!built.graph.nodes["b"].targets.contains_key("build"));
        assert_eq!(
            built.source_maps["libs/a"]["targets.build"],
            SourceInformation::new("libs/a/project.json", "project-json")
        );
    }
}
