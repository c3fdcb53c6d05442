// src/plugins/package_json.rs

//! Projects inferred from `package.json` files.
//!
//! Every script becomes a `run-script` target. An optional `"monodag"` block
//! can add targets, tags and implicit dependencies. Dependencies on other
//! workspace packages become static edges; anything else becomes an
//! external `npm:` node.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{InputDefinition, ProjectConfiguration, TargetConfiguration};
use crate::graph::ExternalNode;
use crate::plugins::{
    create_nodes_from_files, project_root_of, CreateDependenciesContext, CreateNodesContext,
    CreateNodesOutput, CreateNodesResult, GraphPlugin, PluginCapabilities,
    RawProjectGraphDependency,
};
use crate::types::{DependencyType, RUN_SCRIPT_EXECUTOR};

#[derive(Debug, Clone, Copy, Default)]
pub struct PackageJsonPlugin;

impl PackageJsonPlugin {
    pub const NAME: &'static str = "package-json";
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub monodag: Option<PackageJsonProjectBlock>,
}

/// The `"monodag"` block inside a `package.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJsonProjectBlock {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub implicit_dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub targets: Option<BTreeMap<String, TargetConfiguration>>,
    #[serde(default)]
    pub named_inputs: Option<BTreeMap<String, Vec<InputDefinition>>>,
    /// Only these scripts become targets when set.
    #[serde(default)]
    pub included_scripts: Option<Vec<String>>,
}

/// `run-script` targets for a package's scripts.
pub fn read_targets_from_package_json(
    package: &PackageJson,
) -> BTreeMap<String, TargetConfiguration> {
    let included = package
        .monodag
        .as_ref()
        .and_then(|b| b.included_scripts.as_ref());

    package
        .scripts
        .keys()
        .filter(|script| included.map(|inc| inc.contains(script)).unwrap_or(true))
        .map(|script| {
            let mut options = Map::new();
            options.insert("script".to_string(), Value::String(script.clone()));
            let target = TargetConfiguration {
                executor: Some(RUN_SCRIPT_EXECUTOR.to_string()),
                options: Some(options),
                ..Default::default()
            };
            (script.clone(), target)
        })
        .collect()
}

fn to_project_configuration(root: &str, package: PackageJson) -> ProjectConfiguration {
    let mut targets = read_targets_from_package_json(&package);
    let block = package.monodag.unwrap_or_default();
    for (name, target) in block.targets.unwrap_or_default() {
        targets.insert(name, target);
    }

    ProjectConfiguration {
        name: block.name.or(package.name),
        root: root.to_string(),
        tags: block.tags,
        implicit_dependencies: block.implicit_dependencies,
        targets: Some(targets),
        named_inputs: block.named_inputs,
        ..Default::default()
    }
}

impl GraphPlugin for PackageJsonPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            create_nodes: true,
            create_dependencies: true,
            create_metadata: false,
        }
    }

    fn create_nodes_pattern(&self) -> &str {
        "**/package.json"
    }

    fn create_nodes(&self, files: &[String], ctx: &CreateNodesContext<'_>) -> CreateNodesOutput {
        create_nodes_from_files(files, |file| {
            let contents = ctx.fs.read_to_string(&ctx.workspace_root.join(file))?;
            let package: PackageJson =
                serde_json::from_str(&contents).with_context(|| format!("parsing {file}"))?;
            let root = project_root_of(file);

            // The workspace manifest is only a project when it opts in.
            if root == "." && package.monodag.is_none() {
                return Ok(None);
            }

            let mut result = CreateNodesResult::default();
            let all_dependencies = package.dependencies.iter().chain(&package.dev_dependencies);
            for (dep, version) in all_dependencies {
                let name = format!("npm:{dep}");
                result.external_nodes.insert(
                    name.clone(),
                    ExternalNode {
                        name,
                        node_type: "npm".to_string(),
                        version: Some(version.clone()),
                    },
                );
            }
            result
                .projects
                .insert(root.clone(), to_project_configuration(&root, package));
            Ok(Some(result))
        })
    }

    fn create_dependencies(
        &self,
        ctx: &CreateDependenciesContext<'_>,
    ) -> anyhow::Result<Vec<RawProjectGraphDependency>> {
        // Package names may differ from project names; map them back.
        let mut package_to_project = BTreeMap::new();
        let mut manifests = Vec::new();
        for (project_name, project) in ctx.projects.iter() {
            let file = if project.root == "." {
                "package.json".to_string()
            } else {
                format!("{}/package.json", project.root)
            };
            let path = ctx.workspace_root.join(&file);
            if !ctx.fs.is_file(&path) {
                continue;
            }
            let package: PackageJson = serde_json::from_str(&ctx.fs.read_to_string(&path)?)
                .with_context(|| format!("parsing {file}"))?;
            if let Some(name) = &package.name {
                package_to_project.insert(name.clone(), project_name.clone());
            }
            manifests.push((project_name.clone(), file, package));
        }

        let mut deps = Vec::new();
        for (source, file, package) in manifests {
            let all = package
                .dependencies
                .keys()
                .chain(package.dev_dependencies.keys())
                .chain(package.peer_dependencies.keys());
            for dep in all {
                let target = match package_to_project.get(dep) {
                    Some(project) => project.clone(),
                    None if ctx.external_nodes.contains_key(&format!("npm:{dep}")) => {
                        format!("npm:{dep}")
                    }
                    None => continue,
                };
                if target == source {
                    continue;
                }
                deps.push(RawProjectGraphDependency {
                    source: source.clone(),
                    target,
                    dependency_type: DependencyType::Static,
                    source_file: Some(file.clone()),
                });
            }
        }
        Ok(deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::fs::mock::MockFileSystem;
    use crate::workspace::FileMap;
    use std::path::Path;

    #[test]
    fn scripts_become_run_script_targets() {
        let package: PackageJson = serde_json::from_str(
            r#"{"name": "a", "scripts": {"build": "tsc", "test": "jest"},
                "monodag": {"includedScripts": ["build"], "tags": ["t"]}}"#,
        )
        .unwrap();
        let config = to_project_configuration("libs/a", package);
        let targets = config.targets.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets["build"].executor.as_deref(), Some(RUN_SCRIPT_EXECUTOR));
        assert_eq!(targets["build"].options.as_ref().unwrap()["script"], "build");
        assert_eq!(config.tags, Some(vec!["t".to_string()]));
    }

    #[test]
    fn workspace_dependencies_become_static_edges() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "/ws/libs/a/package.json",
            r#"{"name": "@s/a", "dependencies": {"@s/b": "*", "left-pad": "1.0.0"}}"#,
        );
        fs.add_file("/ws/libs/b/package.json", r#"{"name": "@s/b"}"#);

        let mut projects = BTreeMap::new();
        for (name, root) in [("a", "libs/a"), ("b", "libs/b")] {
            projects.insert(
                name.to_string(),
                ProjectConfiguration {
                    name: Some(name.to_string()),
                    root: root.to_string(),
                    ..Default::default()
                },
            );
        }
        let mut external = BTreeMap::new();
        external.insert(
            "npm:left-pad".to_string(),
            ExternalNode {
                name: "npm:left-pad".to_string(),
                node_type: "npm".to_string(),
                version: Some("1.0.0".to_string()),
            },
        );
        let config = WorkspaceConfig::default();
        let file_map = FileMap::default();
        let ctx = CreateDependenciesContext {
            workspace_root: Path::new("/ws"),
            config: &config,
            fs: &fs,
            projects: &projects,
            external_nodes: &external,
            file_map: &file_map,
            options: None,
        };

        let deps = PackageJsonPlugin.create_dependencies(&ctx).unwrap();
        let targets: Vec<&str> = deps.iter().map(|d| d.target.as_str()).collect();
        assert_eq!(targets, vec!["b", "npm:left-pad"]);
        assert!(deps.iter().all(|d| d.source == "a"));
    }
}
