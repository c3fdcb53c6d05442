// src/graph/normalize.rs

//! Turning a merged root map into validated, normalized project nodes.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{ProjectConfiguration, TargetConfiguration};
use crate::errors::ProjectGraphError;
use crate::fs::FileSystem;
use crate::graph::merge::{resolve_command_sugar, ProjectRootMap};
use crate::graph::ProjectNode;

const WORKSPACE_ROOT_TOKEN: &str = "{workspaceRoot}";

/// Validate names and normalize every target of every project.
///
/// Projects without a `name` take the one from `<root>/package.json`. Name
/// problems are collected and returned together with every project that
/// could be resolved; target normalization errors are returned as a list.
pub fn validate_and_normalize_root_map(
    root_map: &ProjectRootMap,
    workspace_root: &Path,
    fs: &dyn FileSystem,
) -> (BTreeMap<String, ProjectNode>, Vec<ProjectGraphError>) {
    let mut projects: BTreeMap<String, ProjectNode> = BTreeMap::new();
    let mut conflicts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut roots_with_no_name = Vec::new();
    let mut errors = Vec::new();

    for (root, config) in root_map {
        let name = match config.name.clone() {
            Some(name) => name,
            None => match read_package_json_name(workspace_root, root, fs) {
                Some(name) => name,
                None => {
                    roots_with_no_name.push(root.clone());
                    continue;
                }
            },
        };

        if let Some(existing) = projects.get(&name) {
            if existing.root != *root {
                conflicts
                    .entry(name.clone())
                    .or_insert_with(|| vec![existing.root.clone()])
                    .push(root.clone());
                continue;
            }
        }

        match to_project_node(&name, config) {
            Ok(node) => {
                projects.insert(name, node);
            }
            Err(e) => errors.push(e),
        }
    }

    if !conflicts.is_empty() {
        errors.push(ProjectGraphError::MultipleProjectsWithSameName { conflicts });
    }
    if !roots_with_no_name.is_empty() {
        errors.push(ProjectGraphError::ProjectWithNoName {
            roots: roots_with_no_name,
        });
    }

    (projects, errors)
}

fn read_package_json_name(
    workspace_root: &Path,
    root: &str,
    fs: &dyn FileSystem,
) -> Option<String> {
    let path = workspace_root.join(root).join("package.json");
    let contents = fs.read_to_string(&path).ok()?;
    let json: Value = serde_json::from_str(&contents).ok()?;
    let name = json.get("name")?.as_str()?.to_string();
    debug!(root = %root, name = %name, "project name taken from package.json");
    Some(name)
}

fn to_project_node(
    name: &str,
    config: &ProjectConfiguration,
) -> Result<ProjectNode, ProjectGraphError> {
    let mut targets = BTreeMap::new();
    for (target_name, target) in config.targets.iter().flatten() {
        let normalized = normalize_target(target.clone(), &config.root, name, target_name)?;
        if normalized.executor.is_none() && normalized.command.is_none() {
            debug!(
                project = %name,
                target = %target_name,
                "dropping target without executor or command"
            );
            continue;
        }
        targets.insert(target_name.clone(), normalized);
    }

    Ok(ProjectNode {
        name: name.to_string(),
        root: config.root.clone(),
        project_type: config.project_type.unwrap_or_default(),
        source_root: config.source_root.clone(),
        targets,
        tags: config.tags.clone().unwrap_or_default(),
        implicit_dependencies: config.implicit_dependencies.clone().unwrap_or_default(),
        named_inputs: config.named_inputs.clone().unwrap_or_default(),
        metadata: config.metadata.clone().unwrap_or_default(),
    })
}

/// Resolve command sugar and `{projectRoot}` / `{projectName}` tokens.
pub fn normalize_target(
    target: TargetConfiguration,
    root: &str,
    project_name: &str,
    target_name: &str,
) -> Result<TargetConfiguration, ProjectGraphError> {
    let mut target = resolve_command_sugar(target, root, target_name)?;
    let key = format!("{root}:{target_name}");

    if let Some(options) = target.options.take() {
        target.options = Some(resolve_tokens_in_map(options, root, project_name, &key)?);
    }

    let configurations = target.configurations.take().unwrap_or_default();
    let mut resolved = BTreeMap::new();
    for (configuration, options) in configurations {
        let key = format!("{key}:{configuration}");
        resolved.insert(
            configuration,
            resolve_tokens_in_map(options, root, project_name, &key)?,
        );
    }
    target.configurations = Some(resolved);

    Ok(target)
}

fn resolve_tokens_in_map(
    map: Map<String, Value>,
    root: &str,
    project_name: &str,
    key: &str,
) -> Result<Map<String, Value>, ProjectGraphError> {
    let mut out = Map::new();
    for (opt, value) in map {
        let key = format!("{key}.{opt}");
        out.insert(opt, resolve_tokens_in_value(value, root, project_name, &key)?);
    }
    Ok(out)
}

/// Replace tokens in every string nested in `value`.
///
/// A leading `{workspaceRoot}` (with optional `/`) is stripped since paths
/// are already workspace-relative; anywhere else it is an error.
pub fn resolve_tokens_in_value(
    value: Value,
    root: &str,
    project_name: &str,
    key: &str,
) -> Result<Value, ProjectGraphError> {
    match value {
        Value::String(s) => {
            let stripped = s
                .strip_prefix("{workspaceRoot}/")
                .or_else(|| s.strip_prefix(WORKSPACE_ROOT_TOKEN))
                .unwrap_or(&s);
            if stripped.contains(WORKSPACE_ROOT_TOKEN) {
                return Err(ProjectGraphError::WorkspaceRootToken {
                    key: key.to_string(),
                });
            }
            Ok(Value::String(
                stripped
                    .replace("{projectRoot}", root)
                    .replace("{projectName}", project_name),
            ))
        }
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| resolve_tokens_in_value(v, root, project_name, &format!("{key}.{i}")))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            resolve_tokens_in_map(map, root, project_name, key).map(Value::Object)
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use serde_json::json;

    fn root_map(entries: &[(&str, Value)]) -> ProjectRootMap {
        entries
            .iter()
            .map(|(root, v)| {
                let mut cfg: ProjectConfiguration = serde_json::from_value(v.clone()).unwrap();
                cfg.root = root.to_string();
                (root.to_string(), cfg)
            })
            .collect()
    }

    #[test]
    fn name_falls_back_to_package_json() {
        let fs = MockFileSystem::new();
        fs.add_file("/ws/libs/a/package.json", r#"{"name": "@scope/a"}"#);
        let map = root_map(&[("libs/a", json!({}))]);
        let (projects, errors) = validate_and_normalize_root_map(&map, Path::new("/ws"), &fs);
        assert!(errors.is_empty());
        assert!(projects.contains_key("@scope/a"));
    }

    #[test]
    fn missing_name_is_reported() {
        let fs = MockFileSystem::new();
        let map = root_map(&[("libs/a", json!({})), ("libs/b", json!({"name": "b"}))]);
        let (projects, errors) = validate_and_normalize_root_map(&map, Path::new("/ws"), &fs);
        assert!(projects.contains_key("b"));
        assert!(matches!(
            errors.as_slice(),
            [ProjectGraphError::ProjectWithNoName { roots }] if roots == &vec!["libs/a".to_string()]
        ));
    }

    #[test]
    fn duplicate_names_are_reported() {
        let fs = MockFileSystem::new();
        let map = root_map(&[("libs/a", json!({"name": "x"})), ("libs/b", json!({"name": "x"}))]);
        let (_, errors) = validate_and_normalize_root_map(&map, Path::new("/ws"), &fs);
        match errors.as_slice() {
            [ProjectGraphError::MultipleProjectsWithSameName { conflicts }] => {
                assert_eq!(conflicts["x"], vec!["libs/a", "libs/b"]);
            }
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn tokens_are_resolved_and_empty_targets_dropped() {
        let fs = MockFileSystem::new();
        let map = root_map(&[(
            "libs/a",
            json!({
                "name": "a",
                "targets": {
                    "build": {"command": "tsc -p {projectRoot}/tsconfig.json --name {projectName}"},
                    "lint": {"options": {"x": 1}},
                    "copy": {"executor": "copy", "options": {"from": "{workspaceRoot}/assets"}}
                }
            }),
        )]);
        let (projects, errors) = validate_and_normalize_root_map(&map, Path::new("/ws"), &fs);
        assert!(errors.is_empty());
        let targets = &projects["a"].targets;
        assert!(!targets.contains_key("lint"));
        assert_eq!(
            targets["build"].options.as_ref().unwrap()["command"],
            "tsc -p libs/a/tsconfig.json --name a"
        );
        assert_eq!(targets["copy"].options.as_ref().unwrap()["from"], "assets");
    }

    #[test]
    fn workspace_root_token_in_the_middle_is_rejected() {
        let err =
            resolve_tokens_in_value(json!("x/{workspaceRoot}/y"), "libs/a", "a", "k").unwrap_err();
        assert!(matches!(err, ProjectGraphError::WorkspaceRootToken { .. }));
    }
}
