// src/plugins/target_defaults.rs

//! Applies `[target_defaults]` from `Monodag.toml` to projects.
//!
//! Defaults are keyed either by target name or by executor. They run before
//! the manifest plugins so that explicit project configuration wins, and they
//! are flagged so they never create a target a project does not define.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;

use crate::config::{ProjectConfiguration, TargetConfiguration, WORKSPACE_CONFIG_FILE};
use crate::plugins::package_json::{read_targets_from_package_json, PackageJson};
use crate::plugins::{
    create_nodes_from_files, project_root_of, CreateNodesContext, CreateNodesOutput,
    CreateNodesResult, GraphPlugin, PluginCapabilities,
};
use crate::types::{RUN_COMMANDS_EXECUTOR, RUN_SCRIPT_EXECUTOR};

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetDefaultsPlugin;

impl TargetDefaultsPlugin {
    pub const NAME: &'static str = "target-defaults";
}

impl GraphPlugin for TargetDefaultsPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities {
            create_nodes: true,
            ..Default::default()
        }
    }

    fn create_nodes_pattern(&self) -> &str {
        "**/{package.json,project.json}"
    }

    fn create_nodes(&self, files: &[String], ctx: &CreateNodesContext<'_>) -> CreateNodesOutput {
        let target_defaults = &ctx.config.target_defaults;
        if target_defaults.is_empty() {
            return Ok(Vec::new());
        }

        create_nodes_from_files(files, |file| {
            let root = project_root_of(file);
            let dir = ctx.workspace_root.join(if root == "." { "" } else { root.as_str() });
            let project_json_path = dir.join("project.json");
            let package_json_path = dir.join("package.json");

            // Handle a root with both manifests once, via project.json.
            if file.ends_with("package.json") && ctx.fs.is_file(&project_json_path) {
                return Ok(None);
            }

            let project_json: Option<ProjectConfiguration> = if ctx.fs.is_file(&project_json_path) {
                let contents = ctx.fs.read_to_string(&project_json_path)?;
                Some(serde_json::from_str(&contents).with_context(|| format!("parsing {file}"))?)
            } else {
                None
            };
            let package_json: Option<PackageJson> = if ctx.fs.is_file(&package_json_path) {
                let contents = ctx.fs.read_to_string(&package_json_path)?;
                Some(serde_json::from_str(&contents).context("parsing package.json")?)
            } else {
                None
            };

            let project_targets = project_json
                .and_then(|p| p.targets)
                .unwrap_or_default();
            let package_targets = package_json
                .as_ref()
                .map(read_targets_from_package_json)
                .unwrap_or_default();

            let modified =
                apply_target_defaults(target_defaults, &project_targets, &package_targets);

            let mut result = CreateNodesResult {
                override_source_file: Some(WORKSPACE_CONFIG_FILE.to_string()),
                ..Default::default()
            };
            result.projects.insert(
                root.clone(),
                ProjectConfiguration {
                    root,
                    targets: Some(modified),
                    ..Default::default()
                },
            );
            Ok(Some(result))
        })
    }
}

/// Build the default-carrying targets for one project.
///
/// Each target is seeded with just enough of the project's own definition
/// (executor, command or script) to stay compatible with it during the
/// merge, then overlaid with the defaults.
pub fn apply_target_defaults(
    target_defaults: &BTreeMap<String, TargetConfiguration>,
    project_targets: &BTreeMap<String, TargetConfiguration>,
    package_targets: &BTreeMap<String, TargetConfiguration>,
) -> BTreeMap<String, TargetConfiguration> {
    let defined: BTreeSet<&String> = project_targets.keys().chain(package_targets.keys()).collect();

    let mut executor_to_targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for target in &defined {
        if let Some(executor) = target_executor(target, project_targets, package_targets) {
            executor_to_targets
                .entry(executor)
                .or_default()
                .insert((*target).clone());
        }
    }

    let mut modified: BTreeMap<String, TargetConfiguration> = BTreeMap::new();
    for (specifier, defaults) in target_defaults {
        let mut names = executor_to_targets.get(specifier).cloned().unwrap_or_default();
        names.insert(specifier.clone());

        for name in names {
            // A target-name key does not override an executor key applied earlier.
            if !modified.contains_key(&name) || name != *specifier {
                let info = target_info(&name, project_targets, package_targets);
                modified.insert(name.clone(), overlay(info, defaults));
            }
            if !defined.contains(&name) {
                if let Some(t) = modified.get_mut(&name) {
                    t.only_modifies_existing = true;
                }
            }
        }
    }
    modified
}

fn target_executor(
    name: &str,
    project_targets: &BTreeMap<String, TargetConfiguration>,
    package_targets: &BTreeMap<String, TargetConfiguration>,
) -> Option<String> {
    if let Some(target) = project_targets.get(name) {
        if target.command.is_some() {
            return Some(RUN_COMMANDS_EXECUTOR.to_string());
        }
        if let Some(executor) = &target.executor {
            return Some(executor.clone());
        }
    }
    package_targets
        .get(name)
        .map(|_| RUN_SCRIPT_EXECUTOR.to_string())
}

/// Minimal slice of the project's own target that keeps the defaults
/// compatible with it.
fn target_info(
    name: &str,
    project_targets: &BTreeMap<String, TargetConfiguration>,
    package_targets: &BTreeMap<String, TargetConfiguration>,
) -> TargetConfiguration {
    let project_target = project_targets.get(name);
    let package_target = package_targets.get(name);

    let mut options = package_target.and_then(|t| t.options.clone()).unwrap_or_default();
    options.extend(project_target.and_then(|t| t.options.clone()).unwrap_or_default());

    if let Some(command) = project_target.and_then(|t| t.command.clone()) {
        return TargetConfiguration {
            command: Some(command),
            ..Default::default()
        };
    }

    let executor = target_executor(name, project_targets, package_targets);
    let keep = |keys: &[&str]| {
        let kept: serde_json::Map<_, _> = options
            .iter()
            .filter(|(k, _)| keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if kept.is_empty() { None } else { Some(kept) }
    };

    match executor.as_deref() {
        Some(RUN_COMMANDS_EXECUTOR) => TargetConfiguration {
            executor: executor.clone(),
            options: keep(&["command", "commands"]),
            ..Default::default()
        },
        Some(RUN_SCRIPT_EXECUTOR) => TargetConfiguration {
            executor: executor.clone(),
            options: keep(&["script"]),
            ..Default::default()
        },
        Some(_) => TargetConfiguration {
            executor,
            ..Default::default()
        },
        None => TargetConfiguration::default(),
    }
}

/// Shallow overlay: any field set in `defaults` replaces the one in `info`.
fn overlay(info: TargetConfiguration, defaults: &TargetConfiguration) -> TargetConfiguration {
    let defaults = defaults.clone();
    TargetConfiguration {
        executor: defaults.executor.or(info.executor),
        command: defaults.command.or(info.command),
        options: defaults.options.or(info.options),
        configurations: defaults.configurations.or(info.configurations),
        default_configuration: defaults.default_configuration.or(info.default_configuration),
        depends_on: defaults.depends_on.or(info.depends_on),
        inputs: defaults.inputs.or(info.inputs),
        outputs: defaults.outputs.or(info.outputs),
        cache: defaults.cache.or(info.cache),
        metadata: defaults.metadata.or(info.metadata),
        only_modifies_existing: false,
    }
}
