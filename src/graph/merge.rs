// src/graph/merge.rs

//! Merging partial project configurations produced by plugins.
//!
//! Several plugins may describe the same project root. Their partial
//! configurations are folded into a single root map in plugin order:
//!
//! - scalar fields: last writer wins
//! - `tags`, `implicitDependencies`: order-preserving union
//! - `generators`: shallow merge per generator
//! - `namedInputs`: shallow merge
//! - `metadata`: [`merge_metadata`]
//! - `targets`: [`merge_target_configurations`]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{ProjectConfiguration, TargetConfiguration};
use crate::errors::ProjectGraphError;
use crate::types::{RUN_COMMANDS_EXECUTOR, RUN_SCRIPT_EXECUTOR};

/// `(file, plugin)` that contributed a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInformation(pub String, pub String);

impl SourceInformation {
    pub fn new(file: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self(file.into(), plugin.into())
    }
}

/// Property path (`targets.build.options.command`) → who set it.
pub type SourceMap = BTreeMap<String, SourceInformation>;

/// Project root → [`SourceMap`].
pub type ConfigurationSourceMaps = BTreeMap<String, SourceMap>;

/// Root → merged project configuration.
pub type ProjectRootMap = BTreeMap<String, ProjectConfiguration>;

/// Fold `project` into `root_map`, recording provenance in `source_maps`.
pub fn merge_project_configuration_into_root_map(
    root_map: &mut ProjectRootMap,
    project: ProjectConfiguration,
    source_maps: Option<&mut ConfigurationSourceMaps>,
    source: &SourceInformation,
) -> Result<(), ProjectGraphError> {
    let root = project.root.clone();
    let mut source_map = source_maps.map(|maps| maps.entry(root.clone()).or_default());

    let matching = root_map.entry(root.clone()).or_insert_with(|| {
        if let Some(sm) = source_map.as_deref_mut() {
            sm.insert("root".to_string(), source.clone());
        }
        ProjectConfiguration {
            root: root.clone(),
            ..Default::default()
        }
    });
    let mut updated = matching.clone();

    let mut record = |key: String| {
        if let Some(sm) = source_map.as_deref_mut() {
            sm.insert(key, source.clone());
        }
    };

    if let Some(name) = project.name {
        updated.name = Some(name);
        record("name".to_string());
    }
    if let Some(source_root) = project.source_root {
        updated.source_root = Some(source_root);
        record("sourceRoot".to_string());
    }
    if let Some(project_type) = project.project_type {
        updated.project_type = Some(project_type);
        record("projectType".to_string());
    }

    if let Some(tags) = project.tags {
        let merged = updated.tags.get_or_insert_with(Vec::new);
        for tag in tags {
            record(format!("tags.{tag}"));
            if !merged.contains(&tag) {
                merged.push(tag);
            }
        }
    }

    if let Some(implicit) = project.implicit_dependencies {
        let merged = updated.implicit_dependencies.get_or_insert_with(Vec::new);
        for dep in implicit {
            record(format!("implicitDependencies.{dep}"));
            if !merged.contains(&dep) {
                merged.push(dep);
            }
        }
    }

    if let Some(generators) = project.generators {
        let base = updated.generators.take().unwrap_or_default();
        let mut merged = generators.clone();
        for (generator, base_options) in base {
            let combined = match (base_options, generators.get(&generator)) {
                (Value::Object(mut base_obj), Some(Value::Object(new_obj))) => {
                    base_obj.extend(new_obj.clone());
                    Value::Object(base_obj)
                }
                (_, Some(new_value)) => new_value.clone(),
                (base_value, None) => base_value,
            };
            merged.insert(generator, combined);
        }
        for generator in generators.keys() {
            record(format!("generators.{generator}"));
        }
        updated.generators = Some(merged);
    }

    if let Some(named_inputs) = project.named_inputs {
        let merged = updated.named_inputs.get_or_insert_with(BTreeMap::new);
        for (name, inputs) in named_inputs {
            record(format!("namedInputs.{name}"));
            merged.insert(name, inputs);
        }
    }

    if let Some(metadata) = project.metadata {
        let base = updated.metadata.take().unwrap_or_default();
        updated.metadata = Some(merge_metadata(&metadata, &base));
        record("metadata".to_string());
    }

    if let Some(targets) = project.targets {
        let merged_targets = updated.targets.get_or_insert_with(BTreeMap::new);
        for (target_name, target) in targets {
            let key = format!("targets.{target_name}");
            let base = merged_targets.get(&target_name);

            // Defaults that only modify an existing target never create one.
            if target.only_modifies_existing && base.is_none() {
                continue;
            }
            if !target.only_modifies_existing {
                record(key.clone());
            }

            let normalized = resolve_command_sugar(target, &root, &target_name)?;
            if let Some(mut merged) = merge_target_configurations(normalized, base) {
                merged.only_modifies_existing = false;
                merged_targets.insert(target_name, merged);
            }
        }
    }

    root_map.insert(root, updated);
    Ok(())
}

/// Merge `target` (higher priority) over `base`.
///
/// When the two are compatible (see [`is_compatible_target`]) top-level
/// properties, options and configurations are merged with `target` winning.
/// Otherwise `target` replaces `base` entirely, unless `target` only modifies
/// existing targets, in which case `base` is kept as is.
pub fn merge_target_configurations(
    target: TargetConfiguration,
    base: Option<&TargetConfiguration>,
) -> Option<TargetConfiguration> {
    let Some(base) = base else {
        return Some(target);
    };

    let compatible = is_compatible_target(base, &target);
    if !compatible && target.only_modifies_existing {
        return Some(base.clone());
    }
    if !compatible {
        return Some(target);
    }

    let options = merge_options(target.options.as_ref(), base.options.as_ref());
    let configurations =
        merge_configurations(target.configurations.as_ref(), base.configurations.as_ref());
    let metadata = match (&target.metadata, &base.metadata) {
        (Some(new), Some(old)) => Some(merge_metadata(new, old)),
        (Some(new), None) => Some(new.clone()),
        (None, old) => old.clone(),
    };

    Some(TargetConfiguration {
        executor: target.executor.or_else(|| base.executor.clone()),
        command: target.command.or_else(|| base.command.clone()),
        options,
        configurations,
        default_configuration: target
            .default_configuration
            .or_else(|| base.default_configuration.clone()),
        depends_on: target.depends_on.or_else(|| base.depends_on.clone()),
        inputs: target.inputs.or_else(|| base.inputs.clone()),
        outputs: target.outputs.or_else(|| base.outputs.clone()),
        cache: target.cache.or(base.cache),
        metadata,
        only_modifies_existing: target.only_modifies_existing,
    })
}

/// Whether two definitions of the same target describe the same work.
///
/// Compatible when either side has no executor, or both use the same one.
/// For `run-commands` the command (or `commands` joined with ` && `) must
/// match or be missing on one side; for `run-script` the same goes for
/// `options.script`.
pub fn is_compatible_target(a: &TargetConfiguration, b: &TargetConfiguration) -> bool {
    let (Some(a_exec), Some(b_exec)) = (a.executor.as_deref(), b.executor.as_deref()) else {
        return true;
    };
    if a_exec != b_exec {
        return false;
    }

    let compare = |left: Option<String>, right: Option<String>| match (left, right) {
        (Some(l), Some(r)) => l == r,
        _ => true,
    };

    match a_exec {
        RUN_COMMANDS_EXECUTOR => compare(command_of(a), command_of(b)),
        RUN_SCRIPT_EXECUTOR => compare(option_str(a, "script"), option_str(b, "script")),
        _ => true,
    }
}

fn command_of(target: &TargetConfiguration) -> Option<String> {
    if let Some(command) = option_str(target, "command") {
        return Some(command);
    }
    let commands = target.options.as_ref()?.get("commands")?.as_array()?;
    let joined: Vec<String> = commands
        .iter()
        .filter_map(|c| match c {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("command").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(" && "))
    }
}

fn option_str(target: &TargetConfiguration, key: &str) -> Option<String> {
    target
        .options
        .as_ref()?
        .get(key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn merge_options(
    new: Option<&Map<String, Value>>,
    base: Option<&Map<String, Value>>,
) -> Option<Map<String, Value>> {
    if new.is_none() && base.is_none() {
        return None;
    }
    let mut merged = base.cloned().unwrap_or_default();
    if let Some(new) = new {
        merged.extend(new.clone());
    }
    Some(merged)
}

fn merge_configurations(
    new: Option<&BTreeMap<String, Map<String, Value>>>,
    base: Option<&BTreeMap<String, Map<String, Value>>>,
) -> Option<BTreeMap<String, Map<String, Value>>> {
    if new.is_none() && base.is_none() {
        return None;
    }
    let mut merged = base.cloned().unwrap_or_default();
    for (name, options) in new.into_iter().flatten() {
        merged
            .entry(name.clone())
            .or_default()
            .extend(options.clone());
    }
    Some(merged)
}

/// Merge metadata maps: arrays are concatenated, objects are merged one level
/// deep (concatenating nested arrays), anything else is overwritten.
pub fn merge_metadata(new: &Map<String, Value>, base: &Map<String, Value>) -> Map<String, Value> {
    let mut result = base.clone();

    for (key, value) in new {
        match (value, result.get_mut(key)) {
            (Value::Array(items), Some(Value::Array(existing))) => {
                existing.extend(items.iter().cloned());
            }
            (Value::Object(obj), Some(Value::Object(existing))) => {
                for (inner_key, inner_value) in obj {
                    match (inner_value, existing.get_mut(inner_key)) {
                        (Value::Array(items), Some(Value::Array(existing_items))) => {
                            existing_items.extend(items.iter().cloned());
                        }
                        _ => {
                            existing.insert(inner_key.clone(), inner_value.clone());
                        }
                    }
                }
            }
            _ => {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    result
}

/// Expand `command: "..."` into `executor: run-commands` + `options.command`.
pub fn resolve_command_sugar(
    mut target: TargetConfiguration,
    root: &str,
    target_name: &str,
) -> Result<TargetConfiguration, ProjectGraphError> {
    let Some(command) = target.command.take() else {
        return Ok(target);
    };
    if target.executor.is_some() {
        return Err(ProjectGraphError::ExecutorAndCommand {
            root: root.to_string(),
            target: target_name.to_string(),
        });
    }
    target.executor = Some(RUN_COMMANDS_EXECUTOR.to_string());
    target
        .options
        .get_or_insert_with(Map::new)
        .insert("command".to_string(), Value::String(command));
    Ok(target)
}
