// src/hasher/inputs.rs

//! Resolve a target's `inputs` into what has to be hashed.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

use crate::config::{InputDefinition, WorkspaceConfig};
use crate::dag::Task;
use crate::graph::{ProjectGraph, ProjectNode};

/// Input resolved within a single project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfInput {
    Fileset(String),
    Runtime(String),
    Env(String),
}

/// Hash files matching `glob` among the outputs of dependency tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsOutput {
    pub glob: String,
    pub transitive: bool,
}

/// Inputs of a task split by where they apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitInputs {
    pub self_inputs: Vec<SelfInput>,
    /// Named inputs to resolve in every dependency project.
    pub deps_inputs: Vec<String>,
    pub deps_outputs: Vec<DepsOutput>,
}

/// Used when neither the target nor the target defaults declare inputs.
fn default_inputs() -> Vec<InputDefinition> {
    vec![
        InputDefinition::Plain("default".to_string()),
        InputDefinition::Plain("^default".to_string()),
    ]
}

/// Named inputs visible in `node`: the built-in `default`, then the
/// workspace ones, then the project's own.
pub fn named_inputs_for(
    config: &WorkspaceConfig,
    node: &ProjectNode,
) -> BTreeMap<String, Vec<InputDefinition>> {
    let mut named = BTreeMap::new();
    named.insert(
        "default".to_string(),
        vec![InputDefinition::Fileset {
            fileset: "{projectRoot}/**/*".to_string(),
        }],
    );
    named.extend(config.named_inputs.clone());
    named.extend(node.named_inputs.clone());
    named
}

pub fn get_inputs(
    task: &Task,
    graph: &ProjectGraph,
    config: &WorkspaceConfig,
) -> Result<SplitInputs> {
    let Some(node) = graph.node(&task.target.project) else {
        bail!("project {} is not in the project graph", task.target.project);
    };
    let declared = node
        .targets
        .get(&task.target.target)
        .and_then(|t| t.inputs.clone())
        .or_else(|| {
            config
                .target_defaults
                .get(&task.target.target)
                .and_then(|t| t.inputs.clone())
        })
        .unwrap_or_else(default_inputs);

    split_inputs(&declared, &named_inputs_for(config, node))
}

/// Resolve one named input in the context of `node`.
pub fn get_named_input(
    name: &str,
    node: &ProjectNode,
    config: &WorkspaceConfig,
) -> Result<SplitInputs> {
    split_inputs(
        &[InputDefinition::Plain(name.to_string())],
        &named_inputs_for(config, node),
    )
}

fn split_inputs(
    inputs: &[InputDefinition],
    named: &BTreeMap<String, Vec<InputDefinition>>,
) -> Result<SplitInputs> {
    let mut out = SplitInputs::default();
    let mut expanding = BTreeSet::new();
    expand(inputs, named, &mut out, &mut expanding)?;
    Ok(out)
}

fn expand(
    inputs: &[InputDefinition],
    named: &BTreeMap<String, Vec<InputDefinition>>,
    out: &mut SplitInputs,
    expanding: &mut BTreeSet<String>,
) -> Result<()> {
    for input in inputs {
        match input {
            InputDefinition::Plain(s) => {
                if let Some(dep) = s.strip_prefix('^') {
                    push_unique(&mut out.deps_inputs, dep.to_string());
                } else if let Some(definition) = named.get(s) {
                    expand_named(s, definition, named, out, expanding)?;
                } else if is_fileset(s) {
                    push_unique(&mut out.self_inputs, SelfInput::Fileset(s.clone()));
                } else {
                    bail!(
                        "{s} is an invalid fileset. \
                         All filesets have to start with either \
                         {{workspaceRoot}} or {{projectRoot}}"
                    );
                }
            }
            InputDefinition::Fileset { fileset } => {
                if !is_fileset(fileset) {
                    bail!("{fileset} is an invalid fileset");
                }
                push_unique(&mut out.self_inputs, SelfInput::Fileset(fileset.clone()));
            }
            InputDefinition::Runtime { runtime } => {
                push_unique(&mut out.self_inputs, SelfInput::Runtime(runtime.clone()));
            }
            InputDefinition::Env { env } => {
                push_unique(&mut out.self_inputs, SelfInput::Env(env.clone()));
            }
            InputDefinition::DependentTasksOutputFiles {
                dependent_tasks_output_files,
                transitive,
            } => {
                push_unique(
                    &mut out.deps_outputs,
                    DepsOutput {
                        glob: dependent_tasks_output_files.clone(),
                        transitive: *transitive,
                    },
                );
            }
            InputDefinition::NamedInput { input, dependencies } => {
                if *dependencies {
                    push_unique(&mut out.deps_inputs, input.clone());
                } else if let Some(definition) = named.get(input) {
                    expand_named(input, definition, named, out, expanding)?;
                } else {
                    bail!("{input} is not a named input");
                }
            }
        }
    }
    Ok(())
}

fn expand_named(
    name: &str,
    definition: &[InputDefinition],
    named: &BTreeMap<String, Vec<InputDefinition>>,
    out: &mut SplitInputs,
    expanding: &mut BTreeSet<String>,
) -> Result<()> {
    if !expanding.insert(name.to_string()) {
        bail!("named input {name} refers to itself");
    }
    expand(definition, named, out, expanding)?;
    expanding.remove(name);
    Ok(())
}

fn is_fileset(s: &str) -> bool {
    let s = s.strip_prefix('!').unwrap_or(s);
    s.starts_with("{projectRoot}") || s.starts_with("{workspaceRoot}")
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}
