// src/hasher/task_hasher.rs

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::config::WorkspaceConfig;
use crate::dag::{Task, TaskGraph};
use crate::fs::patterns::PathMatcher;
use crate::fs::FileSystem;
use crate::graph::{ProjectGraph, ProjectNode};
use crate::hasher::file_hash::{compute_aggregate_hash, compute_file_hash, hash_str};
use crate::hasher::inputs::{get_inputs, get_named_input, DepsOutput, SelfInput};
use crate::hasher::{HashDetails, TaskHash};
use crate::workspace::{FileData, FileMap};

/// Computes task hashes against one snapshot of the workspace.
///
/// `Sync`, so a single hasher is shared by rayon workers. Runtime inputs
/// run once per hasher and are memoized.
#[derive(Debug)]
pub struct TaskHasher<'a> {
    workspace_root: &'a Path,
    project_graph: &'a ProjectGraph,
    file_map: &'a FileMap,
    config: &'a WorkspaceConfig,
    fs: &'a dyn FileSystem,
    env: HashMap<String, String>,
    runtime_cache: Mutex<HashMap<String, String>>,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        workspace_root: &'a Path,
        project_graph: &'a ProjectGraph,
        file_map: &'a FileMap,
        config: &'a WorkspaceConfig,
        fs: &'a dyn FileSystem,
    ) -> Self {
        Self {
            workspace_root,
            project_graph,
            file_map,
            config,
            fs,
            env: std::env::vars().collect(),
            runtime_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the environment `{env: ...}` inputs are read from.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn project_graph(&self) -> &ProjectGraph {
        self.project_graph
    }

    pub fn config(&self) -> &WorkspaceConfig {
        self.config
    }

    /// Hash many tasks in parallel. Results keep the order of `tasks`.
    pub fn hash_tasks(&self, tasks: &[&Task], task_graph: &TaskGraph) -> Vec<Result<TaskHash>> {
        tasks
            .par_iter()
            .map(|task| self.hash_task(task, task_graph))
            .collect()
    }

    pub fn hash_task(&self, task: &Task, task_graph: &TaskGraph) -> Result<TaskHash> {
        let node = self
            .project_graph
            .node(&task.target.project)
            .ok_or_else(|| anyhow!("project {} is not in the project graph", task.target.project))?;
        let inputs = get_inputs(task, self.project_graph, self.config)?;

        let mut details = HashDetails {
            command: hash_command(task)?,
            ..Default::default()
        };

        self.hash_self_inputs(node, &inputs.self_inputs, &mut details)?;

        let mut visited = BTreeSet::new();
        for named in &inputs.deps_inputs {
            self.hash_dependencies(node, named, &mut visited, &mut details)?;
        }

        for deps_output in &inputs.deps_outputs {
            let hash = self.hash_dependent_outputs(task, task_graph, deps_output)?;
            details
                .nodes
                .insert(format!("dependentTasksOutputFiles:{}", deps_output.glob), hash);
        }

        self.hash_global_inputs(&mut details);

        let value = details.aggregate();
        debug!(task = %task.id, hash = %value, "hashed task");
        Ok(TaskHash { value, details })
    }

    fn hash_self_inputs(
        &self,
        node: &ProjectNode,
        inputs: &[SelfInput],
        details: &mut HashDetails,
    ) -> Result<()> {
        let mut project_filesets = Vec::new();
        let mut workspace_filesets = Vec::new();

        for input in inputs {
            match input {
                SelfInput::Fileset(fileset) => {
                    let negated = fileset.starts_with('!');
                    let body = fileset.trim_start_matches('!');
                    if let Some(rest) = body.strip_prefix("{workspaceRoot}/") {
                        workspace_filesets.push(negate(rest, negated));
                    } else {
                        let resolved = resolve_project_root(body, &node.root);
                        project_filesets.push(negate(&resolved, negated));
                    }
                }
                SelfInput::Runtime(command) => {
                    let hash = self.hash_runtime(command)?;
                    details.runtime.insert(command.clone(), hash);
                }
                SelfInput::Env(name) => {
                    let value = self.env.get(name).map(String::as_str).unwrap_or("");
                    details.nodes.insert(format!("env:{name}"), hash_str(value));
                }
            }
        }

        if project_filesets.iter().any(|f| !f.starts_with('!')) {
            let matcher = PathMatcher::new(&project_filesets, &[])?;
            let files = self.file_map.files_for_project(&node.name);
            details.nodes.insert(
                format!("{}:{}", node.name, project_filesets.join(",")),
                hash_matching(files.iter(), &matcher),
            );
        }

        if workspace_filesets.iter().any(|f| !f.starts_with('!')) {
            let matcher = PathMatcher::new(&workspace_filesets, &[])?;
            details.nodes.insert(
                workspace_filesets.join(","),
                hash_matching(self.file_map.all_files(), &matcher),
            );
        }

        Ok(())
    }

    /// Hash `named` in every project `node` depends on, recursively for the
    /// `^inputs` those named inputs contain.
    fn hash_dependencies(
        &self,
        node: &ProjectNode,
        named: &str,
        visited: &mut BTreeSet<(String, String)>,
        details: &mut HashDetails,
    ) -> Result<()> {
        let edges = self.project_graph.dependencies.get(&node.name);
        for edge in edges.into_iter().flatten() {
            if let Some(external) = self.project_graph.external_nodes.get(&edge.target) {
                let version = external.version.as_deref().unwrap_or("");
                let hash = hash_str(&format!("{}@{}", external.name, version));
                details.nodes.insert(external.name.clone(), hash);
                continue;
            }
            let Some(dep) = self.project_graph.node(&edge.target) else {
                continue;
            };
            if !visited.insert((dep.name.clone(), named.to_string())) {
                continue;
            }

            trace!(project = %dep.name, input = %named, "hashing dependency input");
            let inputs = get_named_input(named, dep, self.config)?;
            self.hash_self_inputs(dep, &inputs.self_inputs, details)?;
            for nested in &inputs.deps_inputs {
                self.hash_dependencies(dep, nested, visited, details)?;
            }
        }
        Ok(())
    }

    fn hash_dependent_outputs(
        &self,
        task: &Task,
        task_graph: &TaskGraph,
        input: &DepsOutput,
    ) -> Result<String> {
        let matcher = PathMatcher::single(&input.glob)?;

        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> =
            task_graph.dependencies_of(&task.id).iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id.to_string()) {
                continue;
            }
            if input.transitive {
                stack.extend(task_graph.dependencies_of(id).iter().map(String::as_str));
            }
        }

        let mut files = BTreeSet::new();
        for id in &seen {
            let Some(dep) = task_graph.tasks.get(id) else {
                continue;
            };
            for output in dep.outputs.iter().filter(|o| !o.starts_with('!')) {
                files.extend(self.output_files(output)?);
            }
        }

        let mut parts = Vec::new();
        for file in files.iter().filter(|f| matcher.matches(f)) {
            let hash = compute_file_hash(self.fs, &self.workspace_root.join(file))?;
            parts.push(format!("{file}:{hash}"));
        }
        Ok(compute_aggregate_hash(&parts))
    }

    /// Workspace-relative files below `output` (a file or a directory).
    fn output_files(&self, output: &str) -> Result<Vec<String>> {
        let path = self.workspace_root.join(output);
        if self.fs.is_file(&path) {
            return Ok(vec![output.to_string()]);
        }
        if !self.fs.is_dir(&path) {
            return Ok(Vec::new());
        }
        Ok(self
            .fs
            .list_files(&path)?
            .into_iter()
            .map(|f| format!("{output}/{f}"))
            .collect())
    }

    fn hash_global_inputs(&self, details: &mut HashDetails) {
        let globals: BTreeSet<&str> =
            self.config.workspace.global_inputs.iter().map(String::as_str).collect();
        for file in self.file_map.all_files() {
            if globals.contains(file.file.as_str()) {
                details
                    .nodes
                    .insert(format!("{{workspaceRoot}}/{}", file.file), file.hash.clone());
            }
        }
    }

    fn hash_runtime(&self, command: &str) -> Result<String> {
        if let Some(hash) = self
            .runtime_cache
            .lock()
            .map_err(|_| anyhow!("runtime cache lock poisoned"))?
            .get(command)
        {
            return Ok(hash.clone());
        }

        let output = shell(command)
            .current_dir(self.workspace_root)
            .output()
            .with_context(|| format!("running runtime input {command:?}"))?;
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        let hash = blake3::hash(&combined).to_hex().to_string();

        self.runtime_cache
            .lock()
            .map_err(|_| anyhow!("runtime cache lock poisoned"))?
            .insert(command.to_string(), hash.clone());
        Ok(hash)
    }
}

/// Hash of the target, configuration and overrides.
fn hash_command(task: &Task) -> Result<String> {
    let overrides = serde_json::to_string(&task.overrides)?;
    Ok(compute_aggregate_hash(&[
        task.target.project.as_str(),
        task.target.target.as_str(),
        task.target.configuration.as_deref().unwrap_or(""),
        overrides.as_str(),
    ]))
}

fn hash_matching<'f>(files: impl Iterator<Item = &'f FileData>, matcher: &PathMatcher) -> String {
    let mut parts: Vec<String> = files
        .filter(|f| matcher.matches(&f.file))
        .map(|f| format!("{}:{}", f.file, f.hash))
        .collect();
    parts.sort();
    compute_aggregate_hash(&parts)
}

fn resolve_project_root(fileset: &str, root: &str) -> String {
    if root == "." {
        fileset.replacen("{projectRoot}/", "", 1)
    } else {
        fileset.replacen("{projectRoot}", root, 1)
    }
}

fn negate(pattern: &str, negated: bool) -> String {
    if negated {
        format!("!{pattern}")
    } else {
        pattern.to_string()
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
