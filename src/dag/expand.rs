// src/dag/expand.rs

//! Expanding requested targets into a task graph.
//!
//! `dependsOn` entries are resolved as follows:
//! - `^build` / `{ target, dependencies: true }`: `build` in every project
//!   this project depends on. Projects without `build` are walked through to
//!   their own dependencies.
//! - `build` / `{ target }`: `build` in the same project.
//! - `proj:build` / `{ target, projects: [proj] }`: `build` in `proj`.
//!
//! Every task is created once; a `(task, project)` pair is only expanded
//! once, which also stops the walk on cyclic project graphs.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{DependsOnEntry, DependsOnParams, TargetDependencyConfig};
use crate::dag::graph::{Task, TaskGraph, TaskTarget};
use crate::dag::outputs::{get_outputs_for_target_and_configuration, is_cacheable_task};
use crate::errors::TaskGraphError;
use crate::graph::{ProjectGraph, ProjectNode};
use crate::types::TaskId;

/// What to expand.
#[derive(Debug, Clone, Default)]
pub struct TaskGraphRequest {
    pub projects: Vec<String>,
    pub targets: Vec<String>,
    pub configuration: Option<String>,
    pub overrides: Map<String, Value>,
    /// `dependsOn` used for targets that declare none.
    pub extra_target_dependencies: BTreeMap<String, Vec<DependsOnEntry>>,
    /// Skip `dependsOn` entirely and only create the requested tasks.
    pub exclude_task_dependencies: bool,
    pub ignore_cycles: bool,
}

/// Parse `dependsOn` shorthand.
///
/// `^t` depends on upstream projects, `p:t` on project `p` when `p` is a
/// project, anything else (including `target:with:colons`) on the same
/// project.
pub fn expand_dependency_config_syntax_sugar(
    entry: &DependsOnEntry,
    graph: &ProjectGraph,
    all_target_names: &BTreeSet<String>,
) -> TargetDependencyConfig {
    let shorthand = match entry {
        DependsOnEntry::Full(config) => return config.clone(),
        DependsOnEntry::Shorthand(s) => s,
    };

    if let Some(target) = shorthand.strip_prefix('^') {
        return TargetDependencyConfig {
            target: target.to_string(),
            projects: None,
            dependencies: Some(true),
            params: None,
        };
    }

    let whole = TargetDependencyConfig {
        target: shorthand.clone(),
        projects: None,
        dependencies: None,
        params: None,
    };
    if all_target_names.contains(shorthand) {
        return whole;
    }
    match shorthand.split_once(':') {
        Some((project, target)) if graph.contains(project) => TargetDependencyConfig {
            target: target.to_string(),
            projects: Some(vec![project.to_string()]),
            dependencies: None,
            params: None,
        },
        _ => whole,
    }
}

/// Expand `request` against `graph`.
pub fn create_task_graph(
    graph: &ProjectGraph,
    request: &TaskGraphRequest,
) -> Result<TaskGraph, TaskGraphError> {
    let mut expander = Expander::new(graph, request);
    let initial = expander.create_initial_tasks()?;

    if !request.exclude_task_dependencies {
        for id in &initial {
            let project = expander.task_graph.tasks[id].target.project.clone();
            expander.process_task(id, &project)?;
        }
    }

    let mut task_graph = expander.task_graph;
    task_graph.recompute_roots();

    if let Some(cycle) = task_graph.find_cycle() {
        if request.ignore_cycles {
            warn!(
                cycle = %cycle.join(" --> "),
                "task graph has a cycle; it will be scheduled as one unit"
            );
        } else {
            return Err(TaskGraphError::Cycle(cycle));
        }
    }

    debug!(tasks = task_graph.tasks.len(), roots = task_graph.roots.len(), "task graph created");
    Ok(task_graph)
}

struct Expander<'a> {
    graph: &'a ProjectGraph,
    request: &'a TaskGraphRequest,
    all_target_names: BTreeSet<String>,
    task_graph: TaskGraph,
    seen: HashSet<(TaskId, String)>,
}

impl<'a> Expander<'a> {
    fn new(graph: &'a ProjectGraph, request: &'a TaskGraphRequest) -> Self {
        let all_target_names = graph
            .nodes
            .values()
            .flat_map(|n| n.targets.keys().cloned())
            .collect();
        Self {
            graph,
            request,
            all_target_names,
            task_graph: TaskGraph::new(),
            seen: HashSet::new(),
        }
    }

    fn create_initial_tasks(&mut self) -> Result<Vec<TaskId>, TaskGraphError> {
        let mut initial = Vec::new();
        for target in &self.request.targets {
            let mut found = false;
            for project_name in &self.request.projects {
                let node = self
                    .graph
                    .node(project_name)
                    .ok_or_else(|| TaskGraphError::UnknownProject(project_name.clone()))?;
                if !node.targets.contains_key(target) {
                    continue;
                }
                found = true;
                let configuration =
                    resolve_configuration(node, target, self.request.configuration.as_deref());
                let task = create_task(node, target, configuration, &self.request.overrides)?;
                initial.push(task.id.clone());
                self.task_graph.add_task(task);
            }
            if !found {
                return Err(TaskGraphError::UnknownTarget {
                    project: self.request.projects.join(", "),
                    target: target.clone(),
                });
            }
        }
        Ok(initial)
    }

    /// Expand the `dependsOn` of task `id`, looked up on `project`'s target.
    fn process_task(&mut self, id: &str, project: &str) -> Result<(), TaskGraphError> {
        if !self.seen.insert((id.to_string(), project.to_string())) {
            return Ok(());
        }
        let task_target = self.task_graph.tasks[id].target.clone();

        for entry in self.dependency_configs(project, &task_target.target) {
            let config =
                expand_dependency_config_syntax_sugar(&entry, self.graph, &self.all_target_names);
            if config.projects.is_some() && config.dependencies == Some(true) {
                return Err(TaskGraphError::ProjectsAndDependencies {
                    project: task_target.project.clone(),
                    target: task_target.target.clone(),
                });
            }

            let overrides = match config.params.unwrap_or_default() {
                DependsOnParams::Forward => self.request.overrides.clone(),
                DependsOnParams::Ignore => Map::new(),
            };

            if let Some(projects) = &config.projects {
                for dep_project in projects {
                    if !self.graph.contains(dep_project) {
                        return Err(TaskGraphError::UnknownProject(dep_project.clone()));
                    }
                    self.process_single_project(id, dep_project, &config.target, &overrides)?;
                }
            } else if config.dependencies == Some(true) {
                let mut visited = BTreeSet::new();
                self.process_dependencies(id, project, &config.target, &overrides, &mut visited)?;
            } else {
                self.process_single_project(id, &task_target.project, &config.target, &overrides)?;
            }
        }
        Ok(())
    }

    fn dependency_configs(&self, project: &str, target: &str) -> Vec<DependsOnEntry> {
        self.graph
            .node(project)
            .and_then(|n| n.targets.get(target))
            .and_then(|t| t.depends_on.clone())
            .or_else(|| self.request.extra_target_dependencies.get(target).cloned())
            .unwrap_or_default()
    }

    fn process_single_project(
        &mut self,
        id: &str,
        project: &str,
        target: &str,
        overrides: &Map<String, Value>,
    ) -> Result<(), TaskGraphError> {
        let graph = self.graph;
        let Some(node) = graph.node(project) else {
            return Ok(());
        };
        if !node.targets.contains_key(target) {
            return Ok(());
        }
        let configuration =
            resolve_configuration(node, target, self.request.configuration.as_deref());
        let dep_id = TaskTarget {
            project: project.to_string(),
            target: target.to_string(),
            configuration: configuration.clone(),
        }
        .id();
        self.link(id, node, target, configuration, dep_id, overrides)
    }

    fn process_dependencies(
        &mut self,
        id: &str,
        project: &str,
        target: &str,
        overrides: &Map<String, Value>,
        visited: &mut BTreeSet<String>,
    ) -> Result<(), TaskGraphError> {
        let graph = self.graph;
        let upstream: Vec<String> = graph
            .project_dependencies_of(project)
            .into_iter()
            .map(str::to_string)
            .collect();

        for dep_project in upstream {
            if !visited.insert(dep_project.clone()) {
                continue;
            }
            let Some(node) = graph.node(&dep_project) else {
                continue;
            };
            if node.targets.contains_key(target) {
                let configuration =
                    resolve_configuration(node, target, self.request.configuration.as_deref());
                let dep_id = TaskTarget {
                    project: dep_project.clone(),
                    target: target.to_string(),
                    configuration: configuration.clone(),
                }
                .id();
                self.link(id, node, target, configuration, dep_id, overrides)?;
            } else {
                // Walk through projects that lack the target.
                self.process_dependencies(id, &dep_project, target, overrides, visited)?;
            }
        }
        Ok(())
    }

    /// Record `id -> dep_id`, creating and expanding `dep_id` on first sight.
    fn link(
        &mut self,
        id: &str,
        node: &ProjectNode,
        target: &str,
        configuration: Option<String>,
        dep_id: TaskId,
        overrides: &Map<String, Value>,
    ) -> Result<(), TaskGraphError> {
        if dep_id != id {
            self.task_graph.add_dependency(id, &dep_id);
        }
        if !self.task_graph.tasks.contains_key(&dep_id) {
            let task = create_task(node, target, configuration, overrides)?;
            self.task_graph.add_task(task);
            self.process_task(&dep_id, &node.name)?;
        }
        Ok(())
    }
}

/// The requested configuration when the target defines it, otherwise the
/// target's `defaultConfiguration`.
pub fn resolve_configuration(
    node: &ProjectNode,
    target: &str,
    requested: Option<&str>,
) -> Option<String> {
    let target_config = node.targets.get(target)?;
    let default = target_config.default_configuration.clone();
    let candidate = requested.map(str::to_string).or_else(|| default.clone())?;
    let defined = target_config
        .configurations
        .as_ref()
        .map(|c| c.contains_key(&candidate))
        .unwrap_or(false);
    if defined { Some(candidate) } else { default }
}

pub fn create_task(
    node: &ProjectNode,
    target: &str,
    configuration: Option<String>,
    overrides: &Map<String, Value>,
) -> Result<Task, TaskGraphError> {
    let target_config = node.targets.get(target).ok_or_else(|| TaskGraphError::UnknownTarget {
        project: node.name.clone(),
        target: target.to_string(),
    })?;
    let task_target = TaskTarget {
        project: node.name.clone(),
        target: target.to_string(),
        configuration,
    };
    let outputs = get_outputs_for_target_and_configuration(
        node,
        target,
        task_target.configuration.as_deref(),
        overrides,
    )?;

    Ok(Task {
        id: task_target.id(),
        cache: is_cacheable_task(target_config.cache, target, overrides),
        target: task_target,
        overrides: overrides.clone(),
        outputs,
        project_root: node.root.clone(),
        hash: None,
        hash_details: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfiguration;
    use crate::types::DependencyType;
    use serde_json::json;

    fn add_project(graph: &mut ProjectGraph, name: &str, targets: Value) {
        let targets: BTreeMap<String, TargetConfiguration> =
            serde_json::from_value(targets).unwrap();
        graph.add_node(ProjectNode {
            name: name.to_string(),
            root: format!("libs/{name}"),
            targets,
            ..Default::default()
        });
    }

    fn request(projects: &[&str], target: &str) -> TaskGraphRequest {
        TaskGraphRequest {
            projects: projects.iter().map(|p| p.to_string()).collect(),
            targets: vec![target.to_string()],
            ..Default::default()
        }
    }

    fn chain() -> ProjectGraph {
        // app -> mid -> lib; mid has no build target.
        let mut graph = ProjectGraph::new();
        add_project(
            &mut graph,
            "app",
            json!({
                "build": {"executor": "x", "dependsOn": ["^build", "lint"]},
                "lint": {"executor": "l"}
            }),
        );
        add_project(&mut graph, "mid", json!({"test": {"executor": "x"}}));
        add_project(
            &mut graph,
            "lib",
            json!({"build": {"executor": "x", "dependsOn": ["^build"]}}),
        );
        graph.add_dependency("app", "mid", DependencyType::Static);
        graph.add_dependency("mid", "lib", DependencyType::Static);
        graph
    }

    #[test]
    fn caret_walks_through_projects_without_the_target() {
        let tg = create_task_graph(&chain(), &request(&["app"], "build")).unwrap();
        assert_eq!(tg.dependencies["app:build"], vec!["lib:build", "app:lint"]);
        assert!(tg.dependencies["lib:build"].is_empty());
        assert_eq!(tg.roots, vec!["app:lint", "lib:build"]);
    }

    #[test]
    fn project_target_shorthand_and_configurations() {
        let mut graph = ProjectGraph::new();
        add_project(
            &mut graph,
            "app",
            json!({
                "e2e": {"executor": "x", "dependsOn": ["api:serve"], "configurations": {"ci": {}}}
            }),
        );
        add_project(
            &mut graph,
            "api",
            json!({
                "serve": {
                    "executor": "x",
                    "defaultConfiguration": "dev",
                    "configurations": {"dev": {}}
                }
            }),
        );
        let mut req = request(&["app"], "e2e");
        req.configuration = Some("ci".into());
        let tg = create_task_graph(&graph, &req).unwrap();
        assert!(tg.tasks.contains_key("app:e2e:ci"));
        // `ci` is not defined on api:serve, so its default applies.
        assert_eq!(tg.dependencies["app:e2e:ci"], vec!["api:serve:dev"]);
    }

    #[test]
    fn target_names_with_colons_stay_in_the_same_project() {
        let mut graph = ProjectGraph::new();
        add_project(
            &mut graph,
            "app",
            json!({
                "build": {"executor": "x", "dependsOn": ["build:types"]},
                "build:types": {"executor": "x"}
            }),
        );
        let tg = create_task_graph(&graph, &request(&["app"], "build")).unwrap();
        assert_eq!(tg.dependencies["app:build"], vec!["app:build:types"]);
    }

    #[test]
    fn cycles_are_rejected_unless_ignored() {
        let mut graph = ProjectGraph::new();
        add_project(&mut graph, "a", json!({"build": {"executor": "x", "dependsOn": ["b:build"]}}));
        add_project(&mut graph, "b", json!({"build": {"executor": "x", "dependsOn": ["a:build"]}}));

        let err = create_task_graph(&graph, &request(&["a"], "build")).unwrap_err();
        assert!(matches!(err, TaskGraphError::Cycle(_)));

        let mut req = request(&["a"], "build");
        req.ignore_cycles = true;
        let tg = create_task_graph(&graph, &req).unwrap();
        assert_eq!(tg.tasks.len(), 2);
    }

    #[test]
    fn projects_and_dependencies_together_is_an_error() {
        let mut graph = ProjectGraph::new();
        add_project(
            &mut graph,
            "a",
            json!({
                "build": {
                    "executor": "x",
                    "dependsOn": [{"target": "build", "projects": ["a"], "dependencies": true}]
                }
            }),
        );
        let err = create_task_graph(&graph, &request(&["a"], "build")).unwrap_err();
        assert!(matches!(err, TaskGraphError::ProjectsAndDependencies { .. }));
    }

    #[test]
    fn missing_target_everywhere_is_an_error() {
        let err = create_task_graph(&chain(), &request(&["app", "mid"], "deploy")).unwrap_err();
        assert!(matches!(err, TaskGraphError::UnknownTarget { .. }));
    }

    #[test]
    fn extra_dependencies_apply_to_targets_without_depends_on() {
        let mut graph = ProjectGraph::new();
        add_project(
            &mut graph,
            "a",
            json!({"test": {"executor": "x"}, "build": {"executor": "x"}}),
        );
        let mut req = request(&["a"], "test");
        req.extra_target_dependencies
            .insert("test".into(), vec![DependsOnEntry::Shorthand("build".into())]);
        let tg = create_task_graph(&graph, &req).unwrap();
        assert_eq!(tg.dependencies["a:test"], vec!["a:build"]);
    }
}
