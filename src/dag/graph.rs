// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hasher::HashDetails;
use crate::types::TaskId;

/// `(project, target, configuration)` a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskTarget {
    pub project: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

impl TaskTarget {
    /// `project:target[:configuration]`.
    pub fn id(&self) -> TaskId {
        match &self.configuration {
            Some(c) => format!("{}:{}:{}", self.project, self.target, c),
            None => format!("{}:{}", self.project, self.target),
        }
    }
}

/// A concrete unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub target: TaskTarget,
    #[serde(default)]
    pub overrides: Map<String, Value>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub project_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_details: Option<HashDetails>,
    #[serde(default)]
    pub cache: bool,
}

/// Tasks and the edges between them.
///
/// `dependencies[t]` lists what `t` waits for. `roots` are the tasks with no
/// dependencies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub roots: Vec<TaskId>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) {
        self.dependencies.entry(task.id.clone()).or_default();
        self.tasks.insert(task.id.clone(), task);
    }

    /// `from` waits for `to`. Self edges and duplicates are ignored.
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        let deps = self.dependencies.entry(from.to_string()).or_default();
        if !deps.iter().any(|d| d == to) {
            deps.push(to.to_string());
        }
    }

    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.dependencies
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn recompute_roots(&mut self) {
        self.roots = self
            .dependencies
            .iter()
            .filter(|(id, deps)| deps.is_empty() && self.tasks.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect();
    }

    /// Drop `ids` and every edge pointing at them, then recompute roots.
    pub fn remove_tasks<S: AsRef<str>>(&mut self, ids: &[S]) {
        let removed: BTreeSet<&str> = ids.iter().map(AsRef::as_ref).collect();
        self.tasks.retain(|id, _| !removed.contains(id.as_str()));
        self.dependencies.retain(|id, _| !removed.contains(id.as_str()));
        for deps in self.dependencies.values_mut() {
            deps.retain(|d| !removed.contains(d.as_str()));
        }
        self.recompute_roots();
    }

    /// For each task, the tasks that directly depend on it.
    pub fn reverse_dependencies(&self) -> HashMap<TaskId, Vec<TaskId>> {
        let mut reverse: HashMap<TaskId, Vec<TaskId>> =
            self.tasks.keys().map(|id| (id.clone(), Vec::new())).collect();
        for (id, deps) in &self.dependencies {
            for dep in deps {
                reverse.entry(dep.clone()).or_default().push(id.clone());
            }
        }
        reverse
    }

    /// Groups of tasks that depend on each other in a cycle.
    ///
    /// Single tasks only form a group when they depend on themselves, which
    /// `add_dependency` never records, so every group has two or more tasks.
    pub fn cyclic_groups(&self) -> Vec<Vec<TaskId>> {
        let mut digraph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in self.tasks.keys() {
            digraph.add_node(id.as_str());
        }
        for (id, deps) in &self.dependencies {
            for dep in deps {
                digraph.add_edge(id.as_str(), dep.as_str(), ());
            }
        }
        tarjan_scc(&digraph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| {
                let mut group: Vec<TaskId> = scc.into_iter().map(str::to_string).collect();
                group.sort();
                group
            })
            .collect()
    }

    /// One cycle as a path `a -> b -> ... -> a`, if any.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let group = self.cyclic_groups().into_iter().next()?;
        let members: BTreeSet<&str> = group.iter().map(String::as_str).collect();

        // Walk inside the group until a task repeats.
        let mut path: Vec<TaskId> = vec![group[0].clone()];
        loop {
            let current = path.last()?;
            let next = self
                .dependencies_of(current)
                .iter()
                .find(|d| members.contains(d.as_str()))?
                .clone();
            if let Some(pos) = path.iter().position(|p| *p == next) {
                let mut cycle = path.split_off(pos);
                cycle.push(next);
                return Some(cycle);
            }
            path.push(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> Task {
        let (project, target) = id.split_once(':').unwrap();
        Task {
            id: id.to_string(),
            target: TaskTarget {
                project: project.to_string(),
                target: target.to_string(),
                configuration: None,
            },
            overrides: Map::new(),
            outputs: Vec::new(),
            project_root: format!("libs/{project}"),
            hash: None,
            hash_details: None,
            cache: false,
        }
    }

    fn graph(edges: &[(&str, &str)], ids: &[&str]) -> TaskGraph {
        let mut g = TaskGraph::new();
        for id in ids {
            g.add_task(task(id));
        }
        for (from, to) in edges {
            g.add_dependency(from, to);
        }
        g.recompute_roots();
        g
    }

    #[test]
    fn task_id_includes_configuration() {
        let mut t = task("a:build").target;
        assert_eq!(t.id(), "a:build");
        t.configuration = Some("prod".into());
        assert_eq!(t.id(), "a:build:prod");
    }

    #[test]
    fn removing_tasks_promotes_new_roots() {
        let mut g = graph(
            &[("b:build", "a:build"), ("c:build", "b:build")],
            &["a:build", "b:build", "c:build"],
        );
        assert_eq!(g.roots, vec!["a:build"]);
        g.remove_tasks(&["a:build"]);
        assert_eq!(g.roots, vec!["b:build"]);
        assert!(!g.tasks.contains_key("a:build"));
    }

    #[test]
    fn finds_cycles() {
        let g = graph(
            &[("a:t", "b:t"), ("b:t", "c:t"), ("c:t", "a:t"), ("d:t", "a:t")],
            &["a:t", "b:t", "c:t", "d:t"],
        );
        assert_eq!(g.cyclic_groups(), vec![vec!["a:t", "b:t", "c:t"]]);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        let acyclic = graph(&[("b:t", "a:t")], &["a:t", "b:t"]);
        assert!(acyclic.find_cycle().is_none());
    }
}
