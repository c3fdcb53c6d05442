#![allow(dead_code)]

use monodag::config::{DependsOnEntry, InputDefinition, TargetConfiguration};
use monodag::graph::{ProjectGraph, ProjectNode};
use monodag::types::{DependencyType, ProjectType, RUN_COMMANDS_EXECUTOR};
use serde_json::{Map, Value};

/// Builder for `TargetConfiguration`.
#[derive(Debug, Clone, Default)]
pub struct TargetBuilder {
    target: TargetConfiguration,
}

impl TargetBuilder {
    /// A `run-commands` target running `cmd`, cacheable.
    pub fn command(cmd: &str) -> Self {
        Self::default()
            .executor(RUN_COMMANDS_EXECUTOR)
            .option("command", Value::String(cmd.to_string()))
            .cache(true)
    }

    pub fn executor(mut self, executor: &str) -> Self {
        self.target.executor = Some(executor.to_string());
        self
    }

    pub fn option(mut self, key: &str, value: Value) -> Self {
        self.target
            .options
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn configuration(mut self, name: &str, options: Map<String, Value>) -> Self {
        self.target
            .configurations
            .get_or_insert_with(Default::default)
            .insert(name.to_string(), options);
        self
    }

    /// Shorthand dependency such as `^build` or `lint`.
    pub fn depends_on(self, dep: &str) -> Self {
        self.depends_on_entry(DependsOnEntry::Shorthand(dep.to_string()))
    }

    pub fn depends_on_entry(mut self, entry: DependsOnEntry) -> Self {
        self.target.depends_on.get_or_insert_with(Vec::new).push(entry);
        self
    }

    pub fn outputs(mut self, outputs: &[&str]) -> Self {
        self.target.outputs = Some(outputs.iter().map(|o| o.to_string()).collect());
        self
    }

    pub fn inputs(mut self, inputs: &[&str]) -> Self {
        self.target.inputs = Some(
            inputs
                .iter()
                .map(|i| InputDefinition::Plain(i.to_string()))
                .collect(),
        );
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.target.cache = Some(cache);
        self
    }

    pub fn build(self) -> TargetConfiguration {
        self.target
    }
}

/// Builder for `ProjectNode`. The root defaults to `libs/<name>`.
#[derive(Debug, Clone)]
pub struct ProjectBuilder {
    node: ProjectNode,
}

impl ProjectBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            node: ProjectNode {
                name: name.to_string(),
                root: format!("libs/{name}"),
                ..Default::default()
            },
        }
    }

    pub fn root(mut self, root: &str) -> Self {
        self.node.root = root.to_string();
        self
    }

    pub fn project_type(mut self, project_type: ProjectType) -> Self {
        self.node.project_type = project_type;
        self
    }

    pub fn target(mut self, name: &str, target: TargetConfiguration) -> Self {
        self.node.targets.insert(name.to_string(), target);
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.node.tags.push(tag.to_string());
        self
    }

    pub fn implicit_dependency(mut self, project: &str) -> Self {
        self.node.implicit_dependencies.push(project.to_string());
        self
    }

    pub fn named_input(mut self, name: &str, inputs: &[&str]) -> Self {
        self.node.named_inputs.insert(
            name.to_string(),
            inputs
                .iter()
                .map(|i| InputDefinition::Plain(i.to_string()))
                .collect(),
        );
        self
    }

    pub fn build(self) -> ProjectNode {
        self.node
    }
}

/// Builder for `ProjectGraph`.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraphBuilder {
    graph: ProjectGraph,
}

impl ProjectGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, node: ProjectNode) -> Self {
        self.graph.add_node(node);
        self
    }

    /// Static edge: `source` depends on `target`.
    pub fn dependency(self, source: &str, target: &str) -> Self {
        self.dependency_of_type(source, target, DependencyType::Static)
    }

    pub fn dependency_of_type(
        mut self,
        source: &str,
        target: &str,
        dependency_type: DependencyType,
    ) -> Self {
        self.graph.add_dependency(source, target, dependency_type);
        self
    }

    pub fn build(self) -> ProjectGraph {
        self.graph
    }
}
