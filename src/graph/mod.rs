// src/graph/mod.rs

//! The project graph: construction from plugin output, merge rules and
//! whole-graph operators.

pub mod builder;
pub mod merge;
pub mod normalize;
pub mod operators;
pub mod project_graph;

pub use builder::{
    build_graph_from_configurations, build_project_graph, create_project_configurations,
    hash_project_configurations, ConfigurationResult, GraphBuildContext, ProjectGraphBuild,
};
pub use merge::{ConfigurationSourceMaps, ProjectRootMap, SourceInformation, SourceMap};
pub use project_graph::{ExternalNode, ProjectGraph, ProjectGraphDependency, ProjectNode};
