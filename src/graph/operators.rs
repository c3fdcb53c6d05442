// src/graph/operators.rs

//! Whole-graph transformations.

use std::collections::HashMap;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::{Bfs, Walker};

use crate::graph::ProjectGraph;

/// Same nodes, every edge flipped (target → source).
///
/// Edges to external nodes are dropped because they cannot be reversed into
/// a workspace project.
pub fn reverse(graph: &ProjectGraph) -> ProjectGraph {
    let mut reversed = ProjectGraph {
        nodes: graph.nodes.clone(),
        dependencies: graph.nodes.keys().map(|n| (n.clone(), Vec::new())).collect(),
        external_nodes: graph.external_nodes.clone(),
    };

    for edges in graph.dependencies.values() {
        for dep in edges {
            if graph.nodes.contains_key(&dep.target) {
                reversed.add_dependency(
                    dep.target.clone(),
                    dep.source.clone(),
                    dep.dependency_type,
                );
            }
        }
    }

    reversed
}

/// Every project reachable from `project` (excluding itself).
pub fn find_all_project_node_dependencies(project: &str, graph: &ProjectGraph) -> Vec<String> {
    let digraph = to_digraph(graph);
    if !digraph.contains_node(project) {
        return Vec::new();
    }
    Bfs::new(&digraph, project)
        .iter(&digraph)
        .filter(|n| *n != project)
        .map(str::to_string)
        .collect()
}

/// Number of transitive dependencies for every project, computed once.
///
/// Called on a reversed graph this yields the number of transitive
/// dependents, which the scheduler uses to break ties.
pub fn transitive_dependency_counts(graph: &ProjectGraph) -> HashMap<String, usize> {
    let digraph = to_digraph(graph);
    graph
        .nodes
        .keys()
        .map(|name| {
            let count = Bfs::new(&digraph, name.as_str())
                .iter(&digraph)
                .filter(|n| *n != name.as_str())
                .count();
            (name.clone(), count)
        })
        .collect()
}

fn to_digraph(graph: &ProjectGraph) -> DiGraphMap<&str, ()> {
    let mut digraph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in graph.nodes.keys() {
        digraph.add_node(name.as_str());
    }
    for edges in graph.dependencies.values() {
        for dep in edges {
            if graph.nodes.contains_key(&dep.target) {
                digraph.add_edge(dep.source.as_str(), dep.target.as_str(), ());
            }
        }
    }
    digraph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProjectNode;
    use crate::types::DependencyType;

    fn graph(edges: &[(&str, &str)]) -> ProjectGraph {
        let mut g = ProjectGraph::new();
        for name in ["app", "lib", "util", "other"] {
            g.add_node(ProjectNode {
                name: name.to_string(),
                root: format!("libs/{name}"),
                ..Default::default()
            });
        }
        for (s, t) in edges {
            g.add_dependency(*s, *t, DependencyType::Static);
        }
        g
    }

    #[test]
    fn reverse_flips_edges() {
        let g = graph(&[("app", "lib")]);
        let r = reverse(&g);
        assert_eq!(r.project_dependencies_of("lib"), vec!["app"]);
        assert!(r.project_dependencies_of("app").is_empty());
    }

    #[test]
    fn transitive_dependents_via_reverse() {
        let g = graph(&[("app", "lib"), ("lib", "util")]);
        let r = reverse(&g);
        let mut deps = find_all_project_node_dependencies("util", &r);
        deps.sort();
        assert_eq!(deps, vec!["app", "lib"]);

        let counts = transitive_dependency_counts(&r);
        assert_eq!(counts["util"], 2);
        assert_eq!(counts["lib"], 1);
        assert_eq!(counts["other"], 0);
    }
}
