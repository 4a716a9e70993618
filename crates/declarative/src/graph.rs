//! Dependency graph builder
//!
//! Edges come from two sources merged into one DAG: references found in
//! input attributes, and explicit `depends_on` entries. An edge points from
//! the dependent to its dependency.

use crate::condition::ResolvedConfig;
use crate::error::ConfigError;
use petgraph::Direction;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

/// Where an edge came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// An input attribute references an output of the target
    Reference,
    /// An explicit `depends_on` entry
    Explicit,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => f.write_str("reference"),
            Self::Explicit => f.write_str("depends_on"),
        }
    }
}

/// Acyclic dependency graph over surviving resources
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, EdgeKind>,
    index: BTreeMap<String, NodeIndex>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from a resolved configuration.
    ///
    /// Fails on dangling references, references to pruned resources,
    /// self-references and cycles.
    pub fn build(config: &ResolvedConfig) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::new();
        let mut index = BTreeMap::new();
        for name in config.resources.keys() {
            index.insert(name.clone(), graph.add_node(name.clone()));
        }

        for (name, spec) in &config.resources {
            let from = index[name];
            let referenced = spec.referenced_resources();
            let edges = referenced
                .iter()
                .map(|t| (*t, EdgeKind::Reference))
                .chain(
                    spec.depends_on
                        .iter()
                        .filter(|t| !referenced.contains(t.as_str()))
                        .map(|t| (t.as_str(), EdgeKind::Explicit)),
                );

            for (target, kind) in edges {
                if target == name.as_str() {
                    return Err(ConfigError::SelfReference {
                        resource: name.clone(),
                    });
                }
                let Some(&to) = index.get(target) else {
                    return Err(if config.absent.contains(target) {
                        ConfigError::ConditionallyAbsent {
                            resource: name.clone(),
                            target: target.to_string(),
                        }
                    } else {
                        ConfigError::DanglingReference {
                            resource: name.clone(),
                            target: target.to_string(),
                        }
                    });
                };
                graph.add_edge(from, to, kind);
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(ConfigError::Cycle { cycle });
        }

        let order = stable_toposort(&graph, Direction::Outgoing, |name| name.clone())
            .map_err(|stuck| ConfigError::Cycle {
                cycle: stuck.iter().map(|&n| graph[n].clone()).collect(),
            })?
            .into_iter()
            .map(|n| graph[n].clone())
            .collect();

        Ok(Self { graph, index, order })
    }

    /// Topological order: every resource appears after all its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Whether a resource survived condition resolution
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of resources in the graph
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no resource survived
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of a resource
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Direct dependents of a resource
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.neighbors(name, Direction::Incoming)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> BTreeSet<String> {
        self.index
            .get(name)
            .map(|&n| {
                self.graph
                    .neighbors_directed(n, direction)
                    .map(|m| self.graph[m].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything a resource depends on, directly or not
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(name) else {
            return BTreeSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = BTreeSet::new();
        while let Some(n) = dfs.next(&self.graph) {
            if n != start {
                found.insert(self.graph[n].clone());
            }
        }
        found
    }

    /// Everything that depends on a resource, directly or not.
    ///
    /// These must be destroyed alongside it.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let Some(&start) = self.index.get(name) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut found = BTreeSet::new();
        while let Some(n) = dfs.next(reversed) {
            if n != start {
                found.insert(self.graph[n].clone());
            }
        }
        found
    }

    /// All edges as (dependent, dependency, kind)
    pub fn edges(&self) -> Vec<(String, String, EdgeKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.graph.edge_endpoints(e)?;
                Some((self.graph[from].clone(), self.graph[to].clone(), self.graph[e]))
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        edges
    }

    /// Render in Graphviz DOT format
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::with_config(&self.graph, &[Config::EdgeNoLabel]))
    }
}

/// Depth-first search with a recursion stack.
///
/// Returns the first cycle found (in name order), with the entry node
/// repeated at the end.
fn find_cycle(graph: &DiGraph<String, EdgeKind>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut roots: Vec<NodeIndex> = graph.node_indices().collect();
    roots.sort_by(|a, b| graph[*a].cmp(&graph[*b]));

    for root in roots {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }
        // Each frame holds a node and its remaining successors
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
        marks[root.index()] = Mark::OnStack;
        stack.push((root, sorted_successors(graph, root)));

        while let Some((node, successors)) = stack.last_mut() {
            let node = *node;
            match successors.pop() {
                Some(next) => match marks[next.index()] {
                    Mark::OnStack => {
                        let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|(n, _)| graph[*n].clone()).collect();
                        cycle.push(graph[next].clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnStack;
                        stack.push((next, sorted_successors(graph, next)));
                    }
                    Mark::Done => {}
                },
                None => {
                    marks[node.index()] = Mark::Done;
                    stack.pop();
                }
            }
        }
    }

    None
}

/// Successors in reverse name order so popping visits them alphabetically
fn sorted_successors(graph: &DiGraph<String, EdgeKind>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut next: Vec<NodeIndex> = graph.neighbors(node).collect();
    next.sort_by(|a, b| graph[*b].cmp(&graph[*a]));
    next.dedup();
    next
}

/// Kahn's algorithm with deterministic tie-breaking.
///
/// `prerequisite` is the edge direction that points at a node's
/// prerequisites. Among ready nodes, the smallest `key` goes first. On a
/// cycle, returns the nodes that could not be ordered.
pub(crate) fn stable_toposort<N, E, K, F>(
    graph: &DiGraph<N, E>,
    prerequisite: Direction,
    key: F,
) -> Result<Vec<NodeIndex>, Vec<NodeIndex>>
where
    K: Ord,
    F: Fn(&N) -> K,
{
    let mut remaining: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, prerequisite).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<(K, NodeIndex)>> = graph
        .node_indices()
        .filter(|n| remaining[n.index()] == 0)
        .map(|n| Reverse((key(&graph[n]), n)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((_, n))) = ready.pop() {
        order.push(n);
        for m in graph.neighbors_directed(n, prerequisite.opposite()) {
            remaining[m.index()] -= 1;
            if remaining[m.index()] == 0 {
                ready.push(Reverse((key(&graph[m]), m)));
            }
        }
    }

    if order.len() == graph.node_count() {
        Ok(order)
    } else {
        let placed: BTreeSet<NodeIndex> = order.into_iter().collect();
        Err(graph.node_indices().filter(|n| !placed.contains(n)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::resolve;
    use crate::resource::{Configuration, ResourceSpec};
    use crate::value::Value;

    fn build(config: &Configuration) -> Result<DependencyGraph, ConfigError> {
        DependencyGraph::build(&resolve(config).unwrap())
    }

    fn eks_stack() -> Configuration {
        Configuration::new()
            .resource(ResourceSpec::new("vpc", "aws_vpc").input("cidr_block", "10.0.0.0/16"))
            .resource(
                ResourceSpec::new("subnet_a", "aws_subnet").input("vpc_id", Value::reference("vpc", "id")),
            )
            .resource(
                ResourceSpec::new("subnet_b", "aws_subnet").input("vpc_id", Value::reference("vpc", "id")),
            )
            .resource(
                ResourceSpec::new("cluster", "aws_eks_cluster")
                    .input("subnet_a", Value::reference("subnet_a", "id"))
                    .input("subnet_b", Value::reference("subnet_b", "id")),
            )
            .resource(
                ResourceSpec::new("nodes", "aws_eks_node_group")
                    .input("cluster_name", Value::reference("cluster", "name")),
            )
            .resource(
                ResourceSpec::new("addon", "aws_eks_addon")
                    .input("cluster_name", Value::reference("cluster", "name"))
                    .depends_on("nodes"),
            )
    }

    #[test]
    fn test_order_respects_every_edge() {
        let graph = build(&eks_stack()).unwrap();
        let position = |name: &str| graph.order().iter().position(|n| n == name).unwrap();

        for (dependent, dependency, _) in graph.edges() {
            assert!(
                position(&dependency) < position(&dependent),
                "{dependency} must come before {dependent}"
            );
        }
        assert_eq!(
            graph.order(),
            &["vpc", "subnet_a", "subnet_b", "cluster", "nodes", "addon"]
        );
    }

    #[test]
    fn test_edges_record_their_source() {
        let graph = build(&eks_stack()).unwrap();
        let edges = graph.edges();
        assert!(edges.contains(&("addon".into(), "nodes".into(), EdgeKind::Explicit)));
        assert!(edges.contains(&("addon".into(), "cluster".into(), EdgeKind::Reference)));
    }

    #[test]
    fn test_transitive_closures() {
        let graph = build(&eks_stack()).unwrap();

        let deps: Vec<_> = graph.transitive_dependencies("nodes").into_iter().collect();
        assert_eq!(deps, vec!["cluster", "subnet_a", "subnet_b", "vpc"]);

        let dependents: Vec<_> = graph.transitive_dependents("subnet_a").into_iter().collect();
        assert_eq!(dependents, vec!["addon", "cluster", "nodes"]);

        assert_eq!(graph.dependencies("addon").len(), 2);
        assert!(graph.dependents("addon").is_empty());
    }

    #[test]
    fn test_cycle_names_participants() {
        let config = Configuration::new()
            .resource(ResourceSpec::new("a", "t").input("x", Value::reference("c", "id")))
            .resource(ResourceSpec::new("b", "t").input("x", Value::reference("a", "id")))
            .resource(ResourceSpec::new("c", "t").depends_on("b"))
            .resource(ResourceSpec::new("d", "t"));

        let err = build(&config).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Cycle {
                cycle: vec!["a".into(), "c".into(), "b".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_dangling_and_self_references() {
        let config = Configuration::new()
            .resource(ResourceSpec::new("a", "t").input("x", Value::reference("ghost", "id")));
        assert!(matches!(build(&config), Err(ConfigError::DanglingReference { .. })));

        let config = Configuration::new().resource(ResourceSpec::new("a", "t").depends_on("a"));
        assert!(matches!(build(&config), Err(ConfigError::SelfReference { .. })));
    }

    #[test]
    fn test_reference_to_pruned_resource() {
        let config = Configuration::new()
            .parameter("enable_efs", false)
            .resource(ResourceSpec::new("efs", "aws_efs_file_system").condition("enable_efs"))
            .resource(
                ResourceSpec::new("mount", "aws_efs_mount_target")
                    .input("file_system_id", Value::reference("efs", "id")),
            );

        assert_eq!(
            build(&config).unwrap_err(),
            ConfigError::ConditionallyAbsent {
                resource: "mount".into(),
                target: "efs".into(),
            }
        );
    }

    #[test]
    fn test_dot_output_lists_nodes() {
        let graph = build(&eks_stack()).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("cluster"));
    }
}
