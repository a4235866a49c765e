//! Small `petgraph` helpers shared by manifest verification and the
//! playbook scheduler: cycle detection with cut-candidate reporting, and
//! transitive closure over a dependency graph.

use std::{collections::HashSet, fmt::Display, hash::Hash};

use fixedbitset::FixedBitSet;
use itertools::Itertools;
use petgraph::{
    Direction, Graph,
    visit::{EdgeFiltered, EdgeRef, IntoNeighbors, Reversed, VisitMap, Visitable, depth_first_search},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected:\n{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Nodes reachable from `indices` following edges in `direction`, indices
/// included.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = petgraph::graph::NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();
    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

pub struct Cycle<N> {
    pub nodes: Vec<petgraph::graph::NodeIndex>,
    pub cuts: Vec<HashSet<(N, N)>>,
}

/// Finds strongly-connected components with more than one node (i.e.
/// cycles) and, for each, every minimal set of edges whose removal breaks
/// it.
pub fn cycles_and_cut_candidates<N: Clone + Hash + Eq, E: Clone>(graph: &Graph<N, E>) -> Vec<Cycle<N>> {
    petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|cycle| cycle.len() > 1)
        .map(|nodes| {
            let mut subgraph = graph.clone();
            subgraph.retain_nodes(|_, node| nodes.contains(&node));
            let cuts = edges_to_break_cycle(&subgraph);
            Cycle { nodes, cuts }
        })
        .collect()
}

fn edges_to_break_cycle<N: Clone + Hash + Eq, E: Clone>(graph: &Graph<N, E>) -> Vec<HashSet<(N, N)>> {
    let edge_sets = graph.edge_indices().powerset();
    let mut breaking_edge_sets = Vec::new();
    let mut cycle_detector = CycleDetector::new(graph);
    let mut minimal_break_point = usize::MAX;

    for edge_set in edge_sets {
        let set_size = edge_set.len();
        if set_size > minimal_break_point {
            break;
        }
        let trimmed_graph = EdgeFiltered::from_fn(graph, |edge| !edge_set.contains(&edge.id()));

        if !cycle_detector.has_cycle(&trimmed_graph, trimmed_graph.0.node_indices()) {
            minimal_break_point = set_size;
            breaking_edge_sets.push(
                edge_set
                    .into_iter()
                    .map(|edge| {
                        let (src, dst) = graph.edge_endpoints(edge).unwrap();
                        (
                            graph.node_weight(src).unwrap().clone(),
                            graph.node_weight(dst).unwrap().clone(),
                        )
                    })
                    .collect(),
            );
        }
    }

    breaking_edge_sets
}

/// Validates that `graph` is acyclic and has no self-edges, returning a
/// human-readable error naming the cut candidates otherwise.
pub fn validate_graph<N: Display + Clone + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    let cycles = cycles_and_cut_candidates(graph);

    let cycle_lines = cycles
        .into_iter()
        .map(|Cycle { nodes, cuts }| {
            let members = nodes.into_iter().map(|id| graph.node_weight(id).unwrap());
            let cuts = cuts.into_iter().map(format_cut).format("\n\t");
            format!(
                "\t{}\n\nThe cycle can be broken by removing any of these dependencies:\n\t{cuts}",
                members.format(", ")
            )
        })
        .join("\n");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    Ok(())
}

struct CycleDetector {
    visited: FixedBitSet,
    finished: FixedBitSet,
}

impl CycleDetector {
    fn new<N, E>(graph: &Graph<N, E>) -> CycleDetector {
        CycleDetector {
            visited: graph.visit_map(),
            finished: graph.visit_map(),
        }
    }

    // A fast-failing DFS, reusing visit maps across calls instead of
    // allocating a fresh pair on every candidate edge set.
    fn has_cycle<G, I>(&mut self, graph: G, starts: I) -> bool
    where
        G: IntoNeighbors + Visitable<Map = FixedBitSet>,
        I: IntoIterator<Item = G::NodeId>,
    {
        self.visited.clear();
        self.finished.clear();
        for start in starts {
            if Self::dfs(graph, start, &mut self.visited, &mut self.finished) {
                return true;
            }
        }
        false
    }

    fn dfs<G>(graph: G, u: G::NodeId, visited: &mut G::Map, finished: &mut G::Map) -> bool
    where
        G: IntoNeighbors + Visitable,
    {
        if finished.is_visited(&u) {
            return false;
        }
        if !visited.visit(u) {
            return true;
        }
        for v in graph.neighbors(u) {
            if Self::dfs(graph, v, visited, finished) {
                return true;
            }
        }
        finished.visit(u);
        false
    }
}

fn format_cut<N: Display>(edges: impl IntoIterator<Item = (N, N)>) -> String {
    let edges = edges
        .into_iter()
        .map(|(src, dst)| format!("{src} -> {dst}"))
        .sorted()
        .format(", ");
    format!("{{ {edges} }}")
}

#[cfg(test)]
mod test {
    use petgraph::graph::Graph;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn detects_simple_cycle() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());

        assert!(validate_graph(&g).is_err());
    }

    #[test]
    fn accepts_dag() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn transitive_closure_follows_outgoing_edges() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let closure = transitive_closure(&g, [a], Direction::Outgoing);
        assert_eq!(closure.len(), 3);
        assert!(!closure.contains(&"d"));
        let _ = d;
    }
}
