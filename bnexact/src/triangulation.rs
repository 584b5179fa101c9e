//! Triangulation of the interaction graph into a junction tree skeleton.
use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;

use crate::model::NodeId;
use crate::{BnError, Result};

/// Undirected graph over the variables of a set of potentials: two
/// variables are adjacent iff some potential (or requested joint target)
/// contains both.
#[derive(Debug, Clone, Default)]
pub struct InteractionGraph {
    domain_sizes: BTreeMap<NodeId, usize>,
    neighbours: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl InteractionGraph {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn add_node(&mut self, node: NodeId, domain_size: usize) {
        self.domain_sizes.insert(node, domain_size);
        self.neighbours.entry(node).or_default();
    }
    /// Connects every pair of `nodes`, which must have been added before.
    pub fn add_clique(&mut self, nodes: &[NodeId]) -> Result<()> {
        if let Some(n) = nodes.iter().find(|n| !self.domain_sizes.contains_key(*n)) {
            return Err(BnError::InvalidArgument(format!(
                "node {} is not in the interaction graph",
                n
            )));
        }
        for (a, b) in nodes.iter().tuple_combinations() {
            if a != b {
                self.neighbours.entry(*a).or_default().insert(*b);
                self.neighbours.entry(*b).or_default().insert(*a);
            }
        }
        Ok(())
    }
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.domain_sizes.keys().copied()
    }
    pub fn len(&self) -> usize {
        self.domain_sizes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.domain_sizes.is_empty()
    }
    pub fn contains(&self, node: NodeId) -> bool {
        self.domain_sizes.contains_key(&node)
    }
    pub fn domain_size(&self, node: NodeId) -> Option<usize> {
        self.domain_sizes.get(&node).copied()
    }
    pub fn domain_sizes(&self) -> &BTreeMap<NodeId, usize> {
        &self.domain_sizes
    }
    pub fn neighbours(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.neighbours.get(&node).into_iter().flatten().copied()
    }
}

/// Cliques of a triangulated graph and the (forest) edges between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSkeleton {
    pub cliques: Vec<Vec<NodeId>>,
    pub edges: Vec<(usize, usize)>,
}

/// Produces a junction tree skeleton from an interaction graph.
///
/// Implementations must return cliques covering every edge of the graph and
/// tree edges satisfying the running intersection property.
pub trait Triangulation: Send + Sync + std::fmt::Debug {
    fn triangulate(&self, graph: &InteractionGraph) -> Result<TreeSkeleton>;
}

/// Greedy elimination picking the node that adds the fewest fill-in edges,
/// ties broken by the smallest clique weight (product of domain sizes),
/// then the smallest node id.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinFillTriangulation;

impl MinFillTriangulation {
    /// Maximal cliques created along the elimination.
    fn elimination_cliques(graph: &InteractionGraph) -> Vec<Vec<NodeId>> {
        let mut adjacency: BTreeMap<NodeId, BTreeSet<NodeId>> = graph
            .nodes()
            .map(|n| (n, graph.neighbours(n).collect()))
            .collect();
        let weight = |nodes: &mut dyn Iterator<Item = &NodeId>| -> u128 {
            nodes.fold(1u128, |acc, n| {
                acc.saturating_mul(graph.domain_size(*n).unwrap_or(1) as u128)
            })
        };
        let mut cliques: Vec<BTreeSet<NodeId>> = Vec::new();
        while !adjacency.is_empty() {
            let (_, _, node) = adjacency
                .iter()
                .map(|(n, nbrs)| {
                    let fill = nbrs
                        .iter()
                        .tuple_combinations()
                        .filter(|(a, b)| !adjacency[*a].contains(*b))
                        .count();
                    let w = weight(&mut std::iter::once(n).chain(nbrs.iter()));
                    (fill, w, *n)
                })
                .min()
                .unwrap_or_default();
            let nbrs = adjacency.remove(&node).unwrap_or_default();
            for (a, b) in nbrs.iter().tuple_combinations() {
                adjacency.entry(*a).or_default().insert(*b);
                adjacency.entry(*b).or_default().insert(*a);
            }
            for n in nbrs.iter() {
                if let Some(adj) = adjacency.get_mut(n) {
                    adj.remove(&node);
                }
            }
            let mut clique = nbrs;
            clique.insert(node);
            if !cliques.iter().any(|c| clique.is_subset(c)) {
                cliques.push(clique);
            }
        }
        cliques
            .into_iter()
            .map(|c| c.into_iter().collect())
            .collect()
    }
}

/// Disjoint-set forest with path halving.
pub(crate) struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }
    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }
    /// Returns false if `a` and `b` were already joined.
    pub(crate) fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            false
        } else {
            self.parent[ra.max(rb)] = ra.min(rb);
            true
        }
    }
}

/// Maximum spanning forest of the clique graph weighted by separator size.
/// Cliques sharing no variable are never joined.
pub fn spanning_forest(cliques: &[Vec<NodeId>]) -> Vec<(usize, usize)> {
    let mut candidates: Vec<(usize, usize, usize)> = cliques
        .iter()
        .enumerate()
        .tuple_combinations()
        .filter_map(|((i, ci), (j, cj))| {
            let sep = ci.iter().filter(|v| cj.contains(*v)).count();
            (sep > 0).then_some((sep, i, j))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    let mut uf = UnionFind::new(cliques.len());
    candidates
        .into_iter()
        .filter(|(_, i, j)| uf.union(*i, *j))
        .map(|(_, i, j)| (i, j))
        .collect()
}

impl Triangulation for MinFillTriangulation {
    fn triangulate(&self, graph: &InteractionGraph) -> Result<TreeSkeleton> {
        let cliques = Self::elimination_cliques(graph);
        let edges = spanning_forest(&cliques);
        tracing::trace!(
            nodes = graph.len(),
            cliques = cliques.len(),
            max_clique = cliques.iter().map(Vec::len).max().unwrap_or(0),
            "min-fill triangulation"
        );
        Ok(TreeSkeleton { cliques, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_gets_a_chord() {
        // 0 - 1 - 2 - 3 - 0
        let mut g = InteractionGraph::new();
        for n in 0..4 {
            g.add_node(n, 2);
        }
        for (a, b) in [(0, 1), (1, 2), (2, 3), (3, 0)] {
            g.add_clique(&[a, b]).unwrap();
        }
        let sk = MinFillTriangulation.triangulate(&g).unwrap();
        assert_eq!(sk.cliques.len(), 2);
        assert!(sk.cliques.iter().all(|c| c.len() == 3));
        assert_eq!(sk.edges.len(), 1);
    }

    #[test]
    fn disconnected_graph_gives_forest() {
        let mut g = InteractionGraph::new();
        for n in 0..5 {
            g.add_node(n, 3);
        }
        g.add_clique(&[0, 1]).unwrap();
        g.add_clique(&[1, 2]).unwrap();
        g.add_clique(&[3, 4]).unwrap();
        let sk = MinFillTriangulation.triangulate(&g).unwrap();
        assert_eq!(sk.cliques.len(), 3);
        assert_eq!(sk.edges.len(), 1);
        assert!(g.add_clique(&[0, 7]).is_err());
    }
}
