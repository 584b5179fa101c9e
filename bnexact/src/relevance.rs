//! Selection of the potentials that can influence a query.
//!
//! Two independent mechanisms are available:
//! * barren nodes: nodes that are neither a query, an evidence, nor an
//!   ancestor of one of those. Their CPTs sum to one once their descendants
//!   are summed out, so they can be dropped without changing any result,
//!   evidence probability included.
//! * d-separation (Bayes ball): potentials whose variables are all
//!   d-separated from the query given the evidence only contribute to the
//!   normalization constant of the posteriors.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::{BayesNet, NodeId};

/// How potentials that cannot influence the query are detected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub enum RelevanceFinder {
    /// Keep everything.
    FindAll,
    /// Bayes ball over the nodes: keep the CPTs of the requisite nodes.
    DsepNodes,
    /// Bayes ball tracking every potential: keep those touching a node
    /// reached by the ball.
    #[default]
    DsepTensors,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
pub enum BarrenNodesFinder {
    None,
    #[default]
    FindAll,
}

/// Potentials kept for a query: CPTs and evidence potentials, both
/// identified by their node, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct RelevantPotentials {
    pub cpts: Vec<NodeId>,
    pub evidence: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// The ball arrives from a child (or the node is a query).
    FromChild,
    /// The ball arrives from a parent.
    FromParent,
}

/// Outcome of a ball traversal.
struct Ball {
    /// Nodes reached in any direction.
    visited: Vec<bool>,
    /// Nodes that passed the ball to their parents (requisite CPTs).
    top: Vec<bool>,
}

/// Runs the Bayes ball from `query`.
///
/// `on_visit` is called on the first visit of every node; the traversal
/// stops early when it returns `false`.
fn bounce(
    bn: &BayesNet,
    query: &BTreeSet<NodeId>,
    hard_evidence: &BTreeSet<NodeId>,
    soft_evidence: &BTreeSet<NodeId>,
    mut on_visit: impl FnMut(NodeId) -> bool,
) -> Ball {
    let evidence_ancestors = bn.ancestors(hard_evidence.iter().chain(soft_evidence).copied());
    let mut visited = vec![false; bn.size()];
    let mut top = vec![false; bn.size()];
    // One visited set per direction: a node may be crossed once each way.
    let mut from_child = vec![false; bn.size()];
    let mut from_parent = vec![false; bn.size()];
    let mut queue: VecDeque<(NodeId, Direction)> = query
        .iter()
        .map(|q| (*q, Direction::FromChild))
        .collect();
    while let Some((node, direction)) = queue.pop_front() {
        let seen = match direction {
            Direction::FromChild => &mut from_child,
            Direction::FromParent => &mut from_parent,
        };
        if seen[node] {
            continue;
        }
        seen[node] = true;
        if !visited[node] {
            visited[node] = true;
            if !on_visit(node) {
                break;
            }
        }
        let hard = hard_evidence.contains(&node);
        match direction {
            Direction::FromChild => {
                if !hard {
                    top[node] = true;
                    queue.extend(bn.parents(node).iter().map(|p| (*p, Direction::FromChild)));
                    queue.extend(
                        bn.children(node)
                            .iter()
                            .map(|c| (*c, Direction::FromParent)),
                    );
                }
            }
            Direction::FromParent => {
                if !hard {
                    queue.extend(
                        bn.children(node)
                            .iter()
                            .map(|c| (*c, Direction::FromParent)),
                    );
                }
                if evidence_ancestors.contains(&node) {
                    top[node] = true;
                    queue.extend(bn.parents(node).iter().map(|p| (*p, Direction::FromChild)));
                }
            }
        }
    }
    Ball { visited, top }
}

/// Indices of the potentials (given by their scopes) that are not
/// d-separated from `query` given the evidence.
///
/// Every potential is registered in the bucket of each of its variables.
/// When the ball reaches a node, the potentials of its bucket are known to
/// be relevant and are withdrawn from all the buckets. Whatever is left in
/// the buckets when the ball stops is d-separated from the query.
pub fn dsep_tensors(
    bn: &BayesNet,
    query: &BTreeSet<NodeId>,
    hard_evidence: &BTreeSet<NodeId>,
    soft_evidence: &BTreeSet<NodeId>,
    scopes: &[&[NodeId]],
) -> Vec<usize> {
    let mut index: BTreeMap<NodeId, BTreeSet<usize>> = BTreeMap::new();
    for (pot, scope) in scopes.iter().enumerate() {
        for var in scope.iter() {
            index.entry(*var).or_default().insert(pot);
        }
    }
    bounce(bn, query, hard_evidence, soft_evidence, |node| {
        if let Some(bucket) = index.remove(&node) {
            for pot in bucket {
                for var in scopes[pot].iter().filter(|v| **v != node) {
                    if let Some(other) = index.get_mut(var) {
                        other.remove(&pot);
                        if other.is_empty() {
                            index.remove(var);
                        }
                    }
                }
            }
        }
        // Once the index is empty, nothing can be pruned anymore.
        !index.is_empty()
    });
    let pruned: BTreeSet<usize> = index.into_values().flatten().collect();
    (0..scopes.len()).filter(|p| !pruned.contains(p)).collect()
}

/// Requisite nodes: CPTs of the nodes that passed the ball to their
/// parents, evidence of the nodes the ball reached.
pub fn dsep_nodes(
    bn: &BayesNet,
    query: &BTreeSet<NodeId>,
    hard_evidence: &BTreeSet<NodeId>,
    soft_evidence: &BTreeSet<NodeId>,
) -> (BTreeSet<NodeId>, BTreeSet<NodeId>) {
    let ball = bounce(bn, query, hard_evidence, soft_evidence, |_| true);
    let cpts = bn.nodes().filter(|n| ball.top[*n]).collect();
    let visited = bn.nodes().filter(|n| ball.visited[*n]).collect();
    (cpts, visited)
}

/// Nodes whose CPT is not barren: ancestors of the query and evidence
/// nodes, themselves included.
pub fn non_barren_nodes(
    bn: &BayesNet,
    query: &BTreeSet<NodeId>,
    evidence: impl IntoIterator<Item = NodeId>,
) -> BTreeSet<NodeId> {
    bn.ancestors(query.iter().copied().chain(evidence))
}

/// Potentials needed to answer queries on `query` given the evidence
/// (evidence nodes are split between hard and soft).
pub fn find_relevant(
    bn: &BayesNet,
    finder: RelevanceFinder,
    barren: BarrenNodesFinder,
    query: &BTreeSet<NodeId>,
    hard_evidence: &BTreeSet<NodeId>,
    soft_evidence: &BTreeSet<NodeId>,
) -> RelevantPotentials {
    let evidence: Vec<NodeId> = hard_evidence.union(soft_evidence).copied().collect();
    let cpts: Vec<NodeId> = match barren {
        BarrenNodesFinder::None => bn.nodes().collect(),
        BarrenNodesFinder::FindAll => non_barren_nodes(bn, query, evidence.iter().copied())
            .into_iter()
            .collect(),
    };
    let relevant = match finder {
        RelevanceFinder::FindAll => RelevantPotentials { cpts, evidence },
        RelevanceFinder::DsepNodes => {
            let (requisite, visited) = dsep_nodes(bn, query, hard_evidence, soft_evidence);
            RelevantPotentials {
                cpts: cpts.into_iter().filter(|n| requisite.contains(n)).collect(),
                evidence: evidence
                    .into_iter()
                    .filter(|n| visited.contains(n))
                    .collect(),
            }
        }
        RelevanceFinder::DsepTensors => {
            let ev_scopes: Vec<[NodeId; 1]> = evidence.iter().map(|n| [*n]).collect();
            let scopes: Vec<&[NodeId]> = cpts
                .iter()
                .map(|n| bn.cpt(*n).scope())
                .chain(ev_scopes.iter().map(|s| s.as_slice()))
                .collect();
            let kept = dsep_tensors(bn, query, hard_evidence, soft_evidence, &scopes);
            let n_cpts = cpts.len();
            RelevantPotentials {
                cpts: kept
                    .iter()
                    .filter(|i| **i < n_cpts)
                    .map(|i| cpts[*i])
                    .collect(),
                evidence: kept
                    .iter()
                    .filter(|i| **i >= n_cpts)
                    .map(|i| evidence[*i - n_cpts])
                    .collect(),
            }
        }
    };
    tracing::debug!(
        kept_cpts = relevant.cpts.len(),
        kept_evidence = relevant.evidence.len(),
        total_cpts = bn.size(),
        ?finder,
        "relevant potentials selected"
    );
    relevant
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BayesNetBuilder, Variable};

    /// a -> b -> c, d -> b
    fn small_net() -> BayesNet {
        let mut builder = BayesNetBuilder::new();
        for name in ["a", "b", "c", "d"] {
            builder
                .add_variable(Variable::with_size(name, 2).unwrap())
                .unwrap();
        }
        builder.add_arc(0, 1).unwrap();
        builder.add_arc(3, 1).unwrap();
        builder.add_arc(1, 2).unwrap();
        builder.set_cpt(0, vec![0.4, 0.6]).unwrap();
        builder.set_cpt(3, vec![0.1, 0.9]).unwrap();
        builder
            .set_cpt(1, vec![0.2, 0.3, 0.4, 0.5, 0.8, 0.7, 0.6, 0.5])
            .unwrap();
        builder.set_cpt(2, vec![0.3, 0.9, 0.7, 0.1]).unwrap();
        builder.build().unwrap()
    }

    fn set(nodes: &[NodeId]) -> BTreeSet<NodeId> {
        nodes.iter().copied().collect()
    }

    #[test]
    fn explaining_away_needs_evidence() {
        let bn = small_net();
        // Without evidence, d is independent of a.
        let r = find_relevant(
            &bn,
            RelevanceFinder::DsepTensors,
            BarrenNodesFinder::FindAll,
            &set(&[0]),
            &set(&[]),
            &set(&[]),
        );
        assert_eq!(r.cpts, vec![0]);
        // Observing the common child b connects them.
        let r = find_relevant(
            &bn,
            RelevanceFinder::DsepTensors,
            BarrenNodesFinder::FindAll,
            &set(&[0]),
            &set(&[1]),
            &set(&[]),
        );
        assert_eq!(r.cpts, vec![0, 1, 3]);
        assert_eq!(r.evidence, vec![1]);
        let r = find_relevant(
            &bn,
            RelevanceFinder::DsepNodes,
            BarrenNodesFinder::FindAll,
            &set(&[0]),
            &set(&[1]),
            &set(&[]),
        );
        assert_eq!(r.cpts, vec![0, 1, 3]);
    }

    #[test]
    fn hard_evidence_blocks_chain() {
        let bn = small_net();
        // c given b is independent of a and d.
        let r = find_relevant(
            &bn,
            RelevanceFinder::DsepNodes,
            BarrenNodesFinder::None,
            &set(&[2]),
            &set(&[1]),
            &set(&[]),
        );
        assert_eq!(r.cpts, vec![2]);
        assert_eq!(r.evidence, vec![1]);
        // Soft evidence does not block.
        let r = find_relevant(
            &bn,
            RelevanceFinder::DsepNodes,
            BarrenNodesFinder::None,
            &set(&[2]),
            &set(&[]),
            &set(&[1]),
        );
        assert_eq!(r.cpts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_query_prunes_everything() {
        let bn = small_net();
        let scopes: Vec<&[NodeId]> = bn.nodes().map(|n| bn.cpt(n).scope()).collect();
        let kept = dsep_tensors(&bn, &set(&[]), &set(&[2]), &set(&[]), &scopes);
        assert!(kept.is_empty());
    }
}
