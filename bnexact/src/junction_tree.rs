//! Junction tree built from a triangulation skeleton.
//!
//! The tree is in fact a forest: one rooted tree per connected component of
//! the interaction graph. Every clique keeps its variables sorted. Each
//! undirected edge owns two message slots, one per direction.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::NodeId;
use crate::triangulation::{TreeSkeleton, UnionFind};
use crate::{BnError, Result};

pub type CliqueId = usize;

#[derive(Debug, Clone)]
pub struct JunctionTree {
    cliques: Vec<Vec<NodeId>>,
    neighbours: Vec<Vec<CliqueId>>,
    /// Undirected edges as (smaller id, larger id), sorted.
    edges: Vec<(CliqueId, CliqueId)>,
    separators: Vec<Vec<NodeId>>,
    edge_index: BTreeMap<(CliqueId, CliqueId), usize>,
    roots: Vec<CliqueId>,
    parent: Vec<Option<CliqueId>>,
    depth: Vec<usize>,
    component: Vec<usize>,
    /// Cliques in breadth-first order, component after component.
    bfs_order: Vec<CliqueId>,
    /// Cliques grouped by depth, every component merged.
    levels: Vec<Vec<CliqueId>>,
    domain_sizes: BTreeMap<NodeId, usize>,
}

impl JunctionTree {
    /// Validates a skeleton and roots each of its components at its
    /// smallest clique index.
    ///
    /// A skeleton that is not a forest, or that breaks the running
    /// intersection property, is a broken triangulation.
    pub fn from_skeleton(
        skeleton: TreeSkeleton,
        domain_sizes: &BTreeMap<NodeId, usize>,
    ) -> Result<Self> {
        let TreeSkeleton {
            cliques,
            edges: raw_edges,
        } = skeleton;
        let n = cliques.len();
        let cliques: Vec<Vec<NodeId>> = cliques
            .into_iter()
            .map(|mut c| {
                c.sort_unstable();
                c.dedup();
                c
            })
            .collect();
        let mut sizes = BTreeMap::new();
        for var in cliques.iter().flatten() {
            let size = domain_sizes.get(var).ok_or_else(|| {
                BnError::InvalidTriangulation(format!("variable {} has no known domain", var))
            })?;
            sizes.insert(*var, *size);
        }

        let mut uf = UnionFind::new(n);
        let mut edges = Vec::with_capacity(raw_edges.len());
        let mut neighbours = vec![Vec::new(); n];
        for (a, b) in raw_edges {
            if a >= n || b >= n || a == b {
                return Err(BnError::InvalidTriangulation(format!(
                    "invalid edge ({}, {}) for {} cliques",
                    a, b, n
                )));
            }
            if !uf.union(a, b) {
                return Err(BnError::InvalidTriangulation(format!(
                    "edge ({}, {}) closes a cycle",
                    a, b
                )));
            }
            edges.push((a.min(b), a.max(b)));
            neighbours[a].push(b);
            neighbours[b].push(a);
        }
        edges.sort_unstable();
        for nbrs in neighbours.iter_mut() {
            nbrs.sort_unstable();
        }
        let separators = edges
            .iter()
            .map(|(a, b)| {
                cliques[*a]
                    .iter()
                    .filter(|v| cliques[*b].binary_search(*v).is_ok())
                    .copied()
                    .collect()
            })
            .collect();
        let edge_index = edges.iter().enumerate().map(|(i, e)| (*e, i)).collect();

        let mut parent = vec![None; n];
        let mut depth = vec![0; n];
        let mut component = vec![usize::MAX; n];
        let mut roots = Vec::new();
        let mut bfs_order = Vec::with_capacity(n);
        for start in 0..n {
            if component[start] != usize::MAX {
                continue;
            }
            let comp = roots.len();
            roots.push(start);
            component[start] = comp;
            let mut queue = VecDeque::from([start]);
            while let Some(c) = queue.pop_front() {
                bfs_order.push(c);
                for nb in neighbours[c].iter() {
                    if component[*nb] == usize::MAX {
                        component[*nb] = comp;
                        parent[*nb] = Some(c);
                        depth[*nb] = depth[c] + 1;
                        queue.push_back(*nb);
                    }
                }
            }
        }

        let mut levels: Vec<Vec<CliqueId>> = Vec::new();
        for c in bfs_order.iter() {
            if levels.len() <= depth[*c] {
                levels.resize_with(depth[*c] + 1, Vec::new);
            }
            levels[depth[*c]].push(*c);
        }

        let tree = Self {
            cliques,
            neighbours,
            edges,
            separators,
            edge_index,
            roots,
            parent,
            depth,
            component,
            bfs_order,
            levels,
            domain_sizes: sizes,
        };
        if let Some(var) = tree.running_intersection_violation() {
            return Err(BnError::InvalidTriangulation(format!(
                "the cliques containing {} are not connected",
                var
            )));
        }
        tracing::debug!(
            cliques = tree.nb_cliques(),
            components = tree.roots.len(),
            "junction tree built"
        );
        Ok(tree)
    }

    /// A variable whose cliques do not form a connected subtree, if any.
    fn running_intersection_violation(&self) -> Option<NodeId> {
        // In a forest, k cliques form a subtree iff k - 1 edges join them.
        self.domain_sizes.keys().copied().find(|var| {
            let k = self.cliques_containing(*var).count();
            let e = self
                .separators
                .iter()
                .filter(|s| s.binary_search(var).is_ok())
                .count();
            k > 0 && e + 1 != k
        })
    }

    pub fn has_running_intersection(&self) -> bool {
        self.running_intersection_violation().is_none()
    }

    /// Clique hosting a potential over `scope`: among the cliques covering
    /// it, the closest to its root, then the smallest index.
    pub fn anchor(&self, scope: &[NodeId]) -> Result<CliqueId> {
        self.covering(scope)
            .min_by_key(|c| (self.depth[*c], *c))
            .ok_or_else(|| {
                BnError::InvalidTriangulation(format!("no clique covers the scope {:?}", scope))
            })
    }

    /// Smallest clique containing every variable of `vars`.
    pub fn covering_clique(&self, vars: &[NodeId]) -> Option<CliqueId> {
        self.covering(vars)
            .min_by_key(|c| (self.cliques[*c].len(), *c))
    }

    fn covering<'a>(&'a self, vars: &'a [NodeId]) -> impl Iterator<Item = CliqueId> + 'a {
        (0..self.nb_cliques()).filter(move |c| {
            vars.iter()
                .all(|v| self.cliques[*c].binary_search(v).is_ok())
        })
    }

    pub fn cliques_containing(&self, var: NodeId) -> impl Iterator<Item = CliqueId> + '_ {
        (0..self.nb_cliques()).filter(move |c| self.cliques[*c].binary_search(&var).is_ok())
    }

    /// Cliques on the tree path from `from` to `to`, both included.
    /// `None` if they lie in different components.
    pub fn path(&self, from: CliqueId, to: CliqueId) -> Option<Vec<CliqueId>> {
        if self.component.get(from)? != self.component.get(to)? {
            return None;
        }
        let (mut x, mut y) = (from, to);
        let mut up = Vec::new();
        let mut down = Vec::new();
        while self.depth[x] > self.depth[y] {
            up.push(x);
            x = self.parent[x]?;
        }
        while self.depth[y] > self.depth[x] {
            down.push(y);
            y = self.parent[y]?;
        }
        while x != y {
            up.push(x);
            down.push(y);
            x = self.parent[x]?;
            y = self.parent[y]?;
        }
        up.push(x);
        up.extend(down.into_iter().rev());
        Some(up)
    }

    /// Smallest connected set of cliques containing all of `cliques`,
    /// listed so that every clique but the first has its parent before it.
    /// `None` if they span several components.
    pub fn spanning_subtree(&self, cliques: &[CliqueId]) -> Option<Vec<CliqueId>> {
        let (first, rest) = cliques.split_first()?;
        let mut members: BTreeSet<CliqueId> = BTreeSet::from([*first]);
        for c in rest {
            members.extend(self.path(*first, *c)?);
        }
        Some(
            self.bfs_order
                .iter()
                .copied()
                .filter(|c| members.contains(c))
                .collect(),
        )
    }

    /// Slot of the message travelling from `from` to its neighbour `to`.
    pub fn edge_slot(&self, from: CliqueId, to: CliqueId) -> Option<usize> {
        self.edge_index
            .get(&(from.min(to), from.max(to)))
            .map(|e| 2 * e + usize::from(from > to))
    }

    pub fn nb_edge_slots(&self) -> usize {
        2 * self.edges.len()
    }

    pub fn separator(&self, a: CliqueId, b: CliqueId) -> Option<&[NodeId]> {
        self.edge_index
            .get(&(a.min(b), a.max(b)))
            .map(|e| self.separators[*e].as_slice())
    }

    pub fn nb_cliques(&self) -> usize {
        self.cliques.len()
    }
    pub fn clique(&self, c: CliqueId) -> &[NodeId] {
        self.cliques[c].as_slice()
    }
    pub fn cliques(&self) -> &[Vec<NodeId>] {
        self.cliques.as_slice()
    }
    pub fn edges(&self) -> &[(CliqueId, CliqueId)] {
        self.edges.as_slice()
    }
    pub fn neighbours(&self, c: CliqueId) -> &[CliqueId] {
        self.neighbours[c].as_slice()
    }
    pub fn children(&self, c: CliqueId) -> impl Iterator<Item = CliqueId> + '_ {
        let parent = self.parent[c];
        self.neighbours[c]
            .iter()
            .copied()
            .filter(move |n| Some(*n) != parent)
    }
    pub fn parent(&self, c: CliqueId) -> Option<CliqueId> {
        self.parent[c]
    }
    pub fn depth(&self, c: CliqueId) -> usize {
        self.depth[c]
    }
    pub fn roots(&self) -> &[CliqueId] {
        self.roots.as_slice()
    }
    pub fn nb_components(&self) -> usize {
        self.roots.len()
    }
    pub fn component(&self, c: CliqueId) -> usize {
        self.component[c]
    }
    pub fn bfs_order(&self) -> &[CliqueId] {
        self.bfs_order.as_slice()
    }
    /// `levels()[d]` holds the cliques at depth `d` of their component.
    pub fn levels(&self) -> &[Vec<CliqueId>] {
        self.levels.as_slice()
    }
    pub fn contains(&self, var: NodeId) -> bool {
        self.domain_sizes.contains_key(&var)
    }
    pub fn domain_size(&self, var: NodeId) -> Option<usize> {
        self.domain_sizes.get(&var).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(n: usize) -> BTreeMap<NodeId, usize> {
        (0..n).map(|v| (v, 2)).collect()
    }

    /// {0,1} - {1,2} - {2,3}, plus an isolated {4}.
    fn chain() -> JunctionTree {
        let skeleton = TreeSkeleton {
            cliques: vec![vec![1, 0], vec![2, 1], vec![3, 2], vec![4]],
            edges: vec![(1, 0), (1, 2)],
        };
        JunctionTree::from_skeleton(skeleton, &sizes(5)).unwrap()
    }

    #[test]
    fn rooting_and_paths() {
        let jt = chain();
        assert_eq!(jt.roots(), &[0, 3]);
        assert_eq!(jt.clique(1), &[1, 2]);
        assert_eq!(jt.depth(2), 2);
        assert_eq!(jt.levels(), &[vec![0, 3], vec![1], vec![2]]);
        assert_eq!(jt.path(2, 0), Some(vec![2, 1, 0]));
        assert_eq!(jt.path(0, 3), None);
        assert_eq!(jt.separator(2, 1), Some([2].as_slice()));
        assert_ne!(jt.edge_slot(0, 1), jt.edge_slot(1, 0));
        assert_eq!(jt.spanning_subtree(&[2, 0]), Some(vec![0, 1, 2]));
    }

    #[test]
    fn anchoring_prefers_shallow_cliques() {
        let jt = chain();
        assert_eq!(jt.anchor(&[1]).unwrap(), 0);
        assert_eq!(jt.anchor(&[2]).unwrap(), 1);
        assert_eq!(jt.covering_clique(&[3]), Some(2));
        assert!(matches!(
            jt.anchor(&[0, 3]),
            Err(BnError::InvalidTriangulation(_))
        ));
    }

    #[test]
    fn broken_skeletons_are_rejected() {
        let no_rip = TreeSkeleton {
            cliques: vec![vec![0, 1], vec![2], vec![1, 3]],
            edges: vec![(0, 1), (1, 2)],
        };
        assert!(matches!(
            JunctionTree::from_skeleton(no_rip, &sizes(4)),
            Err(BnError::InvalidTriangulation(_))
        ));
        let cyclic = TreeSkeleton {
            cliques: vec![vec![0], vec![0], vec![0]],
            edges: vec![(0, 1), (1, 2), (2, 0)],
        };
        assert!(JunctionTree::from_skeleton(cyclic, &sizes(1)).is_err());
        let unknown = TreeSkeleton {
            cliques: vec![vec![9]],
            edges: vec![],
        };
        assert!(JunctionTree::from_skeleton(unknown, &sizes(1)).is_err());
    }
}
