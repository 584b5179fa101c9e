use std::collections::{BTreeSet, VecDeque};

use indexmap::IndexMap;

use crate::potential::Potential;
use crate::{BnError, Result};

pub type NodeId = usize;

type NamedList<T> = IndexMap<String, T>;

/// Largest joint table [`BayesNet::brute_force_joint`] accepts.
const MAX_BRUTE_FORCE_STATES: usize = 1 << 22;

/// Tolerance on the normalization of CPT columns.
const CPT_TOLERANCE: f64 = 1e-6;

/// A discrete random variable with an ordered, non-empty list of labels.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Variable {
    name: String,
    labels: Vec<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>, labels: Vec<String>) -> Result<Self> {
        let name = name.into();
        if labels.is_empty() {
            return Err(BnError::InvalidArgument(format!(
                "variable {} has an empty domain",
                name
            )));
        }
        Ok(Self { name, labels })
    }
    /// Variable with labels "0", "1", ..., "size - 1".
    pub fn with_size(name: impl Into<String>, size: usize) -> Result<Self> {
        Self::new(name, (0..size).map(|i| i.to_string()).collect())
    }
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
    pub fn labels(&self) -> &[String] {
        self.labels.as_slice()
    }
    pub fn domain_size(&self) -> usize {
        self.labels.len()
    }
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }
}

/// A DAG of discrete variables, each node carrying the CPT
/// P(node | parents) with scope `[node, parents...]`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "BayesNetRepr", into = "BayesNetRepr")]
pub struct BayesNet {
    variables: NamedList<Variable>,
    parents: Vec<Vec<NodeId>>,
    children: Vec<Vec<NodeId>>,
    cpts: Vec<Potential>,
    topological_order: Vec<NodeId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct BayesNetRepr {
    variables: Vec<Variable>,
    parents: Vec<Vec<NodeId>>,
    /// Row-major CPT values, node axis first.
    cpts: Vec<Vec<f64>>,
}

impl TryFrom<BayesNetRepr> for BayesNet {
    type Error = BnError;
    fn try_from(repr: BayesNetRepr) -> Result<Self> {
        if repr.parents.len() != repr.variables.len() || repr.cpts.len() != repr.variables.len()
        {
            return Err(BnError::InvalidArgument(
                "one parent list and one CPT per variable are required".to_owned(),
            ));
        }
        let mut builder = BayesNetBuilder::new();
        for var in repr.variables {
            builder.add_variable(var)?;
        }
        for (child, parents) in repr.parents.iter().enumerate() {
            for parent in parents {
                builder.add_arc(*parent, child)?;
            }
        }
        for (node, values) in repr.cpts.into_iter().enumerate() {
            builder.set_cpt(node, values)?;
        }
        builder.build()
    }
}

impl From<BayesNet> for BayesNetRepr {
    fn from(bn: BayesNet) -> Self {
        let cpts = bn
            .cpts
            .iter()
            .map(|cpt| cpt.values().as_standard_layout().iter().copied().collect())
            .collect();
        Self {
            variables: bn.variables.into_values().collect(),
            parents: bn.parents,
            cpts,
        }
    }
}

impl BayesNet {
    pub fn size(&self) -> usize {
        self.variables.len()
    }
    pub fn nodes(&self) -> std::ops::Range<NodeId> {
        0..self.size()
    }
    pub fn contains(&self, node: NodeId) -> bool {
        node < self.size()
    }

    /// # Panics
    /// If `node` is not a node of the network.
    pub fn variable(&self, node: NodeId) -> &Variable {
        &self.variables[node]
    }
    /// # Panics
    /// If `node` is not a node of the network.
    pub fn domain_size(&self, node: NodeId) -> usize {
        self.variables[node].domain_size()
    }
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.variables.get_index_of(name)
    }
    /// # Panics
    /// If `node` is not a node of the network.
    pub fn parents(&self, node: NodeId) -> &[NodeId] {
        self.parents[node].as_slice()
    }
    /// # Panics
    /// If `node` is not a node of the network.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.children[node].as_slice()
    }
    /// # Panics
    /// If `node` is not a node of the network.
    pub fn cpt(&self, node: NodeId) -> &Potential {
        &self.cpts[node]
    }
    pub fn topological_order(&self) -> &[NodeId] {
        self.topological_order.as_slice()
    }

    /// All ancestors of `nodes`, the nodes themselves included.
    pub fn ancestors(&self, nodes: impl IntoIterator<Item = NodeId>) -> BTreeSet<NodeId> {
        let mut res = BTreeSet::new();
        let mut stack: Vec<NodeId> = nodes.into_iter().collect();
        while let Some(node) = stack.pop() {
            if res.insert(node) {
                stack.extend(self.parents(node).iter().copied());
            }
        }
        res
    }

    /// Product of every CPT and of the given evidence potentials, without
    /// normalization. Only meant for small networks (reference computations).
    pub fn brute_force_joint<'a>(
        &self,
        evidence: impl IntoIterator<Item = &'a Potential>,
    ) -> Result<Potential> {
        let states = self
            .nodes()
            .try_fold(1usize, |acc, n| acc.checked_mul(self.domain_size(n)))
            .filter(|s| *s <= MAX_BRUTE_FORCE_STATES);
        if states.is_none() {
            return Err(BnError::InvalidArgument(
                "network too large for a brute-force joint".to_owned(),
            ));
        }
        let joint = Potential::product_all(self.cpts.iter())?;
        evidence.into_iter().try_fold(joint, |acc, e| acc.product(e))
    }
}

/// Incremental construction of a [`BayesNet`].
///
/// Variables get consecutive [`NodeId`]s in insertion order. The parents of
/// a node are ordered as their arcs were added, which fixes the axis order
/// of its CPT.
#[derive(Debug, Clone, Default)]
pub struct BayesNetBuilder {
    variables: NamedList<Variable>,
    parents: Vec<Vec<NodeId>>,
    cpts: Vec<Option<Potential>>,
}

impl BayesNetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node < self.variables.len() {
            Ok(())
        } else {
            Err(BnError::InvalidArgument(format!("unknown node {}", node)))
        }
    }

    pub fn add_variable(&mut self, var: Variable) -> Result<NodeId> {
        if self.variables.contains_key(var.name()) {
            return Err(BnError::DuplicateVariable(var.name().to_owned()));
        }
        let id = self.variables.len();
        self.variables.insert(var.name().to_owned(), var);
        self.parents.push(Vec::new());
        self.cpts.push(None);
        Ok(id)
    }

    /// Adds `parent -> child`. Any CPT already set for `child` is dropped.
    pub fn add_arc(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_node(parent)?;
        self.check_node(child)?;
        if parent == child {
            return Err(BnError::NotAcyclic(format!(
                "self-loop on {}",
                self.variables[child].name()
            )));
        }
        if self.parents[child].contains(&parent) {
            return Err(BnError::InvalidArgument(format!(
                "arc {} -> {} added twice",
                parent, child
            )));
        }
        self.parents[child].push(parent);
        self.cpts[child] = None;
        Ok(())
    }

    fn cpt_scope(&self, node: NodeId) -> (Vec<NodeId>, Vec<usize>) {
        let scope: Vec<NodeId> = std::iter::once(node)
            .chain(self.parents[node].iter().copied())
            .collect();
        let shape = scope
            .iter()
            .map(|n| self.variables[*n].domain_size())
            .collect();
        (scope, shape)
    }

    /// Sets P(node | parents) from row-major values over
    /// `[node, parents...]`.
    pub fn set_cpt(&mut self, node: NodeId, values: Vec<f64>) -> Result<()> {
        self.check_node(node)?;
        let (scope, shape) = self.cpt_scope(node);
        let cpt = Potential::from_vec(scope, &shape, values)?;
        self.set_cpt_potential(node, cpt)
    }

    /// Sets P(node | parents) from a potential whose scope is the node and
    /// its parents, in any order.
    pub fn set_cpt_potential(&mut self, node: NodeId, cpt: Potential) -> Result<()> {
        self.check_node(node)?;
        let (scope, shape) = self.cpt_scope(node);
        let cpt = cpt.reorder(&scope)?;
        if cpt.shape() != shape.as_slice() {
            return Err(BnError::ShapeMismatch {
                expected: shape,
                got: cpt.shape().to_vec(),
            });
        }
        let sums = cpt.sum_out(&[node]);
        if sums.values().iter().any(|s| (s - 1.0).abs() > CPT_TOLERANCE) {
            return Err(BnError::InvalidArgument(format!(
                "CPT of {} does not sum to one for every parent assignment",
                self.variables[node].name()
            )));
        }
        self.cpts[node] = Some(cpt);
        Ok(())
    }

    pub fn build(self) -> Result<BayesNet> {
        let n = self.variables.len();
        let mut children = vec![Vec::new(); n];
        for (child, parents) in self.parents.iter().enumerate() {
            for parent in parents {
                children[*parent].push(child);
            }
        }
        // Kahn's algorithm
        let mut in_degree: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut queue: VecDeque<NodeId> = (0..n).filter(|i| in_degree[*i] == 0).collect();
        let mut topological_order = Vec::with_capacity(n);
        while let Some(node) = queue.pop_front() {
            topological_order.push(node);
            for child in &children[node] {
                in_degree[*child] -= 1;
                if in_degree[*child] == 0 {
                    queue.push_back(*child);
                }
            }
        }
        if topological_order.len() != n {
            let in_cycle = (0..n).find(|i| in_degree[*i] != 0).unwrap_or_default();
            return Err(BnError::NotAcyclic(format!(
                "{} lies on a directed cycle",
                self.variables[in_cycle].name()
            )));
        }
        let cpts = self
            .cpts
            .into_iter()
            .enumerate()
            .map(|(node, cpt)| {
                cpt.ok_or_else(|| {
                    BnError::InvalidArgument(format!(
                        "no CPT for {}",
                        self.variables[node].name()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BayesNet {
            variables: self.variables,
            parents: self.parents,
            children,
            cpts,
            topological_order,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_cycles_and_bad_cpts() {
        let mut b = BayesNetBuilder::new();
        let a = b.add_variable(Variable::with_size("a", 2).unwrap()).unwrap();
        let c = b.add_variable(Variable::with_size("c", 2).unwrap()).unwrap();
        assert!(matches!(
            b.add_variable(Variable::with_size("a", 3).unwrap()),
            Err(BnError::DuplicateVariable(_))
        ));
        b.add_arc(a, c).unwrap();
        assert!(b.set_cpt(c, vec![0.5, 0.5, 0.5, 0.4]).is_err());
        b.set_cpt(a, vec![0.3, 0.7]).unwrap();
        b.set_cpt(c, vec![0.9, 0.2, 0.1, 0.8]).unwrap();
        let mut cyclic = b.clone();
        cyclic.add_arc(c, a).unwrap();
        assert!(matches!(cyclic.build(), Err(BnError::NotAcyclic(_))));
        let bn = b.build().unwrap();
        assert_eq!(bn.children(a), &[c]);
        assert_eq!(bn.topological_order(), &[a, c]);
        assert_eq!(bn.ancestors([c]), BTreeSet::from([a, c]));
    }

    #[test]
    #[should_panic]
    fn unknown_nodes_panic_in_accessors() {
        let mut b = BayesNetBuilder::new();
        let a = b.add_variable(Variable::with_size("a", 2).unwrap()).unwrap();
        b.set_cpt(a, vec![0.5, 0.5]).unwrap();
        let bn = b.build().unwrap();
        assert!(!bn.contains(1));
        bn.cpt(1);
    }

    #[test]
    fn missing_cpt() {
        let mut b = BayesNetBuilder::new();
        b.add_variable(Variable::with_size("a", 2).unwrap()).unwrap();
        assert!(matches!(b.build(), Err(BnError::InvalidArgument(_))));
    }
}
