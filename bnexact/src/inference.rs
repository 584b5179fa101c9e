//! Exact inference engine: targets, evidence and cached propagations.
//!
//! Three propagations are kept, each on its own junction tree:
//! * posteriors, on the potentials relevant to the targets;
//! * evidence probability, on the evidence and its ancestors;
//! * most probable explanation, on every potential, in the log2 domain.
//!
//! A propagation is rebuilt only when the set of potentials it needs
//! changes. When only evidence values change, the affected messages are
//! cleared and recomputed on the existing tree.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::junction_tree::JunctionTree;
use crate::model::{BayesNet, NodeId};
use crate::potential::{Assignment, Potential};
use crate::propagation::{Mode, Propagator};
use crate::relevance::{self, BarrenNodesFinder, RelevanceFinder, RelevantPotentials};
use crate::scheduler::{self, Scheduler};
use crate::triangulation::{InteractionGraph, MinFillTriangulation, Triangulation};
use crate::{BnError, Config, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Posterior,
    Evidence,
    Mpe,
}

impl Slot {
    fn index(self) -> usize {
        match self {
            Slot::Posterior => 0,
            Slot::Evidence => 1,
            Slot::Mpe => 2,
        }
    }
    fn mode(self) -> Mode {
        match self {
            Slot::Posterior | Slot::Evidence => Mode::Sum,
            Slot::Mpe => Mode::Max,
        }
    }
}

/// What determines the shape of a junction tree.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StructureKey {
    relevant: RelevantPotentials,
    extra_cliques: Vec<Vec<NodeId>>,
}

#[derive(Debug)]
struct CachedPropagation {
    key: StructureKey,
    propagator: Propagator,
    /// Evidence node -> index of its potential in the propagator, and the
    /// value currently anchored.
    evidence_slots: BTreeMap<NodeId, (usize, Arc<Potential>)>,
}

impl CachedPropagation {
    /// Pushes the evidence values that changed since the last propagation,
    /// then propagates.
    fn sync(
        &mut self,
        evidence: &BTreeMap<NodeId, Arc<Potential>>,
        pool: &rayon::ThreadPool,
    ) -> Result<()> {
        for (node, (idx, anchored)) in self.evidence_slots.iter_mut() {
            let latest = evidence.get(node).ok_or_else(|| {
                BnError::UndefinedElement(format!("no evidence on node {}", node))
            })?;
            if !Arc::ptr_eq(anchored, latest) {
                if **anchored != **latest {
                    self.propagator
                        .update_potential(*idx, latest.as_ref().clone())?;
                }
                *anchored = latest.clone();
            }
        }
        self.propagator.propagate(pool)
    }
}

/// Exact inference over a [`BayesNet`] by junction tree propagation, with
/// relevance pruning and lazy recomputation.
///
/// The queries (`posterior`, `joint_posterior`, `evidence_probability`,
/// `mpe`, ...) run whatever propagation they need; [`Self::make_inference`]
/// can be used to run the posterior propagation ahead of time.
#[derive(Debug)]
pub struct LazyInference {
    bn: Arc<BayesNet>,
    config: Config,
    triangulation: Arc<dyn Triangulation>,
    targets: BTreeSet<NodeId>,
    joint_targets: Vec<BTreeSet<NodeId>>,
    evidence: BTreeMap<NodeId, Arc<Potential>>,
    scheduler: Scheduler,
    caches: [Option<CachedPropagation>; 3],
}

impl LazyInference {
    pub fn new(bn: Arc<BayesNet>) -> Self {
        Self::with_config(bn, Config::default())
    }

    pub fn with_config(bn: Arc<BayesNet>, config: Config) -> Self {
        Self {
            bn,
            config,
            triangulation: Arc::new(MinFillTriangulation),
            targets: BTreeSet::new(),
            joint_targets: Vec::new(),
            evidence: BTreeMap::new(),
            scheduler: Scheduler::new(),
            caches: Default::default(),
        }
    }

    pub fn bn(&self) -> &BayesNet {
        &self.bn
    }
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn clear_caches(&mut self) {
        self.caches = Default::default();
    }

    pub fn set_triangulation(&mut self, triangulation: Arc<dyn Triangulation>) {
        self.triangulation = triangulation;
        self.clear_caches();
    }
    pub fn set_relevance_finder(&mut self, finder: RelevanceFinder) {
        self.config.relevance = finder;
        self.clear_caches();
    }
    pub fn set_barren_nodes_finder(&mut self, finder: BarrenNodesFinder) {
        self.config.barren_nodes = finder;
        self.clear_caches();
    }
    pub fn set_max_joint_states(&mut self, max_joint_states: usize) {
        self.config.max_joint_states = max_joint_states;
    }

    /// 0 adopts the process-wide default (see
    /// [`crate::set_default_number_of_threads`]).
    pub fn set_number_of_threads(&mut self, threads: usize) {
        self.config.threads = threads;
    }
    /// Number of threads the next propagation will use.
    pub fn number_of_threads(&self) -> usize {
        scheduler::resolve(self.config.threads)
    }
    pub fn uses_default_number_of_threads(&self) -> bool {
        self.config.threads == 0
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if self.bn.contains(node) {
            Ok(())
        } else {
            Err(BnError::InvalidArgument(format!(
                "node {} does not belong to the network",
                node
            )))
        }
    }

    // targets

    pub fn add_target(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.targets.insert(node);
        Ok(())
    }

    pub fn add_all_targets(&mut self) {
        self.targets.extend(self.bn.nodes());
    }

    pub fn erase_target(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.targets.remove(&node);
        Ok(())
    }

    fn default_targets(&self) -> bool {
        self.targets.is_empty() && self.joint_targets.is_empty()
    }

    /// Whether `node` is a target; every node is one while no target has
    /// been registered.
    pub fn is_target(&self, node: NodeId) -> Result<bool> {
        self.check_node(node)?;
        Ok(self.default_targets() || self.targets.contains(&node))
    }

    pub fn targets(&self) -> BTreeSet<NodeId> {
        if self.default_targets() {
            self.bn.nodes().collect()
        } else {
            self.targets.clone()
        }
    }

    /// Registers a joint target. A subset of an existing joint target is
    /// already served; a superset replaces the joint targets it contains.
    pub fn add_joint_target(&mut self, nodes: &[NodeId]) -> Result<()> {
        let set = self.node_set(nodes)?;
        if self.joint_targets.iter().any(|t| set.is_subset(t)) {
            return Ok(());
        }
        self.joint_targets.retain(|t| !t.is_subset(&set));
        self.joint_targets.push(set);
        Ok(())
    }

    pub fn erase_joint_target(&mut self, nodes: &[NodeId]) -> Result<()> {
        let set = self.node_set(nodes)?;
        self.joint_targets.retain(|t| *t != set);
        Ok(())
    }

    pub fn is_joint_target(&self, nodes: &[NodeId]) -> Result<bool> {
        let set = self.node_set(nodes)?;
        Ok(self.joint_targets.contains(&set))
    }

    pub fn joint_targets(&self) -> &[BTreeSet<NodeId>] {
        self.joint_targets.as_slice()
    }

    /// Removes the single and the joint targets.
    pub fn erase_all_targets(&mut self) {
        self.targets.clear();
        self.joint_targets.clear();
    }

    pub fn erase_all_joint_targets(&mut self) {
        self.joint_targets.clear();
    }

    /// Non-empty set of known nodes.
    fn node_set(&self, nodes: &[NodeId]) -> Result<BTreeSet<NodeId>> {
        if nodes.is_empty() {
            return Err(BnError::InvalidArgument("empty set of nodes".to_owned()));
        }
        for node in nodes {
            self.check_node(*node)?;
        }
        Ok(nodes.iter().copied().collect())
    }

    /// Nodes the posterior propagation is able to answer for.
    fn query_set(&self) -> BTreeSet<NodeId> {
        if self.default_targets() {
            self.bn.nodes().collect()
        } else {
            self.targets
                .iter()
                .chain(self.joint_targets.iter().flatten())
                .copied()
                .collect()
        }
    }

    // evidence

    fn check_evidence(&self, node: NodeId, potential: &Potential) -> Result<()> {
        self.check_node(node)?;
        if potential.scope() != [node] {
            return Err(BnError::InvalidArgument(format!(
                "evidence on node {} must be a potential over that node only, got {:?}",
                node,
                potential.scope()
            )));
        }
        let size = self.bn.domain_size(node);
        if potential.shape() != [size] {
            return Err(BnError::ShapeMismatch {
                expected: vec![size],
                got: potential.shape().to_vec(),
            });
        }
        if potential.values().iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(BnError::InvalidArgument(format!(
                "evidence on node {} has negative or non-finite values",
                node
            )));
        }
        if potential.total() <= 0.0 {
            return Err(BnError::InvalidArgument(format!(
                "evidence on node {} is zero everywhere",
                node
            )));
        }
        Ok(())
    }

    fn one_hot(&self, node: NodeId, label: usize) -> Result<Potential> {
        self.check_node(node)?;
        Potential::one_hot(node, self.bn.domain_size(node), label)
    }

    fn likelihood(&self, node: NodeId, values: &[f64]) -> Result<Potential> {
        self.check_node(node)?;
        Potential::from_vec(vec![node], &[self.bn.domain_size(node)], values.to_vec())
    }

    /// Adds evidence on a node that has none.
    pub fn add_evidence(&mut self, node: NodeId, potential: Potential) -> Result<()> {
        self.check_evidence(node, &potential)?;
        if self.evidence.contains_key(&node) {
            return Err(BnError::InvalidArgument(format!(
                "node {} already has evidence",
                node
            )));
        }
        self.evidence.insert(node, Arc::new(potential));
        Ok(())
    }

    pub fn add_hard_evidence(&mut self, node: NodeId, label: usize) -> Result<()> {
        let potential = self.one_hot(node, label)?;
        self.add_evidence(node, potential)
    }

    pub fn add_hard_evidence_by_name(&mut self, node: &str, label: &str) -> Result<()> {
        let id = self
            .bn
            .node_id(node)
            .ok_or_else(|| BnError::InvalidArgument(format!("no node named {}", node)))?;
        let index = self.bn.variable(id).label_index(label).ok_or_else(|| {
            BnError::InvalidArgument(format!("node {} has no label {}", node, label))
        })?;
        self.add_hard_evidence(id, index)
    }

    pub fn add_soft_evidence(&mut self, node: NodeId, values: &[f64]) -> Result<()> {
        let potential = self.likelihood(node, values)?;
        self.add_evidence(node, potential)
    }

    /// Replaces the evidence of a node. The junction trees are kept
    /// whenever the change does not alter which potentials are relevant.
    pub fn chg_evidence(&mut self, node: NodeId, potential: Potential) -> Result<()> {
        self.check_evidence(node, &potential)?;
        let current = self.evidence.get_mut(&node).ok_or_else(|| {
            BnError::UndefinedElement(format!("node {} has no evidence to change", node))
        })?;
        if **current != potential {
            *current = Arc::new(potential);
        }
        Ok(())
    }

    pub fn chg_hard_evidence(&mut self, node: NodeId, label: usize) -> Result<()> {
        let potential = self.one_hot(node, label)?;
        self.chg_evidence(node, potential)
    }

    pub fn chg_soft_evidence(&mut self, node: NodeId, values: &[f64]) -> Result<()> {
        let potential = self.likelihood(node, values)?;
        self.chg_evidence(node, potential)
    }

    pub fn erase_evidence(&mut self, node: NodeId) -> Result<()> {
        self.check_node(node)?;
        self.evidence.remove(&node);
        Ok(())
    }

    pub fn erase_all_evidence(&mut self) {
        self.evidence.clear();
    }

    pub fn has_evidence(&self, node: NodeId) -> bool {
        self.evidence.contains_key(&node)
    }
    pub fn has_hard_evidence(&self, node: NodeId) -> bool {
        self.evidence
            .get(&node)
            .is_some_and(|e| e.hard_label().is_some())
    }
    pub fn has_soft_evidence(&self, node: NodeId) -> bool {
        self.evidence
            .get(&node)
            .is_some_and(|e| e.hard_label().is_none())
    }
    pub fn nb_evidence(&self) -> usize {
        self.evidence.len()
    }
    pub fn hard_evidence_nodes(&self) -> BTreeSet<NodeId> {
        self.evidence
            .iter()
            .filter(|(_, e)| e.hard_label().is_some())
            .map(|(n, _)| *n)
            .collect()
    }
    pub fn soft_evidence_nodes(&self) -> BTreeSet<NodeId> {
        self.evidence
            .iter()
            .filter(|(_, e)| e.hard_label().is_none())
            .map(|(n, _)| *n)
            .collect()
    }
    pub fn evidence(&self, node: NodeId) -> Option<&Potential> {
        self.evidence.get(&node).map(|e| e.as_ref())
    }

    // propagations

    fn structure(&self, slot: Slot) -> StructureKey {
        self.structure_for(slot, &self.query_set())
    }

    /// Structure of `slot` if the posterior propagation had to answer for
    /// `query`.
    fn structure_for(&self, slot: Slot, query: &BTreeSet<NodeId>) -> StructureKey {
        let hard = self.hard_evidence_nodes();
        let soft = self.soft_evidence_nodes();
        let (relevant, extra_cliques) = match slot {
            Slot::Posterior => (
                relevance::find_relevant(
                    &self.bn,
                    self.config.relevance,
                    self.config.barren_nodes,
                    query,
                    &hard,
                    &soft,
                ),
                self.joint_targets
                    .iter()
                    .map(|t| t.iter().copied().collect())
                    .collect(),
            ),
            // Barren CPTs sum to one, the rest is needed for the mass.
            Slot::Evidence => (
                relevance::find_relevant(
                    &self.bn,
                    RelevanceFinder::FindAll,
                    self.config.barren_nodes,
                    &BTreeSet::new(),
                    &hard,
                    &soft,
                ),
                Vec::new(),
            ),
            Slot::Mpe => (
                relevance::find_relevant(
                    &self.bn,
                    RelevanceFinder::FindAll,
                    BarrenNodesFinder::None,
                    &self.bn.nodes().collect(),
                    &hard,
                    &soft,
                ),
                Vec::new(),
            ),
        };
        StructureKey {
            relevant,
            extra_cliques,
        }
    }

    fn build(&self, slot: Slot, key: StructureKey) -> Result<CachedPropagation> {
        let mut graph = InteractionGraph::new();
        let mut potentials = Vec::new();
        for node in key.relevant.cpts.iter() {
            let cpt = self.bn.cpt(*node);
            for var in cpt.scope() {
                graph.add_node(*var, self.bn.domain_size(*var));
            }
            graph.add_clique(cpt.scope())?;
            potentials.push(cpt.clone());
        }
        let mut evidence_slots = BTreeMap::new();
        for node in key.relevant.evidence.iter() {
            let ev = self.evidence.get(node).ok_or_else(|| {
                BnError::UndefinedElement(format!("no evidence on node {}", node))
            })?;
            graph.add_node(*node, self.bn.domain_size(*node));
            evidence_slots.insert(*node, (potentials.len(), ev.clone()));
            potentials.push(ev.as_ref().clone());
        }
        for clique in key.extra_cliques.iter() {
            for var in clique {
                graph.add_node(*var, self.bn.domain_size(*var));
            }
            graph.add_clique(clique)?;
        }
        let skeleton = self.triangulation.triangulate(&graph)?;
        let tree = JunctionTree::from_skeleton(skeleton, graph.domain_sizes())?;
        let propagator = Propagator::new(tree, slot.mode(), potentials)?;
        Ok(CachedPropagation {
            key,
            propagator,
            evidence_slots,
        })
    }

    /// Brings the propagation of `slot` up to date. A failed propagation is
    /// discarded.
    fn refresh(&mut self, slot: Slot) -> Result<&Propagator> {
        let key = self.structure(slot);
        let i = slot.index();
        if self.caches[i].as_ref().is_some_and(|c| c.key == key) {
            tracing::debug!(?slot, "junction tree reused");
        } else {
            self.caches[i] = None;
            tracing::debug!(
                ?slot,
                cpts = key.relevant.cpts.len(),
                evidence = key.relevant.evidence.len(),
                "building junction tree"
            );
            self.caches[i] = Some(self.build(slot, key)?);
        }
        let pool = self.scheduler.pool(self.config.threads)?;
        let synced = match self.caches[i].as_mut() {
            Some(cache) => cache.sync(&self.evidence, &pool),
            None => Err(BnError::UndefinedElement("no propagation".to_owned())),
        };
        if let Err(e) = synced {
            self.caches[i] = None;
            return Err(e);
        }
        self.caches[i]
            .as_ref()
            .map(|c| &c.propagator)
            .ok_or_else(|| BnError::UndefinedElement("no propagation".to_owned()))
    }

    /// Runs the posterior propagation for the current targets and evidence.
    pub fn make_inference(&mut self) -> Result<()> {
        self.refresh(Slot::Posterior).map(|_| ())
    }

    /// Junction tree of the last posterior propagation, if any.
    pub fn junction_tree(&self) -> Option<&JunctionTree> {
        self.caches[Slot::Posterior.index()]
            .as_ref()
            .map(|c| c.propagator.tree())
    }

    /// P(node | evidence).
    pub fn posterior(&mut self, node: NodeId) -> Result<Potential> {
        self.joint_posterior(&[node])
    }

    /// P(nodes | evidence), with axes ordered as `nodes`.
    ///
    /// Every node must be a target, single or part of a joint target,
    /// unless `nodes` is an implicit target: a set held by one clique of
    /// the current tree, whose belief registering `nodes` as targets would
    /// not change.
    pub fn joint_posterior(&mut self, nodes: &[NodeId]) -> Result<Potential> {
        let set = self.node_set(nodes)?;
        if set.len() != nodes.len() {
            return Err(BnError::InvalidArgument(format!(
                "{:?} contains a node twice",
                nodes
            )));
        }
        let query = self.query_set();
        if let Some(node) = set.iter().find(|n| !query.contains(*n)).copied() {
            if !self.is_implicit_target(&set)? {
                return Err(BnError::UndefinedElement(format!(
                    "node {} is not a target",
                    node
                )));
            }
        }
        let max_states = self.config.max_joint_states;
        self.refresh(Slot::Posterior)?.joint(nodes, max_states)
    }

    fn is_implicit_target(&mut self, set: &BTreeSet<NodeId>) -> Result<bool> {
        let mut extended = self.query_set();
        extended.extend(set.iter().copied());
        if self.structure_for(Slot::Posterior, &extended) != self.structure(Slot::Posterior) {
            return Ok(false);
        }
        let nodes: Vec<NodeId> = set.iter().copied().collect();
        let tree = self.refresh(Slot::Posterior)?.tree();
        Ok(tree.covering_clique(&nodes).is_some())
    }

    /// P(evidence): 1 without evidence.
    pub fn evidence_probability(&mut self) -> Result<f64> {
        self.refresh(Slot::Evidence)?.total_mass()
    }

    /// Most probable assignment of every node given the evidence.
    pub fn mpe(&mut self) -> Result<Assignment> {
        Ok(self.refresh(Slot::Mpe)?.most_probable()?.0)
    }

    /// Most probable assignment and its log2 posterior probability,
    /// log2 P(x | e).
    pub fn mpe_log2_posterior(&mut self) -> Result<(Assignment, f64)> {
        let (assignment, log2_joint) = self.refresh(Slot::Mpe)?.most_probable()?;
        let evidence = self.evidence_probability()?;
        Ok((assignment, log2_joint - evidence.log2()))
    }
}
