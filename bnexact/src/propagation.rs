//! Collect/distribute message passing over a junction tree.
//!
//! Local potentials, messages and beliefs are computed lazily and cached in
//! `OnceLock`s, so that the parallel phases only need shared access. A
//! changed potential clears the caches that depend on it and leaves the
//! rest of the tree untouched.
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use rayon::prelude::*;

use crate::junction_tree::{CliqueId, JunctionTree};
use crate::model::NodeId;
use crate::potential::{Assignment, Marginalization, Potential};
use crate::{BnError, Result};

/// Semiring of a propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sum-product on probabilities: marginals and evidence probability.
    Sum,
    /// Max-sum on base-2 logarithms: most probable explanation.
    Max,
}

impl Mode {
    fn unit(self) -> f64 {
        match self {
            Mode::Sum => 1.0,
            Mode::Max => 0.0,
        }
    }
    fn marginalization(self) -> Marginalization {
        match self {
            Mode::Sum => Marginalization::Sum,
            Mode::Max => Marginalization::Max,
        }
    }
    fn combine(self, a: &Potential, b: &Potential) -> Result<Potential> {
        match self {
            Mode::Sum => a.product(b),
            Mode::Max => a.combine_with(b, |x, y| x + y),
        }
    }
    /// Moves a probability table into the domain of the mode.
    fn prepare(self, p: Potential) -> Potential {
        match self {
            Mode::Sum => p,
            Mode::Max => p.log2(),
        }
    }
    /// Mass of a belief: total probability, or best log2 score.
    fn mass(self, belief: &Potential) -> f64 {
        match self {
            Mode::Sum => belief.total(),
            Mode::Max => belief.max_value(),
        }
    }
}

/// Progress of the propagation of one tree component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unbuilt,
    CollectDone,
    DistributeDone,
}

/// Message passing state over one junction tree.
#[derive(Debug)]
pub struct Propagator {
    tree: JunctionTree,
    mode: Mode,
    // in the domain of the mode
    potentials: Vec<Potential>,
    anchors: Vec<CliqueId>,
    anchored: Vec<Vec<usize>>,
    local: Vec<OnceLock<Potential>>,
    // indexed by JunctionTree::edge_slot
    messages: Vec<OnceLock<Potential>>,
    beliefs: Vec<OnceLock<Potential>>,
    phases: Vec<Phase>,
}

impl Propagator {
    /// Anchors `potentials` (probability tables) onto `tree`.
    pub fn new(tree: JunctionTree, mode: Mode, potentials: Vec<Potential>) -> Result<Self> {
        let anchors = potentials
            .iter()
            .map(|p| tree.anchor(p.scope()))
            .collect::<Result<Vec<_>>>()?;
        let mut anchored = vec![Vec::new(); tree.nb_cliques()];
        for (i, c) in anchors.iter().enumerate() {
            anchored[*c].push(i);
        }
        let potentials = potentials.into_iter().map(|p| mode.prepare(p)).collect();
        Ok(Self {
            local: (0..tree.nb_cliques()).map(|_| OnceLock::new()).collect(),
            messages: (0..tree.nb_edge_slots()).map(|_| OnceLock::new()).collect(),
            beliefs: (0..tree.nb_cliques()).map(|_| OnceLock::new()).collect(),
            phases: vec![Phase::Unbuilt; tree.nb_components()],
            tree,
            mode,
            potentials,
            anchors,
            anchored,
        })
    }

    pub fn tree(&self) -> &JunctionTree {
        &self.tree
    }
    pub fn mode(&self) -> Mode {
        self.mode
    }
    pub fn phase(&self, component: usize) -> Phase {
        self.phases[component]
    }
    pub fn anchor(&self, potential: usize) -> CliqueId {
        self.anchors[potential]
    }
    pub fn is_propagated(&self) -> bool {
        self.phases.iter().all(|p| *p == Phase::DistributeDone)
    }

    /// Replaces potential `idx` by `potential` (same scope), invalidating
    /// what depends on it.
    pub fn update_potential(&mut self, idx: usize, potential: Potential) -> Result<()> {
        let current = self.potentials.get(idx).ok_or_else(|| {
            BnError::InvalidArgument(format!("no potential with index {}", idx))
        })?;
        if current.scope() != potential.scope() {
            return Err(BnError::InvalidArgument(format!(
                "potential {} has scope {:?}, cannot replace it by one over {:?}",
                idx,
                current.scope(),
                potential.scope()
            )));
        }
        self.potentials[idx] = self.mode.prepare(potential);
        let clique = self.anchors[idx];
        self.local[clique].take();
        self.invalidate_from(clique);
        Ok(())
    }

    /// Clears the messages directed away from `clique`, and the beliefs
    /// of its component.
    fn invalidate_from(&mut self, clique: CliqueId) {
        let mut cleared = 0;
        let mut stack = vec![(clique, None)];
        while let Some((c, from)) = stack.pop() {
            for nb in self.tree.neighbours(c) {
                if Some(*nb) == from {
                    continue;
                }
                if let Some(slot) = self.tree.edge_slot(c, *nb) {
                    if self.messages[slot].take().is_some() {
                        cleared += 1;
                    }
                }
                stack.push((*nb, Some(c)));
            }
        }
        let comp = self.tree.component(clique);
        for c in 0..self.tree.nb_cliques() {
            if self.tree.component(c) == comp {
                self.beliefs[c].take();
            }
        }
        self.phases[comp] = Phase::Unbuilt;
        tracing::debug!(clique, cleared, "messages invalidated");
    }

    /// Combination of the potentials anchored at `c`.
    fn local(&self, c: CliqueId) -> Result<&Potential> {
        if let Some(p) = self.local[c].get() {
            return Ok(p);
        }
        let local = self.anchored[c].iter().try_fold(
            Potential::constant(self.mode.unit()),
            |acc, i| self.mode.combine(&acc, &self.potentials[*i]),
        )?;
        Ok(self.local[c].get_or_init(|| local))
    }

    /// Table over `keep` obtained by eliminating the other variables of
    /// `pot`. Variables of `keep` absent from `pot` are added with a
    /// neutral value.
    fn project(&self, pot: &Potential, keep: &[NodeId]) -> Result<Potential> {
        let missing: Vec<NodeId> = keep.iter().filter(|v| !pot.contains(**v)).copied().collect();
        let pot = if missing.is_empty() {
            Cow::Borrowed(pot)
        } else {
            let shape = missing
                .iter()
                .map(|v| {
                    self.tree.domain_size(*v).ok_or_else(|| {
                        BnError::InvalidTriangulation(format!("variable {} is not in the tree", v))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let flat = Potential::filled(missing, &shape, self.mode.unit());
            Cow::Owned(self.mode.combine(pot, &flat)?)
        };
        pot.marginalize_to(keep, self.mode.marginalization())
    }

    fn slot(&self, from: CliqueId, to: CliqueId) -> Result<usize> {
        self.tree.edge_slot(from, to).ok_or_else(|| {
            BnError::InvalidArgument(format!("cliques {} and {} are not adjacent", from, to))
        })
    }

    /// Message sent by `from` to its neighbour `to`: the local potential
    /// of `from` times the messages of its other neighbours, projected on
    /// the separator.
    fn message(&self, from: CliqueId, to: CliqueId) -> Result<&Potential> {
        let slot = self.slot(from, to)?;
        if let Some(m) = self.messages[slot].get() {
            return Ok(m);
        }
        let mut acc = self.local(from)?.clone();
        for nb in self.tree.neighbours(from).iter().filter(|n| **n != to) {
            acc = self.mode.combine(&acc, self.message(*nb, from)?)?;
        }
        let separator = self.tree.separator(from, to).unwrap_or(&[]);
        let msg = self.project(&acc, separator)?;
        tracing::trace!(from, to, states = msg.nb_states(), "message computed");
        Ok(self.messages[slot].get_or_init(|| msg))
    }

    /// Local potential of `c` times every incoming message, over the
    /// variables of the clique (sorted).
    pub fn belief(&self, c: CliqueId) -> Result<&Potential> {
        if let Some(b) = self.beliefs[c].get() {
            return Ok(b);
        }
        let mut acc = self.local(c)?.clone();
        for nb in self.tree.neighbours(c) {
            acc = self.mode.combine(&acc, self.message(*nb, c)?)?;
        }
        let belief = self.project(&acc, self.tree.clique(c))?;
        Ok(self.beliefs[c].get_or_init(|| belief))
    }

    /// Sends every message towards the roots, deepest level first. The
    /// cliques of one level only read messages cached by the level below.
    fn collect(&self, pending: &[bool]) -> Result<()> {
        for level in self.tree.levels().iter().rev() {
            level
                .par_iter()
                .filter(|c| pending[self.tree.component(**c)])
                .try_for_each(|c| match self.tree.parent(*c) {
                    Some(parent) => self.message(*c, parent).map(|_| ()),
                    None => Ok(()),
                })?;
        }
        Ok(())
    }

    /// Sends every message towards the leaves, shallowest level first.
    fn distribute(&self, pending: &[bool]) -> Result<()> {
        for level in self.tree.levels() {
            level
                .par_iter()
                .filter(|c| pending[self.tree.component(**c)])
                .try_for_each(|c| {
                    self.tree
                        .children(*c)
                        .try_for_each(|child| self.message(*c, child).map(|_| ()))
                })?;
        }
        Ok(())
    }

    /// Runs collect then distribute on every component that is not up to
    /// date, using the workers of `pool`.
    ///
    /// Fails with [`BnError::IncompatibleEvidence`] if a component has no
    /// mass left.
    pub fn propagate(&mut self, pool: &rayon::ThreadPool) -> Result<()> {
        let pending: Vec<bool> = self
            .phases
            .iter()
            .map(|p| *p != Phase::DistributeDone)
            .collect();
        let nb_pending = pending.iter().filter(|p| **p).count();
        if nb_pending == 0 {
            return Ok(());
        }
        tracing::debug!(
            components = nb_pending,
            levels = self.tree.levels().len(),
            mode = ?self.mode,
            threads = pool.current_num_threads(),
            "propagating"
        );
        {
            let this = &*self;
            pool.install(|| this.collect(&pending))?;
        }
        self.set_phases(&pending, Phase::CollectDone);
        {
            let this = &*self;
            pool.install(|| {
                this.distribute(&pending)?;
                (0..this.tree.nb_cliques())
                    .into_par_iter()
                    .filter(|c| pending[this.tree.component(*c)])
                    .try_for_each(|c| this.belief(c).map(|_| ()))
            })?;
        }
        self.set_phases(&pending, Phase::DistributeDone);
        for (comp, _) in pending.iter().enumerate().filter(|(_, p)| **p) {
            self.component_mass(comp)?;
        }
        Ok(())
    }

    fn set_phases(&mut self, pending: &[bool], phase: Phase) {
        for (p, todo) in self.phases.iter_mut().zip(pending) {
            if *todo {
                *p = phase;
            }
        }
    }

    /// Mass of a component: its total probability (in [`Mode::Sum`]) or
    /// its best log2 score (in [`Mode::Max`]).
    pub fn component_mass(&self, component: usize) -> Result<f64> {
        let root = self.tree.roots()[component];
        let mass = self.mode.mass(self.belief(root)?);
        let valid = match self.mode {
            Mode::Sum => mass > 0.0 && mass.is_finite(),
            Mode::Max => mass > f64::NEG_INFINITY && !mass.is_nan(),
        };
        if valid {
            Ok(mass)
        } else {
            Err(BnError::IncompatibleEvidence)
        }
    }

    /// Probability of the anchored evidence (product over components).
    pub fn total_mass(&self) -> Result<f64> {
        (0..self.tree.nb_components()).try_fold(self.mode.unit(), |acc, comp| {
            let mass = self.component_mass(comp)?;
            Ok(match self.mode {
                Mode::Sum => acc * mass,
                Mode::Max => acc + mass,
            })
        })
    }

    /// Normalized joint distribution of `vars`, ordered as given.
    ///
    /// Within a component, variables not covered by a single clique are
    /// handled by multiplying the beliefs of the subtree spanning them and
    /// dividing by the separator beliefs, provided the intermediate table
    /// has at most `max_states` entries.
    pub fn joint(&self, vars: &[NodeId], max_states: usize) -> Result<Potential> {
        if self.mode != Mode::Sum {
            return Err(BnError::InvalidArgument(
                "joint distributions need a sum propagation".to_owned(),
            ));
        }
        if let Some(c) = self.tree.covering_clique(vars) {
            return self
                .belief(c)?
                .marginalize_to(vars, Marginalization::Sum)?
                .normalize();
        }
        let mut by_component: BTreeMap<usize, Vec<CliqueId>> = BTreeMap::new();
        for var in vars {
            let host = self
                .tree
                .cliques_containing(*var)
                .min_by_key(|c| (self.tree.depth(*c), *c))
                .ok_or_else(|| {
                    BnError::UndefinedElement(format!("variable {} is not in the tree", var))
                })?;
            by_component
                .entry(self.tree.component(host))
                .or_default()
                .push(host);
        }
        let mut joint = Potential::unit();
        for hosts in by_component.values() {
            let keep: Vec<NodeId> = vars
                .iter()
                .filter(|v| hosts.iter().any(|h| self.tree.clique(*h).contains(*v)))
                .copied()
                .collect();
            let part = match self.tree.covering_clique(&keep) {
                Some(c) => self.belief(c)?.marginalize_to(&keep, Marginalization::Sum)?,
                None => self.subtree_joint(hosts, &keep, max_states)?,
            };
            joint = joint.product(&part.normalize()?)?;
        }
        joint.reorder(vars)?.normalize()
    }

    fn subtree_joint(
        &self,
        hosts: &[CliqueId],
        keep: &[NodeId],
        max_states: usize,
    ) -> Result<Potential> {
        let subtree = self.tree.spanning_subtree(hosts).ok_or_else(|| {
            BnError::UndefinedElement("cliques are not in the same component".to_owned())
        })?;
        let mut vars: Vec<NodeId> = subtree
            .iter()
            .flat_map(|c| self.tree.clique(*c).iter().copied())
            .collect();
        vars.sort_unstable();
        vars.dedup();
        let states = vars.iter().try_fold(1usize, |acc, v| {
            acc.checked_mul(self.tree.domain_size(*v).unwrap_or(1))
        });
        if states.map_or(true, |s| s > max_states) {
            return Err(BnError::UndefinedElement(format!(
                "the joint of {:?} spans {} cliques, too large to be computed",
                keep,
                subtree.len()
            )));
        }
        let (first, rest) = subtree
            .split_first()
            .ok_or_else(|| BnError::UndefinedElement("empty subtree".to_owned()))?;
        let mut acc = self.belief(*first)?.clone();
        for c in rest {
            let parent = self.tree.parent(*c).ok_or_else(|| {
                BnError::InvalidTriangulation(format!("clique {} has no parent", c))
            })?;
            let separator = self.tree.separator(*c, parent).unwrap_or(&[]);
            let belief = self.belief(*c)?;
            let sep_belief = belief.marginalize_to(separator, Marginalization::Sum)?;
            acc = acc.product(&belief.divide(&sep_belief)?)?;
        }
        acc.marginalize_to(keep, Marginalization::Sum)
    }

    /// Most probable assignment of the variables of the tree and its log2
    /// score (sum over components of the best root score).
    ///
    /// Roots are decoded first, then every clique in breadth-first order
    /// picks the best labels of its variables given those already fixed.
    pub fn most_probable(&self) -> Result<(Assignment, f64)> {
        if self.mode != Mode::Max {
            return Err(BnError::InvalidArgument(
                "the most probable explanation needs a max propagation".to_owned(),
            ));
        }
        let mut assignment = Assignment::new();
        let mut score = 0.0;
        for comp in 0..self.tree.nb_components() {
            score += self.component_mass(comp)?;
        }
        for c in self.tree.bfs_order() {
            let rest = self.belief(*c)?.restrict(&assignment)?;
            let (best, _) = rest.argmax().ok_or(BnError::IncompatibleEvidence)?;
            assignment.extend(best);
        }
        Ok((assignment, score))
    }
}
