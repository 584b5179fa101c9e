//! Exact inference over discrete Bayesian networks.
//!
//! The engine ([`LazyInference`]) prunes potentials that cannot influence the
//! requested targets, anchors the remaining ones onto a junction tree and runs
//! collect/distribute message passing over it, in parallel across independent
//! subtrees.
pub mod inference;
pub mod junction_tree;
pub mod model;
pub mod potential;
pub mod propagation;
pub mod relevance;
pub mod scheduler;
pub mod triangulation;

pub use inference::LazyInference;
pub use junction_tree::{CliqueId, JunctionTree};
pub use model::{BayesNet, BayesNetBuilder, NodeId, Variable};
pub use potential::{Assignment, Potential};
pub use relevance::{BarrenNodesFinder, RelevanceFinder};
pub use scheduler::{default_number_of_threads, set_default_number_of_threads};
pub use triangulation::{InteractionGraph, MinFillTriangulation, Triangulation, TreeSkeleton};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BnError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BnError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Undefined element: {0}")]
    UndefinedElement(String),
    #[error("The evidence is incompatible: its probability is zero.")]
    IncompatibleEvidence,
    #[error("The triangulation is not a valid junction tree for the potentials: {0}")]
    InvalidTriangulation(String),
    #[error("The graph is not acyclic: {0}")]
    NotAcyclic(String),
    #[error("Incorrect shape: expected {expected:?}, got {got:?}.")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("Variable {0} declared twice.")]
    DuplicateVariable(String),
    #[error("Cannot build the thread pool: {0}")]
    ThreadPool(String),
}

/// Tuning of an inference engine.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which potentials are discarded before building the junction tree.
    pub relevance: RelevanceFinder,
    /// Whether CPTs of barren nodes are discarded.
    pub barren_nodes: BarrenNodesFinder,
    /// Worker threads, 0 adopts the process-wide default at each inference.
    pub threads: usize,
    /// Upper bound on the state space of a joint posterior that spans
    /// several cliques.
    pub max_joint_states: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relevance: RelevanceFinder::DsepTensors,
            barren_nodes: BarrenNodesFinder::FindAll,
            threads: 0,
            max_joint_states: 1 << 22,
        }
    }
}

impl Config {
    /// No pruning at all, always correct, never faster.
    pub fn find_all() -> Self {
        Self {
            relevance: RelevanceFinder::FindAll,
            barren_nodes: BarrenNodesFinder::None,
            ..Self::default()
        }
    }
    pub fn with_relevance(mut self, relevance: RelevanceFinder) -> Self {
        self.relevance = relevance;
        self
    }
    pub fn with_barren_nodes(mut self, barren_nodes: BarrenNodesFinder) -> Self {
        self.barren_nodes = barren_nodes;
        self
    }
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    pub fn with_max_joint_states(mut self, max_joint_states: usize) -> Self {
        self.max_joint_states = max_joint_states;
        self
    }
}
