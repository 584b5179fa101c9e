mod common;

use std::sync::Arc;

use bnexact::{
    BnError, InteractionGraph, LazyInference, MinFillTriangulation, Triangulation, TreeSkeleton,
};
use common::{brute_posterior, assert_potentials_close, chain, random_net};

/// Puts every variable in its own clique.
#[derive(Debug)]
struct Singletons;

impl Triangulation for Singletons {
    fn triangulate(&self, graph: &InteractionGraph) -> bnexact::Result<TreeSkeleton> {
        Ok(TreeSkeleton {
            cliques: graph.nodes().map(|n| vec![n]).collect(),
            edges: Vec::new(),
        })
    }
}

/// One clique holding every variable.
#[derive(Debug)]
struct OneClique;

impl Triangulation for OneClique {
    fn triangulate(&self, graph: &InteractionGraph) -> bnexact::Result<TreeSkeleton> {
        Ok(TreeSkeleton {
            cliques: vec![graph.nodes().collect()],
            edges: Vec::new(),
        })
    }
}

#[test]
fn broken_triangulation_is_reported() {
    let bn = Arc::new(chain(1, &[2, 2, 3]));
    let mut ie = LazyInference::new(bn.clone());
    ie.set_triangulation(Arc::new(Singletons));
    assert!(matches!(
        ie.make_inference(),
        Err(BnError::InvalidTriangulation(_))
    ));
    ie.set_triangulation(Arc::new(OneClique));
    ie.add_hard_evidence(2, 2).unwrap();
    let evidence = vec![ie.evidence(2).unwrap().clone()];
    assert_potentials_close(
        &ie.posterior(0).unwrap(),
        &brute_posterior(&bn, &evidence, &[0]),
        1e-12,
    );
    assert_eq!(ie.junction_tree().unwrap().nb_cliques(), 1);
    ie.set_triangulation(Arc::new(MinFillTriangulation));
    assert_eq!(ie.junction_tree().map(|t| t.nb_cliques()), None);
    ie.make_inference().unwrap();
    assert_eq!(ie.junction_tree().unwrap().nb_cliques(), 2);
}

#[test]
fn unknown_nodes_and_targets() {
    let bn = Arc::new(random_net(2, 6, 2, 2));
    let mut ie = LazyInference::new(bn);
    assert!(matches!(
        ie.add_hard_evidence(6, 0),
        Err(BnError::InvalidArgument(_))
    ));
    assert!(matches!(
        ie.add_hard_evidence(0, 5),
        Err(BnError::InvalidArgument(_))
    ));
    assert!(matches!(
        ie.add_hard_evidence_by_name("x0", "yes"),
        Err(BnError::InvalidArgument(_))
    ));
    assert!(matches!(
        ie.add_hard_evidence_by_name("nope", "0"),
        Err(BnError::InvalidArgument(_))
    ));
    assert!(matches!(ie.posterior(6), Err(BnError::InvalidArgument(_))));
    assert!(matches!(
        ie.joint_posterior(&[]),
        Err(BnError::InvalidArgument(_))
    ));
    ie.add_target(1).unwrap();
    assert!(matches!(
        ie.posterior(2),
        Err(BnError::UndefinedElement(_))
    ));
    ie.erase_all_targets();
    ie.posterior(2).unwrap();
}

#[test]
fn incompatible_evidence_is_not_cached() {
    // x1 copies x0.
    let mut b = bnexact::BayesNetBuilder::new();
    for name in ["x0", "x1"] {
        b.add_variable(bnexact::Variable::with_size(name, 2).unwrap())
            .unwrap();
    }
    b.add_arc(0, 1).unwrap();
    b.set_cpt(0, vec![0.5, 0.5]).unwrap();
    b.set_cpt(1, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let mut ie = LazyInference::new(Arc::new(b.build().unwrap()));
    ie.add_hard_evidence(0, 0).unwrap();
    ie.add_hard_evidence(1, 1).unwrap();
    assert_eq!(ie.posterior(0), Err(BnError::IncompatibleEvidence));
    assert_eq!(
        ie.evidence_probability(),
        Err(BnError::IncompatibleEvidence)
    );
    assert!(ie.junction_tree().is_none());
    ie.chg_hard_evidence(1, 0).unwrap();
    assert_eq!(ie.evidence_probability().unwrap(), 0.5);
    assert_eq!(ie.posterior(1).unwrap().hard_label(), Some(0));
}
