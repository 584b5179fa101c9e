mod common;

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use bnexact::{BayesNet, BayesNetBuilder, Config, LazyInference, Potential, Variable};
use common::{assert_potentials_close, brute_posterior, chain};

/// x0 -> x1 -> x2 and, unconnected, x3 -> x4.
fn two_chains() -> BayesNet {
    let mut b = BayesNetBuilder::new();
    for (i, size) in [2, 3, 2, 2, 3].iter().enumerate() {
        b.add_variable(Variable::with_size(format!("x{}", i), *size).unwrap())
            .unwrap();
    }
    for (parent, child) in [(0, 1), (1, 2), (3, 4)] {
        b.add_arc(parent, child).unwrap();
    }
    b.set_cpt(0, vec![0.4, 0.6]).unwrap();
    b.set_cpt(1, vec![0.2, 0.5, 0.3, 0.1, 0.5, 0.4]).unwrap();
    b.set_cpt(2, vec![0.9, 0.3, 0.6, 0.1, 0.7, 0.4]).unwrap();
    b.set_cpt(3, vec![0.25, 0.75]).unwrap();
    b.set_cpt(4, vec![0.6, 0.1, 0.3, 0.3, 0.1, 0.6]).unwrap();
    b.build().unwrap()
}

#[test]
fn disconnected_networks() {
    let bn = Arc::new(two_chains());
    let evidence = vec![
        Potential::from_vec(vec![3], &[2], vec![0.3, 0.8]).unwrap(),
        Potential::from_vec(vec![1], &[3], vec![0.5, 0.1, 0.9]).unwrap(),
    ];
    let expected_mass = bn.brute_force_joint(evidence.iter()).unwrap().total();
    for config in [Config::find_all(), Config::default()] {
        let mut ie = LazyInference::with_config(bn.clone(), config);
        for e in evidence.iter() {
            ie.add_evidence(e.scope()[0], e.clone()).unwrap();
        }
        for node in bn.nodes() {
            let expected = brute_posterior(&bn, &evidence, &[node]);
            assert_potentials_close(&ie.posterior(node).unwrap(), &expected, 1e-12);
        }
        // One factor per component.
        let joint = ie.joint_posterior(&[4, 0, 2]).unwrap();
        assert_potentials_close(&joint, &brute_posterior(&bn, &evidence, &[4, 0, 2]), 1e-12);
        assert_eq!(ie.junction_tree().unwrap().nb_components(), 2);
        assert_abs_diff_eq!(
            ie.evidence_probability().unwrap(),
            expected_mass,
            epsilon = 1e-12
        );
    }
}

#[test]
fn long_chains_do_not_exhaust_the_stack() {
    let n = 3000;
    let bn = Arc::new(chain(7, &vec![2; n]));
    let mut ie = LazyInference::with_config(bn.clone(), Config::find_all().with_threads(2));
    ie.add_hard_evidence(0, 1).unwrap();
    // Forward pass P(x_i | x0 = 1).
    let mut p = [0.0, 1.0];
    for i in 1..n {
        let cpt = bn.cpt(i).values();
        p = [0, 1].map(|a| (0..2).map(|b| cpt[[a, b].as_slice()] * p[b]).sum());
    }
    let last = ie.posterior(n - 1).unwrap();
    assert_abs_diff_eq!(last.values()[[0].as_slice()], p[0], epsilon = 1e-9);
    assert_abs_diff_eq!(last.values()[[1].as_slice()], p[1], epsilon = 1e-9);
    assert_eq!(ie.junction_tree().unwrap().levels().len(), n - 1);

    // Incremental update along the whole chain.
    ie.chg_hard_evidence(0, 0).unwrap();
    let flipped = ie.posterior(n - 1).unwrap();
    assert_abs_diff_eq!(flipped.total(), 1.0, epsilon = 1e-9);
    assert_eq!(ie.mpe().unwrap().len(), n);
}
