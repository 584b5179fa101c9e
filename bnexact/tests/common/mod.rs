#![allow(dead_code)]
use approx::assert_abs_diff_eq;
use bnexact::potential::Marginalization;
use bnexact::{BayesNet, BayesNetBuilder, NodeId, Potential, Variable};
use ndarray::{ArrayD, Axis, IxDyn};
use ndarray_rand::rand::seq::index::sample;
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256StarStar;

/// Random DAG where node i only gets parents among 0..i, with random
/// strictly positive CPTs.
pub fn random_net(seed: u64, n: usize, max_parents: usize, max_domain: usize) -> BayesNet {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let mut builder = BayesNetBuilder::new();
    let mut sizes = Vec::with_capacity(n);
    for i in 0..n {
        let size = rng.gen_range(2..=max_domain);
        sizes.push(size);
        builder
            .add_variable(Variable::with_size(format!("x{}", i), size).unwrap())
            .unwrap();
    }
    let mut parents = vec![Vec::new(); n];
    for child in 1..n {
        let k = rng.gen_range(0..=max_parents.min(child));
        for parent in sample(&mut rng, child, k).into_iter() {
            builder.add_arc(parent, child).unwrap();
            parents[child].push(parent);
        }
    }
    for node in 0..n {
        let shape: Vec<usize> = std::iter::once(sizes[node])
            .chain(parents[node].iter().map(|p| sizes[*p]))
            .collect();
        let table = ArrayD::random_using(IxDyn(&shape), Uniform::new(0.05, 1.0), &mut rng);
        let sums = table.sum_axis(Axis(0)).insert_axis(Axis(0));
        let cpt = &table / &sums;
        builder.set_cpt(node, cpt.iter().copied().collect()).unwrap();
    }
    builder.build().unwrap()
}

/// Random hard (label) or soft (likelihood) observations on `k` nodes.
pub fn random_evidence(seed: u64, bn: &BayesNet, k: usize) -> Vec<Potential> {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    sample(&mut rng, bn.size(), k.min(bn.size()))
        .into_iter()
        .map(|node| {
            let size = bn.domain_size(node);
            if rng.gen_bool(0.5) {
                Potential::one_hot(node, size, rng.gen_range(0..size)).unwrap()
            } else {
                let values = (0..size).map(|_| rng.gen_range(0.1..1.0)).collect();
                Potential::from_vec(vec![node], &[size], values).unwrap()
            }
        })
        .collect()
}

/// Exact P(vars | evidence) by enumeration of the full joint.
pub fn brute_posterior(bn: &BayesNet, evidence: &[Potential], vars: &[NodeId]) -> Potential {
    bn.brute_force_joint(evidence.iter())
        .unwrap()
        .marginalize_to(vars, Marginalization::Sum)
        .unwrap()
        .normalize()
        .unwrap()
}

pub fn assert_potentials_close(a: &Potential, b: &Potential, epsilon: f64) {
    assert_eq!(a.scope(), b.scope());
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.values().iter().zip(b.values().iter()) {
        assert_abs_diff_eq!(x, y, epsilon = epsilon);
    }
}

/// Chain x0 -> x1 -> ... with the given domain sizes and CPTs drawn from
/// `seed`.
pub fn chain(seed: u64, sizes: &[usize]) -> BayesNet {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let mut builder = BayesNetBuilder::new();
    for (i, size) in sizes.iter().enumerate() {
        builder
            .add_variable(Variable::with_size(format!("x{}", i), *size).unwrap())
            .unwrap();
        if i > 0 {
            builder.add_arc(i - 1, i).unwrap();
        }
    }
    for (i, size) in sizes.iter().enumerate() {
        let shape: Vec<usize> = std::iter::once(*size)
            .chain((i > 0).then(|| sizes[i - 1]))
            .collect();
        let table = ArrayD::random_using(IxDyn(&shape), Uniform::new(0.05, 1.0), &mut rng);
        let sums = table.sum_axis(Axis(0)).insert_axis(Axis(0));
        let cpt = &table / &sums;
        builder.set_cpt(i, cpt.iter().copied().collect()).unwrap();
    }
    builder.build().unwrap()
}
