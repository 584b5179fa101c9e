mod common;

use std::sync::Arc;

use bnexact::{default_number_of_threads, set_default_number_of_threads, LazyInference};
use common::random_net;

// Only test of this binary touching the process-wide default.
#[test]
fn default_thread_count_is_read_at_inference_time() {
    let bn = Arc::new(random_net(9, 10, 2, 3));
    let mut adopting = LazyInference::new(bn.clone());
    let mut fixed = LazyInference::new(bn.clone());
    fixed.set_number_of_threads(3);
    assert!(adopting.uses_default_number_of_threads());
    assert!(!fixed.uses_default_number_of_threads());

    set_default_number_of_threads(2);
    assert_eq!(default_number_of_threads(), 2);
    assert_eq!(adopting.number_of_threads(), 2);
    assert_eq!(fixed.number_of_threads(), 3);
    let before = adopting.posterior(4).unwrap();

    set_default_number_of_threads(5);
    assert_eq!(adopting.number_of_threads(), 5);
    assert_eq!(fixed.number_of_threads(), 3);
    adopting.add_hard_evidence(0, 1).unwrap();
    adopting.erase_evidence(0).unwrap();
    assert_eq!(adopting.posterior(4).unwrap(), before);
    assert_eq!(fixed.posterior(4).unwrap(), before);

    set_default_number_of_threads(0);
    assert!(default_number_of_threads() >= 1);
}
