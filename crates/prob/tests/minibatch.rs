//! Minibatch index draws and the alignment of empirical variables that share
//! them.

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use stochgraph_diff::RTensor;
use stochgraph_prob::{
    Dataset, IndexPolicy, ModelError, ProbabilisticModel, RandomIndices, VariableGraph,
};

/// Row `i` of the inputs is `[i, 100 + i]`, label `i` is `i`.
fn indexed_dataset(n: usize) -> Dataset {
    let inputs: Vec<f32> = (0..n).flat_map(|i| [i as f32, 100.0 + i as f32]).collect();
    let labels: Vec<f32> = (0..n).map(|i| i as f32).collect();
    Dataset::new(
        RTensor::from_data(vec![n, 2], inputs),
        RTensor::vector(labels),
    )
    .unwrap()
}

fn paired_model(n: usize, batch: usize, policy: IndexPolicy) -> ProbabilisticModel {
    let mut g = VariableGraph::new();
    g.random_indices("idx", RandomIndices::new(n, batch, policy).unwrap())
        .unwrap();
    g.empirical_pair("idx", "x", "labels", indexed_dataset(n))
        .unwrap();
    ProbabilisticModel::new(g, &["x", "labels"]).unwrap()
}

fn assert_aligned(model: &ProbabilisticModel, n: usize, batch: usize, draws: usize, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let sample = model.sample(draws, &mut rng).unwrap();
    let xs = sample.get("x").unwrap();
    let labels = sample.get("labels").unwrap();
    let x_rows = sample.indices("x").unwrap();
    let label_rows = sample.indices("labels").unwrap();

    for d in 0..draws {
        assert_eq!(x_rows[d], label_rows[d]);
        assert_eq!(x_rows[d].len(), batch);
        assert_eq!(xs[d].shape, vec![batch, 2]);
        assert_eq!(labels[d].shape, vec![batch]);
        for (r, &row) in x_rows[d].iter().enumerate() {
            assert!(row < n);
            assert_eq!(xs[d].data[2 * r], row as f32);
            assert_eq!(xs[d].data[2 * r + 1], 100.0 + row as f32);
            assert_eq!(labels[d].data[r], row as f32);
        }
    }
}

#[test]
fn scenario_a_hundred_rows_batches_of_seven() {
    let model = paired_model(100, 7, IndexPolicy::WithoutReplacement);
    assert_aligned(&model, 100, 7, 50, 11);

    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let sample = model.sample(30, &mut rng).unwrap();
    for idx in sample.get("idx").unwrap() {
        assert_eq!(idx.data.len(), 7);
        assert!(idx.data.iter().all(|&i| (0.0..100.0).contains(&i)));
    }
}

#[test]
fn full_dataset_without_indices() {
    let mut g = VariableGraph::new();
    g.empirical("x", RTensor::from_data(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), None)
        .unwrap();
    let model = ProbabilisticModel::new(g, &["x"]).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let sample = model.sample(2, &mut rng).unwrap();
    assert_eq!(sample.get("x").unwrap()[1].data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(sample.indices("x").unwrap()[0], vec![0, 1, 2]);
}

#[test]
fn clamped_indices_select_rows() {
    let model = paired_model(10, 3, IndexPolicy::WithoutReplacement);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let sample = model
        .get_sample(1, &[("idx", RTensor::vector(vec![9.0, 0.0]))], &mut rng)
        .unwrap();
    assert_eq!(sample.get("labels").unwrap()[0].data, vec![9.0, 0.0]);

    let err = model
        .get_sample(1, &[("idx", RTensor::vector(vec![10.0]))], &mut rng)
        .unwrap_err();
    assert!(matches!(err, ModelError::ConfigurationError { .. }));
}

#[test]
fn observed_minibatch_mismatch_detected_at_build() {
    let mut g = VariableGraph::new();
    g.random_indices(
        "idx",
        RandomIndices::new(20, 5, IndexPolicy::WithReplacement).unwrap(),
    )
    .unwrap();
    g.empirical_pair("idx", "x", "labels", indexed_dataset(20))
        .unwrap();
    g.constant("logits", RTensor::zeros(vec![5, 20])).unwrap();
    g.categorical("y", "logits").unwrap();
    g.observe("y", "labels").unwrap();
    g.constant("zero", RTensor::scalar(0.0)).unwrap();
    g.constant("one", RTensor::scalar(1.0)).unwrap();
    g.normal("z", "zero", "one").unwrap();
    g.observe("z", RTensor::zeros(vec![6])).unwrap();

    match ProbabilisticModel::new(g, &["y", "z"]) {
        Err(ModelError::ShapeMismatch { variable, .. }) => {
            assert!(variable.contains('y') && variable.contains('z'))
        }
        other => panic!("expected a batch mismatch, got {:?}", other),
    }
}

fn policy() -> impl Strategy<Value = IndexPolicy> {
    prop_oneof![
        Just(IndexPolicy::WithReplacement),
        Just(IndexPolicy::WithoutReplacement),
        Just(IndexPolicy::Shuffled),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pairs_stay_aligned(
        n in 1usize..60,
        frac in 0.0f64..1.0,
        policy in policy(),
        seed in any::<u64>(),
    ) {
        let batch = 1 + ((n - 1) as f64 * frac) as usize;
        let model = paired_model(n, batch, policy);
        assert_aligned(&model, n, batch, 4, seed);
    }

    #[test]
    fn prop_index_draws_respect_policy(
        n in 1usize..80,
        frac in 0.0f64..1.0,
        policy in policy(),
        seed in any::<u64>(),
    ) {
        let batch = 1 + ((n - 1) as f64 * frac) as usize;
        let indices = RandomIndices::new(n, batch, policy).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for _ in 0..5 {
            let draw = indices.draw(&mut rng);
            prop_assert_eq!(draw.len(), batch);
            prop_assert!(draw.iter().all(|&i| i < n));
            if policy != IndexPolicy::WithReplacement {
                let unique: HashSet<_> = draw.iter().collect();
                prop_assert_eq!(unique.len(), batch);
            }
        }
    }
}
