//! A small convolutional classifier over 4x4 single-channel images, fitted
//! with MAP and maximum likelihood.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stochgraph_diff::function::{Affine, Convolution, FnFunction};
use stochgraph_diff::layers::{Conv2d, Flatten, Linear, Relu, Sequential};
use stochgraph_diff::{OptimizerSpec, RTensor};
use stochgraph_prob::{
    perform_inference, Dataset, IndexPolicy, InferenceConfig, ModelError, Objective,
    ProbabilisticModel, RandomIndices, VariableGraph,
};

const IMAGES: usize = 12;

/// Image `i` has class `i % 3`: a bright vertical bar in column `class`.
fn images(n: usize) -> Dataset {
    let mut pixels = Vec::with_capacity(n * 16);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let class = i % 3;
        for row in 0..4 {
            for col in 0..4 {
                let noise = ((i * 7 + row * 3 + col) % 5) as f32 * 0.05;
                pixels.push(if col == class { 1.0 } else { 0.0 } + noise);
            }
        }
        labels.push(class as f32);
    }
    Dataset::new(
        RTensor::from_data(vec![n, 1, 4, 4], pixels),
        RTensor::vector(labels),
    )
    .unwrap()
}

/// conv(2 channels, 3x3, padding 1) -> relu -> flatten -> affine(32 -> 3),
/// with every weight a Normal latent variable.
fn bayesian_classifier(prior_scale: f32, batch: usize) -> ProbabilisticModel {
    let mut g = VariableGraph::new();
    g.random_indices(
        "idx",
        RandomIndices::new(IMAGES, batch, IndexPolicy::Shuffled).unwrap(),
    )
    .unwrap();
    g.empirical_pair("idx", "x", "labels", images(IMAGES))
        .unwrap();

    g.constant("prior_scale", RTensor::scalar(prior_scale))
        .unwrap();
    g.constant("kernel_loc", RTensor::zeros(vec![2, 1, 3, 3]))
        .unwrap();
    g.constant("w_loc", RTensor::zeros(vec![3, 32])).unwrap();
    g.constant("b_loc", RTensor::zeros(vec![3])).unwrap();
    g.normal("kernel", "kernel_loc", "prior_scale").unwrap();
    g.normal("w", "w_loc", "prior_scale").unwrap();
    g.normal("b", "b_loc", "prior_scale").unwrap();

    g.deterministic(
        "features",
        Convolution {
            stride: 1,
            padding: 1,
        },
        &["x", "kernel"],
    )
    .unwrap();
    g.deterministic(
        "hidden",
        FnFunction::new("relu_flatten", |t, _p, v| {
            let r = t.relu(v[0])?;
            t.flatten(r)
        }),
        &["features"],
    )
    .unwrap();
    g.deterministic("logits", Affine, &["hidden", "w", "b"])
        .unwrap();
    g.categorical("y", "logits").unwrap();
    g.observe("y", "labels").unwrap();

    ProbabilisticModel::new(g, &["y"]).unwrap()
}

fn map_config(iterations: usize) -> InferenceConfig {
    InferenceConfig::default()
        .with_method(Objective::Map)
        .with_iterations(iterations)
        .with_learning_rate(0.01)
}

fn first_four_images() -> RTensor {
    images(4).inputs
}

#[test]
fn scenario_b_map_training_history() {
    let mut model = bayesian_classifier(1.0, 4);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let diagnostics = perform_inference(&mut model, &map_config(600), &mut rng).unwrap();

    let curve = diagnostics.loss_curve();
    assert_eq!(curve.len(), 600);
    assert!(curve.iter().all(|l| l.is_finite()));

    let head: f32 = curve[..50].iter().sum::<f32>() / 50.0;
    let tail: f32 = curve[550..].iter().sum::<f32>() / 50.0;
    assert!(tail < head, "loss did not decrease: {} -> {}", head, tail);
    assert!(model.has_posterior());
    assert_eq!(model.parameter("kernel:map").unwrap().shape, vec![2, 1, 3, 3]);
}

#[test]
fn scenario_b_invalid_prior_aborts() {
    let mut model = bayesian_classifier(-1.0, 4);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let err = perform_inference(&mut model, &map_config(600), &mut rng).unwrap_err();
    assert!(matches!(err, ModelError::NonFiniteLoss { iteration: 0, .. }));
    assert!(!model.has_posterior());
}

#[test]
fn scenario_c_clamped_inputs_set_batch_size() {
    let mut model = bayesian_classifier(1.0, 5);
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let clamp = [("x", first_four_images())];

    let prior = model.get_sample(3, &clamp, &mut rng).unwrap();
    for (y, logits) in prior
        .get("y")
        .unwrap()
        .iter()
        .zip(prior.get("logits").unwrap())
    {
        assert_eq!(y.shape, vec![4]);
        assert_eq!(logits.shape, vec![4, 3]);
    }

    perform_inference(&mut model, &map_config(50), &mut rng).unwrap();
    let posterior = model.get_posterior_sample(2, &clamp, &mut rng).unwrap();
    let ys = posterior.get("y").unwrap();
    assert_eq!(ys.len(), 2);
    assert!(ys.iter().all(|y| y.shape == vec![4]));
    assert!(ys
        .iter()
        .flat_map(|y| &y.data)
        .all(|&c| c == 0.0 || c == 1.0 || c == 2.0));
}

#[test]
fn maximum_likelihood_through_layers() {
    let mut init = ChaCha8Rng::seed_from_u64(1);
    let net = Sequential::new()
        .push(Conv2d::new(1, 2, 3, 1, 1, &mut init))
        .push(Relu)
        .push(Flatten)
        .push(Linear::new(32, 3, &mut init));

    let mut g = VariableGraph::new();
    g.random_indices(
        "idx",
        RandomIndices::new(IMAGES, 6, IndexPolicy::WithoutReplacement).unwrap(),
    )
    .unwrap();
    g.empirical_pair("idx", "x", "labels", images(IMAGES))
        .unwrap();
    g.deterministic("logits", net, &["x"]).unwrap();
    g.categorical("y", "logits").unwrap();
    g.observe("y", "labels").unwrap();
    let mut model = ProbabilisticModel::new(g, &["y"]).unwrap();

    assert_eq!(
        model.learnable_parameters(Objective::MaximumLikelihood),
        vec!["logits.0.kernel", "logits.3.weight", "logits.3.bias"]
    );

    let config = InferenceConfig::default()
        .with_method(Objective::MaximumLikelihood)
        .with_optimizer(OptimizerSpec::default())
        .with_learning_rate(0.02)
        .with_iterations(300);
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let diagnostics = perform_inference(&mut model, &config, &mut rng).unwrap();

    let curve = diagnostics.loss_curve();
    let head: f32 = curve[..30].iter().sum::<f32>() / 30.0;
    let tail: f32 = curve[270..].iter().sum::<f32>() / 30.0;
    assert!(tail < 0.5 * head, "loss {} -> {}", head, tail);

    // Maximum likelihood fits no latent variables.
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    assert!(matches!(
        model.get_posterior_sample(1, &[], &mut rng),
        Err(ModelError::NoPosteriorDefined { .. })
    ));
}
