//! Model-level behaviour: sampling, conditioning, objectives, persistence and
//! construction errors.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stochgraph_diff::function::FnFunction;
use stochgraph_diff::{OptimizerSpec, RTensor};
use stochgraph_prob::{
    perform_inference, InferenceConfig, ModelError, Objective, PosteriorInit, ProbabilisticModel,
    VariableGraph,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("stochgraph_prob=debug")
        .with_test_writer()
        .try_init();
}

fn regression(observed: Vec<f32>) -> VariableGraph {
    let mut g = VariableGraph::new();
    g.constant("zero", RTensor::scalar(0.0)).unwrap();
    g.constant("one", RTensor::scalar(1.0)).unwrap();
    g.normal("z", "zero", "one").unwrap();
    g.deterministic(
        "shifted",
        FnFunction::new("shift", |t, p, v| t.add(v[0], p[0]))
            .with_parameter("offset", RTensor::scalar(0.0)),
        &["z"],
    )
    .unwrap();
    g.normal("y", "shifted", "one").unwrap();
    g.observe("y", RTensor::vector(observed)).unwrap();
    g
}

#[test]
fn deterministic_nodes_of_constants_repeat() {
    let mut g = VariableGraph::new();
    g.constant("a", RTensor::vector(vec![1.0, 2.0])).unwrap();
    g.deterministic(
        "b",
        FnFunction::new("double_exp", |t, _p, v| {
            let e = t.exp(v[0])?;
            t.scale(e, 2.0)
        }),
        &["a"],
    )
    .unwrap();
    let model = ProbabilisticModel::new(g, &["b"]).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let draws = model.sample_variable("b", 10, &mut rng).unwrap();
    assert_eq!(draws.len(), 10);
    assert!(draws.iter().all(|d| d == &draws[0]));
    assert!((draws[0].data[1] - 2.0 * 2.0f32.exp()).abs() < 1e-4);
}

#[test]
fn observed_values_do_not_depend_on_the_seed() {
    let mut g = VariableGraph::new();
    g.parameter("mu", RTensor::scalar(0.5)).unwrap();
    g.constant("sigma", RTensor::scalar(2.0)).unwrap();
    g.normal("x", "mu", "sigma").unwrap();
    g.observe("x", RTensor::vector(vec![1.0, -1.0, 3.0])).unwrap();
    let model = ProbabilisticModel::new(g, &["x"]).unwrap();

    let losses: Vec<f32> = (0..5)
        .map(|seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            model
                .loss(Objective::MaximumLikelihood, 3, &mut rng)
                .unwrap()
                .value
        })
        .collect();
    assert!(losses.iter().all(|&l| l == losses[0]));

    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let sample = model.sample(4, &mut rng).unwrap();
    assert!(sample
        .get("x")
        .unwrap()
        .iter()
        .all(|x| x.data == vec![1.0, -1.0, 3.0]));
}

#[test]
fn map_fits_latent_and_black_box_parameters() {
    init_tracing();
    let mut model = ProbabilisticModel::new(regression(vec![3.0; 8]), &["y"]).unwrap();
    assert_eq!(model.latent_variables(), vec!["z"]);
    assert_eq!(
        model.learnable_parameters(Objective::MaximumLikelihood),
        vec!["shifted.offset"]
    );

    let config = InferenceConfig::default()
        .with_optimizer(OptimizerSpec::Sgd)
        .with_learning_rate(0.02)
        .with_iterations(400)
        .with_posterior_init(PosteriorInit::PriorMean);
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    perform_inference(&mut model, &config, &mut rng).unwrap();

    let z = model.parameter("z:map").unwrap().data[0];
    let offset = model.parameter("shifted.offset").unwrap().data[0];
    assert!((z + offset - 3.0).abs() < 0.05, "z = {}, offset = {}", z, offset);
    // The prior pulls z towards zero, so the offset carries most of the shift
    assert!(offset > z);

    let posterior = model
        .get_posterior_sample(3, &[], &mut rng)
        .unwrap();
    for shifted in posterior.get("shifted").unwrap() {
        assert!((shifted.data[0] - (z + offset)).abs() < 1e-5);
    }
}

#[test]
fn bernoulli_observations_fit_logit() {
    let mut g = VariableGraph::new();
    g.parameter("logit", RTensor::scalar(0.0)).unwrap();
    g.bernoulli("coin", "logit").unwrap();
    g.observe("coin", RTensor::vector(vec![1.0, 1.0, 1.0, 0.0])).unwrap();
    let mut model = ProbabilisticModel::new(g, &["coin"]).unwrap();

    let config = InferenceConfig::default()
        .with_method(Objective::MaximumLikelihood)
        .with_optimizer(OptimizerSpec::Sgd)
        .with_learning_rate(0.5)
        .with_iterations(300);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    perform_inference(&mut model, &config, &mut rng).unwrap();

    // sigmoid(logit) -> 3/4, logit -> ln 3
    let logit = model.parameter("logit.value").unwrap().data[0];
    assert!((logit - 3.0f32.ln()).abs() < 1e-2, "logit = {}", logit);
}

#[test]
fn categorical_label_batch_shares_logits() {
    let build = |labels: Vec<f32>| {
        let mut g = VariableGraph::new();
        g.parameter("logits", RTensor::vector(vec![0.0, 1.0, 2.0]))
            .unwrap();
        g.categorical("y", "logits").unwrap();
        g.observe("y", RTensor::vector(labels)).unwrap();
        ProbabilisticModel::new(g, &["y"]).unwrap()
    };
    let log_p2 = 2.0 - (1.0f32 + 1.0f32.exp() + 2.0f32.exp()).ln();
    let mut rng = ChaCha8Rng::seed_from_u64(0);

    // As many labels as classes: still three observations of class 2.
    let three = build(vec![2.0, 2.0, 2.0])
        .loss(Objective::MaximumLikelihood, 1, &mut rng)
        .unwrap();
    assert!((three.value - 1.2228).abs() < 1e-3, "loss = {}", three.value);
    assert!((three.value + 3.0 * log_p2).abs() < 1e-4);

    let four = build(vec![2.0, 2.0, 2.0, 2.0])
        .loss(Objective::MaximumLikelihood, 1, &mut rng)
        .unwrap();
    assert!((four.value + 4.0 * log_p2).abs() < 1e-4);

    let err = build(vec![3.0])
        .loss(Objective::MaximumLikelihood, 1, &mut rng)
        .unwrap_err();
    assert!(matches!(err, ModelError::ConfigurationError { .. }));
}

#[test]
fn parameters_survive_save_and_load() {
    let mut model = ProbabilisticModel::new(regression(vec![1.0, 2.0]), &["y"]).unwrap();
    let config = InferenceConfig::default().with_iterations(20);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    perform_inference(&mut model, &config, &mut rng).unwrap();

    let path = std::env::temp_dir().join(format!(
        "stochgraph-params-{}.json",
        std::process::id()
    ));
    model.save_parameters(&path).unwrap();

    let mut restored = ProbabilisticModel::new(regression(vec![1.0, 2.0]), &["y"]).unwrap();
    assert!(!restored.has_posterior());
    restored.load_parameters(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(restored.parameters(), model.parameters());
    assert!(restored.has_posterior());

    let missing = std::env::temp_dir().join("stochgraph-does-not-exist.json");
    assert!(matches!(
        restored.load_parameters(&missing),
        Err(ModelError::Persistence { .. })
    ));
}

#[test]
fn discrete_latents_cannot_be_fitted_with_map() {
    let mut g = VariableGraph::new();
    g.constant("logits", RTensor::vector(vec![0.0, 1.0])).unwrap();
    g.categorical("c", "logits").unwrap();
    g.constant("one", RTensor::scalar(1.0)).unwrap();
    g.normal("y", "c", "one").unwrap();
    g.observe("y", RTensor::vector(vec![1.0])).unwrap();
    let mut model = ProbabilisticModel::new(g, &["y"]).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let err = perform_inference(&mut model, &InferenceConfig::default(), &mut rng).unwrap_err();
    assert!(matches!(err, ModelError::ConfigurationError { .. }));
}

#[test]
fn construction_errors() {
    let mut g = VariableGraph::new();
    g.constant("one", RTensor::scalar(1.0)).unwrap();
    g.normal("y", "missing", "one").unwrap();
    assert_eq!(
        ProbabilisticModel::new(g, &["y"]).unwrap_err(),
        ModelError::UnresolvedDependency {
            variable: "y".to_string(),
            missing: "missing".to_string(),
        }
    );

    let mut g = VariableGraph::new();
    g.constant("one", RTensor::scalar(1.0)).unwrap();
    g.normal("a", "b", "one").unwrap();
    g.normal("b", "a", "one").unwrap();
    assert!(matches!(
        ProbabilisticModel::new(g, &["a"]),
        Err(ModelError::CyclicGraph { .. })
    ));

    let mut g = VariableGraph::new();
    g.parameter("w", RTensor::scalar(1.0)).unwrap();
    g.observe("w", RTensor::scalar(2.0)).unwrap();
    assert!(matches!(
        ProbabilisticModel::new(g, &["w"]),
        Err(ModelError::ConfigurationError { .. })
    ));

    assert!(matches!(
        ProbabilisticModel::new(VariableGraph::new(), &[]),
        Err(ModelError::ConfigurationError { .. })
    ));
}
