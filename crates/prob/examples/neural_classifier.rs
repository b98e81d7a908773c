//! Bayesian convolutional classifier on synthetic 4x4 images.
//!
//! Run with: cargo run -p stochgraph-prob --example neural_classifier
//!
//! Set `RUST_LOG=stochgraph_prob=debug` to see per-step losses.
//!
//! This example demonstrates:
//! - Minibatching a dataset with random indices shared by inputs and labels
//! - A conv -> relu -> affine network whose weights are Normal latents
//! - MAP training and posterior prediction on clamped, unseen inputs

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use stochgraph_diff::function::{Affine, Convolution, FnFunction};
use stochgraph_diff::RTensor;
use stochgraph_prob::{
    perform_inference, Dataset, IndexPolicy, InferenceConfig, ModelError, Objective,
    ProbabilisticModel, RandomIndices, VariableGraph,
};
use tracing_subscriber::EnvFilter;

const CLASSES: usize = 3;

/// Class `c` draws a bar in column `c`, plus pixel noise.
fn bars<R: Rng>(n: usize, rng: &mut R) -> Result<Dataset, ModelError> {
    let mut pixels = Vec::with_capacity(n * 16);
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let class = rng.gen_range(0..CLASSES);
        for _row in 0..4 {
            for col in 0..4 {
                let base = if col == class { 1.0 } else { 0.0 };
                pixels.push(base + rng.gen_range(-0.2..0.2));
            }
        }
        labels.push(class as f32);
    }
    Dataset::new(
        RTensor::from_data(vec![n, 1, 4, 4], pixels),
        RTensor::vector(labels),
    )
}

fn build(train: Dataset) -> Result<ProbabilisticModel, ModelError> {
    let n = train.len();
    let mut g = VariableGraph::new();
    g.random_indices("idx", RandomIndices::new(n, 16, IndexPolicy::Shuffled)?)?;
    g.empirical_pair("idx", "x", "labels", train)?;

    g.constant("prior_scale", RTensor::scalar(1.0))?;
    g.constant("kernel_loc", RTensor::zeros(vec![2, 1, 3, 3]))?;
    g.constant("w_loc", RTensor::zeros(vec![CLASSES, 32]))?;
    g.constant("b_loc", RTensor::zeros(vec![CLASSES]))?;
    g.normal("kernel", "kernel_loc", "prior_scale")?;
    g.normal("w", "w_loc", "prior_scale")?;
    g.normal("b", "b_loc", "prior_scale")?;

    g.deterministic(
        "features",
        Convolution {
            stride: 1,
            padding: 1,
        },
        &["x", "kernel"],
    )?;
    g.deterministic(
        "hidden",
        FnFunction::new("relu_flatten", |t, _p, v| {
            let r = t.relu(v[0])?;
            t.flatten(r)
        }),
        &["features"],
    )?;
    g.deterministic("logits", Affine, &["hidden", "w", "b"])?;
    g.categorical("y", "logits")?;
    g.observe("y", "labels")?;

    ProbabilisticModel::new(g, &["y"])
}

fn main() -> Result<(), ModelError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Bayesian conv net on bar images ===\n");

    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let mut model = build(bars(120, &mut rng)?)?;
    println!("Latent variables: {:?}", model.latent_variables());

    let config = InferenceConfig::default()
        .with_method(Objective::Map)
        .with_iterations(600)
        .with_learning_rate(0.01)
        .with_log_every(100);
    let diagnostics = perform_inference(&mut model, &config, &mut rng)?;

    let curve = diagnostics.loss_curve();
    for (i, loss) in curve.iter().enumerate().step_by(100) {
        println!("  iteration {:>3}: loss {:.3}", i, loss);
    }
    if let Some(last) = curve.last() {
        println!("  final:          loss {:.3}", last);
    }

    // Predict on four unseen images; the batch follows the clamp.
    let test = bars(4, &mut rng)?;
    let predictions = model.get_posterior_sample(1, &[("x", test.inputs)], &mut rng)?;
    println!();
    if let Some(ys) = predictions.get("y") {
        println!("True labels:      {:?}", test.labels.data);
        println!("Sampled labels:   {:?}", ys[0].data);
    }

    let path = std::env::temp_dir().join("stochgraph-classifier.json");
    model.save_parameters(&path)?;
    println!("\nSaved {} parameters to {}", model.parameters().len(), path.display());

    Ok(())
}
