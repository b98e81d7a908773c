//! # Prob - Random-Variable Graphs with Differentiable Black Boxes
//!
//! This crate builds probabilistic models as graphs of named random
//! variables and fits them by stochastic gradient descent on a Monte Carlo
//! loss. Deterministic nodes wrap black-box differentiable functions (neural
//! layers included) from `stochgraph-diff`, so gradients flow through them
//! into their parameters.
//!
//! ## Core Concepts
//!
//! - **Variables**: deterministic functions, parametric families (Normal,
//!   Categorical, Bernoulli), empirical datasets and random minibatch indices
//! - **Minibatching**: empirical variables that read the same random-indices
//!   variable always see the same rows within a draw
//! - **Conditioning**: observing a variable binds it to data and adds its log
//!   density to the objective
//! - **Inference**: maximum likelihood over black-box parameters, or MAP point
//!   estimates for latent variables
//! - **Prediction**: prior and posterior sampling with clamped inputs
//!
//! ## Example: Bayesian Linear Regression
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use stochgraph_diff::function::FnFunction;
//! use stochgraph_diff::{OptimizerSpec, RTensor};
//! use stochgraph_prob::{perform_inference, InferenceConfig, ProbabilisticModel, VariableGraph};
//!
//! let xs = RTensor::vector(vec![0.0, 1.0, 2.0, 3.0]);
//! let ys = RTensor::vector(vec![0.1, 1.9, 4.1, 6.0]);
//!
//! let mut graph = VariableGraph::new();
//! graph.constant("x", xs.clone()).unwrap();
//! graph.constant("zero", RTensor::scalar(0.0)).unwrap();
//! graph.constant("prior_scale", RTensor::scalar(10.0)).unwrap();
//! graph.constant("noise", RTensor::scalar(0.5)).unwrap();
//! graph.normal("slope", "zero", "prior_scale").unwrap();
//! graph
//!     .deterministic("mean", FnFunction::new("times", |g, _p, v| g.mul(v[0], v[1])), &["slope", "x"])
//!     .unwrap();
//! graph.normal("y", "mean", "noise").unwrap();
//! graph.observe("y", ys).unwrap();
//!
//! let mut model = ProbabilisticModel::new(graph, &["y"]).unwrap();
//! let mut rng = ChaCha8Rng::seed_from_u64(7);
//! let config = InferenceConfig::default()
//!     .with_optimizer(OptimizerSpec::Sgd)
//!     .with_learning_rate(0.01)
//!     .with_iterations(200);
//! perform_inference(&mut model, &config, &mut rng).unwrap();
//!
//! let slope = model.parameter("slope:map").unwrap().data[0];
//! assert!((slope - 2.0).abs() < 0.1);
//!
//! // Predict at new inputs with the fitted slope.
//! let pred = model
//!     .get_posterior_sample(1, &[("x", RTensor::vector(vec![10.0]))], &mut rng)
//!     .unwrap();
//! assert_eq!(pred.get("mean").unwrap()[0].shape, vec![1]);
//! ```

mod error;
mod graph;
mod inference;
mod model;
mod posterior;
mod sampler;
mod variable;

pub use error::ModelError;
pub use graph::VariableGraph;
pub use inference::{perform_inference, perform_inference_with, Diagnostics, InferenceConfig};
pub use model::{LossEvaluation, Objective, PosteriorInit, ProbabilisticModel};
pub use sampler::Sample;
pub use variable::{
    DataSource, Dataset, Family, IndexPolicy, RandomIndices, Variable, VariableKind,
};
