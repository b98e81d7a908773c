//! Gradient-based inference over a [`ProbabilisticModel`].
//!
//! Every iteration draws fresh joint samples, evaluates the objective on one
//! tape, back-propagates through it (black-box functions included) and takes
//! a single optimizer step on every learnable parameter.
//!
//! # Example
//!
//! ```rust
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//! use stochgraph_diff::{OptimizerSpec, RTensor};
//! use stochgraph_prob::{perform_inference, InferenceConfig, Objective, ProbabilisticModel, VariableGraph};
//!
//! let mut graph = VariableGraph::new();
//! graph.parameter("mu", RTensor::scalar(0.0)).unwrap();
//! graph.constant("sigma", RTensor::scalar(1.0)).unwrap();
//! graph.normal("x", "mu", "sigma").unwrap();
//! graph.observe("x", RTensor::vector(vec![2.0, 2.2, 1.8])).unwrap();
//!
//! let mut model = ProbabilisticModel::new(graph, &["x"]).unwrap();
//! let config = InferenceConfig::default()
//!     .with_method(Objective::MaximumLikelihood)
//!     .with_optimizer(OptimizerSpec::Sgd)
//!     .with_iterations(200)
//!     .with_learning_rate(0.05);
//! let mut rng = ChaCha8Rng::seed_from_u64(0);
//! let diagnostics = perform_inference(&mut model, &config, &mut rng).unwrap();
//!
//! assert_eq!(diagnostics.loss_curve().len(), 200);
//! let mu = model.parameter("mu.value").unwrap().data[0];
//! assert!((mu - 2.0).abs() < 0.1);
//! ```

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use rand::Rng;
use serde::{Deserialize, Serialize};
use stochgraph_diff::{OptimizerSpec, RTensor};
use tracing::{debug, info, warn};

use crate::error::{AtVariable, ModelError};
use crate::model::{Objective, PosteriorInit, ProbabilisticModel};

/// Settings for [`perform_inference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub method: Objective,
    pub iterations: usize,
    pub optimizer: OptimizerSpec,
    pub learning_rate: f32,
    /// Joint draws averaged per loss evaluation.
    pub number_samples: usize,
    /// Starting point of MAP estimates that do not exist yet.
    pub posterior_init: PosteriorInit,
    /// Emit a debug event every this many iterations; 0 disables it.
    pub log_every: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            method: Objective::Map,
            iterations: 100,
            optimizer: OptimizerSpec::default(),
            learning_rate: 0.01,
            number_samples: 1,
            posterior_init: PosteriorInit::default(),
            log_every: 50,
        }
    }
}

impl InferenceConfig {
    pub fn with_method(mut self, method: Objective) -> Self {
        self.method = method;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerSpec) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_number_samples(mut self, number_samples: usize) -> Self {
        self.number_samples = number_samples;
        self
    }

    pub fn with_posterior_init(mut self, init: PosteriorInit) -> Self {
        self.posterior_init = init;
        self
    }

    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every;
        self
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.number_samples == 0 {
            return Err(ModelError::config("number_samples must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ModelError::config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Named per-iteration series recorded during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    series: BTreeMap<String, Vec<f32>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value to a series, creating it on first use.
    pub fn record(&mut self, name: &str, value: f32) {
        self.series.entry(name.to_string()).or_default().push(value);
    }

    pub fn series(&self, name: &str) -> Option<&[f32]> {
        self.series.get(name).map(Vec::as_slice)
    }

    /// The loss after each completed iteration.
    pub fn loss_curve(&self) -> &[f32] {
        self.series("loss").unwrap_or(&[])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.series.keys().map(String::as_str)
    }

    /// Iterations recorded so far.
    pub fn len(&self) -> usize {
        self.loss_curve().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fit the model's learnable parameters.
pub fn perform_inference<R: Rng + ?Sized>(
    model: &mut ProbabilisticModel,
    config: &InferenceConfig,
    rng: &mut R,
) -> Result<Diagnostics, ModelError> {
    perform_inference_with(model, config, rng, |_, _| ControlFlow::Continue(()))
}

/// Like [`perform_inference`], calling `observer(iteration, loss)` after every
/// step. Returning [`ControlFlow::Break`] ends the run early.
pub fn perform_inference_with<R, F>(
    model: &mut ProbabilisticModel,
    config: &InferenceConfig,
    rng: &mut R,
    mut observer: F,
) -> Result<Diagnostics, ModelError>
where
    R: Rng + ?Sized,
    F: FnMut(usize, f32) -> ControlFlow<()>,
{
    config.validate()?;
    if config.method == Objective::Map {
        model.initialize_point_estimates(config.posterior_init, rng)?;
    }
    let learnable = model.learnable_parameters(config.method);
    if learnable.is_empty() {
        return Err(ModelError::config(format!(
            "{:?} has no learnable parameters to fit",
            config.method
        )));
    }

    let mut optimizer = config.optimizer.build(config.learning_rate);
    let mut diagnostics = Diagnostics::new();
    info!(
        method = ?config.method,
        iterations = config.iterations,
        parameters = learnable.len(),
        scalars = model.parameters().num_parameters(),
        "starting inference"
    );

    for iteration in 0..config.iterations {
        let eval = model.loss(config.method, config.number_samples, rng)?;
        if !eval.value.is_finite() {
            warn!(iteration, value = eval.value, "loss is not finite, stopping");
            return Err(ModelError::NonFiniteLoss {
                iteration,
                value: eval.value,
            });
        }

        let mut values: Vec<RTensor> = Vec::with_capacity(learnable.len());
        for name in &learnable {
            let value = model.parameter(name).ok_or_else(|| {
                ModelError::config(format!("parameter '{}' disappeared during inference", name))
            })?;
            values.push(value.clone());
        }
        let grads: Vec<RTensor> = eval.gradients.into_iter().map(|(_, g)| g).collect();
        optimizer.step(&mut values, &grads).at("optimizer")?;
        for (name, value) in learnable.iter().zip(values) {
            model.params_mut().set(name, value);
        }

        diagnostics.record("loss", eval.value);
        if config.log_every > 0 && iteration % config.log_every == 0 {
            debug!(iteration, loss = eval.value, "inference step");
        }
        if observer(iteration, eval.value).is_break() {
            info!(iteration, "inference stopped by observer");
            break;
        }
    }

    // A posterior exists only once at least one step has been taken.
    if config.method == Objective::Map && !model.latents.is_empty() && !diagnostics.is_empty() {
        model.fitted = true;
    }
    info!(
        iterations = diagnostics.len(),
        final_loss = diagnostics.loss_curve().last().copied().unwrap_or(f32::NAN),
        "inference finished"
    );
    Ok(diagnostics)
}
