//! # Optimization
//!
//! This module provides optimizers for gradient-based training and the
//! named parameter store they update.
//!
//! ## Optimizers
//!
//! - [`SGD`]: Stochastic Gradient Descent
//! - [`SGDMomentum`]: SGD with a velocity buffer
//! - [`Adam`]: adaptive moments with bias correction
//!
//! All three implement [`Optimizer`], and [`OptimizerSpec`] is the
//! serialisable description used by configuration files.
//!
//! ## Example
//!
//! ```rust
//! use stochgraph_diff::optim::{Optimizer, SGD};
//! use stochgraph_diff::ops::RTensor;
//!
//! let mut params = vec![RTensor::randn_seeded(vec![3, 2], 0.1, 0)];
//! let grads = vec![RTensor::full(vec![3, 2], 0.5)];
//!
//! let mut optimizer = SGD::new(0.01);
//! optimizer.step(&mut params, &grads).unwrap();
//! // params have been updated: param = param - 0.01 * grad
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DiffError;
use crate::ops::RTensor;

/// A first-order update rule over a fixed, ordered list of parameters.
///
/// Stateful optimizers keep one buffer per position, so callers must pass
/// parameters in the same order on every step.
pub trait Optimizer: fmt::Debug + Send {
    /// Update `params` in place from `grads`.
    fn step(&mut self, params: &mut [RTensor], grads: &[RTensor]) -> Result<(), DiffError>;

    /// Current step size.
    fn learning_rate(&self) -> f32;
}

fn check_pairs(op: &'static str, params: &[RTensor], grads: &[RTensor]) -> Result<(), DiffError> {
    if params.len() != grads.len() {
        return Err(DiffError::Arity {
            op,
            expected: params.len(),
            got: grads.len(),
        });
    }
    for (param, grad) in params.iter().zip(grads) {
        if param.shape != grad.shape {
            return Err(DiffError::ShapeMismatch {
                op,
                expected: param.shape.clone(),
                got: grad.shape.clone(),
            });
        }
    }
    Ok(())
}

/// Stochastic Gradient Descent optimizer.
///
/// Updates parameters using: `θ = θ - lr * ∇L`
#[derive(Debug, Clone)]
pub struct SGD {
    /// Learning rate (step size)
    pub learning_rate: f32,
}

impl SGD {
    /// Create a new SGD optimizer with the given learning rate.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [RTensor], grads: &[RTensor]) -> Result<(), DiffError> {
        check_pairs("SGD", params, grads)?;
        for (param, grad) in params.iter_mut().zip(grads.iter()) {
            for (p, g) in param.data.iter_mut().zip(grad.data.iter()) {
                *p -= self.learning_rate * g;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// SGD with momentum.
///
/// Updates parameters using:
/// - `v = momentum * v + grad`
/// - `θ = θ - lr * v`
#[derive(Debug, Clone)]
pub struct SGDMomentum {
    /// Learning rate
    pub learning_rate: f32,
    /// Momentum coefficient (typically 0.9)
    pub momentum: f32,
    /// Velocity buffers (one per parameter)
    velocities: Vec<RTensor>,
}

impl SGDMomentum {
    /// Create a new SGD with momentum optimizer.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocities: Vec::new(),
        }
    }
}

impl Optimizer for SGDMomentum {
    fn step(&mut self, params: &mut [RTensor], grads: &[RTensor]) -> Result<(), DiffError> {
        check_pairs("SGDMomentum", params, grads)?;
        if self.velocities.len() != params.len() {
            self.velocities = params.iter().map(|p| p.zeros_like()).collect();
        }

        for ((param, grad), velocity) in params
            .iter_mut()
            .zip(grads.iter())
            .zip(self.velocities.iter_mut())
        {
            // v = momentum * v + grad
            for (v, g) in velocity.data.iter_mut().zip(grad.data.iter()) {
                *v = self.momentum * *v + g;
            }

            // θ = θ - lr * v
            for (p, v) in param.data.iter_mut().zip(velocity.data.iter()) {
                *p -= self.learning_rate * v;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Adam optimizer.
///
/// - `m = β1 m + (1 - β1) g`
/// - `v = β2 v + (1 - β2) g²`
/// - `θ = θ - lr * m̂ / (√v̂ + ε)` with `m̂ = m / (1 - β1ᵗ)`, `v̂ = v / (1 - β2ᵗ)`
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: i32,
    m: Vec<RTensor>,
    v: Vec<RTensor>,
}

impl Adam {
    /// Adam with the usual defaults (β1 = 0.9, β2 = 0.999, ε = 1e-8).
    pub fn new(learning_rate: f32) -> Self {
        Self::with_betas(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(learning_rate: f32, beta1: f32, beta2: f32, eps: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Number of steps taken so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [RTensor], grads: &[RTensor]) -> Result<(), DiffError> {
        check_pairs("Adam", params, grads)?;
        if self.m.len() != params.len() {
            self.m = params.iter().map(|p| p.zeros_like()).collect();
            self.v = self.m.clone();
            self.t = 0;
        }
        self.t += 1;
        let c1 = 1.0 - self.beta1.powi(self.t);
        let c2 = 1.0 - self.beta2.powi(self.t);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let (m, v) = (&mut self.m[i].data, &mut self.v[i].data);
            for (j, (p, &g)) in param.data.iter_mut().zip(&grad.data).enumerate() {
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / c1;
                let v_hat = v[j] / c2;
                *p -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

/// Serialisable choice of update rule; the learning rate is supplied separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Sgd,
    Momentum { momentum: f32 },
    Adam { beta1: f32, beta2: f32, eps: f32 },
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        OptimizerSpec::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerSpec {
    /// Instantiate the optimizer with a learning rate.
    pub fn build(&self, learning_rate: f32) -> Box<dyn Optimizer> {
        match *self {
            OptimizerSpec::Sgd => Box::new(SGD::new(learning_rate)),
            OptimizerSpec::Momentum { momentum } => {
                Box::new(SGDMomentum::new(learning_rate, momentum))
            }
            OptimizerSpec::Adam { beta1, beta2, eps } => {
                Box::new(Adam::with_betas(learning_rate, beta1, beta2, eps))
            }
        }
    }
}

/// Parameter collection for managing named parameters.
///
/// Registration order is preserved and is the order optimizers see.
/// Deserialization rejects unpaired, duplicated or malformed entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredParameters")]
pub struct Parameters {
    names: Vec<String>,
    tensors: Vec<RTensor>,
}

#[derive(Deserialize)]
struct StoredParameters {
    names: Vec<String>,
    tensors: Vec<RTensor>,
}

impl TryFrom<StoredParameters> for Parameters {
    type Error = String;

    fn try_from(stored: StoredParameters) -> Result<Self, Self::Error> {
        if stored.names.len() != stored.tensors.len() {
            return Err(format!(
                "{} parameter names for {} tensors",
                stored.names.len(),
                stored.tensors.len()
            ));
        }
        let mut params = Parameters::new();
        for (name, tensor) in stored.names.into_iter().zip(stored.tensors) {
            let expected: usize = tensor.shape.iter().product();
            if tensor.data.len() != expected {
                return Err(format!(
                    "parameter '{}' has {} values for shape {:?}",
                    name,
                    tensor.data.len(),
                    tensor.shape
                ));
            }
            if !params.register(&name, tensor) {
                return Err(format!("parameter '{}' appears twice", name));
            }
        }
        Ok(params)
    }
}

impl Parameters {
    /// Create an empty parameter collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter with a name.
    ///
    /// Returns false (and leaves the store unchanged) if the name is taken.
    pub fn register(&mut self, name: &str, tensor: RTensor) -> bool {
        if self.contains(name) {
            return false;
        }
        self.names.push(name.to_string());
        self.tensors.push(tensor);
        true
    }

    /// Insert or overwrite a parameter.
    pub fn set(&mut self, name: &str, tensor: RTensor) {
        match self.get_mut(name) {
            Some(slot) => *slot = tensor,
            None => {
                self.names.push(name.to_string());
                self.tensors.push(tensor);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Get a parameter by name.
    pub fn get(&self, name: &str) -> Option<&RTensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.tensors[i])
    }

    /// Get a mutable reference to a parameter by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut RTensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &mut self.tensors[i])
    }

    /// Names in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Get all parameters as a slice.
    pub fn as_slice(&self) -> &[RTensor] {
        &self.tensors
    }

    /// Get all parameters as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [RTensor] {
        &mut self.tensors
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterate over (name, tensor) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RTensor)> {
        self.names
            .iter()
            .zip(self.tensors.iter())
            .map(|(n, t)| (n.as_str(), t))
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
