//! Prior and posterior predictive sampling.
//!
//! Both samplers ignore observations: observed variables are drawn from
//! their distributions. Clamped inputs replace a variable's value in every
//! draw, so downstream batch sizes follow the clamp.

use std::collections::HashMap;

use rand::Rng;
use stochgraph_diff::RTensor;
use tracing::debug;

use crate::error::ModelError;
use crate::model::ProbabilisticModel;
use crate::sampler::{sample_many, DrawSettings, Sample};

impl ProbabilisticModel {
    /// Draw `n` samples from the generative model with `input_values` clamped.
    pub fn get_sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        input_values: &[(&str, RTensor)],
        rng: &mut R,
    ) -> Result<Sample, ModelError> {
        let clamps = self.clamps(input_values)?;
        sample_many(self, n, DrawSettings::GENERATIVE, &clamps, rng)
    }

    /// Like [`get_sample`](Self::get_sample), with latent variables fixed at
    /// their fitted point estimates.
    pub fn get_posterior_sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        input_values: &[(&str, RTensor)],
        rng: &mut R,
    ) -> Result<Sample, ModelError> {
        if !self.has_posterior() {
            return Err(ModelError::NoPosteriorDefined {
                roots: self.roots.clone(),
            });
        }
        let clamps = self.clamps(input_values)?;
        sample_many(self, n, DrawSettings::POSTERIOR, &clamps, rng)
    }

    fn clamps(&self, input_values: &[(&str, RTensor)]) -> Result<HashMap<String, RTensor>, ModelError> {
        let mut clamps = HashMap::with_capacity(input_values.len());
        for (name, value) in input_values {
            if self.variable(name).is_none() {
                return Err(ModelError::UnresolvedDependency {
                    variable: "input_values".to_string(),
                    missing: name.to_string(),
                });
            }
            clamps.insert(name.to_string(), value.clone());
        }
        if !clamps.is_empty() {
            debug!(clamped = ?clamps.keys().collect::<Vec<_>>(), "clamping inputs");
        }
        Ok(clamps)
    }
}
