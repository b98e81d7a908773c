//! Ancestral sampling over a resolved model.
//!
//! One *draw* walks the model's variables in topological order and records
//! each value on a [`DiffGraph`] tape, so the same walk serves both plain
//! sampling and differentiable loss evaluation. Every variable is evaluated
//! exactly once per draw; a random-indices variable is drawn once and all
//! empirical variables reading it see the same rows.

use std::collections::HashMap;

use rand::distributions::{Bernoulli, Distribution, WeightedIndex};
use rand::Rng;
use stochgraph_diff::ops::broadcast_shape;
use stochgraph_diff::{DiffGraph, NodeIndex, RTensor};

use crate::error::{AtVariable, ModelError};
use crate::model::ProbabilisticModel;
use crate::variable::{DataSource, Family, VariableKind};

/// Joint samples: one tensor per variable per draw.
///
/// The outer `Vec` is the Monte Carlo dimension; the leading axis of each
/// tensor is the variable's own batch dimension.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    draws: usize,
    values: HashMap<String, Vec<RTensor>>,
    indices: HashMap<String, Vec<Vec<usize>>>,
}

impl Sample {
    /// Number of draws.
    pub fn len(&self) -> usize {
        self.draws
    }

    pub fn is_empty(&self) -> bool {
        self.draws == 0
    }

    /// Every draw of one variable.
    pub fn get(&self, name: &str) -> Option<&[RTensor]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// All variables' values in draw `i`.
    pub fn draw(&self, i: usize) -> Option<HashMap<&str, &RTensor>> {
        if i >= self.draws {
            return None;
        }
        Some(
            self.values
                .iter()
                .map(|(name, values)| (name.as_str(), &values[i]))
                .collect(),
        )
    }

    /// Dataset rows an empirical variable read in each draw.
    pub fn indices(&self, name: &str) -> Option<&[Vec<usize>]> {
        self.indices.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.values.keys().map(String::as_str)
    }
}

/// What a draw does with observations and latent variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrawSettings {
    /// Observed variables take their bound data and are scored.
    pub condition: bool,
    /// Latent parametric variables take their fitted point estimates.
    pub point_estimates: bool,
    /// Score latent point estimates under their priors.
    pub score_priors: bool,
}

impl DrawSettings {
    pub const CONDITIONED: Self = Self {
        condition: true,
        point_estimates: false,
        score_priors: false,
    };
    pub const GENERATIVE: Self = Self {
        condition: false,
        point_estimates: false,
        score_priors: false,
    };
    pub const POSTERIOR: Self = Self {
        condition: false,
        point_estimates: true,
        score_priors: false,
    };
    pub const MAP_LOSS: Self = Self {
        condition: true,
        point_estimates: true,
        score_priors: true,
    };
}

/// Tape nodes and bookkeeping produced by one draw.
#[derive(Debug, Default)]
pub(crate) struct DrawOutcome {
    /// Variable index to the node holding its value
    pub nodes: HashMap<usize, NodeIndex>,
    /// Empirical variable index to the rows it read
    pub rows: HashMap<usize, Vec<usize>>,
    /// Scalar log-density terms to be summed
    pub log_terms: Vec<NodeIndex>,
}

/// Name of the learnable point estimate for a latent variable.
pub(crate) fn estimate_name(variable: &str) -> String {
    format!("{}:map", variable)
}

/// Name of a black-box parameter owned by a deterministic variable.
pub(crate) fn function_param_name(variable: &str, param: &str) -> String {
    format!("{}.{}", variable, param)
}

/// Walk the model once, recording every variable on `tape`.
pub(crate) fn draw<R: Rng + ?Sized>(
    model: &ProbabilisticModel,
    tape: &mut DiffGraph,
    settings: DrawSettings,
    clamps: &HashMap<String, RTensor>,
    rng: &mut R,
) -> Result<DrawOutcome, ModelError> {
    let mut out = DrawOutcome::default();
    let mut index_draws: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut observed_rows: Vec<(&str, usize)> = Vec::new();

    for &idx in &model.order {
        let var = &model.variables[idx];
        let name = var.name.as_str();
        let parent_nodes: Vec<NodeIndex> = model.parents[idx]
            .iter()
            .map(|p| out.nodes[p])
            .collect();

        if let Some(value) = clamps.get(name) {
            if let VariableKind::RandomIndices(ri) = &var.kind {
                index_draws.insert(idx, clamped_indices(name, value, ri.dataset_size())?);
            }
            out.nodes.insert(idx, tape.input(value.clone()));
            continue;
        }

        let node = match &var.kind {
            VariableKind::RandomIndices(ri) => {
                let rows = ri.draw(rng);
                let as_f32 = RTensor::vector(rows.iter().map(|&i| i as f32).collect());
                index_draws.insert(idx, rows);
                tape.input(as_f32)
            }

            VariableKind::Empirical { dataset, .. } => {
                let rows: Vec<usize> = match model.parents[idx].first() {
                    Some(p) => index_draws.get(p).cloned().ok_or_else(|| {
                        ModelError::config(format!("'{}' has no index draw to read", name))
                    })?,
                    None => (0..dataset.rows()).collect(),
                };
                let value = dataset.gather_rows(&rows).at(name)?;
                out.rows.insert(idx, rows);
                tape.input(value)
            }

            VariableKind::Deterministic { function, .. } => {
                let mut params = Vec::new();
                for full in &model.function_params[&idx] {
                    let value = model.params.get(full).ok_or_else(|| {
                        ModelError::config(format!("parameter '{}' is not registered", full))
                    })?;
                    params.push(tape.param(full, value));
                }
                function.forward(tape, &params, &parent_nodes).at(name)?
            }

            VariableKind::Parametric(family) => {
                let binding = if settings.condition {
                    var.observation()
                } else {
                    None
                };
                if let Some(source) = binding {
                    let data = match source {
                        DataSource::Tensor(t) => tape.input(t.clone()),
                        DataSource::Variable(_) => {
                            let src = model.sources[idx].ok_or_else(|| {
                                ModelError::config(format!("'{}' has no resolved source", name))
                            })?;
                            out.nodes[&src]
                        }
                    };
                    let rows = tape.value(data).at(name)?.rows();
                    observed_rows.push((name, rows));
                    let lp = log_density(tape, name, family, data, &parent_nodes)?;
                    out.log_terms.push(lp);
                    data
                } else if settings.point_estimates && !var.is_observed() {
                    let key = estimate_name(name);
                    let value = model.params.get(&key).ok_or_else(|| {
                        ModelError::config(format!("no point estimate for latent '{}'", name))
                    })?;
                    let node = tape.param(&key, value);
                    if settings.score_priors {
                        let lp = log_density(tape, name, family, node, &parent_nodes)?;
                        out.log_terms.push(lp);
                    }
                    node
                } else {
                    sample_family(tape, name, family, &parent_nodes, rng)?
                }
            }
        };
        out.nodes.insert(idx, node);
    }

    if let Some(&(first, rows)) = observed_rows.first() {
        if let Some(&(other, other_rows)) = observed_rows.iter().find(|(_, r)| *r != rows) {
            return Err(ModelError::ShapeMismatch {
                variable: format!("{} vs {}", first, other),
                expected: vec![rows],
                got: vec![other_rows],
            });
        }
    }

    Ok(out)
}

fn clamped_indices(name: &str, value: &RTensor, dataset_size: usize) -> Result<Vec<usize>, ModelError> {
    value
        .data
        .iter()
        .map(|&v| {
            if v >= 0.0 && v.fract() == 0.0 && (v as usize) < dataset_size {
                Ok(v as usize)
            } else {
                Err(ModelError::config(format!(
                    "clamped index {} for '{}' is outside 0..{}",
                    v, name, dataset_size
                )))
            }
        })
        .collect()
}

/// Summed log-density of `value` under `family` with parameters `params`.
fn log_density(
    tape: &mut DiffGraph,
    name: &str,
    family: &Family,
    value: NodeIndex,
    params: &[NodeIndex],
) -> Result<NodeIndex, ModelError> {
    let elementwise = match family {
        Family::Normal { .. } => tape.normal_log_pdf(value, params[0], params[1]),
        Family::Categorical { .. } => tape.categorical_log_pmf(params[0], value),
        Family::Bernoulli { .. } => tape.bernoulli_log_pmf(params[0], value),
    }
    .at(name)?;
    tape.sum_all(elementwise).at(name)
}

fn sample_family<R: Rng + ?Sized>(
    tape: &mut DiffGraph,
    name: &str,
    family: &Family,
    params: &[NodeIndex],
    rng: &mut R,
) -> Result<NodeIndex, ModelError> {
    match family {
        Family::Normal { .. } => {
            // loc + scale * eps keeps the draw differentiable in loc and scale
            let (loc, scale) = (params[0], params[1]);
            let loc_shape = tape.shape(loc).at(name)?.to_vec();
            let scale_shape = tape.shape(scale).at(name)?.to_vec();
            let shape = broadcast_shape(&loc_shape, &scale_shape).ok_or_else(|| {
                ModelError::ShapeMismatch {
                    variable: name.to_string(),
                    expected: loc_shape.clone(),
                    got: scale_shape.clone(),
                }
            })?;
            let eps = tape.input(RTensor::randn(shape, 1.0, rng));
            let noise = tape.mul(scale, eps).at(name)?;
            tape.add(loc, noise).at(name)
        }

        Family::Categorical { .. } => {
            let logits = tape.value(params[0]).at(name)?;
            let k = match logits.shape.last() {
                Some(&k) if k > 0 => k,
                _ => {
                    return Err(ModelError::ShapeMismatch {
                        variable: name.to_string(),
                        expected: vec![1],
                        got: logits.shape.clone(),
                    })
                }
            };
            let rows = logits.size() / k;
            let mut classes = Vec::with_capacity(rows);
            for r in 0..rows {
                let row = &logits.data[r * k..(r + 1) * k];
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let weights: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
                let dist = WeightedIndex::new(&weights).map_err(|e| {
                    ModelError::config(format!("cannot sample '{}': {}", name, e))
                })?;
                classes.push(dist.sample(rng) as f32);
            }
            let shape = logits.shape[..logits.rank() - 1].to_vec();
            Ok(tape.input(RTensor::from_data(shape, classes)))
        }

        Family::Bernoulli { .. } => {
            let logits = tape.value(params[0]).at(name)?;
            let mut draws = logits.zeros_like();
            for (d, &l) in draws.data.iter_mut().zip(&logits.data) {
                let p = 1.0 / (1.0 + (-f64::from(l)).exp());
                let dist = Bernoulli::new(p).map_err(|e| {
                    ModelError::config(format!("cannot sample '{}': {}", name, e))
                })?;
                *d = if dist.sample(rng) { 1.0 } else { 0.0 };
            }
            Ok(tape.input(draws))
        }
    }
}

/// Draw `n` independent joint samples, each on a fresh tape.
pub(crate) fn sample_many<R: Rng + ?Sized>(
    model: &ProbabilisticModel,
    n: usize,
    settings: DrawSettings,
    clamps: &HashMap<String, RTensor>,
    rng: &mut R,
) -> Result<Sample, ModelError> {
    if n == 0 {
        return Err(ModelError::config("number of samples must be positive"));
    }
    let mut sample = Sample {
        draws: n,
        ..Sample::default()
    };
    for _ in 0..n {
        let mut tape = DiffGraph::new();
        let outcome = draw(model, &mut tape, settings, clamps, rng)?;
        for &idx in &model.order {
            let name = &model.variables[idx].name;
            let value = tape.value(outcome.nodes[&idx]).at(name)?.clone();
            sample.values.entry(name.clone()).or_default().push(value);
        }
        for (idx, rows) in outcome.rows {
            sample
                .indices
                .entry(model.variables[idx].name.clone())
                .or_default()
                .push(rows);
        }
    }
    Ok(sample)
}
