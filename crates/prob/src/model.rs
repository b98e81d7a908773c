//! # Probabilistic Model
//!
//! A [`ProbabilisticModel`] is a [`VariableGraph`] resolved against a set of
//! root variables: only the roots and their ancestors (including the
//! variables observations read from) take part.
//!
//! ## Objectives
//!
//! Both objectives are Monte Carlo averages over `n` joint draws:
//!
//! - **Maximum likelihood**: `-(1/n) Σ_draws Σ_observed log p(data | parents)`,
//!   with latent variables drawn from their priors.
//! - **MAP**: every latent parametric variable is replaced by a learnable
//!   point estimate, and its log prior density is added to the log joint.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use stochgraph_diff::{backward, DiffGraph, Parameters, RTensor};
use tracing::debug;

use crate::error::{AtVariable, ModelError};
use crate::graph::VariableGraph;
use crate::sampler::{
    draw, estimate_name, function_param_name, sample_many, DrawSettings, Sample,
};
use crate::variable::{DataSource, Variable, VariableKind};

/// Which loss to minimise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    MaximumLikelihood,
    Map,
}

/// Where MAP point estimates start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PosteriorInit {
    /// One draw from the prior.
    #[default]
    PriorSample,
    /// The prior's location, broadcast to the variable's shape.
    PriorMean,
}

/// Loss value and gradients for every learnable parameter of an objective.
#[derive(Debug, Clone)]
pub struct LossEvaluation {
    pub value: f32,
    /// `(parameter name, gradient)` in the order of
    /// [`ProbabilisticModel::learnable_parameters`].
    pub gradients: Vec<(String, RTensor)>,
}

/// A variable graph resolved against its roots.
#[derive(Debug)]
pub struct ProbabilisticModel {
    pub(crate) variables: Vec<Variable>,
    pub(crate) lookup: HashMap<String, usize>,
    pub(crate) roots: Vec<String>,
    /// Ancestors of the roots in topological order
    pub(crate) order: Vec<usize>,
    /// Resolved parent indices per variable
    pub(crate) parents: Vec<Vec<usize>>,
    /// Resolved observation source per variable
    pub(crate) sources: Vec<Option<usize>>,
    /// Full parameter names per deterministic variable
    pub(crate) function_params: HashMap<usize, Vec<String>>,
    pub(crate) params: Parameters,
    /// Unobserved parametric variables
    pub(crate) latents: Vec<usize>,
    pub(crate) fitted: bool,
}

impl ProbabilisticModel {
    /// Resolve `graph` against `roots`.
    pub fn new(graph: VariableGraph, roots: &[&str]) -> Result<Self, ModelError> {
        let VariableGraph { variables, lookup } = graph;
        if roots.is_empty() {
            return Err(ModelError::config("a model needs at least one root variable"));
        }

        // Resolve every dependency of every reachable variable.
        let mut parents = vec![Vec::new(); variables.len()];
        let mut sources = vec![None; variables.len()];
        let mut included: Vec<usize> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut stack: Vec<usize> = Vec::new();
        for root in roots {
            let idx = *lookup
                .get(*root)
                .ok_or_else(|| ModelError::UnresolvedDependency {
                    variable: "roots".to_string(),
                    missing: root.to_string(),
                })?;
            stack.push(idx);
        }
        while let Some(idx) = stack.pop() {
            if !seen.insert(idx) {
                continue;
            }
            included.push(idx);
            let var = &variables[idx];
            let resolve = |dep: &str| {
                lookup
                    .get(dep)
                    .copied()
                    .ok_or_else(|| ModelError::UnresolvedDependency {
                        variable: var.name.clone(),
                        missing: dep.to_string(),
                    })
            };
            for p in var.parents() {
                let p = resolve(p)?;
                parents[idx].push(p);
                stack.push(p);
            }
            if let Some(DataSource::Variable(src)) = var.observation() {
                let s = resolve(src)?;
                sources[idx] = Some(s);
                stack.push(s);
            }
        }

        // Order the reachable subgraph; a cycle is fatal.
        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let nodes: HashMap<usize, _> = included.iter().map(|&i| (i, dag.add_node(i))).collect();
        for &idx in &included {
            for dep in parents[idx].iter().chain(sources[idx].iter()) {
                dag.add_edge(nodes[dep], nodes[&idx], ());
            }
        }
        let order: Vec<usize> = toposort(&dag, None)
            .map_err(|cycle| ModelError::CyclicGraph {
                variable: variables[dag[cycle.node_id()]].name.clone(),
            })?
            .into_iter()
            .map(|n| dag[n])
            .collect();

        let mut model = Self {
            variables,
            lookup,
            roots: roots.iter().map(|r| r.to_string()).collect(),
            order,
            parents,
            sources,
            function_params: HashMap::new(),
            params: Parameters::new(),
            latents: Vec::new(),
            fitted: false,
        };
        model.validate()?;
        model.register_parameters()?;
        debug!(
            variables = model.order.len(),
            parameters = model.params.len(),
            latents = model.latents.len(),
            "model resolved"
        );
        Ok(model)
    }

    fn validate(&mut self) -> Result<(), ModelError> {
        let mut batch: Option<(&str, usize)> = None;
        for &idx in &self.order {
            let var = &self.variables[idx];
            if let VariableKind::Empirical {
                dataset,
                indices: Some(_),
            } = &var.kind
            {
                let parent = &self.variables[self.parents[idx][0]];
                match &parent.kind {
                    VariableKind::RandomIndices(ri) if ri.dataset_size() != dataset.rows() => {
                        return Err(ModelError::ShapeMismatch {
                            variable: var.name.clone(),
                            expected: vec![ri.dataset_size()],
                            got: dataset.shape.clone(),
                        })
                    }
                    VariableKind::RandomIndices(_) => {}
                    _ => {
                        return Err(ModelError::config(format!(
                            "'{}' reads indices from '{}', which is not a random-indices variable",
                            var.name, parent.name
                        )))
                    }
                }
            }

            match (&var.kind, var.observation()) {
                (VariableKind::Parametric(_), Some(source)) => {
                    if let Some(rows) = self.static_rows(source) {
                        match batch {
                            Some((other, expected)) if expected != rows => {
                                return Err(ModelError::ShapeMismatch {
                                    variable: format!("{} vs {}", var.name, other),
                                    expected: vec![expected],
                                    got: vec![rows],
                                })
                            }
                            Some(_) => {}
                            None => batch = Some((var.name.as_str(), rows)),
                        }
                    }
                }
                (VariableKind::Parametric(_), None) => {}
                (_, Some(_)) => {
                    return Err(ModelError::config(format!(
                        "only parametric variables can be observed, '{}' is not",
                        var.name
                    )))
                }
                (_, None) => {}
            }
        }

        self.latents = self
            .order
            .iter()
            .copied()
            .filter(|&i| self.variables[i].is_parametric() && !self.variables[i].is_observed())
            .collect();
        Ok(())
    }

    /// Batch size of an observation source when it is known without sampling.
    fn static_rows(&self, source: &DataSource) -> Option<usize> {
        match source {
            DataSource::Tensor(t) => Some(t.rows()),
            DataSource::Variable(name) => {
                let idx = *self.lookup.get(name)?;
                match &self.variables[idx].kind {
                    VariableKind::Empirical { indices: None, dataset } => Some(dataset.rows()),
                    VariableKind::Empirical { .. } => {
                        match &self.variables[self.parents[idx][0]].kind {
                            VariableKind::RandomIndices(ri) => Some(ri.batch_size()),
                            _ => None,
                        }
                    }
                    _ => None,
                }
            }
        }
    }

    /// Register every black-box function parameter under its full name.
    /// Full names must be unique, including against the estimate names
    /// reserved for latent variables.
    fn register_parameters(&mut self) -> Result<(), ModelError> {
        let mut owners: HashMap<String, usize> = self
            .latents
            .iter()
            .map(|&i| (estimate_name(&self.variables[i].name), i))
            .collect();
        for &idx in &self.order {
            if let VariableKind::Deterministic { function, .. } = &self.variables[idx].kind {
                let mut names = Vec::new();
                for (pname, init) in function.parameters() {
                    let full = function_param_name(&self.variables[idx].name, &pname);
                    if let Some(&owner) = owners.get(&full) {
                        return Err(ModelError::config(format!(
                            "parameter '{}' of '{}' collides with a name already used by '{}'",
                            full, self.variables[idx].name, self.variables[owner].name
                        )));
                    }
                    owners.insert(full.clone(), idx);
                    self.params.register(&full, init);
                    names.push(full);
                }
                self.function_params.insert(idx, names);
            }
        }
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup
            .get(name)
            .copied()
            .filter(|i| self.order.contains(i))
    }

    /// Root variable names.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Names of all variables in the model, in topological order.
    pub fn variable_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.variables[i].name.as_str())
            .collect()
    }

    /// A variable of this model by name.
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.index_of(name).map(|i| &self.variables[i])
    }

    /// Names of unobserved parametric variables.
    pub fn latent_variables(&self) -> Vec<&str> {
        self.latents
            .iter()
            .map(|&i| self.variables[i].name.as_str())
            .collect()
    }

    /// Draw `n` joint samples, with observed variables carrying their data.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Sample, ModelError> {
        sample_many(self, n, DrawSettings::CONDITIONED, &HashMap::new(), rng)
    }

    /// Draw `n` values of a single variable.
    pub fn sample_variable<R: Rng + ?Sized>(
        &self,
        name: &str,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<RTensor>, ModelError> {
        if self.index_of(name).is_none() {
            return Err(ModelError::UnresolvedDependency {
                variable: "sample_variable".to_string(),
                missing: name.to_string(),
            });
        }
        let sample = self.sample(n, rng)?;
        Ok(sample.get(name).map(<[RTensor]>::to_vec).unwrap_or_default())
    }

    /// Parameters an objective updates, in a stable order.
    ///
    /// Black-box parameters always take part; MAP adds one point estimate per
    /// latent variable.
    pub fn learnable_parameters(&self, objective: Objective) -> Vec<String> {
        let estimates: HashSet<String> = self
            .latents
            .iter()
            .map(|&i| estimate_name(&self.variables[i].name))
            .collect();
        self.params
            .names()
            .iter()
            .filter(|n| objective == Objective::Map || !estimates.contains(*n))
            .cloned()
            .collect()
    }

    /// Current value of a learnable parameter.
    pub fn parameter(&self, name: &str) -> Option<&RTensor> {
        self.params.get(name)
    }

    /// The full parameter store.
    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// True once point estimates for every latent variable have been fitted.
    pub fn has_posterior(&self) -> bool {
        self.fitted
    }

    /// Check that MAP can be applied: every latent must be continuous.
    pub(crate) fn check_map_support(&self) -> Result<(), ModelError> {
        for &i in &self.latents {
            if let VariableKind::Parametric(family) = &self.variables[i].kind {
                if !family.is_continuous() {
                    return Err(ModelError::config(format!(
                        "MAP needs continuous latent variables, '{}' is {}",
                        self.variables[i].name,
                        family.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Create point estimates for latent variables that do not have one yet.
    pub fn initialize_point_estimates<R: Rng + ?Sized>(
        &mut self,
        init: PosteriorInit,
        rng: &mut R,
    ) -> Result<(), ModelError> {
        self.check_map_support()?;
        let missing: Vec<usize> = self
            .latents
            .iter()
            .copied()
            .filter(|&i| !self.params.contains(&estimate_name(&self.variables[i].name)))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut tape = DiffGraph::new();
        let outcome = draw(self, &mut tape, DrawSettings::GENERATIVE, &HashMap::new(), rng)?;
        for idx in missing {
            let name = self.variables[idx].name.clone();
            let drawn = tape.value(outcome.nodes[&idx]).at(&name)?;
            let value = match init {
                PosteriorInit::PriorSample => drawn.clone(),
                PosteriorInit::PriorMean => {
                    let loc = tape.value(outcome.nodes[&self.parents[idx][0]]).at(&name)?;
                    loc.broadcast_to(&drawn.shape).at(&name)?
                }
            };
            self.params.register(&estimate_name(&name), value);
        }
        Ok(())
    }

    /// Evaluate an objective and its gradients over `n` joint draws.
    pub fn loss<R: Rng + ?Sized>(
        &self,
        objective: Objective,
        n: usize,
        rng: &mut R,
    ) -> Result<LossEvaluation, ModelError> {
        if n == 0 {
            return Err(ModelError::config("number of samples must be positive"));
        }
        let settings = match objective {
            Objective::MaximumLikelihood => DrawSettings::CONDITIONED,
            Objective::Map => {
                self.check_map_support()?;
                DrawSettings::MAP_LOSS
            }
        };

        let mut tape = DiffGraph::new();
        let mut terms = Vec::new();
        for _ in 0..n {
            let outcome = draw(self, &mut tape, settings, &HashMap::new(), rng)?;
            terms.extend(outcome.log_terms);
        }
        let Some((&first, rest)) = terms.split_first() else {
            return Err(ModelError::config(
                "nothing to score: the model has no observed variables",
            ));
        };
        let mut total = first;
        for &term in rest {
            total = tape.add(total, term).at("loss")?;
        }
        let loss = tape.scale(total, -1.0 / n as f32).at("loss")?;
        let value = tape.value(loss).at("loss")?.data[0];

        let grads = backward(&tape, loss).at("loss")?;
        let gradients = self
            .learnable_parameters(objective)
            .into_iter()
            .map(|name| {
                let g = match (grads.param(&name), self.params.get(&name)) {
                    (Some(g), _) => g.clone(),
                    (None, Some(p)) => p.zeros_like(),
                    (None, None) => RTensor::scalar(0.0),
                };
                (name, g)
            })
            .collect();

        Ok(LossEvaluation { value, gradients })
    }

    pub(crate) fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// Serialise every learnable parameter to JSON.
    pub fn parameters_to_json(&self) -> Result<String, ModelError> {
        self.params.to_json().map_err(|e| ModelError::Persistence {
            reason: e.to_string(),
        })
    }

    /// Overwrite parameters from JSON produced by [`parameters_to_json`](Self::parameters_to_json).
    ///
    /// Every stored name must belong to this model and keep its shape. Loading
    /// point estimates for every latent variable makes the posterior available.
    pub fn parameters_from_json(&mut self, json: &str) -> Result<(), ModelError> {
        let loaded = Parameters::from_json(json).map_err(|e| ModelError::Persistence {
            reason: e.to_string(),
        })?;
        let estimates: HashMap<String, usize> = self
            .latents
            .iter()
            .map(|&i| (estimate_name(&self.variables[i].name), i))
            .collect();
        let prior_shapes = if loaded
            .names()
            .iter()
            .any(|n| !self.params.contains(n) && estimates.contains_key(n))
        {
            self.latent_shapes()?
        } else {
            HashMap::new()
        };

        for (name, value) in loaded.iter() {
            let expected = match self.params.get(name) {
                Some(current) => Some(&current.shape),
                None => estimates.get(name).and_then(|i| prior_shapes.get(i)),
            };
            match expected {
                Some(shape) if *shape != value.shape => {
                    return Err(ModelError::ShapeMismatch {
                        variable: name.to_string(),
                        expected: shape.clone(),
                        got: value.shape.clone(),
                    })
                }
                Some(_) => {}
                None => {
                    return Err(ModelError::Persistence {
                        reason: format!("unknown parameter '{}'", name),
                    })
                }
            }
        }
        for (name, value) in loaded.iter() {
            self.params.set(name, value.clone());
        }
        if !self.latents.is_empty() && estimates.keys().all(|k| self.params.contains(k)) {
            self.fitted = true;
        }
        Ok(())
    }

    /// Shapes of the latent variables in one prior draw.
    fn latent_shapes(&self) -> Result<HashMap<usize, Vec<usize>>, ModelError> {
        let mut tape = DiffGraph::new();
        let mut rng = StdRng::seed_from_u64(0);
        let outcome = draw(self, &mut tape, DrawSettings::GENERATIVE, &HashMap::new(), &mut rng)?;
        self.latents
            .iter()
            .map(|&i| {
                let shape = tape.shape(outcome.nodes[&i]).at(&self.variables[i].name)?;
                Ok((i, shape.to_vec()))
            })
            .collect()
    }

    /// Write parameters to a JSON file.
    pub fn save_parameters(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let json = self.parameters_to_json()?;
        fs::write(path.as_ref(), json).map_err(|e| ModelError::Persistence {
            reason: format!("{}: {}", path.as_ref().display(), e),
        })
    }

    /// Read parameters from a JSON file.
    pub fn load_parameters(&mut self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let json = fs::read_to_string(path.as_ref()).map_err(|e| ModelError::Persistence {
            reason: format!("{}: {}", path.as_ref().display(), e),
        })?;
        self.parameters_from_json(&json)
    }
}
