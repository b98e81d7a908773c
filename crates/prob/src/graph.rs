//! Builder for the variable graph.
//!
//! Variables may name parents that are defined later; references are
//! resolved when the graph is turned into a
//! [`ProbabilisticModel`](crate::ProbabilisticModel).

use std::collections::HashMap;
use std::sync::Arc;

use stochgraph_diff::function::{Constant, Parameter};
use stochgraph_diff::{DifferentiableFunction, RTensor};

use crate::error::ModelError;
use crate::variable::{DataSource, Dataset, Family, RandomIndices, Variable, VariableKind};

/// A set of named variables under construction.
#[derive(Debug, Default)]
pub struct VariableGraph {
    pub(crate) variables: Vec<Variable>,
    pub(crate) lookup: HashMap<String, usize>,
}

impl VariableGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable, rejecting duplicate names.
    pub fn add(&mut self, variable: Variable) -> Result<(), ModelError> {
        if self.lookup.contains_key(&variable.name) {
            return Err(ModelError::DuplicateVariable {
                name: variable.name,
            });
        }
        self.lookup
            .insert(variable.name.clone(), self.variables.len());
        self.variables.push(variable);
        Ok(())
    }

    fn define(&mut self, name: &str, kind: VariableKind) -> Result<(), ModelError> {
        self.add(Variable::new(name, kind))
    }

    /// A fixed tensor.
    pub fn constant(&mut self, name: &str, value: RTensor) -> Result<(), ModelError> {
        self.deterministic(name, Constant::new(value), &[])
    }

    /// A free learnable tensor.
    pub fn parameter(&mut self, name: &str, init: RTensor) -> Result<(), ModelError> {
        self.deterministic(name, Parameter::new(init), &[])
    }

    /// Apply `function` to the values of `parents`, in order.
    pub fn deterministic<F>(
        &mut self,
        name: &str,
        function: F,
        parents: &[&str],
    ) -> Result<(), ModelError>
    where
        F: DifferentiableFunction + 'static,
    {
        self.deterministic_shared(name, Arc::new(function), parents)
    }

    /// Like [`deterministic`](Self::deterministic) for a function shared with other code.
    pub fn deterministic_shared(
        &mut self,
        name: &str,
        function: Arc<dyn DifferentiableFunction>,
        parents: &[&str],
    ) -> Result<(), ModelError> {
        self.define(
            name,
            VariableKind::Deterministic {
                function,
                parents: parents.iter().map(|p| p.to_string()).collect(),
            },
        )
    }

    pub fn normal(&mut self, name: &str, loc: &str, scale: &str) -> Result<(), ModelError> {
        self.define(
            name,
            VariableKind::Parametric(Family::Normal {
                loc: loc.to_string(),
                scale: scale.to_string(),
            }),
        )
    }

    pub fn categorical(&mut self, name: &str, logits: &str) -> Result<(), ModelError> {
        self.define(
            name,
            VariableKind::Parametric(Family::Categorical {
                logits: logits.to_string(),
            }),
        )
    }

    pub fn bernoulli(&mut self, name: &str, logits: &str) -> Result<(), ModelError> {
        self.define(
            name,
            VariableKind::Parametric(Family::Bernoulli {
                logits: logits.to_string(),
            }),
        )
    }

    pub fn random_indices(&mut self, name: &str, indices: RandomIndices) -> Result<(), ModelError> {
        self.define(name, VariableKind::RandomIndices(indices))
    }

    /// Rows of `dataset`, selected by the `indices` variable when given.
    pub fn empirical(
        &mut self,
        name: &str,
        dataset: RTensor,
        indices: Option<&str>,
    ) -> Result<(), ModelError> {
        if dataset.rank() == 0 {
            return Err(ModelError::ShapeMismatch {
                variable: name.to_string(),
                expected: vec![dataset.size()],
                got: dataset.shape,
            });
        }
        self.define(
            name,
            VariableKind::Empirical {
                dataset: Arc::new(dataset),
                indices: indices.map(str::to_string),
            },
        )
    }

    /// Two empirical variables over a dataset's inputs and labels sharing one index draw.
    pub fn empirical_pair(
        &mut self,
        indices: &str,
        inputs: &str,
        labels: &str,
        dataset: Dataset,
    ) -> Result<(), ModelError> {
        self.empirical(inputs, dataset.inputs, Some(indices))?;
        self.empirical(labels, dataset.labels, Some(indices))
    }

    /// Bind a variable to data. A later call replaces the earlier binding.
    ///
    /// Tensor sources are checked against other tensor-bound variables here;
    /// sources read from variables are checked when the model is built and
    /// again on every draw.
    pub fn observe(&mut self, name: &str, source: impl Into<DataSource>) -> Result<(), ModelError> {
        let source = source.into();
        let idx = *self
            .lookup
            .get(name)
            .ok_or_else(|| ModelError::UnresolvedDependency {
                variable: "observe".to_string(),
                missing: name.to_string(),
            })?;

        if let DataSource::Tensor(data) = &source {
            for other in &self.variables {
                if other.name == name {
                    continue;
                }
                if let Some(DataSource::Tensor(existing)) = &other.observation {
                    if existing.rows() != data.rows() {
                        return Err(ModelError::ShapeMismatch {
                            variable: format!("{} vs {}", name, other.name),
                            expected: vec![existing.rows()],
                            got: vec![data.rows()],
                        });
                    }
                }
            }
        }

        self.variables[idx].observation = Some(source);
        Ok(())
    }

    /// Look up a variable by name.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.lookup.get(name).map(|&i| &self.variables[i])
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.variables.iter().map(|v| v.name.as_str())
    }
}
