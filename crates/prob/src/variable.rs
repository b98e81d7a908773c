//! Variable kinds: deterministic functions, parametric families, empirical
//! data and random minibatch indices.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rand::seq::index::sample as sample_indices;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use stochgraph_diff::{DifferentiableFunction, RTensor};

use crate::error::ModelError;

/// Distribution families a parametric variable can draw from.
///
/// Parameters are names of other variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Family {
    /// Elementwise Normal; `loc` and `scale` broadcast against each other.
    Normal { loc: String, scale: String },
    /// Categorical over the last axis of `logits`; values are class indices.
    Categorical { logits: String },
    /// Elementwise Bernoulli with success probability `sigmoid(logits)`.
    Bernoulli { logits: String },
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Normal { .. } => "Normal",
            Family::Categorical { .. } => "Categorical",
            Family::Bernoulli { .. } => "Bernoulli",
        }
    }

    /// Parameter variables in the order the log-density takes them.
    pub fn parents(&self) -> Vec<&str> {
        match self {
            Family::Normal { loc, scale } => vec![loc.as_str(), scale.as_str()],
            Family::Categorical { logits } | Family::Bernoulli { logits } => vec![logits.as_str()],
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Family::Normal { .. })
    }
}

/// How a [`RandomIndices`] variable picks rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPolicy {
    /// Independent uniform draws; rows may repeat within a batch.
    WithReplacement,
    /// Distinct rows within each batch.
    #[default]
    WithoutReplacement,
    /// Walk a random permutation batch by batch, reshuffling when an epoch ends.
    Shuffled,
}

#[derive(Debug, Default)]
struct Epoch {
    order: Vec<usize>,
    cursor: usize,
}

/// Draws `batch_size` row indices in `[0, dataset_size)` per sampling call.
#[derive(Debug)]
pub struct RandomIndices {
    dataset_size: usize,
    batch_size: usize,
    policy: IndexPolicy,
    epoch: RefCell<Epoch>,
}

impl RandomIndices {
    pub fn new(
        dataset_size: usize,
        batch_size: usize,
        policy: IndexPolicy,
    ) -> Result<Self, ModelError> {
        if dataset_size == 0 {
            return Err(ModelError::config("random indices need a non-empty dataset"));
        }
        if batch_size == 0 {
            return Err(ModelError::config("random indices need batch_size > 0"));
        }
        if policy != IndexPolicy::WithReplacement && batch_size > dataset_size {
            return Err(ModelError::config(format!(
                "batch_size {} exceeds dataset_size {} under {:?}",
                batch_size, dataset_size, policy
            )));
        }
        Ok(Self {
            dataset_size,
            batch_size,
            policy,
            epoch: RefCell::new(Epoch::default()),
        })
    }

    pub fn dataset_size(&self) -> usize {
        self.dataset_size
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn policy(&self) -> IndexPolicy {
        self.policy
    }

    /// Draw one batch of indices.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        match self.policy {
            IndexPolicy::WithReplacement => (0..self.batch_size)
                .map(|_| rng.gen_range(0..self.dataset_size))
                .collect(),
            IndexPolicy::WithoutReplacement => {
                sample_indices(rng, self.dataset_size, self.batch_size).into_vec()
            }
            IndexPolicy::Shuffled => {
                let mut epoch = self.epoch.borrow_mut();
                if epoch.order.is_empty() || epoch.cursor + self.batch_size > epoch.order.len() {
                    epoch.order = (0..self.dataset_size).collect();
                    epoch.order.shuffle(rng);
                    epoch.cursor = 0;
                }
                let start = epoch.cursor;
                epoch.cursor += self.batch_size;
                epoch.order[start..start + self.batch_size].to_vec()
            }
        }
    }
}

/// Paired inputs and labels with equal leading dimension.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub inputs: RTensor,
    pub labels: RTensor,
}

impl Dataset {
    pub fn new(inputs: RTensor, labels: RTensor) -> Result<Self, ModelError> {
        if inputs.rows() != labels.rows() || inputs.rank() == 0 || labels.rank() == 0 {
            return Err(ModelError::ShapeMismatch {
                variable: "dataset labels".to_string(),
                expected: vec![inputs.rows()],
                got: labels.shape.clone(),
            });
        }
        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.inputs.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where an observed variable's value comes from.
#[derive(Debug, Clone)]
pub enum DataSource {
    /// A fixed tensor, used as-is on every draw.
    Tensor(RTensor),
    /// The value of another variable in the same draw, usually an empirical one.
    Variable(String),
}

impl From<RTensor> for DataSource {
    fn from(t: RTensor) -> Self {
        DataSource::Tensor(t)
    }
}

impl From<&str> for DataSource {
    fn from(name: &str) -> Self {
        DataSource::Variable(name.to_string())
    }
}

/// How a variable produces its value.
pub enum VariableKind {
    Deterministic {
        function: Arc<dyn DifferentiableFunction>,
        parents: Vec<String>,
    },
    Parametric(Family),
    /// Rows of `dataset` at the indices drawn by `indices`, or every row.
    Empirical {
        dataset: Arc<RTensor>,
        indices: Option<String>,
    },
    RandomIndices(RandomIndices),
}

impl fmt::Debug for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableKind::Deterministic { function, parents } => f
                .debug_struct("Deterministic")
                .field("function", &function.name())
                .field("parents", parents)
                .finish(),
            VariableKind::Parametric(family) => f.debug_tuple("Parametric").field(family).finish(),
            VariableKind::Empirical { dataset, indices } => f
                .debug_struct("Empirical")
                .field("shape", &dataset.shape)
                .field("indices", indices)
                .finish(),
            VariableKind::RandomIndices(ri) => f.debug_tuple("RandomIndices").field(ri).finish(),
        }
    }
}

/// A named node of the model graph.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub(crate) observation: Option<DataSource>,
}

impl Variable {
    pub fn new(name: &str, kind: VariableKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            observation: None,
        }
    }

    /// Variables this one's value is computed from.
    pub fn parents(&self) -> Vec<&str> {
        match &self.kind {
            VariableKind::Deterministic { parents, .. } => {
                parents.iter().map(String::as_str).collect()
            }
            VariableKind::Parametric(family) => family.parents(),
            VariableKind::Empirical { indices, .. } => indices.iter().map(String::as_str).collect(),
            VariableKind::RandomIndices(_) => vec![],
        }
    }

    /// Parents plus the variable an observation reads from.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps = self.parents();
        if let Some(DataSource::Variable(src)) = &self.observation {
            deps.push(src);
        }
        deps
    }

    pub fn is_observed(&self) -> bool {
        self.observation.is_some()
    }

    pub fn observation(&self) -> Option<&DataSource> {
        self.observation.as_ref()
    }

    pub fn is_parametric(&self) -> bool {
        matches!(self.kind, VariableKind::Parametric(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashSet;

    #[test]
    fn test_invalid_index_configurations() {
        assert!(RandomIndices::new(0, 1, IndexPolicy::WithReplacement).is_err());
        assert!(RandomIndices::new(10, 0, IndexPolicy::WithReplacement).is_err());
        assert!(matches!(
            RandomIndices::new(5, 6, IndexPolicy::WithoutReplacement),
            Err(ModelError::ConfigurationError { .. })
        ));
        assert!(RandomIndices::new(5, 6, IndexPolicy::WithReplacement).is_ok());
    }

    #[test]
    fn test_without_replacement_is_distinct() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let ri = RandomIndices::new(10, 10, IndexPolicy::WithoutReplacement).unwrap();
        for _ in 0..20 {
            let draw = ri.draw(&mut rng);
            let unique: HashSet<_> = draw.iter().collect();
            assert_eq!(unique.len(), 10);
        }
    }

    #[test]
    fn test_shuffled_covers_epoch() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let ri = RandomIndices::new(12, 4, IndexPolicy::Shuffled).unwrap();
        let mut seen: Vec<usize> = (0..3).flat_map(|_| ri.draw(&mut rng)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffled_reshuffles_on_partial_epoch() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let ri = RandomIndices::new(5, 2, IndexPolicy::Shuffled).unwrap();
        for _ in 0..10 {
            let draw = ri.draw(&mut rng);
            assert_eq!(draw.len(), 2);
            assert_ne!(draw[0], draw[1]);
        }
    }

    #[test]
    fn test_dataset_requires_equal_rows() {
        let inputs = RTensor::zeros(vec![3, 2]);
        assert!(Dataset::new(inputs.clone(), RTensor::zeros(vec![3])).is_ok());
        assert!(matches!(
            Dataset::new(inputs, RTensor::zeros(vec![4])),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_dependencies_include_observation_source() {
        let mut v = Variable::new(
            "y",
            VariableKind::Parametric(Family::Categorical {
                logits: "logits".to_string(),
            }),
        );
        v.observation = Some(DataSource::from("labels"));
        assert_eq!(v.dependencies(), vec!["logits", "labels"]);
        assert!(v.is_observed());
    }
}
