//! # Forward Evaluation on a Recording Tape
//!
//! A [`DiffGraph`] records operations as they are applied. Every node stores
//! the value it produced, so building the graph *is* the forward pass, and
//! the graph can be handed straight to [`crate::backward::backward`].
//!
//! ## Key Concepts
//!
//! - **Eager evaluation**: `apply` computes a node's value before the node is added
//! - **Insertion order**: node indices are already a topological order
//! - **Edge routing**: each edge records which operand slot it feeds
//! - **Replay**: the recorded program can be re-run with some leaves replaced
//!
//! ## Example
//!
//! ```rust
//! use stochgraph_diff::forward::DiffGraph;
//! use stochgraph_diff::ops::RTensor;
//!
//! // Build: y = ReLU(a + b)
//! let mut graph = DiffGraph::new();
//! let a = graph.input(RTensor::vector(vec![-1.0, 2.0, -3.0]));
//! let b = graph.input(RTensor::vector(vec![2.0, -1.0, 4.0]));
//! let sum = graph.add(a, b).unwrap();
//! let y = graph.relu(sum).unwrap();
//!
//! // Result: ReLU([-1+2, 2-1, -3+4]) = ReLU([1, 1, 1]) = [1, 1, 1]
//! assert_eq!(graph.value(y).unwrap().data, vec![1.0, 1.0, 1.0]);
//! ```

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::error::DiffError;
use crate::ops::{DiffOp, RTensor};

/// A recorded operation together with the value it produced.
#[derive(Debug, Clone)]
pub struct TapeNode {
    pub op: DiffOp,
    pub value: RTensor,
}

/// Operand slot an edge feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub to_port: usize,
}

/// A computation graph for differentiable operations.
///
/// Parameters are memoised by name: asking for the same name twice returns
/// the same node, so gradients from every use accumulate in one place.
#[derive(Debug, Clone, Default)]
pub struct DiffGraph {
    /// The underlying DAG
    pub graph: DiGraph<TapeNode, Edge>,
    /// Input nodes in the order they were created
    leaves: Vec<NodeIndex>,
    /// Parameter nodes by name
    params: HashMap<String, NodeIndex>,
}

impl DiffGraph {
    /// Create a new empty tape.
    pub fn new() -> Self {
        Self::default()
    }

    fn leaf(&mut self, op: DiffOp, value: RTensor) -> NodeIndex {
        self.graph.add_node(TapeNode { op, value })
    }

    /// Add an input node that receives no parameter update.
    pub fn input(&mut self, value: RTensor) -> NodeIndex {
        let index = self.leaves.len();
        let idx = self.leaf(DiffOp::Input { index }, value);
        self.leaves.push(idx);
        idx
    }

    /// Bind a named learnable parameter.
    ///
    /// If the name is already bound the existing node is returned and
    /// `value` is ignored.
    pub fn param(&mut self, name: &str, value: &RTensor) -> NodeIndex {
        if let Some(&idx) = self.params.get(name) {
            return idx;
        }
        let index = self.params.len();
        let idx = self.leaf(
            DiffOp::Param {
                name: name.to_string(),
                index,
            },
            value.clone(),
        );
        self.params.insert(name.to_string(), idx);
        idx
    }

    /// Look up a parameter node by name.
    pub fn param_node(&self, name: &str) -> Option<NodeIndex> {
        self.params.get(name).copied()
    }

    /// All parameter bindings as `(name, node)`.
    pub fn params(&self) -> impl Iterator<Item = (&str, NodeIndex)> + '_ {
        self.params.iter().map(|(k, &v)| (k.as_str(), v))
    }

    /// Input nodes in creation order.
    pub fn inputs(&self) -> &[NodeIndex] {
        &self.leaves
    }

    /// Add a constant scalar node.
    pub fn constant(&mut self, value: f32) -> NodeIndex {
        self.leaf(DiffOp::Const { value }, RTensor::scalar(value))
    }

    /// Apply an operation to existing nodes, evaluating it immediately.
    pub fn apply(&mut self, op: DiffOp, operands: &[NodeIndex]) -> Result<NodeIndex, DiffError> {
        if op.is_leaf() || operands.len() != op.num_inputs() {
            return Err(DiffError::Arity {
                op: op.name(),
                expected: op.num_inputs(),
                got: operands.len(),
            });
        }
        let values = operands
            .iter()
            .map(|&n| self.value(n).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        let value = op.forward(&values)?;
        let idx = self.graph.add_node(TapeNode { op, value });
        for (port, &src) in operands.iter().enumerate() {
            self.graph.add_edge(src, idx, Edge { to_port: port });
        }
        Ok(idx)
    }

    /// Add an addition node: a + b
    pub fn add(&mut self, a: NodeIndex, b: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Add, &[a, b])
    }

    /// Add a subtraction node: a - b
    pub fn sub(&mut self, a: NodeIndex, b: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Sub, &[a, b])
    }

    /// Add a multiplication node: a * b
    pub fn mul(&mut self, a: NodeIndex, b: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Mul, &[a, b])
    }

    /// Add a division node: a / b
    pub fn div(&mut self, a: NodeIndex, b: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Div, &[a, b])
    }

    pub fn neg(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Neg, &[x])
    }

    pub fn exp(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Exp, &[x])
    }

    pub fn log(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Log, &[x])
    }

    pub fn square(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Square, &[x])
    }

    pub fn scale(&mut self, x: NodeIndex, factor: f32) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Scale { factor }, &[x])
    }

    /// Add a matrix multiplication node: A @ B
    pub fn matmul(&mut self, a: NodeIndex, b: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::MatMul, &[a, b])
    }

    pub fn transpose(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Transpose, &[x])
    }

    pub fn reshape(&mut self, x: NodeIndex, shape: Vec<usize>) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Reshape { shape }, &[x])
    }

    /// Collapse every axis after the first: `[N, ...] -> [N, rest]`.
    pub fn flatten(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        let value = self.value(x)?;
        let rows = value.rows();
        let rest = if rows == 0 { 0 } else { value.size() / rows };
        self.reshape(x, vec![rows, rest])
    }

    /// Add a ReLU activation node.
    pub fn relu(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::ReLU, &[x])
    }

    pub fn sigmoid(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Sigmoid, &[x])
    }

    pub fn tanh(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Tanh, &[x])
    }

    /// Add a sum reduction node.
    pub fn sum_all(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::SumAll, &[x])
    }

    pub fn mean_all(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::MeanAll, &[x])
    }

    /// 2D convolution of an NCHW input with an OIHW kernel.
    pub fn conv2d(
        &mut self,
        x: NodeIndex,
        kernel: NodeIndex,
        stride: usize,
        padding: usize,
    ) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::Conv2d { stride, padding }, &[x, kernel])
    }

    pub fn log_softmax(&mut self, x: NodeIndex) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::LogSoftmax, &[x])
    }

    /// Elementwise Normal log-density of `x` under `(loc, scale)`.
    pub fn normal_log_pdf(
        &mut self,
        x: NodeIndex,
        loc: NodeIndex,
        scale: NodeIndex,
    ) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::NormalLogPdf, &[x, loc, scale])
    }

    /// Log-probability of class-index `labels` under `softmax(logits)`, one
    /// value per label. The label batch broadcasts against the leading axes of
    /// `logits`; labels shaped like matrix logits are read as class weights.
    pub fn categorical_log_pmf(
        &mut self,
        logits: NodeIndex,
        labels: NodeIndex,
    ) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::CategoricalLogPmf, &[logits, labels])
    }

    /// Elementwise log-probability of 0/1 `targets` under `sigmoid(logits)`.
    pub fn bernoulli_log_pmf(
        &mut self,
        logits: NodeIndex,
        targets: NodeIndex,
    ) -> Result<NodeIndex, DiffError> {
        self.apply(DiffOp::BernoulliLogPmf, &[logits, targets])
    }

    /// Value recorded for a node.
    pub fn value(&self, node: NodeIndex) -> Result<&RTensor, DiffError> {
        self.graph
            .node_weight(node)
            .map(|n| &n.value)
            .ok_or(DiffError::UnknownNode {
                index: node.index(),
            })
    }

    /// Shape of a node's value.
    pub fn shape(&self, node: NodeIndex) -> Result<&[usize], DiffError> {
        self.value(node).map(|v| v.shape.as_slice())
    }

    /// Operand nodes of `node`, ordered by slot.
    pub fn operands(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut incoming: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| (e.weight().to_port, e.source()))
            .collect();
        incoming.sort_by_key(|&(port, _)| port);
        incoming.into_iter().map(|(_, src)| src).collect()
    }

    /// Get topological order of nodes.
    ///
    /// Operands always exist before the node that consumes them, so the
    /// insertion order is a valid topological order.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    /// Re-run the recorded program with some nodes' values replaced.
    ///
    /// Returns every node's value, indexed by `NodeIndex::index()`.
    pub fn replay(
        &self,
        overrides: &HashMap<NodeIndex, RTensor>,
    ) -> Result<Vec<RTensor>, DiffError> {
        let mut values: Vec<RTensor> = Vec::with_capacity(self.node_count());
        for idx in self.topological_order() {
            let node = &self.graph[idx];
            let value = if let Some(v) = overrides.get(&idx) {
                v.clone()
            } else if node.op.is_leaf() {
                node.value.clone()
            } else {
                let inputs: Vec<RTensor> = self
                    .operands(idx)
                    .iter()
                    .map(|src| values[src.index()].clone())
                    .collect();
                node.op.forward(&inputs)?
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}
