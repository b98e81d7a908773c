//! # Backward Pass - Reverse-Mode Autodiff
//!
//! Gradients flow against the edges of the tape:
//!
//! - Forward: values go operand → result
//! - Backward: gradients go result → operand
//! - For composition f;g, the VJP is vjp(g);vjp(f) (reverse order)
//!
//! Because every [`DiffGraph`] node already holds its forward value, no
//! separate forward cache is needed.
//!
//! ## Example
//!
//! ```rust
//! use stochgraph_diff::forward::DiffGraph;
//! use stochgraph_diff::backward::backward;
//! use stochgraph_diff::ops::RTensor;
//!
//! // Build: loss = sum(ReLU(x + y))
//! let mut graph = DiffGraph::new();
//! let x = graph.input(RTensor::vector(vec![-1.0, 2.0, 3.0]));
//! let y = graph.input(RTensor::vector(vec![2.0, -1.0, 1.0]));
//! let sum = graph.add(x, y).unwrap();
//! let relu = graph.relu(sum).unwrap();
//! let loss = graph.sum_all(relu).unwrap();
//!
//! let grads = backward(&graph, loss).unwrap();
//! assert_eq!(grads.wrt(x).unwrap().data, vec![1.0, 1.0, 1.0]);
//! ```

use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use thiserror::Error;

use crate::error::DiffError;
use crate::forward::DiffGraph;
use crate::ops::RTensor;

/// Gradients of a scalar output with respect to every node that reaches it.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<NodeIndex, RTensor>,
    params: HashMap<String, NodeIndex>,
}

impl Gradients {
    /// Gradient with respect to a node, if the output depends on it.
    pub fn wrt(&self, node: NodeIndex) -> Option<&RTensor> {
        self.grads.get(&node)
    }

    /// Gradient with respect to a named parameter.
    pub fn param(&self, name: &str) -> Option<&RTensor> {
        self.params.get(name).and_then(|n| self.grads.get(n))
    }

    /// Names of parameters that received a gradient.
    pub fn param_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.params
            .iter()
            .filter(|(_, n)| self.grads.contains_key(n))
            .map(|(k, _)| k.as_str())
    }
}

/// Perform the backward pass from a scalar output.
///
/// The output is seeded with gradient 1 and nodes are visited in reverse
/// insertion order, accumulating gradients for nodes with several consumers.
pub fn backward(graph: &DiffGraph, output: NodeIndex) -> Result<Gradients, DiffError> {
    let out = graph.value(output)?;
    if out.size() != 1 {
        return Err(DiffError::NonScalarOutput {
            shape: out.shape.clone(),
        });
    }

    let mut grads: HashMap<NodeIndex, RTensor> = HashMap::new();
    grads.insert(output, out.ones_like());

    // Process in REVERSE topological order
    for idx in (0..=output.index()).rev() {
        let node_idx = NodeIndex::new(idx);
        let Some(grad) = grads.get(&node_idx).cloned() else {
            continue;
        };
        let node = &graph.graph[node_idx];
        if node.op.is_leaf() {
            continue;
        }

        let operands = graph.operands(node_idx);
        let inputs = operands
            .iter()
            .map(|&n| graph.value(n).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        // Compute VJP: output gradient → operand gradients
        let input_grads = node.op.vjp(&inputs, &node.value, &grad)?;

        for (src, g) in operands.into_iter().zip(input_grads) {
            // Accumulate gradient (for nodes with multiple consumers)
            match grads.get_mut(&src) {
                Some(existing) => *existing = existing.add(&g)?,
                None => {
                    grads.insert(src, g);
                }
            }
        }
    }

    Ok(Gradients {
        grads,
        params: graph.params().map(|(k, v)| (k.to_string(), v)).collect(),
    })
}

/// Compute gradients of a scalar output with respect to the given nodes.
///
/// Nodes the output does not depend on get a zero gradient.
pub fn grad(
    graph: &DiffGraph,
    output: NodeIndex,
    wrt: &[NodeIndex],
) -> Result<Vec<RTensor>, DiffError> {
    let grads = backward(graph, output)?;
    wrt.iter()
        .map(|&n| match grads.wrt(n) {
            Some(g) => Ok(g.clone()),
            None => graph.value(n).map(RTensor::zeros_like),
        })
        .collect()
}

/// Numerical gradient computation for testing.
///
/// Uses central differences: (f(x+h) - f(x-h)) / 2h
pub fn numerical_gradient(
    graph: &DiffGraph,
    output: NodeIndex,
    wrt: NodeIndex,
    elem_idx: usize,
    h: f32,
) -> Result<f32, DiffError> {
    let base = graph.value(wrt)?;
    let mut plus = base.clone();
    let mut minus = base.clone();
    plus.data[elem_idx] += h;
    minus.data[elem_idx] -= h;

    let mut overrides = HashMap::new();
    overrides.insert(wrt, plus);
    let f_plus = graph.replay(&overrides)?[output.index()].data[0];
    overrides.insert(wrt, minus);
    let f_minus = graph.replay(&overrides)?[output.index()].data[0];

    Ok((f_plus - f_minus) / (2.0 * h))
}

/// Error from gradient checking.
#[derive(Debug, Error)]
pub enum GradCheckError {
    #[error(
        "Gradient mismatch at node {node}[{elem_idx}]: analytical={analytical}, numerical={numerical}, diff={diff}"
    )]
    Mismatch {
        node: usize,
        elem_idx: usize,
        analytical: f32,
        numerical: f32,
        diff: f32,
    },

    #[error(transparent)]
    Backend(#[from] DiffError),
}

/// Check analytical gradients against numerical gradients.
///
/// # Arguments
///
/// * `graph` - The recorded tape
/// * `output` - Scalar node to differentiate
/// * `wrt` - Leaf nodes to perturb
/// * `h` - Step size for numerical differentiation (e.g., 1e-3)
/// * `tolerance` - Maximum allowed difference (e.g., 1e-2)
pub fn grad_check(
    graph: &DiffGraph,
    output: NodeIndex,
    wrt: &[NodeIndex],
    h: f32,
    tolerance: f32,
) -> Result<(), GradCheckError> {
    let analytical_grads = grad(graph, output, wrt)?;

    for (&node, analytical) in wrt.iter().zip(&analytical_grads) {
        for elem_idx in 0..analytical.data.len() {
            let numerical = numerical_gradient(graph, output, node, elem_idx, h)?;
            let analytical_val = analytical.data[elem_idx];
            let diff = (numerical - analytical_val).abs();

            // Use relative error for large values
            let scale = analytical_val.abs().max(numerical.abs()).max(1.0);
            let rel_diff = diff / scale;

            if rel_diff > tolerance && diff > tolerance {
                return Err(GradCheckError::Mismatch {
                    node: node.index(),
                    elem_idx,
                    analytical: analytical_val,
                    numerical,
                    diff,
                });
            }
        }
    }

    Ok(())
}
