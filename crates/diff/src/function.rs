//! Black-box differentiable functions.
//!
//! A [`DifferentiableFunction`] records its computation onto a caller's
//! [`DiffGraph`], so whatever it does internally is differentiated by the
//! same backward pass as the rest of a model. The caller owns the parameter
//! values and binds them as tape nodes before calling `forward`.

use std::fmt;

use petgraph::graph::NodeIndex;

use crate::error::DiffError;
use crate::forward::DiffGraph;
use crate::ops::RTensor;

/// A function whose output can be differentiated with respect to its
/// parameters and inputs.
pub trait DifferentiableFunction: Send + Sync {
    /// Name for diagnostics.
    fn name(&self) -> &str;

    /// Initial learnable parameters, in the order `forward` expects them.
    fn parameters(&self) -> Vec<(String, RTensor)> {
        Vec::new()
    }

    /// Record the function on `graph`.
    ///
    /// `params` are bound nodes for [`parameters`](Self::parameters) in the
    /// same order; `inputs` are the operand nodes.
    fn forward(
        &self,
        graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError>;
}

impl fmt::Debug for dyn DifferentiableFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DifferentiableFunction({})", self.name())
    }
}

/// Evaluate a function on concrete values using its initial parameters.
pub fn call(function: &dyn DifferentiableFunction, inputs: &[RTensor]) -> Result<RTensor, DiffError> {
    let mut graph = DiffGraph::new();
    let params: Vec<NodeIndex> = function
        .parameters()
        .iter()
        .map(|(name, value)| graph.param(name, value))
        .collect();
    let inputs: Vec<NodeIndex> = inputs.iter().map(|v| graph.input(v.clone())).collect();
    let out = function.forward(&mut graph, &params, &inputs)?;
    graph.value(out).cloned()
}

pub(crate) fn expect_arity(
    op: &'static str,
    expected: usize,
    got: &[NodeIndex],
) -> Result<(), DiffError> {
    if got.len() == expected {
        Ok(())
    } else {
        Err(DiffError::Arity {
            op,
            expected,
            got: got.len(),
        })
    }
}

type Body =
    dyn Fn(&mut DiffGraph, &[NodeIndex], &[NodeIndex]) -> Result<NodeIndex, DiffError> + Send + Sync;

/// Adapter turning a closure into a [`DifferentiableFunction`].
///
/// ```rust
/// use stochgraph_diff::function::{call, FnFunction};
/// use stochgraph_diff::ops::RTensor;
///
/// let double = FnFunction::new("double", |g, _p, x| g.scale(x[0], 2.0));
/// let y = call(&double, &[RTensor::vector(vec![1.0, -2.0])]).unwrap();
/// assert_eq!(y.data, vec![2.0, -4.0]);
/// ```
pub struct FnFunction {
    name: String,
    params: Vec<(String, RTensor)>,
    body: Box<Body>,
}

impl FnFunction {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&mut DiffGraph, &[NodeIndex], &[NodeIndex]) -> Result<NodeIndex, DiffError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            body: Box::new(body),
        }
    }

    /// Attach a learnable parameter with its initial value.
    pub fn with_parameter(mut self, name: &str, value: RTensor) -> Self {
        self.params.push((name.to_string(), value));
        self
    }
}

impl DifferentiableFunction for FnFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Vec<(String, RTensor)> {
        self.params.clone()
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        (self.body)(graph, params, inputs)
    }
}

/// Zero-input function that always yields the same value.
#[derive(Debug, Clone)]
pub struct Constant {
    pub value: RTensor,
}

impl Constant {
    pub fn new(value: RTensor) -> Self {
        Self { value }
    }
}

impl DifferentiableFunction for Constant {
    fn name(&self) -> &str {
        "constant"
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        _params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("constant", 0, inputs)?;
        Ok(graph.input(self.value.clone()))
    }
}

/// Zero-input function whose value is itself a learnable parameter.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub init: RTensor,
}

impl Parameter {
    pub fn new(init: RTensor) -> Self {
        Self { init }
    }
}

impl DifferentiableFunction for Parameter {
    fn name(&self) -> &str {
        "parameter"
    }

    fn parameters(&self) -> Vec<(String, RTensor)> {
        vec![("value".to_string(), self.init.clone())]
    }

    fn forward(
        &self,
        _graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("parameter", 0, inputs)?;
        expect_arity("parameter", 1, params)?;
        Ok(params[0])
    }
}

/// `x @ wᵀ + b` with every operand supplied as an input: `(x [N, in], w [out, in], b [out])`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Affine;

impl DifferentiableFunction for Affine {
    fn name(&self) -> &str {
        "affine"
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        _params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("affine", 3, inputs)?;
        affine(graph, inputs[0], inputs[1], inputs[2])
    }
}

pub(crate) fn affine(
    graph: &mut DiffGraph,
    x: NodeIndex,
    w: NodeIndex,
    b: NodeIndex,
) -> Result<NodeIndex, DiffError> {
    let wt = graph.transpose(w)?;
    let xw = graph.matmul(x, wt)?;
    graph.add(xw, b)
}

/// 2D convolution with the kernel supplied as an input: `(x [N, C, H, W], k [O, C, kh, kw])`.
#[derive(Debug, Clone, Copy)]
pub struct Convolution {
    pub stride: usize,
    pub padding: usize,
}

impl DifferentiableFunction for Convolution {
    fn name(&self) -> &str {
        "convolution"
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        _params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("convolution", 2, inputs)?;
        graph.conv2d(inputs[0], inputs[1], self.stride, self.padding)
    }
}
