//! Neural network layers as [`DifferentiableFunction`]s.
//!
//! Layers own their initial parameter values; whoever binds them to a tape
//! (usually the model's parameter store) owns the values from then on.

use petgraph::graph::NodeIndex;
use rand::Rng;

use crate::error::DiffError;
use crate::forward::DiffGraph;
use crate::function::{affine, expect_arity, DifferentiableFunction};
use crate::ops::RTensor;

/// A linear layer: y = x @ Wᵀ + b
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix (output_dim, input_dim)
    pub weight: RTensor,
    /// Bias vector (output_dim,)
    pub bias: RTensor,
}

impl Linear {
    /// Create a new linear layer with random weights.
    pub fn new<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        // Xavier initialization: scale = sqrt(2 / (fan_in + fan_out))
        let scale = (2.0 / (input_dim + output_dim) as f32).sqrt();
        Self {
            weight: RTensor::randn(vec![output_dim, input_dim], scale, rng),
            bias: RTensor::zeros(vec![output_dim]),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.shape[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.shape[0]
    }
}

impl DifferentiableFunction for Linear {
    fn name(&self) -> &str {
        "linear"
    }

    fn parameters(&self) -> Vec<(String, RTensor)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("linear", 2, params)?;
        expect_arity("linear", 1, inputs)?;
        affine(graph, inputs[0], params[0], params[1])
    }
}

/// 2D convolution over NCHW input, without bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// Kernel (out_channels, in_channels, k, k)
    pub kernel: RTensor,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    /// He-initialised square kernel.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let scale = (2.0 / fan_in as f32).sqrt();
        Self {
            kernel: RTensor::randn(
                vec![out_channels, in_channels, kernel_size, kernel_size],
                scale,
                rng,
            ),
            stride,
            padding,
        }
    }
}

impl DifferentiableFunction for Conv2d {
    fn name(&self) -> &str {
        "conv2d"
    }

    fn parameters(&self) -> Vec<(String, RTensor)> {
        vec![("kernel".to_string(), self.kernel.clone())]
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("conv2d", 1, params)?;
        expect_arity("conv2d", 1, inputs)?;
        graph.conv2d(inputs[0], params[0], self.stride, self.padding)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl DifferentiableFunction for Relu {
    fn name(&self) -> &str {
        "relu"
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        _params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("relu", 1, inputs)?;
        graph.relu(inputs[0])
    }
}

/// `[N, ...] -> [N, rest]`
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl DifferentiableFunction for Flatten {
    fn name(&self) -> &str {
        "flatten"
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        _params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        expect_arity("flatten", 1, inputs)?;
        graph.flatten(inputs[0])
    }
}

/// Layers applied one after another.
///
/// Parameter names are prefixed with the layer position (`"0.weight"`,
/// `"2.kernel"`), and the first layer receives every input.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn DifferentiableFunction>>,
    counts: Vec<usize>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer.
    pub fn push<L: DifferentiableFunction + 'static>(mut self, layer: L) -> Self {
        self.counts.push(layer.parameters().len());
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl DifferentiableFunction for Sequential {
    fn name(&self) -> &str {
        "sequential"
    }

    fn parameters(&self) -> Vec<(String, RTensor)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| {
                layer
                    .parameters()
                    .into_iter()
                    .map(move |(name, value)| (format!("{}.{}", i, name), value))
            })
            .collect()
    }

    fn forward(
        &self,
        graph: &mut DiffGraph,
        params: &[NodeIndex],
        inputs: &[NodeIndex],
    ) -> Result<NodeIndex, DiffError> {
        let total: usize = self.counts.iter().sum();
        expect_arity("sequential", total, params)?;
        if self.layers.is_empty() {
            expect_arity("sequential", 1, inputs)?;
            return Ok(inputs[0]);
        }

        let mut offset = 0;
        let mut current: Vec<NodeIndex> = inputs.to_vec();
        for (layer, &count) in self.layers.iter().zip(&self.counts) {
            let out = layer.forward(graph, &params[offset..offset + count], &current)?;
            offset += count;
            current = vec![out];
        }
        Ok(current[0])
    }
}
