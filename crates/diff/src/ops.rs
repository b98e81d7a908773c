//! # Runtime Tensors and Differentiable Operations
//!
//! This module defines [`RTensor`], the dynamically shaped tensor every value
//! in a tape is stored as, and [`DiffOp`], the closed set of operations a tape
//! can record. Each operation knows how to:
//!
//! - Execute forward (compute the output from its inputs)
//! - Compute its VJP (vector-Jacobian product for backprop)
//!
//! ## Operations
//!
//! | Op | Forward | Backward |
//! |----|---------|----------|
//! | Add / Sub / Mul / Div | elementwise, trailing-axis broadcast | reduce grad back to each operand shape |
//! | MatMul | A @ B | ∂L/∂A = grad @ Bᵀ, ∂L/∂B = Aᵀ @ grad |
//! | ReLU | max(0, x) | grad × (x > 0) |
//! | Conv2d | cross-correlation, NCHW | scatter grad to input and kernel |
//! | LogSoftmax | x - logsumexp(x) over the last axis | grad - softmax · Σ grad |
//! | NormalLogPdf | log N(x; μ, σ) | closed form for x, μ, σ |
//! | CategoricalLogPmf | log softmax(logits)[label] | onehot - softmax |
//! | BernoulliLogPmf | t·l - softplus(l) | t - sigmoid(l) |
//!
//! ## Broadcasting
//!
//! Binary operations accept operands whose shapes agree after dropping leading
//! unit axes, or where one shape is a suffix of the other. The leading axis is
//! therefore free to carry a batch of rows without any operation treating it
//! as a model dimension.

use std::fmt;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::DiffError;

/// A runtime tensor for graph evaluation.
///
/// Shapes are checked at runtime; the first axis is conventionally the
/// batch (row) axis.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RTensor {
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Flattened data in row-major order
    pub data: Vec<f32>,
}

/// Compute the shape two operands broadcast to, if any.
///
/// Leading unit axes are ignored; the shorter (trimmed) shape must be a
/// suffix of the longer one. The longer original shape is returned.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    if a == b {
        return Some(a.to_vec());
    }
    let trim = |s: &[usize]| -> usize { s.iter().take_while(|&&d| d == 1).count() };
    let (ta, tb) = (&a[trim(a)..], &b[trim(b)..]);
    if tb.len() <= ta.len() && ta.ends_with(tb) {
        Some(a.to_vec())
    } else if ta.len() < tb.len() && tb.ends_with(ta) {
        Some(b.to_vec())
    } else {
        None
    }
}

impl RTensor {
    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; size],
        }
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    /// Create a tensor from data with given shape.
    ///
    /// Panics when the data length does not match the shape; use
    /// [`RTensor::try_from_data`] for untrusted input.
    pub fn from_data(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length {} doesn't match shape {:?}",
            data.len(),
            shape
        );
        Self { shape, data }
    }

    /// Create a tensor from data, reporting a length mismatch as an error.
    pub fn try_from_data(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, DiffError> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(DiffError::ShapeMismatch {
                op: "FromData",
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    /// Create a scalar tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![],
            data: vec![value],
        }
    }

    /// Create a 1D vector tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            shape: vec![len],
            data,
        }
    }

    /// Create a 2D matrix tensor.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * cols);
        Self {
            shape: vec![rows, cols],
            data,
        }
    }

    /// Check if this is a scalar.
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty() || (self.shape.len() == 1 && self.shape[0] == 1)
    }

    /// Get the scalar value (panics if not a scalar).
    pub fn as_scalar(&self) -> f32 {
        assert!(self.is_scalar() || self.data.len() == 1);
        self.data[0]
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Length of the leading (row) axis; scalars count as one row.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// True when every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    fn zip_broadcast(
        &self,
        other: &RTensor,
        op: &'static str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<RTensor, DiffError> {
        let shape =
            broadcast_shape(&self.shape, &other.shape).ok_or_else(|| DiffError::ShapeMismatch {
                op,
                expected: self.shape.clone(),
                got: other.shape.clone(),
            })?;
        let size: usize = shape.iter().product();
        let (na, nb) = (self.data.len(), other.data.len());
        let data = (0..size)
            .map(|i| f(self.data[i % na], other.data[i % nb]))
            .collect();
        Ok(RTensor { shape, data })
    }

    /// Element-wise addition with broadcasting.
    pub fn add(&self, other: &RTensor) -> Result<RTensor, DiffError> {
        self.zip_broadcast(other, "Add", |a, b| a + b)
    }

    /// Element-wise subtraction with broadcasting.
    pub fn sub(&self, other: &RTensor) -> Result<RTensor, DiffError> {
        self.zip_broadcast(other, "Sub", |a, b| a - b)
    }

    /// Element-wise multiplication with broadcasting.
    pub fn mul(&self, other: &RTensor) -> Result<RTensor, DiffError> {
        self.zip_broadcast(other, "Mul", |a, b| a * b)
    }

    /// Element-wise division with broadcasting.
    pub fn div(&self, other: &RTensor) -> Result<RTensor, DiffError> {
        self.zip_broadcast(other, "Div", |a, b| a / b)
    }

    /// Element-wise ReLU.
    pub fn relu(&self) -> RTensor {
        self.map(|x| x.max(0.0))
    }

    /// Sum all elements to a scalar.
    pub fn sum_all(&self) -> RTensor {
        let sum: f32 = self.data.iter().sum();
        RTensor::scalar(sum)
    }

    /// Matrix multiplication (2D tensors only).
    pub fn matmul(&self, other: &RTensor) -> Result<RTensor, DiffError> {
        if self.shape.len() != 2 || other.shape.len() != 2 {
            return Err(DiffError::InvalidValue {
                op: "MatMul",
                reason: format!(
                    "requires 2D operands, got {:?} and {:?}",
                    self.shape, other.shape
                ),
            });
        }

        let m = self.shape[0];
        let k = self.shape[1];
        let k2 = other.shape[0];
        let n = other.shape[1];

        if k != k2 {
            return Err(DiffError::ShapeMismatch {
                op: "MatMul",
                expected: vec![k, n],
                got: other.shape.clone(),
            });
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for kk in 0..k {
                let a = self.data[i * k + kk];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    result[i * n + j] += a * other.data[kk * n + j];
                }
            }
        }

        Ok(RTensor {
            shape: vec![m, n],
            data: result,
        })
    }

    /// Scalar multiplication.
    pub fn scale(&self, scalar: f32) -> RTensor {
        self.map(|x| x * scalar)
    }

    /// Apply a function to each element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> RTensor {
        let data: Vec<f32> = self.data.iter().map(|&x| f(x)).collect();
        RTensor {
            shape: self.shape.clone(),
            data,
        }
    }

    /// Transpose a 2D matrix.
    pub fn transpose(&self) -> Result<RTensor, DiffError> {
        if self.shape.len() != 2 {
            return Err(DiffError::InvalidValue {
                op: "Transpose",
                reason: format!("requires a 2D tensor, got {:?}", self.shape),
            });
        }
        let rows = self.shape[0];
        let cols = self.shape[1];

        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }

        Ok(RTensor {
            shape: vec![cols, rows],
            data: result,
        })
    }

    /// Reinterpret the data under a new shape with the same element count.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<RTensor, DiffError> {
        let size: usize = shape.iter().product();
        if size != self.data.len() {
            return Err(DiffError::ShapeMismatch {
                op: "Reshape",
                expected: shape,
                got: self.shape.clone(),
            });
        }
        Ok(RTensor {
            shape,
            data: self.data.clone(),
        })
    }

    /// Broadcast to a larger shape under the trailing-axis rule.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<RTensor, DiffError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        let target: usize = shape.iter().product();
        match broadcast_shape(&self.shape, shape) {
            Some(ref s) if s.iter().product::<usize>() == target => {
                let n = self.data.len();
                Ok(RTensor {
                    shape: shape.to_vec(),
                    data: (0..target).map(|i| self.data[i % n]).collect(),
                })
            }
            _ => Err(DiffError::ShapeMismatch {
                op: "Broadcast",
                expected: shape.to_vec(),
                got: self.shape.clone(),
            }),
        }
    }

    /// Sum a broadcast tensor back down to `shape` (the adjoint of `broadcast_to`).
    pub fn reduce_to(&self, shape: &[usize]) -> RTensor {
        let n: usize = shape.iter().product();
        let mut data = vec![0.0; n];
        if n > 0 {
            for (i, v) in self.data.iter().enumerate() {
                data[i % n] += v;
            }
        }
        RTensor {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Select rows along the leading axis.
    pub fn gather_rows(&self, indices: &[usize]) -> Result<RTensor, DiffError> {
        if self.shape.is_empty() {
            return Err(DiffError::InvalidValue {
                op: "GatherRows",
                reason: "cannot index rows of a scalar".to_string(),
            });
        }
        let rows = self.shape[0];
        let row_len = if rows == 0 { 0 } else { self.data.len() / rows };
        let mut data = Vec::with_capacity(indices.len() * row_len);
        for &i in indices {
            if i >= rows {
                return Err(DiffError::InvalidValue {
                    op: "GatherRows",
                    reason: format!("row {} out of bounds for {} rows", i, rows),
                });
            }
            data.extend_from_slice(&self.data[i * row_len..(i + 1) * row_len]);
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Ok(RTensor { shape, data })
    }

    /// Create a tensor of ones with the same shape.
    pub fn ones_like(&self) -> RTensor {
        RTensor::full(self.shape.clone(), 1.0)
    }

    /// Create a tensor of zeros with the same shape.
    pub fn zeros_like(&self) -> RTensor {
        RTensor::zeros(self.shape.clone())
    }

    /// Negate all elements.
    pub fn neg(&self) -> RTensor {
        self.map(|x| -x)
    }

    /// Create a tensor with values drawn from N(0, scale²).
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, scale: f32, rng: &mut R) -> RTensor {
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
            .collect();
        RTensor { shape, data }
    }

    /// Create a tensor with random values, using a seed.
    pub fn randn_seeded(shape: Vec<usize>, scale: f32, seed: u64) -> RTensor {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self::randn(shape, scale, &mut rng)
    }

    /// Compute mean of all elements.
    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Compute L2 norm.
    pub fn norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

impl fmt::Debug for RTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_empty() {
            write!(f, "RTensor(scalar={})", self.data[0])
        } else if self.shape.len() == 1 {
            write!(f, "RTensor(vec[{}]={:?})", self.shape[0], self.data)
        } else {
            write!(f, "RTensor(shape={:?}, data={:?})", self.shape, self.data)
        }
    }
}

/// Differentiable operations recorded on a tape.
///
/// `Input`, `Param` and `Const` are leaves: their value is supplied when the
/// node is created. Every other variant is computed from its operands.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Boundary value that receives no parameter update (data, noise, draws)
    Input { index: usize },

    /// Learnable parameter bound under a name
    Param { name: String, index: usize },

    /// Constant scalar
    Const { value: f32 },

    /// Element-wise addition: a + b
    Add,

    /// Element-wise subtraction: a - b
    Sub,

    /// Element-wise multiplication: a * b
    Mul,

    /// Element-wise division: a / b
    Div,

    Neg,
    Exp,
    Log,
    Square,

    /// Multiply by a fixed factor
    Scale { factor: f32 },

    /// Matrix multiplication: A @ B
    MatMul,

    /// 2D transpose
    Transpose,

    /// Same data, new shape
    Reshape { shape: Vec<usize> },

    /// Element-wise ReLU: max(0, x)
    ReLU,

    Sigmoid,
    Tanh,

    /// Sum all elements to a scalar
    SumAll,

    /// Mean of all elements as a scalar
    MeanAll,

    /// 2D cross-correlation over NCHW input with an OIHW kernel
    Conv2d { stride: usize, padding: usize },

    /// Log-softmax over the last axis
    LogSoftmax,

    /// Elementwise log N(x; loc, scale); operands (x, loc, scale)
    NormalLogPdf,

    /// Log-probability of labels under softmax(logits); operands (logits, labels)
    CategoricalLogPmf,

    /// Log-probability of 0/1 targets under sigmoid(logits); operands (logits, targets)
    BernoulliLogPmf,
}

const HALF_LN_TAU: f32 = 0.918_938_5;

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Rows and class count of a tensor whose last axis holds classes.
fn class_layout(op: &'static str, logits: &RTensor) -> Result<(usize, usize), DiffError> {
    let k = match logits.shape.last() {
        Some(&k) if k > 0 => k,
        _ => {
            return Err(DiffError::InvalidValue {
                op,
                reason: format!("needs a non-empty class axis, got shape {:?}", logits.shape),
            })
        }
    };
    Ok((logits.size() / k, k))
}

fn log_softmax_rows(x: &RTensor, rows: usize, k: usize) -> RTensor {
    let mut out = x.clone();
    for r in 0..rows {
        let row = &x.data[r * k..(r + 1) * k];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
        for c in 0..k {
            out.data[r * k + c] = row[c] - lse;
        }
    }
    out
}

/// Class labels for a categorical likelihood.
///
/// Labels of the same shape as matrix-or-higher logits are per-class weights
/// (one-hot or soft). Anything else is a tensor of class indices whose shape
/// broadcasts against the batch axes of the logits, so a single logits
/// vector can score a whole batch of observations.
enum Labels<'a> {
    Indices { shape: Vec<usize>, classes: Vec<usize> },
    Weights(&'a [f32]),
}

fn categorical_labels<'a>(
    logits: &RTensor,
    labels: &'a RTensor,
    k: usize,
) -> Result<Labels<'a>, DiffError> {
    if logits.rank() >= 2 && labels.shape == logits.shape {
        return Ok(Labels::Weights(&labels.data));
    }
    let batch = &logits.shape[..logits.rank() - 1];
    let shape = broadcast_shape(batch, &labels.shape).ok_or_else(|| DiffError::ShapeMismatch {
        op: "CategoricalLogPmf",
        expected: batch.to_vec(),
        got: labels.shape.clone(),
    })?;
    let classes = labels
        .data
        .iter()
        .map(|&l| {
            if l >= 0.0 && l.fract() == 0.0 && (l as usize) < k {
                Ok(l as usize)
            } else {
                Err(DiffError::InvalidValue {
                    op: "CategoricalLogPmf",
                    reason: format!("label {} outside 0..{}", l, k),
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Labels::Indices { shape, classes })
}

/// Geometry of a 2D convolution, validated once and shared by forward and VJP.
struct ConvGeometry {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    o: usize,
    kh: usize,
    kw: usize,
    ho: usize,
    wo: usize,
    stride: usize,
    padding: usize,
}

impl ConvGeometry {
    fn new(x: &RTensor, k: &RTensor, stride: usize, padding: usize) -> Result<Self, DiffError> {
        if x.rank() != 4 || k.rank() != 4 {
            return Err(DiffError::InvalidValue {
                op: "Conv2d",
                reason: format!(
                    "expects NCHW input and OIHW kernel, got {:?} and {:?}",
                    x.shape, k.shape
                ),
            });
        }
        if stride == 0 {
            return Err(DiffError::InvalidValue {
                op: "Conv2d",
                reason: "stride must be positive".to_string(),
            });
        }
        let (n, c, h, w) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
        let (o, kc, kh, kw) = (k.shape[0], k.shape[1], k.shape[2], k.shape[3]);
        if kc != c {
            return Err(DiffError::ShapeMismatch {
                op: "Conv2d",
                expected: vec![o, c, kh, kw],
                got: k.shape.clone(),
            });
        }
        if h + 2 * padding < kh || w + 2 * padding < kw {
            return Err(DiffError::InvalidValue {
                op: "Conv2d",
                reason: format!(
                    "kernel {}x{} larger than padded input {}x{}",
                    kh,
                    kw,
                    h + 2 * padding,
                    w + 2 * padding
                ),
            });
        }
        Ok(Self {
            n,
            c,
            h,
            w,
            o,
            kh,
            kw,
            ho: (h + 2 * padding - kh) / stride + 1,
            wo: (w + 2 * padding - kw) / stride + 1,
            stride,
            padding,
        })
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.n, self.o, self.ho, self.wo]
    }

    /// Visit every (output offset, input offset, kernel offset) triple.
    fn for_each(&self, mut f: impl FnMut(usize, usize, usize)) {
        let p = self.padding as isize;
        for b in 0..self.n {
            for oc in 0..self.o {
                for i in 0..self.ho {
                    for j in 0..self.wo {
                        let out_idx = ((b * self.o + oc) * self.ho + i) * self.wo + j;
                        for ic in 0..self.c {
                            for a in 0..self.kh {
                                let y = (i * self.stride + a) as isize - p;
                                if y < 0 || y >= self.h as isize {
                                    continue;
                                }
                                for bb in 0..self.kw {
                                    let x = (j * self.stride + bb) as isize - p;
                                    if x < 0 || x >= self.w as isize {
                                        continue;
                                    }
                                    let in_idx = ((b * self.c + ic) * self.h + y as usize)
                                        * self.w
                                        + x as usize;
                                    let k_idx = ((oc * self.c + ic) * self.kh + a) * self.kw + bb;
                                    f(out_idx, in_idx, k_idx);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

impl DiffOp {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            DiffOp::Input { .. } => "Input",
            DiffOp::Param { .. } => "Param",
            DiffOp::Const { .. } => "Const",
            DiffOp::Add => "Add",
            DiffOp::Sub => "Sub",
            DiffOp::Mul => "Mul",
            DiffOp::Div => "Div",
            DiffOp::Neg => "Neg",
            DiffOp::Exp => "Exp",
            DiffOp::Log => "Log",
            DiffOp::Square => "Square",
            DiffOp::Scale { .. } => "Scale",
            DiffOp::MatMul => "MatMul",
            DiffOp::Transpose => "Transpose",
            DiffOp::Reshape { .. } => "Reshape",
            DiffOp::ReLU => "ReLU",
            DiffOp::Sigmoid => "Sigmoid",
            DiffOp::Tanh => "Tanh",
            DiffOp::SumAll => "SumAll",
            DiffOp::MeanAll => "MeanAll",
            DiffOp::Conv2d { .. } => "Conv2d",
            DiffOp::LogSoftmax => "LogSoftmax",
            DiffOp::NormalLogPdf => "NormalLogPdf",
            DiffOp::CategoricalLogPmf => "CategoricalLogPmf",
            DiffOp::BernoulliLogPmf => "BernoulliLogPmf",
        }
    }

    /// True for nodes whose value is supplied rather than computed.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            DiffOp::Input { .. } | DiffOp::Param { .. } | DiffOp::Const { .. }
        )
    }

    /// Number of inputs this operation expects.
    pub fn num_inputs(&self) -> usize {
        match self {
            DiffOp::Input { .. } | DiffOp::Param { .. } | DiffOp::Const { .. } => 0,
            DiffOp::Add
            | DiffOp::Sub
            | DiffOp::Mul
            | DiffOp::Div
            | DiffOp::MatMul
            | DiffOp::Conv2d { .. }
            | DiffOp::CategoricalLogPmf
            | DiffOp::BernoulliLogPmf => 2,
            DiffOp::NormalLogPdf => 3,
            _ => 1,
        }
    }

    /// Execute the forward pass for this operation.
    ///
    /// Leaves return their single boundary value unchanged.
    pub fn forward(&self, inputs: &[RTensor]) -> Result<RTensor, DiffError> {
        let expected = if self.is_leaf() { 1 } else { self.num_inputs() };
        if inputs.len() != expected && !matches!(self, DiffOp::Const { .. }) {
            return Err(DiffError::Arity {
                op: self.name(),
                expected,
                got: inputs.len(),
            });
        }

        match self {
            DiffOp::Input { .. } | DiffOp::Param { .. } => Ok(inputs[0].clone()),
            DiffOp::Const { value } => Ok(RTensor::scalar(*value)),
            DiffOp::Add => inputs[0].add(&inputs[1]),
            DiffOp::Sub => inputs[0].sub(&inputs[1]),
            DiffOp::Mul => inputs[0].mul(&inputs[1]),
            DiffOp::Div => inputs[0].div(&inputs[1]),
            DiffOp::Neg => Ok(inputs[0].neg()),
            DiffOp::Exp => Ok(inputs[0].map(f32::exp)),
            DiffOp::Log => Ok(inputs[0].map(f32::ln)),
            DiffOp::Square => Ok(inputs[0].map(|x| x * x)),
            DiffOp::Scale { factor } => Ok(inputs[0].scale(*factor)),
            DiffOp::MatMul => inputs[0].matmul(&inputs[1]),
            DiffOp::Transpose => inputs[0].transpose(),
            DiffOp::Reshape { shape } => inputs[0].reshape(shape.clone()),
            DiffOp::ReLU => Ok(inputs[0].relu()),
            DiffOp::Sigmoid => Ok(inputs[0].map(sigmoid)),
            DiffOp::Tanh => Ok(inputs[0].map(f32::tanh)),
            DiffOp::SumAll => Ok(inputs[0].sum_all()),
            DiffOp::MeanAll => Ok(RTensor::scalar(inputs[0].mean())),

            DiffOp::Conv2d { stride, padding } => {
                let (x, k) = (&inputs[0], &inputs[1]);
                let geo = ConvGeometry::new(x, k, *stride, *padding)?;
                let mut out = RTensor::zeros(geo.output_shape());
                geo.for_each(|o, i, w| out.data[o] += x.data[i] * k.data[w]);
                Ok(out)
            }

            DiffOp::LogSoftmax => {
                let (rows, k) = class_layout("LogSoftmax", &inputs[0])?;
                Ok(log_softmax_rows(&inputs[0], rows, k))
            }

            DiffOp::NormalLogPdf => {
                let (x, loc, scale) = (&inputs[0], &inputs[1], &inputs[2]);
                let shape = normal_shape(x, loc, scale)?;
                let size: usize = shape.iter().product();
                let (nx, nl, ns) = (x.size(), loc.size(), scale.size());
                let data = (0..size)
                    .map(|i| {
                        let sigma = scale.data[i % ns];
                        let z = (x.data[i % nx] - loc.data[i % nl]) / sigma;
                        -0.5 * z * z - sigma.ln() - HALF_LN_TAU
                    })
                    .collect();
                Ok(RTensor { shape, data })
            }

            DiffOp::CategoricalLogPmf => {
                let (logits, labels) = (&inputs[0], &inputs[1]);
                let (rows, k) = class_layout("CategoricalLogPmf", logits)?;
                let log_p = log_softmax_rows(logits, rows, k);
                match categorical_labels(logits, labels, k)? {
                    Labels::Indices { shape, classes } => {
                        let size: usize = shape.iter().product();
                        let n = classes.len();
                        let data = (0..size)
                            .map(|i| log_p.data[(i % rows) * k + classes[i % n]])
                            .collect();
                        Ok(RTensor { shape, data })
                    }
                    Labels::Weights(w) => {
                        let data = (0..rows)
                            .map(|r| (0..k).map(|c| w[r * k + c] * log_p.data[r * k + c]).sum())
                            .collect();
                        Ok(RTensor {
                            shape: logits.shape[..logits.rank() - 1].to_vec(),
                            data,
                        })
                    }
                }
            }

            DiffOp::BernoulliLogPmf => inputs[0].zip_broadcast(&inputs[1], "BernoulliLogPmf", |l, t| {
                t * l - softplus(l)
            }),
        }
    }

    /// Compute the Vector-Jacobian Product (VJP) for reverse-mode autodiff.
    ///
    /// Given the forward inputs, the forward output and the gradient of the
    /// loss with respect to that output, compute one gradient per input.
    /// Gradients are always returned in the shape of the matching input.
    pub fn vjp(
        &self,
        inputs: &[RTensor],
        output: &RTensor,
        grad: &RTensor,
    ) -> Result<Vec<RTensor>, DiffError> {
        match self {
            DiffOp::Input { .. } | DiffOp::Param { .. } | DiffOp::Const { .. } => Ok(vec![]),

            DiffOp::Add => {
                // z = x + y
                // ∂L/∂x = ∂L/∂z, ∂L/∂y = ∂L/∂z (summed over broadcast axes)
                Ok(vec![
                    grad.reduce_to(&inputs[0].shape),
                    grad.reduce_to(&inputs[1].shape),
                ])
            }

            DiffOp::Sub => Ok(vec![
                grad.reduce_to(&inputs[0].shape),
                grad.neg().reduce_to(&inputs[1].shape),
            ]),

            DiffOp::Mul => {
                // ∂L/∂x = ∂L/∂z * y, ∂L/∂y = ∂L/∂z * x
                let (x, y) = (&inputs[0], &inputs[1]);
                Ok(vec![
                    grad.mul(y)?.reduce_to(&x.shape),
                    grad.mul(x)?.reduce_to(&y.shape),
                ])
            }

            DiffOp::Div => {
                // z = x / y: ∂L/∂x = g / y, ∂L/∂y = -g · x / y²
                let (x, y) = (&inputs[0], &inputs[1]);
                let gx = grad.div(y)?;
                let gy = grad.mul(output)?.div(y)?.neg();
                Ok(vec![gx.reduce_to(&x.shape), gy.reduce_to(&y.shape)])
            }

            DiffOp::Neg => Ok(vec![grad.neg()]),
            DiffOp::Exp => Ok(vec![grad.mul(output)?]),
            DiffOp::Log => Ok(vec![grad.div(&inputs[0])?]),
            DiffOp::Square => Ok(vec![grad.mul(&inputs[0].scale(2.0))?]),
            DiffOp::Scale { factor } => Ok(vec![grad.scale(*factor)]),

            DiffOp::MatMul => {
                // C = A @ B where A is (m,k), B is (k,n), C is (m,n)
                // ∂L/∂A = (∂L/∂C) @ Bᵀ  -> (m,n) @ (n,k) = (m,k)
                // ∂L/∂B = Aᵀ @ (∂L/∂C)  -> (k,m) @ (m,n) = (k,n)
                let (a, b) = (&inputs[0], &inputs[1]);
                let grad_a = grad.matmul(&b.transpose()?)?;
                let grad_b = a.transpose()?.matmul(grad)?;
                Ok(vec![grad_a, grad_b])
            }

            DiffOp::Transpose => Ok(vec![grad.transpose()?]),
            DiffOp::Reshape { .. } => Ok(vec![grad.reshape(inputs[0].shape.clone())?]),

            DiffOp::ReLU => {
                // ∂L/∂x = ∂L/∂y * (x > 0 ? 1 : 0)
                let mask = inputs[0].map(|v| if v > 0.0 { 1.0 } else { 0.0 });
                Ok(vec![grad.mul(&mask)?])
            }

            DiffOp::Sigmoid => Ok(vec![grad.mul(&output.map(|s| s * (1.0 - s)))?]),
            DiffOp::Tanh => Ok(vec![grad.mul(&output.map(|t| 1.0 - t * t))?]),

            DiffOp::SumAll => {
                // ∂L/∂xᵢ = ∂L/∂s for all i (broadcast)
                Ok(vec![grad.broadcast_to(&inputs[0].shape)?])
            }

            DiffOp::MeanAll => {
                let n = inputs[0].size().max(1) as f32;
                Ok(vec![grad.scale(1.0 / n).broadcast_to(&inputs[0].shape)?])
            }

            DiffOp::Conv2d { stride, padding } => {
                let (x, k) = (&inputs[0], &inputs[1]);
                let geo = ConvGeometry::new(x, k, *stride, *padding)?;
                let mut gx = x.zeros_like();
                let mut gk = k.zeros_like();
                geo.for_each(|o, i, w| {
                    let g = grad.data[o];
                    gx.data[i] += g * k.data[w];
                    gk.data[w] += g * x.data[i];
                });
                Ok(vec![gx, gk])
            }

            DiffOp::LogSoftmax => {
                // ∂L/∂x = g - softmax(x) · Σ g (per row)
                let (rows, k) = class_layout("LogSoftmax", &inputs[0])?;
                let mut gx = grad.clone();
                for r in 0..rows {
                    let total: f32 = grad.data[r * k..(r + 1) * k].iter().sum();
                    for c in 0..k {
                        gx.data[r * k + c] -= output.data[r * k + c].exp() * total;
                    }
                }
                Ok(vec![gx])
            }

            DiffOp::NormalLogPdf => {
                let (x, loc, scale) = (&inputs[0], &inputs[1], &inputs[2]);
                let size = output.size();
                let (nx, nl, ns) = (x.size(), loc.size(), scale.size());
                let mut gx = RTensor::zeros(output.shape.clone());
                let mut gl = gx.clone();
                let mut gs = gx.clone();
                for i in 0..size {
                    let sigma = scale.data[i % ns];
                    let z = (x.data[i % nx] - loc.data[i % nl]) / sigma;
                    let g = grad.data[i];
                    gx.data[i] = -g * z / sigma;
                    gl.data[i] = g * z / sigma;
                    gs.data[i] = g * (z * z - 1.0) / sigma;
                }
                Ok(vec![
                    gx.reduce_to(&x.shape),
                    gl.reduce_to(&loc.shape),
                    gs.reduce_to(&scale.shape),
                ])
            }

            DiffOp::CategoricalLogPmf => {
                // ∂L/∂logits = g · (onehot - softmax), summed over rows sharing logits
                let (logits, labels) = (&inputs[0], &inputs[1]);
                let (rows, k) = class_layout("CategoricalLogPmf", logits)?;
                let log_p = log_softmax_rows(logits, rows, k);
                let mut gl = logits.zeros_like();
                match categorical_labels(logits, labels, k)? {
                    Labels::Indices { classes, .. } => {
                        let n = classes.len();
                        for (i, &g) in grad.data.iter().enumerate() {
                            let r = i % rows;
                            let label = classes[i % n];
                            for c in 0..k {
                                let target = if c == label { 1.0 } else { 0.0 };
                                gl.data[r * k + c] += g * (target - log_p.data[r * k + c].exp());
                            }
                        }
                    }
                    Labels::Weights(w) => {
                        for r in 0..rows {
                            let g = grad.data[r];
                            let mass: f32 = w[r * k..(r + 1) * k].iter().sum();
                            for c in 0..k {
                                gl.data[r * k + c] =
                                    g * (w[r * k + c] - mass * log_p.data[r * k + c].exp());
                            }
                        }
                    }
                }
                Ok(vec![gl, labels.zeros_like()])
            }

            DiffOp::BernoulliLogPmf => {
                // ∂L/∂l = g · (t - sigmoid(l))
                let (logits, targets) = (&inputs[0], &inputs[1]);
                let (nl, nt) = (logits.size(), targets.size());
                let mut gl = RTensor::zeros(output.shape.clone());
                for i in 0..output.size() {
                    gl.data[i] = grad.data[i] * (targets.data[i % nt] - sigmoid(logits.data[i % nl]));
                }
                Ok(vec![gl.reduce_to(&logits.shape), targets.zeros_like()])
            }
        }
    }
}

fn normal_shape(x: &RTensor, loc: &RTensor, scale: &RTensor) -> Result<Vec<usize>, DiffError> {
    let mismatch = |got: &RTensor| DiffError::ShapeMismatch {
        op: "NormalLogPdf",
        expected: x.shape.clone(),
        got: got.shape.clone(),
    };
    let xl = broadcast_shape(&x.shape, &loc.shape).ok_or_else(|| mismatch(loc))?;
    broadcast_shape(&xl, &scale.shape).ok_or_else(|| mismatch(scale))
}

impl fmt::Display for DiffOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffOp::Input { index } => write!(f, "Input[{}]", index),
            DiffOp::Param { name, .. } => write!(f, "Param({})", name),
            DiffOp::Const { value } => write!(f, "Const({})", value),
            DiffOp::Scale { factor } => write!(f, "Scale({})", factor),
            DiffOp::Reshape { shape } => write!(f, "Reshape({:?})", shape),
            DiffOp::Conv2d { stride, padding } => {
                write!(f, "Conv2d(stride={}, padding={})", stride, padding)
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    #[test]
    fn test_rtensor_scalar() {
        let t = RTensor::scalar(42.0);
        assert!(t.is_scalar());
        assert_eq!(t.as_scalar(), 42.0);
    }

    #[test]
    fn test_broadcast_shape_rules() {
        assert_eq!(broadcast_shape(&[4, 3], &[3]), Some(vec![4, 3]));
        assert_eq!(broadcast_shape(&[3], &[4, 3]), Some(vec![4, 3]));
        assert_eq!(broadcast_shape(&[], &[2, 2]), Some(vec![2, 2]));
        assert_eq!(broadcast_shape(&[1, 3], &[5, 3]), Some(vec![5, 3]));
        assert_eq!(broadcast_shape(&[4, 3], &[4]), None);
    }

    #[test]
    fn test_add_broadcasts_row_vector() {
        let a = RTensor::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let b = RTensor::vector(vec![10.0, 20.0]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_add_rejects_incompatible() {
        let a = RTensor::vector(vec![1.0, 2.0, 3.0]);
        let b = RTensor::vector(vec![1.0, 2.0]);
        assert!(matches!(a.add(&b), Err(DiffError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_reduce_to_sums_rows() {
        let g = RTensor::matrix(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(g.reduce_to(&[2]).data, vec![9.0, 12.0]);
        assert_eq!(g.reduce_to(&[]).data, vec![21.0]);
    }

    #[test]
    fn test_rtensor_matmul() {
        // [1 2] × [5 6]   [19 22]
        // [3 4]   [7 8] = [43 50]
        let a = RTensor::matrix(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let b = RTensor::matrix(2, 2, vec![5.0, 6.0, 7.0, 8.0]);
        let c = a.matmul(&b).unwrap();

        assert_eq!(c.shape, vec![2, 2]);
        assert_eq!(c.data, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = RTensor::matrix(2, 3, vec![0.0; 6]);
        let b = RTensor::matrix(2, 2, vec![0.0; 4]);
        assert!(matches!(a.matmul(&b), Err(DiffError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_gather_rows() {
        let t = RTensor::matrix(3, 2, vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0]);
        let g = t.gather_rows(&[2, 0, 2]).unwrap();
        assert_eq!(g.shape, vec![3, 2]);
        assert_eq!(g.data, vec![20.0, 21.0, 0.0, 1.0, 20.0, 21.0]);
        assert!(t.gather_rows(&[3]).is_err());
    }

    #[test]
    fn test_conv2d_forward() {
        // 1x1x3x3 input, 1x1x2x2 kernel of ones -> 2x2 window sums
        let x = RTensor::from_data(
            vec![1, 1, 3, 3],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        );
        let k = RTensor::full(vec![1, 1, 2, 2], 1.0);
        let y = DiffOp::Conv2d {
            stride: 1,
            padding: 0,
        }
        .forward(&[x, k])
        .unwrap();
        assert_eq!(y.shape, vec![1, 1, 2, 2]);
        assert_eq!(y.data, vec![12.0, 16.0, 24.0, 28.0]);
    }

    #[test]
    fn test_conv2d_padding_keeps_size() {
        let x = RTensor::full(vec![2, 1, 4, 4], 1.0);
        let k = RTensor::full(vec![3, 1, 3, 3], 1.0);
        let y = DiffOp::Conv2d {
            stride: 1,
            padding: 1,
        }
        .forward(&[x, k])
        .unwrap();
        assert_eq!(y.shape, vec![2, 3, 4, 4]);
        // corner sees a 2x2 patch, centre a 3x3 patch
        assert_eq!(y.data[0], 4.0);
        assert_eq!(y.data[5], 9.0);
    }

    #[test]
    fn test_conv2d_channel_mismatch() {
        let x = RTensor::zeros(vec![1, 2, 3, 3]);
        let k = RTensor::zeros(vec![1, 1, 2, 2]);
        let result = DiffOp::Conv2d {
            stride: 1,
            padding: 0,
        }
        .forward(&[x, k]);
        assert!(matches!(result, Err(DiffError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_log_softmax_rows_normalise() {
        let x = RTensor::matrix(2, 3, vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        let y = DiffOp::LogSoftmax.forward(&[x]).unwrap();
        for r in 0..2 {
            let total: f32 = y.data[r * 3..(r + 1) * 3].iter().map(|v| v.exp()).sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_normal_log_pdf_standard() {
        let x = RTensor::vector(vec![0.0, 1.0]);
        let y = DiffOp::NormalLogPdf
            .forward(&[x, RTensor::scalar(0.0), RTensor::scalar(1.0)])
            .unwrap();
        assert!((y.data[0] + HALF_LN_TAU).abs() < 1e-6);
        assert!((y.data[1] + 0.5 + HALF_LN_TAU).abs() < 1e-6);
        assert!((HALF_LN_TAU - 0.5 * TAU.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_categorical_log_pmf_indices_and_onehot_agree() {
        let logits = RTensor::matrix(2, 3, vec![0.5, 1.0, -1.0, 2.0, 0.0, 0.0]);
        let idx = RTensor::vector(vec![1.0, 0.0]);
        let onehot = RTensor::matrix(2, 3, vec![0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        let a = DiffOp::CategoricalLogPmf
            .forward(&[logits.clone(), idx])
            .unwrap();
        let b = DiffOp::CategoricalLogPmf.forward(&[logits, onehot]).unwrap();
        assert_eq!(a.shape, vec![2]);
        for (x, y) in a.data.iter().zip(&b.data) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_categorical_rejects_bad_label() {
        let logits = RTensor::matrix(1, 2, vec![0.0, 0.0]);
        let result = DiffOp::CategoricalLogPmf.forward(&[logits, RTensor::vector(vec![2.0])]);
        assert!(matches!(result, Err(DiffError::InvalidValue { .. })));
    }

    #[test]
    fn test_categorical_label_batch_shares_logits() {
        // Three observations of class 2 under one logits vector; the batch
        // length equals the class count but the labels are still indices.
        let logits = RTensor::vector(vec![0.0, 1.0, 2.0]);
        let labels = RTensor::vector(vec![2.0, 2.0, 2.0]);
        let y = DiffOp::CategoricalLogPmf
            .forward(&[logits.clone(), labels])
            .unwrap();
        assert_eq!(y.shape, vec![3]);
        let lse = (1.0f32 + 1.0f32.exp() + 2.0f32.exp()).ln();
        for v in &y.data {
            assert!((v - (2.0 - lse)).abs() < 1e-5);
        }
        assert!((y.data.iter().sum::<f32>() + 1.2228).abs() < 1e-3);

        let four = DiffOp::CategoricalLogPmf
            .forward(&[logits, RTensor::vector(vec![0.0, 1.0, 2.0, 2.0])])
            .unwrap();
        assert_eq!(four.shape, vec![4]);
        assert!((four.data[0] + lse).abs() < 1e-5);
    }

    #[test]
    fn test_categorical_shared_logits_gradient_sums_rows() {
        let logits = RTensor::vector(vec![0.0, 1.0, 2.0]);
        let labels = RTensor::vector(vec![2.0, 0.0, 2.0, 1.0]);
        let y = DiffOp::CategoricalLogPmf
            .forward(&[logits.clone(), labels.clone()])
            .unwrap();
        let grads = DiffOp::CategoricalLogPmf
            .vjp(&[logits.clone(), labels], &y, &RTensor::full(vec![4], 1.0))
            .unwrap();
        assert_eq!(grads[0].shape, vec![3]);
        // Four rows each contribute onehot - softmax; the softmax mass cancels
        // against the label counts, so the gradient sums to zero.
        assert!(grads[0].data.iter().sum::<f32>().abs() < 1e-5);
        let p0 = 1.0 / (1.0 + 1.0f32.exp() + 2.0f32.exp());
        assert!((grads[0].data[0] - (1.0 - 4.0 * p0)).abs() < 1e-5);
    }

    #[test]
    fn test_categorical_label_batch_must_broadcast() {
        let logits = RTensor::matrix(2, 3, vec![0.0; 6]);
        let result = DiffOp::CategoricalLogPmf.forward(&[logits, RTensor::vector(vec![0.0; 3])]);
        assert!(matches!(result, Err(DiffError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_bernoulli_log_pmf() {
        let logits = RTensor::vector(vec![0.0, 0.0]);
        let targets = RTensor::vector(vec![1.0, 0.0]);
        let y = DiffOp::BernoulliLogPmf.forward(&[logits, targets]).unwrap();
        for v in y.data {
            assert!((v - 0.5f32.ln()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_arity_is_checked() {
        let result = DiffOp::Add.forward(&[RTensor::scalar(1.0)]);
        assert!(matches!(result, Err(DiffError::Arity { .. })));
    }
}
