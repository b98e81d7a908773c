//! # Diff - Tensors and Reverse-Mode Autodiff
//!
//! This crate is the numeric backend of the stochgraph engine: a small
//! dynamically shaped tensor, a recording tape over a petgraph DAG, and a
//! reverse-mode backward pass.
//!
//! ## Core Concepts
//!
//! - **Computation graphs are recorded eagerly**: each node keeps its value
//! - **Backward reverses the arrows**: VJPs are applied in reverse order
//! - **Black boxes record onto the same tape**: see [`function`]
//!
//! ## Modules
//!
//! - [`ops`]: `RTensor` and differentiable operations
//! - [`forward`]: the recording tape
//! - [`backward`]: reverse-mode autodiff and gradient checking
//! - [`optim`]: optimizers and the named parameter store
//! - [`function`]: the `DifferentiableFunction` trait
//! - [`layers`]: Linear, Conv2d and friends
//!
//! ## Example
//!
//! ```rust
//! use stochgraph_diff::{backward, DiffGraph, RTensor};
//!
//! let mut graph = DiffGraph::new();
//! let w = graph.param("w", &RTensor::vector(vec![1.0, -1.0]));
//! let sq = graph.square(w).unwrap();
//! let loss = graph.sum_all(sq).unwrap();
//!
//! let grads = backward(&graph, loss).unwrap();
//! assert_eq!(grads.param("w").unwrap().data, vec![2.0, -2.0]);
//! ```

pub mod backward;
pub mod error;
pub mod forward;
pub mod function;
pub mod layers;
pub mod ops;
pub mod optim;

// Re-export key types
pub use backward::{backward, grad, grad_check, Gradients};
pub use error::DiffError;
pub use forward::DiffGraph;
pub use function::DifferentiableFunction;
pub use ops::{DiffOp, RTensor};
pub use optim::{Optimizer, OptimizerSpec, Parameters};
pub use petgraph::graph::NodeIndex;
