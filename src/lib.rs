//! rten-fold folds elementwise binary operations into preceding convolutions
//! in a tensor compute graph.
//!
//! A convolution whose output is added to, subtracted from, multiplied or
//! divided by a constant can often be replaced by a single convolution with
//! adjusted weights and bias. This removes an operator from the graph and a
//! pass over the convolution's output at inference time.
//!
//! # Overview
//!
//! Graphs are represented by [`Graph`], a list of nodes in execution order.
//! Each node is a graph input, a constant or a call to an operator, and
//! carries [`NodeMeta`] annotations describing the shape and type of its
//! value.
//!
//! Rewrites are described by a [`Pattern`](optimize::Pattern) which is
//! matched against the graph, a legality check and a rewrite function.
//! These are collected in a [`PatternRegistry`](optimize::PatternRegistry)
//! and applied until the graph reaches a fixed point. [`GraphOptimizer`]
//! combines the registry of binary folding rewrites with constant
//! propagation, which evaluates the adjusted weights and biases.
//!
//! ```
//! use rten_fold::graph::builder::Expr;
//! use rten_fold::graph::{fixed_dims, NodeMeta, OpType};
//! use rten_fold::{DataType, GraphOptimizer, OptimizeOptions};
//! use rten_tensor::Tensor;
//!
//! let x = Expr::input("x", NodeMeta::tensor(DataType::Float32, fixed_dims(&[1, 3, 8, 8])));
//! let weight = Expr::constant("weight", Tensor::<f32>::zeros(&[16, 3, 3, 3]));
//! let scale = Expr::constant("scale", Tensor::full(&[16, 1, 1], 0.5f32));
//! let graph = (x.conv(weight, None) * scale).build_graph();
//!
//! let optimizer = GraphOptimizer::with_options(OptimizeOptions::default());
//! let graph = optimizer.optimize(graph).unwrap();
//!
//! let output = graph.output_ids()[0];
//! assert_eq!(graph.get_node(output).and_then(|n| n.target()), Some(&OpType::Convolution));
//! ```
//!
//! # Configuration
//!
//! [`GraphOptimizer::new`] reads options from the `RTEN_FOLD` environment
//! variable, a space-separated list of `key=value` pairs:
//!
//! - `diagnostics=off|warn|info` reports rejected (`warn`) or all (`info`)
//!   rewrites on stdout.
//! - `max-rewrites=N` limits the number of rewrites applied to a graph.
//! - `propagate-constants=0|1` controls whether constant expressions created
//!   by rewrites are evaluated.

pub mod dtype;
mod env;
pub mod graph;
pub mod infer_shapes;
pub mod optimize;
pub mod oracle;
pub mod type_map;

pub use dtype::{promote_types, DataType};
pub use graph::{Dimension, Graph, GraphError, NodeId, NodeMeta};
pub use optimize::{GraphOptimizer, OptimizeError, OptimizeOptions};
pub use oracle::{MetaOracle, ShapeOracle};
