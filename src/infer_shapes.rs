//! Shape and type inference for operator calls.
//!
//! Graphs handed to the optimizer are annotated with shapes and types by an
//! earlier analysis phase. Nodes created by rewrites do not have these
//! annotations, so this module computes them from the annotations of the
//! node's inputs.

use crate::dtype::promote_types;
use crate::graph::{Arg, Dimension, Graph, NodeId, NodeMeta, OpType};

#[derive(Clone, Debug, PartialEq)]
pub enum ShapeInferenceError {
    /// Too many or too few inputs were provided for this operator.
    IncorrectInputCount,

    /// The input shapes are incompatible.
    ///
    /// Operator execution will fail if given inputs with these shapes.
    IncompatibleShapes,

    /// An input's rank does not match that expected by the operator.
    IncorrectRank,

    /// An operator attribute (eg. a target shape) is invalid.
    InvalidAttribute,
}

/// Inferred size of a single output dimension.
#[derive(Clone, Debug, PartialEq)]
pub enum InferredDimension {
    Fixed(usize),
    Symbolic(String),
    /// The dimension has an unknown size.
    Unknown,
}

impl InferredDimension {
    /// Convert to a [`Dimension`], if the size is known.
    pub fn to_dimension(&self) -> Option<Dimension> {
        match self {
            Self::Fixed(size) => Some(Dimension::Fixed(*size)),
            Self::Symbolic(name) => Some(Dimension::Symbolic(name.clone())),
            Self::Unknown => None,
        }
    }
}

impl From<usize> for InferredDimension {
    fn from(size: usize) -> Self {
        InferredDimension::Fixed(size)
    }
}

impl From<&str> for InferredDimension {
    fn from(name: &str) -> Self {
        InferredDimension::Symbolic(name.to_string())
    }
}

impl From<Dimension> for InferredDimension {
    fn from(val: Dimension) -> Self {
        match val {
            Dimension::Fixed(size) => Self::Fixed(size),
            Dimension::Symbolic(name) => Self::Symbolic(name),
        }
    }
}

/// Infer the shape of an operator's output given the shapes of its inputs.
pub trait InferShapes {
    fn infer_shapes(
        &self,
        inputs: &[&[Dimension]],
    ) -> Result<Vec<InferredDimension>, ShapeInferenceError>;
}

/// Shape inference implementation for binary operators.
///
/// These operators take two inputs and return an output whose shape is the
/// result of broadcasting the two input shapes together.
pub struct BinaryOpInfer;

impl InferShapes for BinaryOpInfer {
    fn infer_shapes(
        &self,
        inputs: &[&[Dimension]],
    ) -> Result<Vec<InferredDimension>, ShapeInferenceError> {
        let [a, b] = inputs else {
            return Err(ShapeInferenceError::IncorrectInputCount);
        };

        let a_pad = b.len().saturating_sub(a.len());
        let b_pad = a.len().saturating_sub(b.len());

        let one = Dimension::Fixed(1);
        let a_iter = std::iter::repeat(&one).take(a_pad).chain(a.iter());
        let b_iter = std::iter::repeat(&one).take(b_pad).chain(b.iter());

        let mut out_shape = Vec::with_capacity(a.len().max(b.len()));
        for (a, b) in a_iter.zip(b_iter) {
            let dim: InferredDimension = match (a, b) {
                (a, b) if a == b => a.clone().into(),

                // If either size is 1, it will be broadcast against the other
                // size.
                (Dimension::Fixed(1), b) => b.clone().into(),
                (a, Dimension::Fixed(1)) => a.clone().into(),

                (Dimension::Fixed(_), Dimension::Fixed(_)) => {
                    return Err(ShapeInferenceError::IncompatibleShapes);
                }

                // Execution can only succeed if the symbolic dim has the same
                // size as the fixed dim.
                (Dimension::Symbolic(_), Dimension::Fixed(b)) => InferredDimension::Fixed(*b),
                (Dimension::Fixed(a), Dimension::Symbolic(_)) => InferredDimension::Fixed(*a),

                // Differently named symbolic dims may be equal, or either may
                // be 1.
                (Dimension::Symbolic(_), Dimension::Symbolic(_)) => InferredDimension::Unknown,
            };
            out_shape.push(dim);
        }

        Ok(out_shape)
    }
}

/// Shape inference for `Reshape`.
///
/// One entry in the target shape may be -1, in which case its size is
/// computed from the number of elements in the input.
pub struct ReshapeInfer<'a> {
    pub shape: &'a [i64],
}

impl InferShapes for ReshapeInfer<'_> {
    fn infer_shapes(
        &self,
        inputs: &[&[Dimension]],
    ) -> Result<Vec<InferredDimension>, ShapeInferenceError> {
        let [input] = inputs else {
            return Err(ShapeInferenceError::IncorrectInputCount);
        };

        let n_inferred = self.shape.iter().filter(|&&size| size == -1).count();
        if n_inferred > 1 || self.shape.iter().any(|&size| size < -1) {
            return Err(ShapeInferenceError::InvalidAttribute);
        }

        let known_len = self
            .shape
            .iter()
            .filter(|&&size| size != -1)
            .try_fold(1usize, |acc, &size| acc.checked_mul(size as usize))
            .ok_or(ShapeInferenceError::InvalidAttribute)?;
        let input_len = input
            .iter()
            .try_fold(1usize, |acc, d| d.fixed().and_then(|d| acc.checked_mul(d)));

        if n_inferred == 0 {
            if input_len.is_some_and(|len| len != known_len) {
                return Err(ShapeInferenceError::IncompatibleShapes);
            }
            return Ok(self
                .shape
                .iter()
                .map(|&size| InferredDimension::Fixed(size as usize))
                .collect());
        }

        let inferred = match input_len {
            Some(len) if known_len == 0 || len % known_len != 0 => {
                return Err(ShapeInferenceError::IncompatibleShapes)
            }
            Some(len) => InferredDimension::Fixed(len / known_len),
            None => InferredDimension::Unknown,
        };

        Ok(self
            .shape
            .iter()
            .map(|&size| {
                if size == -1 {
                    inferred.clone()
                } else {
                    InferredDimension::Fixed(size as usize)
                }
            })
            .collect())
    }
}

/// Shape inference for `Expand`.
///
/// The input is broadcast to the target shape. Entries of -1 in the target
/// shape keep the size of the corresponding input dimension.
pub struct ExpandInfer<'a> {
    pub shape: &'a [i64],
}

impl InferShapes for ExpandInfer<'_> {
    fn infer_shapes(
        &self,
        inputs: &[&[Dimension]],
    ) -> Result<Vec<InferredDimension>, ShapeInferenceError> {
        let [input] = inputs else {
            return Err(ShapeInferenceError::IncorrectInputCount);
        };
        if input.len() > self.shape.len() {
            return Err(ShapeInferenceError::IncorrectRank);
        }

        let pad = self.shape.len() - input.len();
        let mut out_shape = Vec::with_capacity(self.shape.len());
        for (i, &size) in self.shape.iter().enumerate() {
            let in_dim = i.checked_sub(pad).map(|i| &input[i]);
            let dim = match (in_dim, size) {
                (None, -1) => return Err(ShapeInferenceError::InvalidAttribute),
                (Some(dim), -1) => dim.clone().into(),
                (_, size) if size < 0 => return Err(ShapeInferenceError::InvalidAttribute),
                (None | Some(Dimension::Fixed(1)), size) => InferredDimension::Fixed(size as usize),
                (Some(Dimension::Fixed(in_size)), size) if *in_size == size as usize => {
                    InferredDimension::Fixed(*in_size)
                }
                (Some(Dimension::Fixed(_)), _) => {
                    return Err(ShapeInferenceError::IncompatibleShapes)
                }
                (Some(Dimension::Symbolic(_)), size) => InferredDimension::Fixed(size as usize),
            };
            out_shape.push(dim);
        }
        Ok(out_shape)
    }
}

/// Shape inference for N-d convolution with channel-first layout.
///
/// The inputs are the data with shape `[N, C_in, *spatial]` and weight with
/// shape `[C_out, C_in / groups, *kernel]` (`[C_in, C_out / groups, *kernel]`
/// for transposed convolution).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConvInfer {
    pub stride: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
    pub transposed: bool,
    pub output_padding: Vec<i64>,
    pub groups: i64,
}

impl ConvInfer {
    /// Extract convolution parameters from the arguments of a convolution
    /// call.
    pub fn from_args(args: &[Arg]) -> Option<ConvInfer> {
        let int_list = |index: usize| args.get(index).and_then(|a| a.as_int_list());
        Some(ConvInfer {
            stride: int_list(3)?,
            padding: int_list(4)?,
            dilation: int_list(5)?,
            transposed: args.get(6)?.as_bool()?,
            output_padding: int_list(7)?,
            groups: args.get(8)?.as_int()?,
        })
    }
}

/// Return the parameter for spatial axis `axis`, broadcasting a single
/// value over all axes.
fn spatial_param(values: &[i64], axis: usize, default: i64) -> i64 {
    match values {
        [] => default,
        [value] => *value,
        values => values.get(axis).copied().unwrap_or(default),
    }
}

impl InferShapes for ConvInfer {
    fn infer_shapes(
        &self,
        inputs: &[&[Dimension]],
    ) -> Result<Vec<InferredDimension>, ShapeInferenceError> {
        let [input, weight] = inputs else {
            return Err(ShapeInferenceError::IncorrectInputCount);
        };
        if input.len() < 3 || input.len() != weight.len() {
            return Err(ShapeInferenceError::IncorrectRank);
        }

        let out_channels = if self.transposed {
            weight[1].fixed().map(|c| c * self.groups.max(1) as usize)
        } else {
            weight[0].fixed()
        };

        let mut out_shape = Vec::with_capacity(input.len());
        out_shape.push(input[0].clone().into());
        out_shape.push(
            out_channels
                .map(InferredDimension::Fixed)
                .unwrap_or(InferredDimension::Unknown),
        );

        for (axis, (in_dim, k_dim)) in input[2..].iter().zip(&weight[2..]).enumerate() {
            let (Some(in_size), Some(k_size)) = (in_dim.fixed(), k_dim.fixed()) else {
                out_shape.push(InferredDimension::Unknown);
                continue;
            };
            let (in_size, k_size) = (in_size as i64, k_size as i64);
            let stride = spatial_param(&self.stride, axis, 1);
            let padding = spatial_param(&self.padding, axis, 0);
            let dilation = spatial_param(&self.dilation, axis, 1);

            let out_size = if self.transposed {
                let output_padding = spatial_param(&self.output_padding, axis, 0);
                (in_size - 1) * stride - 2 * padding + dilation * (k_size - 1) + output_padding + 1
            } else {
                if stride <= 0 {
                    return Err(ShapeInferenceError::InvalidAttribute);
                }
                let span = in_size + 2 * padding - dilation * (k_size - 1) - 1;
                if span < 0 {
                    return Err(ShapeInferenceError::IncompatibleShapes);
                }
                span / stride + 1
            };
            if out_size <= 0 {
                return Err(ShapeInferenceError::IncompatibleShapes);
            }
            out_shape.push(InferredDimension::Fixed(out_size as usize));
        }

        Ok(out_shape)
    }
}

/// Return the metadata of the node referenced by argument `index`.
fn input_meta<'a>(graph: &'a Graph, args: &[Arg], index: usize) -> Option<&'a NodeMeta> {
    let id = args.get(index)?.as_node()?;
    graph.get_node(id).map(|n| n.meta())
}

/// Return the shape of argument `index`. Scalar arguments act as rank-0
/// tensors.
fn input_shape<'a>(graph: &'a Graph, args: &[Arg], index: usize) -> Option<&'a [Dimension]> {
    match args.get(index)? {
        Arg::Int(_) | Arg::Float(_) | Arg::Bool(_) => Some(&[]),
        Arg::Node(_) => input_meta(graph, args, index)?.shape.as_deref(),
        Arg::None | Arg::List(_) => None,
    }
}

/// Compute the shape and type of a call node from the metadata of its
/// inputs.
///
/// Returns `None` if the node is not a call, the operator is not supported or
/// nothing could be inferred. Fields of the result which could not be
/// inferred are left unset.
pub fn infer_node_meta(graph: &Graph, node_id: NodeId) -> Option<NodeMeta> {
    let call = graph.get_call(node_id)?;
    let args = call.args();
    let dtype_of = |index| input_meta(graph, args, index).and_then(|m| m.dtype);
    let is_scalar = |index| args.get(index).is_some_and(|a: &Arg| a.as_node().is_none());

    let (shape, dtype) = match call.target() {
        OpType::Add | OpType::Sub | OpType::Mul | OpType::Div => {
            let dtype = match (dtype_of(0), dtype_of(1)) {
                (Some(a), Some(b)) => Some(promote_types(a, b)),
                (Some(a), None) if is_scalar(1) => Some(a),
                (None, Some(b)) if is_scalar(0) => Some(b),
                _ => None,
            };
            let shape = match (input_shape(graph, args, 0), input_shape(graph, args, 1)) {
                (Some(a), Some(b)) => BinaryOpInfer.infer_shapes(&[a, b]).ok(),
                _ => None,
            };
            (shape, dtype)
        }
        op @ (OpType::Reshape | OpType::Expand) => {
            let target = args.get(1).and_then(|a| a.as_int_list());
            let shape = match (input_shape(graph, args, 0), target) {
                (Some(input), Some(target)) => {
                    let result = if *op == OpType::Reshape {
                        ReshapeInfer { shape: &target }.infer_shapes(&[input])
                    } else {
                        ExpandInfer { shape: &target }.infer_shapes(&[input])
                    };
                    result.ok()
                }
                _ => None,
            };
            (shape, dtype_of(0))
        }
        OpType::Convolution => {
            let shape = match (
                input_shape(graph, args, 0),
                input_shape(graph, args, 1),
                ConvInfer::from_args(args),
            ) {
                (Some(input), Some(weight), Some(conv)) => conv.infer_shapes(&[input, weight]).ok(),
                _ => None,
            };
            (shape, dtype_of(0))
        }
        OpType::Custom(_) => return None,
    };

    let shape: Option<Vec<Dimension>> =
        shape.and_then(|dims| dims.iter().map(|d| d.to_dimension()).collect());
    if shape.is_none() && dtype.is_none() {
        return None;
    }

    Some(NodeMeta {
        shape,
        dtype,
        ..Default::default()
    })
}
