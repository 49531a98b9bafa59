//! Folding of elementwise binary operations into convolutions.
//!
//! A convolution followed by an addition, subtraction, multiplication or
//! division with a constant can be replaced by a single convolution whose
//! weight and bias have been adjusted, if the constant varies only along the
//! output channel axis:
//!
//! ```text
//! conv(x, w, b) + c  =>  conv(x, w, b + c)
//! conv(x, w, b) * c  =>  conv(x, w * c, b * c)
//! ```
//!
//! The adjusted weights and biases are expressed as new operators on the
//! existing constants. Constant propagation then evaluates them.

use crate::graph::{Arg, Dimension, Graph, GraphError, Inserter, NodeId, NodeKind, OpType};
use crate::infer_shapes::infer_node_meta;
use crate::oracle::ShapeOracle;

use super::pattern_matcher::{Match, Pattern};
use super::{LegalityViolation, RewriteError};

/// Family of binary operators which are folded the same way.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FoldFamily {
    /// `Add` and `Sub`, which are folded into the convolution's bias.
    Additive,
    /// `Mul` and `Div`, which are folded into the weight and bias.
    Multiplicative,
}

impl FoldFamily {
    /// Return the family of a binary operator, or `None` if it cannot be
    /// folded.
    pub fn from_op(op: &OpType) -> Option<FoldFamily> {
        match op {
            OpType::Add | OpType::Sub => Some(FoldFamily::Additive),
            OpType::Mul | OpType::Div => Some(FoldFamily::Multiplicative),
            _ => None,
        }
    }
}

/// Number of arguments of a convolution call.
const CONV_ARG_COUNT: usize = 9;

/// Return a pattern which matches `binary_op(conv(...), other)`.
///
/// The pattern binds the symbols `conv`, `weight`, `bias` and `other`.
/// Transposed convolutions are not matched, since their weights have the
/// output channels in the second dimension.
///
/// For commutative operators the convolution may be either operand. For
/// `Sub` and `Div` it must be the first.
pub fn binary_folding_pattern(binary_op: OpType) -> Pattern {
    let any = Pattern::wildcard;
    let conv = Pattern::call(
        OpType::Convolution,
        [
            any(), // input
            Pattern::symbol("weight"),
            Pattern::symbol("bias"),
            any(), // stride
            any(), // padding
            any(), // dilation
            Pattern::fixed(false), // transposed
            any(), // output_padding
            any(), // groups
        ],
    )
    .with_name("conv");
    Pattern::binary_op(binary_op, conv, Pattern::symbol("other"))
}

/// Return the ID of a node bound to a symbol if it is a constant.
fn constant_node(graph: &Graph, pat_match: &Match, name: &str) -> Option<NodeId> {
    let id = pat_match.node_id(name)?;
    graph
        .get_node(id)
        .is_some_and(|node| matches!(node.kind(), NodeKind::Constant(_)))
        .then_some(id)
}

/// Return true if an operand with shape `other` combined with the output of
/// a convolution whose weight has shape `weight` leaves the shape of the
/// output unchanged, and the operand can be reshaped to `[out_channels]`.
///
/// The convolution output has the same rank as the weight, with output
/// channels in dimension 1. `other` is aligned against the output from the
/// right, as in broadcasting. The dimension that aligns with the channel
/// axis may equal the number of output channels. All other dimensions must
/// be 1.
pub fn op_does_not_broadcast(weight: &[Dimension], other: &[Dimension]) -> bool {
    if weight.len() < other.len() {
        return false;
    }
    let Some(out_channels) = weight.first() else {
        return false;
    };

    // Index in `other` of the dimension that aligns with output dim 1.
    let channel_axis = (other.len() + 1).checked_sub(weight.len());

    other.iter().enumerate().rev().all(|(i, dim)| {
        if Some(i) == channel_axis && dim == out_channels {
            return true;
        }
        *dim == Dimension::Fixed(1)
    })
}

/// Check whether a match for [`binary_folding_pattern`] can be folded.
///
/// The weight, bias (if any) and other operand must be constants. The
/// weight and other operand must be float tensors, and combining them must
/// not change the weight's type. Finally the other operand must not change
/// the shape of the convolution output when broadcast against it (see
/// [`op_does_not_broadcast`]).
pub fn check_binary_folding(
    pat_match: &Match,
    graph: &Graph,
    oracle: &dyn ShapeOracle,
) -> Result<(), LegalityViolation> {
    let weight =
        constant_node(graph, pat_match, "weight").ok_or(LegalityViolation::WeightNotConstant)?;

    match pat_match.get("bias") {
        Some(Arg::None) => {}
        Some(Arg::Node(_)) if constant_node(graph, pat_match, "bias").is_some() => {}
        _ => return Err(LegalityViolation::BiasNotConstant),
    }

    // Scalar operands are not supported.
    let other =
        constant_node(graph, pat_match, "other").ok_or(LegalityViolation::OtherNotConstant)?;

    let weight_dtype = oracle
        .dtype(graph, weight)
        .ok_or(LegalityViolation::MissingMeta(weight))?;
    if !weight_dtype.is_float() {
        return Err(LegalityViolation::WeightNotFloat(weight_dtype));
    }

    let other_dtype = oracle
        .dtype(graph, other)
        .ok_or(LegalityViolation::MissingMeta(other))?;
    if !other_dtype.is_float() {
        return Err(LegalityViolation::OtherNotFloat(other_dtype));
    }
    if oracle.promote_types(other_dtype, weight_dtype) != weight_dtype {
        return Err(LegalityViolation::TypePromotion {
            weight: weight_dtype,
            other: other_dtype,
        });
    }

    let weight_shape = oracle
        .shape(graph, weight)
        .ok_or(LegalityViolation::MissingMeta(weight))?;
    let other_shape = oracle
        .shape(graph, other)
        .ok_or(LegalityViolation::MissingMeta(other))?;
    if !op_does_not_broadcast(&weight_shape, &other_shape) {
        return Err(LegalityViolation::Broadcast);
    }

    // The rewrite reshapes `other` to a per-channel shape, which needs a
    // fixed channel count and element count.
    if weight_shape.first().and_then(|d| d.fixed()).is_none() {
        return Err(LegalityViolation::SymbolicShape(weight));
    }
    if other_shape.iter().any(|d| d.fixed().is_none()) {
        return Err(LegalityViolation::SymbolicShape(other));
    }

    Ok(())
}

/// Create a call node and annotate it with its inferred shape and type.
fn create_node(ins: &mut Inserter, target: OpType, args: Vec<Arg>) -> Result<NodeId, GraphError> {
    let id = ins.create_node(target, args)?;
    if let Some(meta) = infer_node_meta(ins.graph(), id) {
        ins.graph_mut().update_meta(id, &meta)?;
    }
    Ok(id)
}

/// Reshape `value` to `shape`.
///
/// Single-element values are reshaped to `[1]` and then expanded, since
/// `shape` may have more elements.
fn resize_to_shape(
    ins: &mut Inserter,
    value: NodeId,
    numel: usize,
    shape: &[usize],
) -> Result<NodeId, GraphError> {
    let shape_arg = Arg::ints(shape.iter().map(|&size| size as i64));
    if numel == 1 {
        let flat = create_node(ins, OpType::Reshape, vec![value.into(), Arg::ints([1])])?;
        create_node(ins, OpType::Expand, vec![flat.into(), shape_arg])
    } else {
        create_node(ins, OpType::Reshape, vec![value.into(), shape_arg])
    }
}

fn invariant(msg: &str) -> RewriteError {
    RewriteError::InvariantViolation(msg.to_string())
}

/// Replace a match for [`binary_folding_pattern`] with a convolution whose
/// weight and bias incorporate the binary operation.
///
/// The match must have passed [`check_binary_folding`]. All assumptions
/// about the match are verified before the graph is modified, so on error
/// the graph is unchanged.
///
/// Returns the ID of the new convolution node.
pub fn fold_binary_into_conv(
    family: FoldFamily,
    binary_op: &OpType,
    pat_match: &Match,
    graph: &mut Graph,
) -> Result<NodeId, RewriteError> {
    let binary_id = pat_match.root();
    let binary_node = graph
        .get_node(binary_id)
        .ok_or_else(|| invariant("binary node not found"))?;
    if binary_node.target() != Some(binary_op) {
        return Err(invariant("root of match has unexpected operator"));
    }
    let binary_meta = binary_node.meta().clone();

    let conv_id = pat_match
        .node_id("conv")
        .ok_or_else(|| invariant("convolution not bound"))?;
    let conv = graph
        .get_call(conv_id)
        .filter(|call| *call.target() == OpType::Convolution)
        .ok_or_else(|| invariant("bound node is not a convolution"))?;
    if conv.args().len() != CONV_ARG_COUNT {
        return Err(invariant("convolution has wrong number of arguments"));
    }
    if graph.users(conv_id) != [binary_id] {
        return Err(invariant("convolution output is used outside of match"));
    }
    let mut conv_args = conv.args().to_vec();

    let weight = conv_args[1]
        .as_node()
        .filter(|&id| graph.get_node(id).is_some_and(|n| n.is_constant()))
        .ok_or_else(|| invariant("weight is not a constant"))?;
    let weight_meta = graph
        .get_node(weight)
        .map(|n| n.meta().clone())
        .ok_or_else(|| invariant("weight not found"))?;
    let weight_rank = weight_meta
        .shape
        .as_ref()
        .map(|s| s.len())
        .ok_or_else(|| invariant("weight shape is unknown"))?;
    let out_channels = weight_meta
        .shape
        .as_ref()
        .and_then(|s| s.first())
        .and_then(|d| d.fixed())
        .ok_or_else(|| invariant("weight has no fixed output channel count"))?;

    let bias = match &conv_args[2] {
        Arg::None => None,
        Arg::Node(id) => Some(*id),
        _ => return Err(invariant("bias is not a node")),
    };
    let bias_meta = bias
        .map(|id| {
            graph
                .get_node(id)
                .map(|n| n.meta().clone())
                .ok_or_else(|| invariant("bias not found"))
        })
        .transpose()?;

    let other = pat_match
        .node_id("other")
        .ok_or_else(|| invariant("other operand is not a node"))?;
    let other_numel = graph
        .get_node(other)
        .and_then(|n| n.meta().numel())
        .ok_or_else(|| invariant("other operand has unknown size"))?;

    let mut ins = graph.inserting_before(binary_id)?;

    match family {
        FoldFamily::Additive => {
            let other_1d = resize_to_shape(&mut ins, other, other_numel, &[out_channels])?;
            let base = bias.map(Arg::Node).unwrap_or(Arg::Float(0.));
            let new_bias = create_node(&mut ins, binary_op.clone(), vec![base, other_1d.into()])?;
            conv_args[2] = new_bias.into();
        }
        FoldFamily::Multiplicative => {
            let mut weight_shape = vec![1; weight_rank];
            weight_shape[0] = out_channels;
            let other_w = resize_to_shape(&mut ins, other, other_numel, &weight_shape)?;
            let new_weight =
                create_node(&mut ins, binary_op.clone(), vec![weight.into(), other_w.into()])?;
            ins.graph_mut().update_meta(new_weight, &weight_meta)?;
            conv_args[1] = new_weight.into();

            if let (Some(bias), Some(bias_meta)) = (bias, bias_meta) {
                let other_1d = resize_to_shape(&mut ins, other, other_numel, &[out_channels])?;
                let new_bias =
                    create_node(&mut ins, binary_op.clone(), vec![bias.into(), other_1d.into()])?;
                ins.graph_mut().update_meta(new_bias, &bias_meta)?;
                conv_args[2] = new_bias.into();
            }
        }
    }

    let new_conv = create_node(&mut ins, OpType::Convolution, conv_args)?;

    graph.replace_all_uses_with(binary_id, new_conv)?;
    graph.update_meta(new_conv, &binary_meta)?;
    graph.erase_node(binary_id)?;
    graph.erase_node(conv_id)?;

    Ok(new_conv)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use rten_tensor::Tensor;
    use rten_testing::TestCases;

    use super::{
        binary_folding_pattern, check_binary_folding, op_does_not_broadcast, FoldFamily,
    };
    use crate::dtype::DataType;
    use crate::graph::builder::{dims, ConvParams, Expr};
    use crate::graph::{Dimension, NodeId, NodeMeta, OpType};
    use crate::optimize::LegalityViolation;
    use crate::oracle::MetaOracle;

    #[test]
    fn test_fold_family() {
        assert_eq!(FoldFamily::from_op(&OpType::Sub), Some(FoldFamily::Additive));
        assert_eq!(FoldFamily::from_op(&OpType::Div), Some(FoldFamily::Multiplicative));
        assert_eq!(FoldFamily::from_op(&OpType::Convolution), None);
    }

    #[test]
    fn test_op_does_not_broadcast() {
        #[derive(Debug)]
        struct Case {
            weight: Vec<Dimension>,
            other: Vec<Dimension>,
            expected: bool,
        }

        let weight = dims![16, 3, 3, 3];
        let cases = [
            Case {
                weight: weight.clone(),
                other: dims![16, 1, 1],
                expected: true,
            },
            Case {
                weight: weight.clone(),
                other: dims![1, 16, 1, 1],
                expected: true,
            },
            Case {
                weight: weight.clone(),
                other: dims![1, 1, 1],
                expected: true,
            },
            Case {
                weight: weight.clone(),
                other: dims![],
                expected: true,
            },
            Case {
                weight: weight.clone(),
                other: dims![16, 2, 1],
                expected: false,
            },
            // Would broadcast against the output width.
            Case {
                weight: weight.clone(),
                other: dims![16],
                expected: false,
            },
            // Would broadcast against the batch dimension.
            Case {
                weight: weight.clone(),
                other: dims![16, 1, 1, 1],
                expected: false,
            },
            // Higher rank than the output.
            Case {
                weight: weight.clone(),
                other: dims![1, 1, 1, 1, 1],
                expected: false,
            },
            Case {
                weight: weight.clone(),
                other: dims![8, 1, 1],
                expected: false,
            },
            // 1D convolution.
            Case {
                weight: dims![4, 2, 3],
                other: dims![4, 1],
                expected: true,
            },
        ];

        cases.test_each(|case| {
            assert_eq!(
                op_does_not_broadcast(&case.weight, &case.other),
                case.expected
            );
        })
    }

    fn input() -> Expr {
        Expr::input(
            "x",
            NodeMeta::tensor(DataType::Float32, dims!["batch", 3, 8, 8]),
        )
    }

    fn weight() -> Expr {
        Expr::constant("weight", Tensor::<f32>::zeros(&[16, 3, 3, 3]))
    }

    #[test]
    fn test_check_binary_folding() {
        #[derive(Clone, Copy, Debug)]
        enum Operand {
            Constant(DataType),
            Dynamic,
        }

        #[derive(Debug)]
        struct Case {
            weight: Operand,
            bias: Option<Operand>,
            other: Operand,
            weight_shape: Vec<Dimension>,
            other_shape: Vec<Dimension>,
            expected: Result<(), LegalityViolation>,
        }

        let param = |name: &str, operand: Operand, shape: Vec<Dimension>| match operand {
            Operand::Constant(dtype) => Expr::parameter(name, NodeMeta::tensor(dtype, shape)),
            Operand::Dynamic => {
                Expr::input(name, NodeMeta::tensor(DataType::Float32, shape)).unary("Relu")
            }
        };

        let f32_const = Operand::Constant(DataType::Float32);
        let cases = [
            // Per-channel scale.
            Case {
                weight: f32_const,
                bias: None,
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Ok(()),
            },
            // Narrower float operand and a constant bias.
            Case {
                weight: f32_const,
                bias: Some(f32_const),
                other: Operand::Constant(DataType::Float16),
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Ok(()),
            },
            Case {
                weight: f32_const,
                bias: None,
                other: Operand::Dynamic,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::OtherNotConstant),
            },
            Case {
                weight: Operand::Dynamic,
                bias: None,
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::WeightNotConstant),
            },
            Case {
                weight: f32_const,
                bias: Some(Operand::Dynamic),
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::BiasNotConstant),
            },
            Case {
                weight: f32_const,
                bias: None,
                other: Operand::Constant(DataType::Float64),
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::TypePromotion {
                    weight: DataType::Float32,
                    other: DataType::Float64,
                }),
            },
            Case {
                weight: f32_const,
                bias: None,
                other: Operand::Constant(DataType::Int32),
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::OtherNotFloat(DataType::Int32)),
            },
            Case {
                weight: Operand::Constant(DataType::Int8),
                bias: None,
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 1, 1],
                expected: Err(LegalityViolation::WeightNotFloat(DataType::Int8)),
            },
            Case {
                weight: f32_const,
                bias: None,
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims![16, 2, 1],
                expected: Err(LegalityViolation::Broadcast),
            },
            // Output channel count only known at runtime.
            Case {
                weight: f32_const,
                bias: None,
                other: f32_const,
                weight_shape: dims!["C", 3, 3, 3],
                other_shape: dims!["C", 1, 1],
                expected: Err(LegalityViolation::SymbolicShape(NodeId::from_u32(0))),
            },
            Case {
                weight: f32_const,
                bias: None,
                other: f32_const,
                weight_shape: dims![16, 3, 3, 3],
                other_shape: dims!["n"],
                expected: Err(LegalityViolation::Broadcast),
            },
        ];

        cases.test_each(|case| {
            let weight = param("weight", case.weight, case.weight_shape.clone());
            let bias = case.bias.map(|bias| param("bias", bias, dims![16]));
            let other = param("scale", case.other, case.other_shape.clone());
            let graph = (input().conv(weight, bias) * other).build_graph();
            let root = graph.output_ids()[0];

            let pattern = binary_folding_pattern(OpType::Mul);
            let pat_match = pattern.test(root, &graph);
            let pat_match = pat_match.as_ref().expect("pattern should match");
            let result = check_binary_folding(pat_match, &graph, &MetaOracle);

            // Node IDs in expected errors are placeholders for the weight.
            let expected = match &case.expected {
                Err(LegalityViolation::SymbolicShape(_)) => {
                    let weight_id = graph.find_node("weight").expect("weight should exist");
                    Err(LegalityViolation::SymbolicShape(weight_id))
                }
                expected => expected.clone(),
            };
            assert_eq!(result, expected);
        })
    }

    #[test]
    fn test_missing_meta() -> Result<(), Box<dyn Error>> {
        let other = Expr::parameter("scale", NodeMeta::default());
        let graph = (input().conv(weight(), None) + other).build_graph();
        let root = graph.output_ids()[0];
        let scale = graph.find_node("scale").ok_or("missing node")?;

        let pattern = binary_folding_pattern(OpType::Add);
        let pat_match = pattern.test(root, &graph).ok_or("no match")?;
        assert_eq!(
            check_binary_folding(&pat_match, &graph, &MetaOracle),
            Err(LegalityViolation::MissingMeta(scale))
        );
        Ok(())
    }

    #[test]
    fn test_pattern_operand_order() {
        let scale = || Expr::constant("scale", Tensor::full(&[16, 1, 1], 2.0f32));
        let conv = || input().conv(weight(), None);

        // Commutative operators match either way around.
        let graph = (scale() * conv()).build_graph();
        let root = graph.output_ids()[0];
        let pat_match = binary_folding_pattern(OpType::Mul).test(root, &graph);
        assert!(pat_match.is_some_and(|m| m.node_id("other") == graph.find_node("scale")));

        // Non-commutative operators require the convolution to come first.
        let graph = (scale() / conv()).build_graph();
        let root = graph.output_ids()[0];
        assert!(binary_folding_pattern(OpType::Div).test(root, &graph).is_none());

        let graph = (conv() / scale()).build_graph();
        let root = graph.output_ids()[0];
        assert!(binary_folding_pattern(OpType::Div).test(root, &graph).is_some());

        // Transposed convolutions are not matched.
        let params = ConvParams {
            transposed: true,
            ..Default::default()
        };
        let graph = (input().conv_with(weight(), None, params) + scale()).build_graph();
        let root = graph.output_ids()[0];
        assert!(binary_folding_pattern(OpType::Add).test(root, &graph).is_none());
    }
}
