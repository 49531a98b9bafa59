use std::borrow::Cow;
use std::error::Error;
use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::graph::{Arg, CallNode, Graph, GraphError, NodeId, OpType};

/// Errors that occur when evaluating an operator with constant inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum EvalError {
    /// The operator cannot be evaluated ahead of time.
    Unsupported(OpType),
    /// An input is not a float constant with known data.
    NonConstantInput(usize),
    /// Input shapes are incompatible with each other or with a shape
    /// argument.
    ShapeMismatch(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unsupported(op) => write!(f, "cannot evaluate operator {}", op),
            Self::NonConstantInput(index) => write!(f, "input {} is not a float constant", index),
            Self::ShapeMismatch(details) => write!(f, "shape mismatch: {}", details),
        }
    }
}

impl Error for EvalError {}

/// Return the value of a call argument as a float tensor, if it is a float
/// constant or a number.
fn float_operand<'a>(graph: &'a Graph, arg: &Arg) -> Option<Cow<'a, Tensor<f32>>> {
    match arg {
        Arg::Node(id) => graph
            .get_node(*id)?
            .as_constant()?
            .data()?
            .as_float()
            .map(Cow::Borrowed),
        Arg::Float(val) => Some(Cow::Owned(Tensor::from_scalar(*val as f32))),
        Arg::Int(val) => Some(Cow::Owned(Tensor::from_scalar(*val as f32))),
        _ => None,
    }
}

fn operand<'a>(
    graph: &'a Graph,
    call: &CallNode,
    index: usize,
) -> Result<Cow<'a, Tensor<f32>>, EvalError> {
    call.arg(index)
        .and_then(|arg| float_operand(graph, arg))
        .ok_or(EvalError::NonConstantInput(index))
}

fn shape_arg(call: &CallNode, index: usize) -> Result<Vec<i64>, EvalError> {
    call.arg(index)
        .and_then(|arg| arg.as_int_list())
        .ok_or_else(|| EvalError::ShapeMismatch(format!("argument {} is not a shape", index)))
}

/// Compute the shape produced by broadcasting `a` and `b` together.
fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        (i + shape.len())
            .checked_sub(rank)
            .map(|j| shape[j])
            .unwrap_or(1)
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn binary_op(
    a: &Tensor<f32>,
    b: &Tensor<f32>,
    op: impl Fn(f32, f32) -> f32,
) -> Result<Tensor<f32>, EvalError> {
    let mismatch = || EvalError::ShapeMismatch(format!("{:?} vs {:?}", a.shape(), b.shape()));
    let out_shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(mismatch)?;
    let a = a
        .view()
        .try_broadcast(out_shape.as_slice())
        .map_err(|_| mismatch())?;
    let b = b
        .view()
        .try_broadcast(out_shape.as_slice())
        .map_err(|_| mismatch())?;
    let data: Vec<f32> = a.iter().zip(b.iter()).map(|(x, y)| op(*x, *y)).collect();
    Ok(Tensor::from_data(&out_shape, data))
}

fn reshape(input: &Tensor<f32>, shape: &[i64]) -> Result<Tensor<f32>, EvalError> {
    let mismatch = || {
        EvalError::ShapeMismatch(format!("cannot reshape {:?} to {:?}", input.shape(), shape))
    };
    let n_inferred = shape.iter().filter(|&&size| size == -1).count();
    if n_inferred > 1 || shape.iter().any(|&size| size < -1) {
        return Err(mismatch());
    }

    let known = shape
        .iter()
        .filter(|&&size| size != -1)
        .try_fold(1usize, |acc, &size| acc.checked_mul(size as usize))
        .ok_or_else(mismatch)?;
    let inferred = if n_inferred == 1 {
        if known == 0 || input.len() % known != 0 {
            return Err(mismatch());
        }
        input.len() / known
    } else {
        known
    };

    let new_shape: Vec<usize> = shape
        .iter()
        .map(|&size| if size == -1 { inferred } else { size as usize })
        .collect();
    if new_shape.iter().product::<usize>() != input.len() {
        return Err(mismatch());
    }
    Ok(Tensor::from_data(&new_shape, input.to_vec()))
}

fn expand(input: &Tensor<f32>, shape: &[i64]) -> Result<Tensor<f32>, EvalError> {
    let mismatch = || {
        EvalError::ShapeMismatch(format!("cannot expand {:?} to {:?}", input.shape(), shape))
    };
    let in_shape = input.shape();
    let offset = shape.len().checked_sub(in_shape.len()).ok_or_else(mismatch)?;

    let out_shape = shape
        .iter()
        .enumerate()
        .map(|(i, &size)| match size {
            -1 => i.checked_sub(offset).map(|j| in_shape[j]),
            size if size >= 0 => Some(size as usize),
            _ => None,
        })
        .collect::<Option<Vec<usize>>>()
        .ok_or_else(mismatch)?;

    let expanded = input
        .view()
        .try_broadcast(out_shape.as_slice())
        .map_err(|_| mismatch())?;
    Ok(Tensor::from_data(&out_shape, expanded.to_vec()))
}

/// Evaluate a call whose inputs are all float constants.
pub fn eval_call(call: &CallNode, graph: &Graph) -> Result<Tensor<f32>, EvalError> {
    match call.target() {
        op @ (OpType::Add | OpType::Sub | OpType::Mul | OpType::Div) => {
            if call.args().len() != 2 {
                return Err(EvalError::Unsupported(op.clone()));
            }
            let a = operand(graph, call, 0)?;
            let b = operand(graph, call, 1)?;
            match op {
                OpType::Add => binary_op(&a, &b, |x, y| x + y),
                OpType::Sub => binary_op(&a, &b, |x, y| x - y),
                OpType::Mul => binary_op(&a, &b, |x, y| x * y),
                _ => binary_op(&a, &b, |x, y| x / y),
            }
        }
        OpType::Reshape => {
            let input = operand(graph, call, 0)?;
            reshape(&input, &shape_arg(call, 1)?)
        }
        OpType::Expand => {
            let input = operand(graph, call, 0)?;
            expand(&input, &shape_arg(call, 1)?)
        }
        op => Err(EvalError::Unsupported(op.clone())),
    }
}

/// Return true if all node inputs of a call are constants with float data.
fn has_constant_inputs(call: &CallNode, graph: &Graph) -> bool {
    let mut all_constant = true;
    for arg in call.args() {
        arg.for_each_node(&mut |id| {
            let is_float = graph
                .get_node(id)
                .and_then(|n| n.as_constant())
                .and_then(|c| c.data())
                .is_some_and(|data| data.as_float().is_some());
            all_constant &= is_float;
        });
    }
    all_constant
}

/// Replace calls whose inputs are all constants with the computed values.
///
/// Calls are visited in execution order, so chains of constant operations
/// are evaluated in a single pass. Calls which cannot be evaluated are left
/// in place. The replaced calls are left in the graph without users, for
/// removal by [`Graph::eliminate_dead_code`].
///
/// Returns the number of replaced calls.
pub fn propagate_constants(graph: &mut Graph) -> Result<usize, GraphError> {
    let mut n_replaced = 0;

    for id in graph.node_ids().to_vec() {
        let Some(call) = graph.get_call(id) else {
            continue;
        };
        if !has_constant_inputs(call, graph) {
            continue;
        }
        let Ok(value) = eval_call(call, graph) else {
            continue;
        };
        let (name, meta) = match graph.get_node(id) {
            Some(node) => (node.name().to_string(), node.meta().clone()),
            None => continue,
        };

        // Shape and type come from the data. Keep other annotations.
        let const_id = replace_with_constant(graph, id, &name, value)?;
        let mut meta = meta;
        meta.shape = None;
        meta.dtype = None;
        graph.update_meta(const_id, &meta)?;
        n_replaced += 1;
    }

    Ok(n_replaced)
}

fn replace_with_constant(
    graph: &mut Graph,
    id: NodeId,
    name: &str,
    value: Tensor<f32>,
) -> Result<NodeId, GraphError> {
    let const_id = graph.inserting_before(id)?.create_constant(name, value)?;
    graph.replace_all_uses_with(id, const_id)?;
    Ok(const_id)
}
