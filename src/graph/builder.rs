//! Tools to simplify building graphs, mainly for use in tests.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

use rten_tensor::Tensor;

use crate::graph::{Arg, Constant, Graph, NodeId, NodeMeta, OpType};
use crate::infer_shapes::infer_node_meta;

enum ExprKind {
    /// Expression representing a graph input.
    Input { name: String, meta: NodeMeta },
    /// Expression representing a constant with known data.
    Constant { name: String, value: Constant },
    /// Expression representing a constant whose value is unavailable.
    Parameter { name: String, meta: NodeMeta },
    /// Expression representing an operator call.
    Call {
        target: OpType,
        args: Vec<ExprArg>,
    },
}

/// An argument of an operator call expression.
#[derive(Clone)]
pub enum ExprArg {
    /// Argument which is the result of another expression.
    Expr(Expr),
    /// Immediate argument value (eg. a stride or shape).
    Value(Arg),
}

impl From<Expr> for ExprArg {
    fn from(expr: Expr) -> ExprArg {
        ExprArg::Expr(expr)
    }
}

impl From<Arg> for ExprArg {
    fn from(arg: Arg) -> ExprArg {
        ExprArg::Value(arg)
    }
}

/// An expression describing a [`Graph`].
///
/// Expressions are constructed using constructor methods and math operators.
/// They are then converted into a graph using [`Expr::build_graph`], which
/// also annotates operator calls with inferred shapes and types.
///
/// The following builds a graph for a convolution followed by a bias add:
///
/// ```
/// use rten_fold::graph::builder::Expr;
/// use rten_fold::graph::{Dimension, NodeMeta};
/// use rten_fold::DataType;
/// use rten_tensor::Tensor;
///
/// let x = Expr::input("x", NodeMeta::tensor(DataType::Float32, vec![Dimension::Fixed(1), Dimension::Fixed(3), Dimension::Fixed(8), Dimension::Fixed(8)]));
/// let w = Expr::constant("weight", Tensor::<f32>::zeros(&[4, 3, 3, 3]));
/// let b = Expr::constant("shift", Tensor::<f32>::zeros(&[4, 1, 1]));
/// let graph = (x.conv(w, None) + b).build_graph();
/// assert_eq!(graph.output_ids().len(), 1);
/// ```
#[derive(Clone)]
pub struct Expr {
    kind: Rc<ExprKind>,
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind.as_ref() {
            ExprKind::Input { name, .. } => write!(f, "Input({})", name),
            ExprKind::Constant { name, .. } => write!(f, "Constant({})", name),
            ExprKind::Parameter { name, .. } => write!(f, "Parameter({})", name),
            ExprKind::Call { target, args } => {
                write!(f, "{}(", target)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match arg {
                        ExprArg::Expr(expr) => write!(f, "{:?}", expr)?,
                        ExprArg::Value(value) => write!(f, "{:?}", value)?,
                    }
                }
                write!(f, ")")
            }
        }
    }
}

impl From<ExprKind> for Expr {
    fn from(kind: ExprKind) -> Expr {
        Expr { kind: kind.into() }
    }
}

/// Parameters for a convolution expression.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvParams {
    pub stride: Vec<i64>,
    pub padding: Vec<i64>,
    pub dilation: Vec<i64>,
    pub transposed: bool,
    pub output_padding: Vec<i64>,
    pub groups: i64,
}

impl Default for ConvParams {
    /// Return parameters for a 2D convolution with unit strides and no
    /// padding.
    fn default() -> Self {
        ConvParams {
            stride: vec![1, 1],
            padding: vec![0, 0],
            dilation: vec![1, 1],
            transposed: false,
            output_padding: vec![0, 0],
            groups: 1,
        }
    }
}

impl Expr {
    /// Create an expression representing a graph input.
    pub fn input(name: &str, meta: NodeMeta) -> Expr {
        Expr::from(ExprKind::Input {
            name: name.to_string(),
            meta,
        })
    }

    /// Create an expression representing a constant value.
    pub fn constant<C: Into<Constant>>(name: &str, value: C) -> Expr {
        Expr::from(ExprKind::Constant {
            name: name.to_string(),
            value: value.into(),
        })
    }

    /// Create an expression representing a constant scalar float.
    pub fn scalar(value: f32) -> Expr {
        Expr::constant("const", Tensor::from_scalar(value))
    }

    /// Create an expression representing a parameter whose type and shape is
    /// known, but whose value is not.
    pub fn parameter(name: &str, meta: NodeMeta) -> Expr {
        Expr::from(ExprKind::Parameter {
            name: name.to_string(),
            meta,
        })
    }

    /// Create an expression which calls an operator.
    pub fn call(target: OpType, args: Vec<ExprArg>) -> Expr {
        Expr::from(ExprKind::Call { target, args })
    }

    /// Create an expression which applies a binary operator to this
    /// expression and `rhs`.
    pub fn binary(&self, target: OpType, rhs: Expr) -> Expr {
        Expr::call(target, vec![self.clone().into(), rhs.into()])
    }

    /// Create an expression which applies a 2D convolution with default
    /// parameters to this expression.
    pub fn conv(&self, weight: Expr, bias: Option<Expr>) -> Expr {
        self.conv_with(weight, bias, ConvParams::default())
    }

    /// Create an expression which applies a convolution to this expression.
    pub fn conv_with(&self, weight: Expr, bias: Option<Expr>, params: ConvParams) -> Expr {
        let bias = bias.map(ExprArg::Expr).unwrap_or(ExprArg::Value(Arg::None));
        Expr::call(
            OpType::Convolution,
            vec![
                self.clone().into(),
                weight.into(),
                bias,
                Arg::ints(params.stride).into(),
                Arg::ints(params.padding).into(),
                Arg::ints(params.dilation).into(),
                Arg::Bool(params.transposed).into(),
                Arg::ints(params.output_padding).into(),
                Arg::Int(params.groups).into(),
            ],
        )
    }

    /// Create an expression which applies a custom unary operator.
    pub fn unary(&self, name: &str) -> Expr {
        Expr::call(OpType::Custom(name.to_string()), vec![self.clone().into()])
    }

    /// Convert this expression into a graph whose output is the result of
    /// `self`.
    pub fn build_graph(self) -> Graph {
        Expr::make_graph([self])
    }

    /// Create a graph with the given outputs.
    pub fn make_graph<O: AsRef<[Expr]>>(outputs: O) -> Graph {
        let mut graph = Graph::new();
        let mut expr_ids = HashMap::new();
        let output_ids: Vec<NodeId> = outputs
            .as_ref()
            .iter()
            .map(|expr| expr.add_to_graph(&mut graph, &mut expr_ids))
            .collect();
        graph
            .set_outputs(&output_ids)
            .expect("output IDs should be valid");
        graph
    }

    fn add_to_graph(&self, graph: &mut Graph, expr_ids: &mut HashMap<ExprRef, NodeId>) -> NodeId {
        if let Some(node_id) = expr_ids.get(&ExprRef(self.clone())) {
            return *node_id;
        }

        let node_id = match self.kind.as_ref() {
            ExprKind::Input { name, meta } => graph.add_input(name, meta.clone()),
            ExprKind::Constant { name, value } => graph.add_constant(name, value.clone()),
            ExprKind::Parameter { name, meta } => graph.add_parameter(name, meta.clone()),
            ExprKind::Call { target, args } => {
                let args: Vec<Arg> = args
                    .iter()
                    .map(|arg| match arg {
                        ExprArg::Expr(expr) => Arg::Node(expr.add_to_graph(graph, expr_ids)),
                        ExprArg::Value(value) => value.clone(),
                    })
                    .collect();
                let id = graph
                    .add_call(target.clone(), args)
                    .expect("call inputs should be in graph");
                if let Some(meta) = infer_node_meta(graph, id) {
                    graph
                        .update_meta(id, &meta)
                        .expect("node should be in graph");
                }
                id
            }
        };
        expr_ids.insert(ExprRef(self.clone()), node_id);

        node_id
    }
}

/// Wrapper around an `Expr` which uses reference-equality.
struct ExprRef(Expr);

impl PartialEq for ExprRef {
    fn eq(&self, other: &ExprRef) -> bool {
        Rc::ptr_eq(&self.0.kind, &other.0.kind)
    }
}

impl Eq for ExprRef {}

impl Hash for ExprRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0.kind).hash(state)
    }
}

macro_rules! impl_binary_op {
    ($op_trait:ident, $op_method:ident, $op_type: ident) => {
        impl $op_trait for Expr {
            type Output = Expr;

            fn $op_method(self, rhs: Expr) -> Expr {
                self.binary(OpType::$op_type, rhs)
            }
        }

        impl $op_trait<f32> for Expr {
            type Output = Expr;

            fn $op_method(self, rhs: f32) -> Expr {
                self.binary(OpType::$op_type, Expr::scalar(rhs))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);
impl_binary_op!(Sub, sub, Sub);

/// Create a [`Dimension`](crate::graph::Dimension) array from a list of
/// symbolic names and fixed sizes.
macro_rules! dims {
    ($($x:expr),* $(,)?) => {
        vec![$($crate::graph::Dimension::from($x)),*]
    };
}
#[allow(unused_imports)]
pub(crate) use dims;

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::Expr;
    use crate::dtype::DataType;
    use crate::graph::{Arg, NodeKind, NodeMeta, OpType};

    #[test]
    fn test_build_graph() {
        // Re-use of the same expression (`x_sqr`) should produce one node.
        let x = Expr::input("x", NodeMeta::tensor(DataType::Float32, dims![2, 3]));
        let x_sqr = x.clone() * x.clone();
        let expr = x_sqr.clone() * x_sqr.clone() + 2.0;
        let graph = expr.build_graph();
        graph.validate().unwrap();

        // Input, Mul, Mul, constant, Add and output.
        assert_eq!(graph.len(), 6);
        assert_eq!(graph.input_ids().len(), 1);

        let output = graph.output_ids()[0];
        let add = graph.get_node(output).unwrap();
        assert_eq!(add.target(), Some(&OpType::Add));
        assert_eq!(add.meta().shape, Some(dims![2, 3]));
        assert_eq!(add.meta().dtype, Some(DataType::Float32));
    }

    #[test]
    fn test_build_conv_graph() {
        let x = Expr::input("x", NodeMeta::tensor(DataType::Float32, dims!["batch", 3, 10, 10]));
        let w = Expr::constant("weight", Tensor::<f32>::zeros(&[8, 3, 3, 3]));
        let graph = x.conv(w, None).build_graph();

        let conv_id = graph.output_ids()[0];
        let conv = graph.get_call(conv_id).unwrap();
        assert_eq!(conv.target(), &OpType::Convolution);
        assert_eq!(conv.args().len(), 9);
        assert_eq!(conv.arg(2), Some(&Arg::None));

        let weight_id = conv.arg(1).and_then(|a| a.as_node()).unwrap();
        assert!(matches!(
            graph.get_node(weight_id).unwrap().kind(),
            NodeKind::Constant(_)
        ));
        assert_eq!(
            graph.get_node(conv_id).unwrap().meta().shape,
            Some(dims!["batch", 8, 8, 8])
        );
    }
}
