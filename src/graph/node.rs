use std::fmt;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::NodeId;
use crate::dtype::DataType;

/// Represents the size of a dimension of a value in the graph.
#[derive(Clone, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dimension {
    /// A dimension whose size is fixed and known ahead of time.
    Fixed(usize),

    /// A dimension whose size is determined at runtime. The symbol provides
    /// a name to identify when different values share a size.
    Symbolic(String),
}

impl Dimension {
    /// Return the size of this dimension if it is fixed.
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dimension::Fixed(size) => Some(*size),
            Dimension::Symbolic(_) => None,
        }
    }
}

impl From<usize> for Dimension {
    fn from(val: usize) -> Dimension {
        Dimension::Fixed(val)
    }
}

impl From<String> for Dimension {
    fn from(name: String) -> Dimension {
        Dimension::Symbolic(name)
    }
}

impl<'a> From<&'a str> for Dimension {
    fn from(name: &'a str) -> Dimension {
        Dimension::Symbolic(name.into())
    }
}

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(size) => write!(f, "{}", size),
            Self::Symbolic(name) => write!(f, "\"{}\"", name),
        }
    }
}

/// Convert a fixed-size shape into a list of [`Dimension`]s.
pub fn fixed_dims(shape: &[usize]) -> Vec<Dimension> {
    shape.iter().copied().map(Dimension::Fixed).collect()
}

/// Auxiliary annotations attached to a node by earlier analysis passes.
///
/// The shape and element type are the annotations used by optimizations.
/// Other annotations (eg. source locations) are kept in `extra` and carried
/// along when metadata is copied between nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeMeta {
    pub shape: Option<Vec<Dimension>>,
    pub dtype: Option<DataType>,
    pub extra: FxHashMap<String, String>,
}

impl NodeMeta {
    /// Create metadata for a tensor value with a known type and shape.
    pub fn tensor(dtype: DataType, shape: Vec<Dimension>) -> NodeMeta {
        NodeMeta {
            shape: Some(shape),
            dtype: Some(dtype),
            extra: FxHashMap::default(),
        }
    }

    /// Copy all annotations which are set in `other` into `self`, replacing
    /// existing values.
    pub fn update(&mut self, other: &NodeMeta) {
        if let Some(shape) = &other.shape {
            self.shape = Some(shape.clone());
        }
        if let Some(dtype) = other.dtype {
            self.dtype = Some(dtype);
        }
        self.extra
            .extend(other.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Return the number of elements in the value, if the shape is known and
    /// all dimensions are fixed.
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .as_ref()?
            .iter()
            .map(|d| d.fixed())
            .try_fold(1usize, |acc, d| d.and_then(|d| acc.checked_mul(d)))
    }
}

/// Identifies the operation performed by a call node.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum OpType {
    /// N-d convolution. Arguments are `(input, weight, bias, stride, padding,
    /// dilation, transposed, output_padding, groups)`.
    Convolution,
    Add,
    Sub,
    Mul,
    Div,
    /// Arguments are `(input, shape)`. One entry in `shape` may be -1.
    Reshape,
    /// Arguments are `(input, shape)`. -1 entries keep the input's size.
    Expand,
    /// Any operator which optimizations do not need to understand.
    Custom(String),
}

impl OpType {
    /// Return the name of the operator (eg. "Add").
    pub fn name(&self) -> &str {
        match self {
            OpType::Convolution => "Convolution",
            OpType::Add => "Add",
            OpType::Sub => "Sub",
            OpType::Mul => "Mul",
            OpType::Div => "Div",
            OpType::Reshape => "Reshape",
            OpType::Expand => "Expand",
            OpType::Custom(name) => name,
        }
    }

    /// Return true if the operator's two inputs can be swapped without
    /// changing the result.
    pub fn is_commutative(&self) -> bool {
        matches!(self, OpType::Add | OpType::Mul)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An argument of a call node.
///
/// Arguments are either references to other nodes in the graph, or
/// immediate values such as strides and target shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Absent optional argument (eg. a convolution without bias).
    None,
    Node(NodeId),
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<Arg>),
}

impl Arg {
    /// Create a list argument from a sequence of integers.
    pub fn ints<I: IntoIterator<Item = i64>>(values: I) -> Arg {
        Arg::List(values.into_iter().map(Arg::Int).collect())
    }

    /// Return the node this argument refers to, if it is a node reference.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Arg::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(x) => Some(*x),
            _ => None,
        }
    }

    /// Return the value of a scalar number argument as a float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Arg::Int(x) => Some(*x as f64),
            Arg::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(x) => Some(*x),
            _ => None,
        }
    }

    /// Return the values of a list of integers.
    pub fn as_int_list(&self) -> Option<Vec<i64>> {
        match self {
            Arg::List(items) => items.iter().map(|item| item.as_int()).collect(),
            _ => None,
        }
    }

    /// Call `f` with each node referenced by this argument, including
    /// references nested in lists.
    pub fn for_each_node(&self, f: &mut impl FnMut(NodeId)) {
        match self {
            Arg::Node(id) => f(*id),
            Arg::List(items) => {
                for item in items {
                    item.for_each_node(f);
                }
            }
            Arg::None | Arg::Bool(_) | Arg::Int(_) | Arg::Float(_) => {}
        }
    }

    /// Replace references to `old_id` with `new_id`. Returns true if any
    /// reference was replaced.
    fn replace_node(&mut self, old_id: NodeId, new_id: NodeId) -> bool {
        match self {
            Arg::Node(id) if *id == old_id => {
                *id = new_id;
                true
            }
            Arg::List(items) => items
                .iter_mut()
                .fold(false, |replaced, item| item.replace_node(old_id, new_id) || replaced),
            _ => false,
        }
    }
}

impl From<NodeId> for Arg {
    fn from(id: NodeId) -> Arg {
        Arg::Node(id)
    }
}

impl From<Option<NodeId>> for Arg {
    fn from(id: Option<NodeId>) -> Arg {
        id.map(Arg::Node).unwrap_or(Arg::None)
    }
}

impl From<i64> for Arg {
    fn from(val: i64) -> Arg {
        Arg::Int(val)
    }
}

impl From<f64> for Arg {
    fn from(val: f64) -> Arg {
        Arg::Float(val)
    }
}

impl From<bool> for Arg {
    fn from(val: bool) -> Arg {
        Arg::Bool(val)
    }
}

/// Tensor data for a constant node.
#[derive(Clone, Debug, PartialEq)]
pub enum Constant {
    Float(Tensor<f32>),
    Int32(Tensor<i32>),
}

impl Constant {
    pub fn shape(&self) -> &[usize] {
        match self {
            Constant::Float(t) => t.shape(),
            Constant::Int32(t) => t.shape(),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Constant::Float(_) => DataType::Float32,
            Constant::Int32(_) => DataType::Int32,
        }
    }

    /// Return the data as a float tensor, if this is a float constant.
    pub fn as_float(&self) -> Option<&Tensor<f32>> {
        match self {
            Constant::Float(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Tensor<f32>> for Constant {
    fn from(val: Tensor<f32>) -> Constant {
        Constant::Float(val)
    }
}

impl From<Tensor<i32>> for Constant {
    fn from(val: Tensor<i32>) -> Constant {
        Constant::Int32(val)
    }
}

/// A named constant or parameter (eg. trained weights).
///
/// The data may be absent if the graph is being optimized without access to
/// parameter values. In that case the node's metadata still describes the
/// value.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstantNode {
    data: Option<Constant>,
}

impl ConstantNode {
    pub fn new(data: Option<Constant>) -> Self {
        ConstantNode { data }
    }

    pub fn data(&self) -> Option<&Constant> {
        self.data.as_ref()
    }
}

/// An operator application.
#[derive(Clone, Debug, PartialEq)]
pub struct CallNode {
    target: OpType,
    args: Vec<Arg>,
    kwargs: Vec<(String, Arg)>,
}

impl CallNode {
    pub fn new(target: OpType, args: Vec<Arg>, kwargs: Vec<(String, Arg)>) -> Self {
        CallNode {
            target,
            args,
            kwargs,
        }
    }

    pub fn target(&self) -> &OpType {
        &self.target
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Return the positional argument at `index`, or `None` if there are
    /// fewer arguments.
    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }

    pub fn kwargs(&self) -> &[(String, Arg)] {
        &self.kwargs
    }

    /// Look up a keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Arg> {
        self.kwargs
            .iter()
            .find_map(|(key, val)| (key == name).then_some(val))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// A value supplied when the graph is run.
    Input,
    Constant(ConstantNode),
    Call(CallNode),
    /// The values produced by the graph. A graph has at most one output node.
    Output(Vec<Arg>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    name: String,
    kind: NodeKind,
    meta: NodeMeta,
}

impl Node {
    pub(super) fn new(name: String, kind: NodeKind, meta: NodeMeta) -> Self {
        Node { name, kind, meta }
    }

    /// Return the unique name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    pub(super) fn meta_mut(&mut self) -> &mut NodeMeta {
        &mut self.meta
    }

    /// Return the contained call, if this is a call node.
    pub fn as_call(&self) -> Option<&CallNode> {
        match &self.kind {
            NodeKind::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Return the contained constant, if this is a constant node.
    pub fn as_constant(&self) -> Option<&ConstantNode> {
        match &self.kind {
            NodeKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant(_))
    }

    /// Return the operator of a call node.
    pub fn target(&self) -> Option<&OpType> {
        self.as_call().map(|call| call.target())
    }

    /// Return the IDs of nodes used as inputs by this node, in argument
    /// order. A node used by several arguments is listed once per use.
    pub fn input_ids(&self) -> SmallVec<[NodeId; 4]> {
        let mut ids = SmallVec::new();
        let mut push = |id| ids.push(id);
        match &self.kind {
            NodeKind::Call(call) => {
                for arg in call.args.iter().chain(call.kwargs.iter().map(|(_, v)| v)) {
                    arg.for_each_node(&mut push);
                }
            }
            NodeKind::Output(args) => {
                for arg in args {
                    arg.for_each_node(&mut push);
                }
            }
            NodeKind::Input | NodeKind::Constant(_) => {}
        }
        ids
    }

    /// Replace uses of `old_id` in this node's arguments with `new_id`.
    ///
    /// Consumers outside the graph module should use
    /// [`Graph::replace_all_uses_with`](super::Graph::replace_all_uses_with)
    /// instead, which keeps the graph's user lists up to date.
    pub(super) fn replace_input(&mut self, old_id: NodeId, new_id: NodeId) -> bool {
        let mut replaced = false;
        match &mut self.kind {
            NodeKind::Call(call) => {
                let kwargs = call.kwargs.iter_mut().map(|(_, v)| v);
                for arg in call.args.iter_mut().chain(kwargs) {
                    replaced |= arg.replace_node(old_id, new_id);
                }
            }
            NodeKind::Output(args) => {
                for arg in args.iter_mut() {
                    replaced |= arg.replace_node(old_id, new_id);
                }
            }
            NodeKind::Input | NodeKind::Constant(_) => {}
        }
        replaced
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{Arg, CallNode, Constant, Dimension, NodeKind, NodeMeta, OpType};
    use crate::dtype::DataType;
    use crate::graph::NodeId;

    #[test]
    fn test_meta_update() {
        let mut meta = NodeMeta::tensor(DataType::Float32, vec![Dimension::Fixed(4)]);
        meta.extra.insert("stack_trace".into(), "model.py:10".into());

        let mut other = NodeMeta {
            dtype: Some(DataType::Float16),
            ..Default::default()
        };
        other.extra.insert("source_fn".into(), "conv".into());
        meta.update(&other);

        assert_eq!(meta.dtype, Some(DataType::Float16));
        assert_eq!(meta.shape, Some(vec![Dimension::Fixed(4)]));
        assert_eq!(meta.extra.len(), 2);
    }

    #[test]
    fn test_meta_numel() {
        let meta = NodeMeta::tensor(DataType::Float32, vec![2.into(), 3.into()]);
        assert_eq!(meta.numel(), Some(6));

        let meta = NodeMeta::tensor(DataType::Float32, vec!["batch".into(), 3.into()]);
        assert_eq!(meta.numel(), None);

        let meta = NodeMeta::tensor(DataType::Float32, vec![]);
        assert_eq!(meta.numel(), Some(1));
    }

    #[test]
    fn test_arg_helpers() {
        let a = NodeId::from_u32(0);
        let b = NodeId::from_u32(1);

        let mut arg = Arg::List(vec![Arg::Node(a), Arg::Int(3), Arg::Node(a)]);
        let mut seen = Vec::new();
        arg.for_each_node(&mut |id| seen.push(id));
        assert_eq!(seen, [a, a]);

        assert!(arg.replace_node(a, b));
        assert_eq!(arg, Arg::List(vec![Arg::Node(b), Arg::Int(3), Arg::Node(b)]));
        assert!(!arg.replace_node(a, b));

        assert_eq!(Arg::ints([1, -1]).as_int_list(), Some(vec![1, -1]));
        assert_eq!(Arg::List(vec![Arg::Float(1.)]).as_int_list(), None);
        assert_eq!(Arg::from(None::<NodeId>), Arg::None);
    }

    #[test]
    fn test_call_node_kwargs() {
        let call = CallNode::new(
            OpType::Custom("Softmax".into()),
            vec![],
            vec![("dim".into(), Arg::Int(-1))],
        );
        assert_eq!(call.kwarg("dim"), Some(&Arg::Int(-1)));
        assert_eq!(call.kwarg("axis"), None);
        assert!(matches!(NodeKind::Call(call), NodeKind::Call(_)));
    }

    #[test]
    fn test_constant() {
        let c = Constant::from(Tensor::from_data(&[2, 1], vec![1f32, 2.]));
        assert_eq!(c.shape(), &[2, 1]);
        assert_eq!(c.dtype(), DataType::Float32);
        assert!(c.as_float().is_some());

        let c = Constant::from(Tensor::from_data(&[3], vec![1i32, 2, 3]));
        assert_eq!(c.dtype(), DataType::Int32);
        assert!(c.as_float().is_none());
    }
}
