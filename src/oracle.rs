//! Shape and type queries used by legality checks.

use crate::dtype::{promote_types, DataType};
use crate::graph::{Dimension, Graph, NodeId};

/// Answers questions about the static type and shape of values in a graph.
///
/// Optimizations use an oracle rather than reading node metadata directly,
/// so that the source of type information can be replaced (eg. by a
/// compiler's own tensor metadata).
pub trait ShapeOracle {
    /// Return the element type of a node's value, if known.
    fn dtype(&self, graph: &Graph, node: NodeId) -> Option<DataType>;

    /// Return the shape of a node's value, if known.
    fn shape(&self, graph: &Graph, node: NodeId) -> Option<Vec<Dimension>>;

    /// Return the type of the result of combining values of type `a` and `b`
    /// with an elementwise operator.
    fn promote_types(&self, a: DataType, b: DataType) -> DataType {
        promote_types(a, b)
    }
}

/// Oracle which reads the shape and type annotations in node metadata.
#[derive(Copy, Clone, Debug, Default)]
pub struct MetaOracle;

impl ShapeOracle for MetaOracle {
    fn dtype(&self, graph: &Graph, node: NodeId) -> Option<DataType> {
        graph.get_node(node)?.meta().dtype
    }

    fn shape(&self, graph: &Graph, node: NodeId) -> Option<Vec<Dimension>> {
        graph.get_node(node)?.meta().shape.clone()
    }
}

#[cfg(test)]
mod tests {
    use rten_tensor::Tensor;

    use super::{MetaOracle, ShapeOracle};
    use crate::dtype::DataType;
    use crate::graph::builder::dims;
    use crate::graph::{Graph, NodeMeta};

    #[test]
    fn test_meta_oracle() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", NodeMeta::tensor(DataType::Float16, dims!["batch", 4]));
        let w = graph.add_constant("w", Tensor::<f32>::zeros(&[4, 2]));
        let p = graph.add_parameter("p", NodeMeta::default());

        let oracle = MetaOracle;
        assert_eq!(oracle.dtype(&graph, x), Some(DataType::Float16));
        assert_eq!(oracle.shape(&graph, x), Some(dims!["batch", 4]));
        assert_eq!(oracle.dtype(&graph, w), Some(DataType::Float32));
        assert_eq!(oracle.shape(&graph, w), Some(dims![4, 2]));
        assert_eq!(oracle.dtype(&graph, p), None);
        assert_eq!(
            oracle.promote_types(DataType::Float16, DataType::Float32),
            DataType::Float32
        );
    }
}
