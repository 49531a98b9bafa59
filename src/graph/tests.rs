use std::error::Error;

use rten_tensor::Tensor;

use super::builder::{dims, Expr};
use super::{Arg, Graph, GraphError, NodeId, NodeKind, NodeMeta, OpType};
use crate::dtype::DataType;

fn float_input(graph: &mut Graph, name: &str) -> NodeId {
    graph.add_input(name, NodeMeta::tensor(DataType::Float32, dims![2, 2]))
}

#[test]
fn test_add_nodes() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let c = graph.add_constant("c", Tensor::from_scalar(2.0f32));
    let add = graph.add_call(OpType::Add, vec![x.into(), c.into()])?;
    let output = graph.set_outputs(&[add])?;

    assert_eq!(graph.node_ids(), &[x, c, add, output]);
    assert_eq!(graph.users(x), &[add]);
    assert_eq!(graph.users(add), &[output]);
    assert_eq!(graph.output_ids(), [add]);
    assert_eq!(graph.input_ids(), [x]);

    // Calls added after the output node is created are placed before it.
    let mul = graph.add_call(OpType::Mul, vec![add.into(), add.into()])?;
    assert_eq!(graph.node_ids(), &[x, c, add, mul, output]);
    assert_eq!(graph.users(add), &[output, mul]);
    graph.validate()?;

    Ok(())
}

#[test]
fn test_add_call_with_missing_input() {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let y = float_input(&mut graph, "y");
    graph.erase_node(y).unwrap();

    let result = graph.add_call(OpType::Add, vec![x.into(), Arg::List(vec![y.into()])]);
    assert!(matches!(
        result,
        Err(GraphError::DanglingEdge { input, .. }) if input == y
    ));
}

#[test]
fn test_unique_names() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let a = graph.add_call(OpType::Add, vec![x.into(), x.into()])?;
    let b = graph.add_call(OpType::Add, vec![a.into(), x.into()])?;
    let c = graph.add_constant("add", Tensor::from_scalar(1.0f32));

    let name = |id| graph.get_node(id).map(|n| n.name().to_string());
    assert_eq!(name(a).as_deref(), Some("add"));
    assert_eq!(name(b).as_deref(), Some("add_1"));
    assert_eq!(name(c).as_deref(), Some("add_2"));
    assert_eq!(graph.find_node("add_1"), Some(b));

    Ok(())
}

#[test]
fn test_erase_node() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let relu = graph.add_call(OpType::Custom("Relu".into()), vec![x.into()])?;
    graph.set_outputs(&[relu])?;

    assert_eq!(
        graph.erase_node(x).err(),
        Some(GraphError::NodeHasUsers { node: x, users: 1 })
    );

    let unused = graph.add_call(OpType::Mul, vec![x.into(), Arg::Float(2.)])?;
    let node = graph.erase_node(unused)?;
    assert_eq!(node.target(), Some(&OpType::Mul));
    assert!(!graph.contains(unused));
    assert_eq!(graph.users(x), &[relu]);
    assert_eq!(graph.erase_node(unused).err(), Some(GraphError::InvalidNodeId(unused)));

    // IDs of erased nodes are not re-used.
    let next = graph.add_call(OpType::Mul, vec![x.into(), Arg::Float(3.)])?;
    assert_ne!(next, unused);
    graph.validate()?;

    Ok(())
}

#[test]
fn test_replace_all_uses_with() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let a = graph.add_call(OpType::Mul, vec![x.into(), Arg::Float(2.)])?;
    let b = graph.add_call(OpType::Add, vec![a.into(), a.into()])?;
    graph.set_outputs(&[a, b])?;

    // Replace `a` with a node that itself uses `a`.
    let c = graph.add_call(OpType::Sub, vec![a.into(), Arg::Float(1.)])?;
    let n_replaced = graph.replace_all_uses_with(a, c)?;
    assert_eq!(n_replaced, 2);

    assert_eq!(graph.output_ids(), [c, b]);
    let b_call = graph.get_call(b).ok_or("not a call")?;
    assert_eq!(b_call.args(), &[Arg::Node(c), Arg::Node(c)]);
    assert_eq!(graph.users(a), &[c]);

    // `c` was added after `b`, so `b` now uses a later node.
    assert!(matches!(
        graph.validate(),
        Err(GraphError::OutOfOrder { node, input }) if node == b && input == c
    ));

    Ok(())
}

#[test]
fn test_inserting_before() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let relu = graph.add_call(OpType::Custom("Relu".into()), vec![x.into()])?;
    let output = graph.set_outputs(&[relu])?;

    let mut inserter = graph.inserting_before(relu)?;
    let c = inserter.create_constant("two", Tensor::from_scalar(2.0f32))?;
    let mul = inserter.create_node(OpType::Mul, vec![x.into(), c.into()])?;

    // Nodes that come after the insertion point cannot be used.
    let err = inserter.create_node(OpType::Add, vec![relu.into(), x.into()]);
    assert!(matches!(err, Err(GraphError::OutOfOrder { input, .. }) if input == relu));

    assert_eq!(graph.node_ids(), &[x, c, mul, relu, output]);
    graph.validate()?;

    let missing = NodeId::from_u32(100);
    assert!(matches!(
        graph.inserting_before(missing),
        Err(GraphError::InvalidNodeId(id)) if id == missing
    ));

    Ok(())
}

#[test]
fn test_eliminate_dead_code() -> Result<(), Box<dyn Error>> {
    let x = Expr::input("x", NodeMeta::tensor(DataType::Float32, dims![4]));
    let dead = x.clone() * 3.0;
    let live = x.clone() + 1.0;
    let mut graph = Expr::make_graph([live, dead]);
    let output = graph.output_node().ok_or("no output")?;

    // Drop the second output, leaving `x * 3.0` and its constant unused.
    let live_id = graph.output_ids()[0];
    graph.set_outputs(&[live_id])?;
    let n_before = graph.len();
    assert_eq!(graph.eliminate_dead_code(), 2);
    assert_eq!(graph.len(), n_before - 2);

    let kinds: Vec<_> = graph.iter().map(|(_, node)| node.kind().clone()).collect();
    assert!(matches!(kinds[0], NodeKind::Input));
    assert!(graph.contains(output));

    // Inputs are kept even if unused.
    graph.set_outputs(&[])?;
    graph.eliminate_dead_code();
    assert_eq!(graph.node_ids(), &[graph.input_ids()[0], output]);
    graph.validate()?;

    Ok(())
}

#[test]
fn test_validate() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = float_input(&mut graph, "x");
    let relu = graph.add_call(OpType::Custom("Relu".into()), vec![x.into()])?;
    graph.set_outputs(&[relu])?;
    graph.validate()?;

    let mut missing_user = graph.clone();
    missing_user.users.remove(&x);
    assert_eq!(
        missing_user.validate(),
        Err(GraphError::InconsistentUsers(x))
    );

    let mut extra_user = graph.clone();
    extra_user.add_user(relu, x);
    assert_eq!(extra_user.validate(), Err(GraphError::InconsistentUsers(relu)));

    let mut misplaced_output = graph.clone();
    let output = misplaced_output.output_node().ok_or("no output")?;
    misplaced_output.order.retain(|&id| id != output);
    misplaced_output.order.insert(0, output);
    assert!(misplaced_output.validate().is_err());

    Ok(())
}

#[test]
fn test_update_meta() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = graph.add_input("x", NodeMeta::default());

    let mut meta = NodeMeta::tensor(DataType::Float16, dims!["batch", 3]);
    meta.extra.insert("source".into(), "x".into());
    graph.update_meta(x, &meta)?;
    assert_eq!(graph.get_node(x).map(|n| n.meta()), Some(&meta));

    let missing = NodeId::from_u32(10);
    assert_eq!(
        graph.update_meta(missing, &meta),
        Err(GraphError::InvalidNodeId(missing))
    );

    Ok(())
}
