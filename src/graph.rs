use std::error::Error;
use std::fmt;

// The std HashMap/HashSet provide DOS resistance. In this module hash keys are
// mostly `NodeId`s which we allocate ourselves, so this is not a concern.
// Instead we want faster hashing.
use rustc_hash::{FxHashMap, FxHashSet};

pub mod builder;
mod node;
mod node_id;

#[cfg(test)]
mod tests;

pub use node::{
    fixed_dims, Arg, CallNode, Constant, ConstantNode, Dimension, Node, NodeKind, NodeMeta,
    OpType,
};
pub use node_id::NodeId;

/// Errors that occur when querying or modifying a [`Graph`].
#[derive(Clone, Debug, PartialEq)]
pub enum GraphError {
    /// A node ID does not refer to a node in the graph.
    InvalidNodeId(NodeId),

    /// A node could not be erased because other nodes still use it.
    NodeHasUsers { node: NodeId, users: usize },

    /// A node refers to an input that is not in the graph.
    DanglingEdge { node: NodeId, input: NodeId },

    /// A node refers to an input that does not come before it in the graph's
    /// execution order.
    OutOfOrder { node: NodeId, input: NodeId },

    /// The user list of a node does not match the edges of the graph.
    InconsistentUsers(NodeId),

    /// The output node is not the last node, or there are several of them.
    MisplacedOutput(NodeId),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::InvalidNodeId(id) => write!(f, "node {} not found", id),
            GraphError::NodeHasUsers { node, users } => {
                write!(f, "node {} still has {} users", node, users)
            }
            GraphError::DanglingEdge { node, input } => {
                write!(f, "node {} refers to missing input {}", node, input)
            }
            GraphError::OutOfOrder { node, input } => {
                write!(f, "node {} uses input {} before it is defined", node, input)
            }
            GraphError::InconsistentUsers(id) => {
                write!(f, "users of node {} do not match graph edges", id)
            }
            GraphError::MisplacedOutput(id) => write!(f, "output node {} is misplaced", id),
        }
    }
}

impl Error for GraphError {}

/// A dataflow graph of tensor operations.
///
/// Graphs consist of inputs, constants (eg. weights), calls to operators and
/// a single output node. Nodes are kept in an order where every node comes
/// after the nodes it uses, which is also the order in which the graph is
/// executed.
///
/// Each node has an ID which is stable for the lifetime of the graph, and a
/// unique name which is used in debug messages.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    /// Node storage, indexed by ID. Erased nodes leave a `None` slot so that
    /// IDs are not re-used.
    nodes: Vec<Option<Node>>,

    /// IDs of live nodes in execution order.
    order: Vec<NodeId>,

    /// Map of node ID to IDs of nodes which use it as an input.
    users: FxHashMap<NodeId, Vec<NodeId>>,

    /// Names which have been assigned to nodes.
    used_names: FxHashSet<String>,

    output: Option<NodeId>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Add a graph input.
    pub fn add_input(&mut self, name: &str, meta: NodeMeta) -> NodeId {
        self.push_node(name, NodeKind::Input, meta)
    }

    /// Add a constant whose value is known.
    ///
    /// The node's shape and type metadata is derived from the data.
    pub fn add_constant<C: Into<Constant>>(&mut self, name: &str, value: C) -> NodeId {
        let value = value.into();
        let meta = NodeMeta::tensor(value.dtype(), fixed_dims(value.shape()));
        self.push_node(name, NodeKind::Constant(ConstantNode::new(Some(value))), meta)
    }

    /// Add a constant parameter whose value is not available, but whose type
    /// and shape is described by `meta`.
    pub fn add_parameter(&mut self, name: &str, meta: NodeMeta) -> NodeId {
        self.push_node(name, NodeKind::Constant(ConstantNode::new(None)), meta)
    }

    /// Add a call to an operator at the end of the graph (but before the
    /// output node).
    ///
    /// All nodes referenced by `args` must already be in the graph.
    pub fn add_call(&mut self, target: OpType, args: Vec<Arg>) -> Result<NodeId, GraphError> {
        self.add_call_with_kwargs(target, args, Vec::new())
    }

    /// Variant of [`add_call`](Graph::add_call) which also takes keyword
    /// arguments.
    pub fn add_call_with_kwargs(
        &mut self,
        target: OpType,
        args: Vec<Arg>,
        kwargs: Vec<(String, Arg)>,
    ) -> Result<NodeId, GraphError> {
        let pos = self.output.map(|_| self.order.len() - 1).unwrap_or(self.order.len());
        self.insert_call(pos, target, args, kwargs)
    }

    /// Set the values returned by the graph.
    ///
    /// This creates the output node if it does not exist, or replaces its
    /// arguments otherwise. Returns the ID of the output node.
    pub fn set_outputs(&mut self, values: &[NodeId]) -> Result<NodeId, GraphError> {
        for &id in values {
            if !self.contains(id) {
                return Err(GraphError::InvalidNodeId(id));
            }
        }
        let args = values.iter().copied().map(Arg::Node).collect();

        if let Some(output_id) = self.output {
            for input in self.node(output_id).input_ids() {
                self.remove_user(input, output_id);
            }
            if let Some(node) = self.nodes[output_id.as_usize()].as_mut() {
                *node = Node::new(
                    node.name().to_string(),
                    NodeKind::Output(args),
                    node.meta().clone(),
                );
            }
            self.add_edges(output_id);
            Ok(output_id)
        } else {
            let id = self.push_node("output", NodeKind::Output(args), NodeMeta::default());
            self.output = Some(id);
            Ok(id)
        }
    }

    /// Return the ID of the output node, if the graph has one.
    pub fn output_node(&self) -> Option<NodeId> {
        self.output
    }

    /// Return the IDs of the values returned by the graph.
    pub fn output_ids(&self) -> Vec<NodeId> {
        self.output
            .map(|id| self.node(id).input_ids().into_vec())
            .unwrap_or_default()
    }

    /// Return the IDs of graph inputs, in execution order.
    pub fn input_ids(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, node)| matches!(node.kind(), NodeKind::Input))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize()).and_then(|n| n.as_ref())
    }

    /// Return the call details of a node, if it is a call node.
    pub fn get_call(&self, id: NodeId) -> Option<&CallNode> {
        self.get_node(id).and_then(|n| n.as_call())
    }

    /// Return true if a node with the given ID is in the graph.
    pub fn contains(&self, id: NodeId) -> bool {
        self.get_node(id).is_some()
    }

    /// Find a node by name.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.iter()
            .find_map(|(id, node)| (node.name() == name).then_some(id))
    }

    /// Iterate over nodes and their IDs in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.order.iter().map(|&id| (id, self.node(id)))
    }

    /// Return IDs of nodes in execution order.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.order
    }

    /// Return the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Return the nodes which use `id` as an input.
    pub fn users(&self, id: NodeId) -> &[NodeId] {
        self.users.get(&id).map(|u| u.as_slice()).unwrap_or(&[])
    }

    /// Merge `meta` into the metadata of a node.
    ///
    /// See [`NodeMeta::update`].
    pub fn update_meta(&mut self, id: NodeId, meta: &NodeMeta) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(id.as_usize())
            .and_then(|n| n.as_mut())
            .ok_or(GraphError::InvalidNodeId(id))?;
        node.meta_mut().update(meta);
        Ok(())
    }

    /// Return an [`Inserter`] which adds new nodes immediately before
    /// `anchor` in execution order.
    pub fn inserting_before(&mut self, anchor: NodeId) -> Result<Inserter<'_>, GraphError> {
        if !self.contains(anchor) {
            return Err(GraphError::InvalidNodeId(anchor));
        }
        Ok(Inserter {
            graph: self,
            anchor,
        })
    }

    /// Remove a node from the graph.
    ///
    /// Fails if the node is still used by other nodes. Returns the removed
    /// node.
    pub fn erase_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        if !self.contains(id) {
            return Err(GraphError::InvalidNodeId(id));
        }
        let users = self.users(id).len();
        if users > 0 {
            return Err(GraphError::NodeHasUsers { node: id, users });
        }

        for input in self.node(id).input_ids() {
            self.remove_user(input, id);
        }
        self.users.remove(&id);
        self.order.retain(|&node_id| node_id != id);
        if self.output == Some(id) {
            self.output = None;
        }

        // Slot is left empty so that the ID is not re-used.
        self.nodes[id.as_usize()]
            .take()
            .ok_or(GraphError::InvalidNodeId(id))
    }

    /// Replace all uses of `old_id` with `new_id`, including uses by the
    /// output node.
    ///
    /// Uses by `new_id` itself are left unchanged, since replacing them
    /// would create a cycle. Returns the number of updated nodes.
    pub fn replace_all_uses_with(
        &mut self,
        old_id: NodeId,
        new_id: NodeId,
    ) -> Result<usize, GraphError> {
        for id in [old_id, new_id] {
            if !self.contains(id) {
                return Err(GraphError::InvalidNodeId(id));
            }
        }

        let old_users = self.users.remove(&old_id).unwrap_or_default();
        let mut kept = Vec::new();
        let mut n_replaced = 0;

        for user in old_users {
            if user == new_id {
                kept.push(user);
                continue;
            }
            if let Some(node) = self.nodes[user.as_usize()].as_mut() {
                node.replace_input(old_id, new_id);
            }
            self.add_user(new_id, user);
            n_replaced += 1;
        }

        if !kept.is_empty() {
            self.users.insert(old_id, kept);
        }
        Ok(n_replaced)
    }

    /// Remove call and constant nodes whose values are not used.
    ///
    /// Returns the number of removed nodes.
    pub fn eliminate_dead_code(&mut self) -> usize {
        let mut removed = 0;

        // Visit nodes in reverse order so that erasing a node can make its
        // inputs dead before they are visited.
        for id in self.order.clone().into_iter().rev() {
            let removable = matches!(
                self.node(id).kind(),
                NodeKind::Call(_) | NodeKind::Constant(_)
            );
            if removable && self.users(id).is_empty() && self.erase_node(id).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Check the structural invariants of the graph.
    ///
    /// These are that every edge refers to a node which is in the graph and
    /// comes earlier in execution order (so the graph is acyclic), that user
    /// lists match the edges and that the output node, if any, is last.
    pub fn validate(&self) -> Result<(), GraphError> {
        let positions: FxHashMap<NodeId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos))
            .collect();

        for (pos, &id) in self.order.iter().enumerate() {
            let node = self.get_node(id).ok_or(GraphError::InvalidNodeId(id))?;
            for input in node.input_ids() {
                match positions.get(&input) {
                    None => return Err(GraphError::DanglingEdge { node: id, input }),
                    Some(&input_pos) if input_pos >= pos => {
                        return Err(GraphError::OutOfOrder { node: id, input })
                    }
                    Some(_) => {}
                }
                if !self.users(input).contains(&id) {
                    return Err(GraphError::InconsistentUsers(input));
                }
            }

            if matches!(node.kind(), NodeKind::Output(_))
                && (self.output != Some(id) || pos + 1 != self.order.len())
            {
                return Err(GraphError::MisplacedOutput(id));
            }
        }

        for (&id, users) in &self.users {
            for user in users {
                let uses_id = self
                    .get_node(*user)
                    .is_some_and(|node| node.input_ids().contains(&id));
                if !uses_id {
                    return Err(GraphError::InconsistentUsers(id));
                }
            }
        }

        Ok(())
    }

    /// Return the node with a given ID.
    ///
    /// Panics if the ID is invalid. This is used internally for IDs which
    /// come from the graph's own data structures.
    fn node(&self, id: NodeId) -> &Node {
        self.get_node(id).expect("node ID should be valid")
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&node_id| node_id == id)
    }

    fn push_node(&mut self, name: &str, kind: NodeKind, meta: NodeMeta) -> NodeId {
        let pos = match (&kind, self.output) {
            (NodeKind::Output(_), _) | (_, None) => self.order.len(),
            (_, Some(_)) => self.order.len() - 1,
        };
        self.insert_node(pos, name, kind, meta)
    }

    /// Add a call node at position `pos` in the execution order, after
    /// checking that all of its inputs come earlier.
    fn insert_call(
        &mut self,
        pos: usize,
        target: OpType,
        args: Vec<Arg>,
        kwargs: Vec<(String, Arg)>,
    ) -> Result<NodeId, GraphError> {
        let name = target.name().to_lowercase();
        let call = CallNode::new(target, args, kwargs);

        // ID that the node will be assigned, for error reporting.
        let next_id = NodeId::from_u32(self.nodes.len() as u32);

        for arg in call.args().iter().chain(call.kwargs().iter().map(|(_, v)| v)) {
            let mut result = Ok(());
            arg.for_each_node(&mut |input| {
                if result.is_err() {
                    return;
                }
                result = match self.position(input) {
                    None => Err(GraphError::DanglingEdge {
                        node: next_id,
                        input,
                    }),
                    Some(input_pos) if input_pos >= pos => Err(GraphError::OutOfOrder {
                        node: next_id,
                        input,
                    }),
                    Some(_) => Ok(()),
                };
            });
            result?;
        }

        Ok(self.insert_node(pos, &name, NodeKind::Call(call), NodeMeta::default()))
    }

    fn insert_node(&mut self, pos: usize, name: &str, kind: NodeKind, meta: NodeMeta) -> NodeId {
        let id = NodeId::from_u32(self.nodes.len() as u32);
        let name = self.unique_name(name);
        self.nodes.push(Some(Node::new(name, kind, meta)));
        self.order.insert(pos, id);
        self.add_edges(id);
        id
    }

    /// Register `id` as a user of each of its inputs.
    fn add_edges(&mut self, id: NodeId) {
        for input in self.node(id).input_ids() {
            self.add_user(input, id);
        }
    }

    fn add_user(&mut self, id: NodeId, user: NodeId) {
        let users = self.users.entry(id).or_default();
        if !users.contains(&user) {
            users.push(user);
        }
    }

    fn remove_user(&mut self, id: NodeId, user: NodeId) {
        if let Some(users) = self.users.get_mut(&id) {
            users.retain(|&u| u != user);
            if users.is_empty() {
                self.users.remove(&id);
            }
        }
    }

    /// Generate a name which is not used by any other node, by appending a
    /// numeric suffix to `prefix` if needed.
    fn unique_name(&mut self, prefix: &str) -> String {
        let mut name = prefix.to_string();
        let mut suffix = 0;
        while self.used_names.contains(&name) {
            suffix += 1;
            name = format!("{}_{}", prefix, suffix);
        }
        self.used_names.insert(name.clone());
        name
    }
}

/// Adds nodes to a graph at a fixed insertion point.
///
/// Created with [`Graph::inserting_before`]. Each node is inserted
/// immediately before the anchor node, so nodes appear in the order they were
/// created and all come before the anchor.
pub struct Inserter<'a> {
    graph: &'a mut Graph,
    anchor: NodeId,
}

impl Inserter<'_> {
    /// Create a call node before the anchor.
    ///
    /// All nodes referenced by `args` must come before the anchor.
    pub fn create_node(&mut self, target: OpType, args: Vec<Arg>) -> Result<NodeId, GraphError> {
        self.create_node_with_kwargs(target, args, Vec::new())
    }

    /// Variant of [`create_node`](Inserter::create_node) which also takes
    /// keyword arguments.
    pub fn create_node_with_kwargs(
        &mut self,
        target: OpType,
        args: Vec<Arg>,
        kwargs: Vec<(String, Arg)>,
    ) -> Result<NodeId, GraphError> {
        let pos = self
            .graph
            .position(self.anchor)
            .ok_or(GraphError::InvalidNodeId(self.anchor))?;
        self.graph.insert_call(pos, target, args, kwargs)
    }

    /// Create a constant before the anchor.
    pub fn create_constant<C: Into<Constant>>(
        &mut self,
        name: &str,
        value: C,
    ) -> Result<NodeId, GraphError> {
        let pos = self
            .graph
            .position(self.anchor)
            .ok_or(GraphError::InvalidNodeId(self.anchor))?;
        let value = value.into();
        let meta = NodeMeta::tensor(value.dtype(), fixed_dims(value.shape()));
        Ok(self.graph.insert_node(
            pos,
            name,
            NodeKind::Constant(ConstantNode::new(Some(value))),
            meta,
        ))
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut *self.graph
    }
}
