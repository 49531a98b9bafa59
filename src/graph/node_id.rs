use std::num::NonZero;

/// ID of a node in a [`Graph`](super::Graph).
///
/// IDs are allocated sequentially when nodes are added and are never re-used
/// after a node is erased, so an ID held across a rewrite either refers to
/// the same node or to no node.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a node ID from a slot index.
    ///
    /// Panics if the value is `u32::MAX`.
    pub fn from_u32(value: u32) -> NodeId {
        // Store `value + 1` so that `Option<NodeId>` is the same size as
        // `NodeId`.
        let id = value
            .checked_add(1)
            .and_then(NonZero::new)
            .expect("node ID overflow");
        NodeId(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_u32())
    }
}
