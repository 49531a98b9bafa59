use std::cell::RefCell;
use std::fmt;

use rustc_hash::FxHashSet;

use crate::graph::{Graph, NodeId};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DiagnosticLevel {
    /// Don't show any diagnostics.
    #[default]
    Off,
    /// Report only unsuccessful optimizations.
    Warn,
    /// Report all optimizations.
    Info,
}

impl DiagnosticLevel {
    /// Parse a level name ("off", "warn" or "info").
    pub fn from_name(name: &str) -> Option<DiagnosticLevel> {
        match name {
            "off" => Some(DiagnosticLevel::Off),
            "warn" => Some(DiagnosticLevel::Warn),
            "info" => Some(DiagnosticLevel::Info),
            _ => None,
        }
    }
}

/// Diagnostic reporter for graph optimizations.
///
/// Messages are printed to stdout, prefixed by the level and name of the node
/// they relate to (eg. `W| add_1: other operand is not a constant`), and
/// also recorded so they can be inspected with [`messages`](Self::messages).
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Nodes against which diagnostics have been reported at the `Warn` level
    /// or higher.
    warned_nodes: RefCell<FxHashSet<NodeId>>,
    messages: RefCell<Vec<String>>,
    level: DiagnosticLevel,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reporter which logs messages at or above `level`.
    pub fn with_level(level: DiagnosticLevel) -> Self {
        let mut diag = Self::new();
        diag.set_level(level);
        diag
    }

    /// Enable reporting of all messages at or above a given level.
    pub fn set_level(&mut self, level: DiagnosticLevel) {
        self.level = level;
    }

    /// Return true if diagnostic messages are enabled at a given level.
    pub fn enabled(&self, level: DiagnosticLevel) -> bool {
        self.level >= level
    }

    /// Log a diagnostic message for a given node at the [`Info`](DiagnosticLevel::Info) level.
    pub fn info(&self, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Info {
            return;
        }
        self.log(DiagnosticLevel::Info, graph, node, message);
    }

    /// Log a diagnostic message for a given node at the [`Warn`](DiagnosticLevel::Warn) level.
    ///
    /// Only the first warning for each node is reported. Patterns are matched
    /// repeatedly until a fixed point is reached, so the same rejection would
    /// otherwise be reported once per scan.
    pub fn warn(&self, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        if self.level < DiagnosticLevel::Warn || self.warned_nodes.borrow().contains(&node) {
            return;
        }
        self.warned_nodes.borrow_mut().insert(node);
        self.log(DiagnosticLevel::Warn, graph, node, message);
    }

    /// Return the messages which have been reported so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    fn log(&self, level: DiagnosticLevel, graph: &Graph, node: NodeId, message: fmt::Arguments<'_>) {
        let level_char = match level {
            DiagnosticLevel::Warn => 'W',
            DiagnosticLevel::Info => 'I',
            DiagnosticLevel::Off => return,
        };
        let line = format!("{}| {}: {}", level_char, node_name(graph, node), message);
        println!("{}", line);
        self.messages.borrow_mut().push(line);
    }
}

fn node_name(g: &Graph, id: NodeId) -> &str {
    g.get_node(id).map(|n| n.name()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{DiagnosticLevel, Diagnostics};
    use crate::graph::{Graph, NodeMeta};

    #[test]
    fn test_diagnostics() {
        let mut graph = Graph::new();
        let x = graph.add_input("x", NodeMeta::default());
        let y = graph.add_input("y", NodeMeta::default());

        let diag = Diagnostics::with_level(DiagnosticLevel::Warn);
        diag.info(&graph, x, format_args!("fused"));
        diag.warn(&graph, x, format_args!("not fused"));
        diag.warn(&graph, x, format_args!("not fused again"));
        diag.warn(&graph, y, format_args!("not fused"));

        assert_eq!(diag.messages(), ["W| x: not fused", "W| y: not fused"]);
        assert!(diag.enabled(DiagnosticLevel::Warn));
        assert!(!diag.enabled(DiagnosticLevel::Info));

        let diag = Diagnostics::new();
        diag.warn(&graph, x, format_args!("not fused"));
        assert!(diag.messages().is_empty());
    }

    #[test]
    fn test_level_from_name() {
        assert_eq!(DiagnosticLevel::from_name("info"), Some(DiagnosticLevel::Info));
        assert_eq!(DiagnosticLevel::from_name("off"), Some(DiagnosticLevel::Off));
        assert_eq!(DiagnosticLevel::from_name("verbose"), None);
    }
}
