use std::ops::{Add, Div, Mul, Sub};

use smallvec::SmallVec;

use crate::graph::{Arg, Graph, NodeId, NodeKind, OpType};

/// Tracks an association between named symbols (variables) in a pattern and
/// the argument values they have been resolved to, plus the call nodes
/// matched so far.
#[derive(Clone, Debug, Default)]
struct SymbolMap {
    // Map of `(name, value)` for resolved symbols. This is modified only by
    // extending and truncating it.
    symbols: SmallVec<[(&'static str, Arg); 4]>,

    // Call nodes matched by call patterns, in the order they were matched.
    nodes: SmallVec<[NodeId; 4]>,

    // Stack of checkpoints. Each is the length of `symbols` and `nodes` at
    // the time of the checkpoint.
    checkpoints: Vec<(usize, usize)>,
}

impl SymbolMap {
    /// Save the current state of the map.
    ///
    /// This is useful if we need to backtrack during pattern matching.
    fn checkpoint(&mut self) {
        self.checkpoints.push((self.symbols.len(), self.nodes.len()));
    }

    /// Discard any new symbols and nodes recorded since the last call to
    /// `checkpoint`.
    fn revert(&mut self) {
        if let Some((n_symbols, n_nodes)) = self.checkpoints.pop() {
            self.symbols.truncate(n_symbols);
            self.nodes.truncate(n_nodes);
        }
    }

    /// Discard the last checkpoint, keeping changes made since.
    fn commit(&mut self) {
        self.checkpoints.pop();
    }

    /// Add a new symbol-value association.
    fn add(&mut self, name: &'static str, value: Arg) {
        self.symbols.push((name, value));
    }

    /// Find the value that a symbol has been resolved to.
    fn find(&self, name: &str) -> Option<&Arg> {
        self.symbols
            .iter()
            .find_map(|(sym_name, value)| (*sym_name == name).then_some(value))
    }
}

/// The result of matching a [`Pattern`] against a graph node.
///
/// A match holds node IDs rather than references into the graph. It is only
/// valid until the graph is next modified.
#[derive(Clone, Debug)]
pub struct Match {
    root: NodeId,
    symbols: SymbolMap,
}

impl Match {
    /// Return the node that the root of the pattern matched.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Return the argument that a symbol was resolved to.
    pub fn get(&self, name: &str) -> Option<&Arg> {
        self.symbols.find(name)
    }

    /// Return the node ID that a symbol or keyed call pattern was resolved
    /// to.
    ///
    /// Returns `None` if the name is unknown or the symbol matched a value
    /// which is not a node (eg. an absent optional argument).
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.get(name).and_then(|arg| arg.as_node())
    }

    /// Return the call nodes matched by call patterns, including the root.
    pub fn nodes(&self) -> &[NodeId] {
        &self.symbols.nodes
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallPattern {
    /// Operator that the node must call.
    target: OpType,

    /// Patterns that the positional arguments must match.
    args: Vec<Pattern>,

    /// Patterns that the keyword arguments must match.
    kwargs: Vec<(&'static str, Pattern)>,

    /// Identifier which can be used to look up the node ID after a
    /// successful match.
    key: Option<&'static str>,
}

impl CallPattern {
    fn matches(&self, node_id: NodeId, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        let Some(call) = graph.get_call(node_id) else {
            return false;
        };
        if *call.target() != self.target
            || call.args().len() != self.args.len()
            || call.kwargs().len() != self.kwargs.len()
        {
            return false;
        }

        symbols.checkpoint();
        symbols.nodes.push(node_id);

        let kwargs_match = |symbols: &mut SymbolMap| {
            self.kwargs.iter().all(|(name, pattern)| {
                call.kwarg(name)
                    .is_some_and(|arg| pattern.test_impl(arg, graph, symbols))
            })
        };

        // For commutative binary operators, we allow the pattern to match
        // either way around. The declared order is tried first.
        let matched = if let (true, [pat_a, pat_b], [arg_a, arg_b]) =
            (self.target.is_commutative(), &self.args[..], call.args())
        {
            symbols.checkpoint();
            if pat_a.test_impl(arg_a, graph, symbols)
                && pat_b.test_impl(arg_b, graph, symbols)
                && kwargs_match(symbols)
            {
                symbols.commit();
                true
            } else {
                symbols.revert();
                pat_b.test_impl(arg_a, graph, symbols)
                    && pat_a.test_impl(arg_b, graph, symbols)
                    && kwargs_match(symbols)
            }
        } else {
            self.args
                .iter()
                .zip(call.args())
                .all(|(pattern, arg)| pattern.test_impl(arg, graph, symbols))
                && kwargs_match(symbols)
        };

        if !matched {
            symbols.revert();
            return false;
        }

        symbols.commit();
        if let Some(key) = self.key {
            symbols.add(key, Arg::Node(node_id));
        }
        true
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SymbolPattern {
    name: &'static str,

    /// True if this symbol can only match a constant node.
    constant: bool,
}

/// Specifies a pattern for a subgraph within a [`Graph`].
///
/// Patterns are trees whose leaves are fixed values, wildcards or symbols
/// (named wildcards) and whose interior nodes match operator calls. A
/// pattern is matched against a call node in a graph, and the node matches
/// if it is the output of a subgraph with the same structure.
///
/// Patterns are created using constructor methods and combined to form
/// patterns for sub-graphs. For example
/// `Pattern::symbol("x") + Pattern::const_symbol("c")` describes an `Add`
/// operator that takes a free variable `x` and a constant `c` as inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    /// Matches an argument which is exactly equal to a value.
    Fixed(Arg),
    /// Matches any argument.
    Wildcard,
    /// Matches any argument and records it under a name.
    Symbol(SymbolPattern),
    /// Matches a call to an operator.
    Call(CallPattern),
}

impl Pattern {
    /// Create a pattern that matches a call to an operator.
    pub fn call<I: Into<Vec<Pattern>>>(target: OpType, args: I) -> Pattern {
        Pattern::Call(CallPattern {
            target,
            args: args.into(),
            kwargs: Vec::new(),
            key: None,
        })
    }

    /// Create a pattern that matches a call to an operator with keyword
    /// arguments.
    pub fn call_with_kwargs<I: Into<Vec<Pattern>>, K: Into<Vec<(&'static str, Pattern)>>>(
        target: OpType,
        args: I,
        kwargs: K,
    ) -> Pattern {
        Pattern::Call(CallPattern {
            target,
            args: args.into(),
            kwargs: kwargs.into(),
            key: None,
        })
    }

    /// Create a pattern that matches a binary operator.
    pub fn binary_op<A: Into<Pattern>, B: Into<Pattern>>(
        target: OpType,
        input_a: A,
        input_b: B,
    ) -> Pattern {
        let args: [Pattern; 2] = [input_a.into(), input_b.into()];
        Pattern::call(target, args)
    }

    /// Create a pattern that matches a unary operator.
    pub fn unary_op<I: Into<Pattern>>(target: OpType, input: I) -> Pattern {
        let args: [Pattern; 1] = [input.into()];
        Pattern::call(target, args)
    }

    /// Set the identifier for a pattern, used to look up the node ID in a
    /// match using [`Match::node_id`].
    pub fn with_name(self, name: &'static str) -> Pattern {
        match self {
            Pattern::Call(mut call) => {
                call.key = Some(name);
                Pattern::Call(call)
            }
            Pattern::Symbol(mut symbol) => {
                symbol.name = name;
                Pattern::Symbol(symbol)
            }
            // Fixed values and wildcards don't support keys.
            pattern @ (Pattern::Fixed(_) | Pattern::Wildcard) => pattern,
        }
    }

    /// Create a pattern that matches an argument equal to `value`.
    pub fn fixed<A: Into<Arg>>(value: A) -> Pattern {
        Pattern::Fixed(value.into())
    }

    /// Create a pattern that matches any argument.
    pub fn wildcard() -> Pattern {
        Pattern::Wildcard
    }

    /// Create a pattern that matches any argument and records it.
    ///
    /// In order for a pattern to match a node, all symbols with the same name
    /// must resolve to the same value.
    pub fn symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: false,
        })
    }

    /// Create a pattern that matches a constant node.
    pub fn const_symbol(name: &'static str) -> Pattern {
        Pattern::Symbol(SymbolPattern {
            name,
            constant: true,
        })
    }

    /// Return the operator which the root of this pattern calls.
    pub fn root_target(&self) -> Option<&OpType> {
        match self {
            Pattern::Call(call) => Some(&call.target),
            _ => None,
        }
    }

    /// Test whether the subgraph with output `node_id` matches this pattern.
    ///
    /// If the pattern matches, this returns a [`Match`] which allows looking
    /// up the values that any symbols in the pattern were resolved to.
    ///
    /// Call nodes other than the root must not be used by nodes outside the
    /// match, since a rewrite that replaces the match would otherwise remove
    /// values that are still needed.
    pub fn test(&self, node_id: NodeId, graph: &Graph) -> Option<Match> {
        let Pattern::Call(call_pat) = self else {
            return None;
        };
        let mut symbols = SymbolMap::default();
        if !call_pat.matches(node_id, graph, &mut symbols) {
            return None;
        }

        let internal_nodes = symbols.nodes.iter().filter(|&&id| id != node_id);
        for &id in internal_nodes {
            if graph
                .users(id)
                .iter()
                .any(|user| !symbols.nodes.contains(user))
            {
                return None;
            }
        }

        Some(Match {
            root: node_id,
            symbols,
        })
    }

    /// Match this pattern against an argument and record symbol-value
    /// associations in `symbols`.
    fn test_impl(&self, arg: &Arg, graph: &Graph, symbols: &mut SymbolMap) -> bool {
        match self {
            Pattern::Fixed(value) => value == arg,
            Pattern::Wildcard => true,
            Pattern::Call(call_pat) => arg
                .as_node()
                .is_some_and(|node_id| call_pat.matches(node_id, graph, symbols)),
            Pattern::Symbol(sym_pat) => {
                if sym_pat.constant {
                    let is_constant = arg
                        .as_node()
                        .and_then(|id| graph.get_node(id))
                        .is_some_and(|node| matches!(node.kind(), NodeKind::Constant(_)));
                    if !is_constant {
                        return false;
                    }
                }

                // If we have seen this symbol before, it must resolve to the
                // same value. Otherwise it always matches.
                if let Some(resolved) = symbols.find(sym_pat.name) {
                    resolved == arg
                } else {
                    symbols.add(sym_pat.name, arg.clone());
                    true
                }
            }
        }
    }
}

/// Iterator over the matches of a pattern in a graph, created by
/// [`match_all`].
///
/// Matches are produced lazily, in graph order. The iterator borrows the
/// graph, so it must be dropped (and matching restarted) before the graph
/// is modified.
pub struct Matches<'a> {
    graph: &'a Graph,
    pattern: &'a Pattern,
    node_ids: std::slice::Iter<'a, NodeId>,
}

impl Iterator for Matches<'_> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        let target = self.pattern.root_target()?;
        for &node_id in self.node_ids.by_ref() {
            let candidate = self
                .graph
                .get_node(node_id)
                .and_then(|node| node.target())
                .is_some_and(|node_target| node_target == target);
            if !candidate {
                continue;
            }
            if let Some(pat_match) = self.pattern.test(node_id, self.graph) {
                return Some(pat_match);
            }
        }
        None
    }
}

/// Find all subgraphs of `graph` which match `pattern`.
pub fn match_all<'a>(graph: &'a Graph, pattern: &'a Pattern) -> Matches<'a> {
    Matches {
        graph,
        pattern,
        node_ids: graph.node_ids().iter(),
    }
}

macro_rules! impl_binop_for_pattern {
    ($trait:ident, $method:ident, $op_type:ident) => {
        impl<I: Into<Pattern>> $trait<I> for Pattern {
            type Output = Pattern;

            fn $method(self, rhs: I) -> Pattern {
                Pattern::binary_op(OpType::$op_type, self, rhs.into())
            }
        }
    };
}
impl_binop_for_pattern!(Add, add, Add);
impl_binop_for_pattern!(Mul, mul, Mul);
impl_binop_for_pattern!(Div, div, Div);
impl_binop_for_pattern!(Sub, sub, Sub);
