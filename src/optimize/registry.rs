use crate::graph::{Graph, NodeId, OpType};
use crate::oracle::ShapeOracle;

use super::binary_folding::{
    binary_folding_pattern, check_binary_folding, fold_binary_into_conv, FoldFamily,
};
use super::diagnostics::Diagnostics;
use super::pattern_matcher::{match_all, Match, Pattern};
use super::{LegalityViolation, OptimizeError, RewriteError};

/// Check whether a match can be rewritten.
type Predicate = Box<dyn Fn(&Match, &Graph, &dyn ShapeOracle) -> Result<(), LegalityViolation>>;

/// Rewrite a match which passed its legality check. Returns the ID of the
/// node which replaced the root of the match.
type Rewrite = Box<dyn Fn(&Match, &mut Graph) -> Result<NodeId, RewriteError>>;

struct Entry {
    name: String,
    pattern: Pattern,
    predicate: Predicate,
    rewrite: Rewrite,
}

/// Set of graph rewrites, each consisting of a pattern, a legality check
/// and a rewrite function.
///
/// Rewrites are applied in registration order by [`apply`](Self::apply).
#[derive(Default)]
pub struct PatternRegistry {
    entries: Vec<Entry>,
}

impl PatternRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry which folds `Add`, `Sub`, `Mul` and `Div` operators
    /// with a constant operand into a preceding convolution.
    pub fn binary_folding() -> Self {
        let mut registry = Self::new();
        let computation_ops = [OpType::Convolution];
        let binary_ops = [OpType::Add, OpType::Sub, OpType::Mul, OpType::Div];

        for computation_op in &computation_ops {
            for binary_op in &binary_ops {
                let Some(family) = FoldFamily::from_op(binary_op) else {
                    continue;
                };
                let name = format!("{}{}Folding", computation_op, binary_op);
                let rewrite_op = binary_op.clone();
                registry.register_named(
                    &name,
                    binary_folding_pattern(binary_op.clone()),
                    check_binary_folding,
                    move |pat_match, graph| {
                        fold_binary_into_conv(family, &rewrite_op, pat_match, graph)
                    },
                );
            }
        }
        registry
    }

    /// Add a rewrite with a name derived from the pattern's root operator.
    pub fn register<P, R>(&mut self, pattern: Pattern, predicate: P, rewrite: R)
    where
        P: Fn(&Match, &Graph, &dyn ShapeOracle) -> Result<(), LegalityViolation> + 'static,
        R: Fn(&Match, &mut Graph) -> Result<NodeId, RewriteError> + 'static,
    {
        let name = match pattern.root_target() {
            Some(target) => format!("{}Rewrite{}", target, self.entries.len()),
            None => format!("Rewrite{}", self.entries.len()),
        };
        self.register_named(&name, pattern, predicate, rewrite);
    }

    /// Add a rewrite with a name used in diagnostics and errors.
    pub fn register_named<P, R>(&mut self, name: &str, pattern: Pattern, predicate: P, rewrite: R)
    where
        P: Fn(&Match, &Graph, &dyn ShapeOracle) -> Result<(), LegalityViolation> + 'static,
        R: Fn(&Match, &mut Graph) -> Result<NodeId, RewriteError> + 'static,
    {
        self.entries.push(Entry {
            name: name.to_string(),
            pattern,
            predicate: Box::new(predicate),
            rewrite: Box::new(rewrite),
        });
    }

    /// Return the names of registered rewrites, in the order they are
    /// applied.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply registered rewrites until no more legal matches are found.
    ///
    /// Entries are visited in registration order. For each entry, the graph
    /// is scanned for the first match which passes the legality check, the
    /// match is rewritten and the scan restarts, since the rewrite
    /// invalidates other matches. Once no entry makes changes the graph has
    /// reached a fixed point.
    ///
    /// Returns the number of rewrites applied.
    pub fn apply(
        &self,
        graph: &mut Graph,
        oracle: &dyn ShapeOracle,
        diagnostics: &Diagnostics,
        max_rewrites: usize,
    ) -> Result<usize, OptimizeError> {
        let mut n_rewrites = 0;

        loop {
            let mut changed = false;

            for entry in &self.entries {
                while let Some(pat_match) = entry.next_legal_match(graph, oracle, diagnostics) {
                    if n_rewrites >= max_rewrites {
                        return Err(OptimizeError::RewriteLimitExceeded(max_rewrites));
                    }

                    let root = pat_match.root();
                    diagnostics.info(graph, root, format_args!("applying {}", entry.name));
                    (entry.rewrite)(&pat_match, graph).map_err(|error| OptimizeError::Rewrite {
                        pattern: entry.name.clone(),
                        node: root,
                        error,
                    })?;

                    n_rewrites += 1;
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        Ok(n_rewrites)
    }
}

impl Entry {
    /// Find the first match for this entry's pattern which passes its
    /// legality check.
    fn next_legal_match(
        &self,
        graph: &Graph,
        oracle: &dyn ShapeOracle,
        diagnostics: &Diagnostics,
    ) -> Option<Match> {
        match_all(graph, &self.pattern).find(|pat_match| {
            match (self.predicate)(pat_match, graph, oracle) {
                Ok(()) => true,
                Err(reason) => {
                    diagnostics.warn(
                        graph,
                        pat_match.root(),
                        format_args!("{} not applied: {}", self.name, reason),
                    );
                    false
                }
            }
        })
    }
}
