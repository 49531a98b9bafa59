use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::dtype::DataType;
use crate::env::parse_fold_config;
use crate::graph::{Graph, GraphError, NodeId};
use crate::oracle::{MetaOracle, ShapeOracle};

mod binary_folding;
mod constant_propagation;
mod diagnostics;
mod pattern_matcher;
mod registry;


pub use binary_folding::{
    binary_folding_pattern, check_binary_folding, fold_binary_into_conv, op_does_not_broadcast,
    FoldFamily,
};
pub use constant_propagation::{eval_call, propagate_constants, EvalError};
pub use diagnostics::{DiagnosticLevel, Diagnostics};
pub use pattern_matcher::{match_all, Match, Matches, Pattern};
pub use registry::PatternRegistry;

/// Reason why a pattern match was not rewritten.
///
/// These are routine outcomes of legality checks. The graph is left
/// unchanged.
#[derive(Clone, Debug, PartialEq)]
pub enum LegalityViolation {
    /// The convolution weight is not a constant.
    WeightNotConstant,
    /// The convolution bias is neither absent nor a constant.
    BiasNotConstant,
    /// The operand combined with the convolution output is not a constant.
    OtherNotConstant,
    /// The shape or type of an operand is unknown.
    MissingMeta(NodeId),
    /// The convolution weight does not have a float type.
    WeightNotFloat(DataType),
    /// The other operand does not have a float type.
    OtherNotFloat(DataType),
    /// Folding would change the type of the convolution weight.
    TypePromotion { weight: DataType, other: DataType },
    /// The other operand would change the shape of the result when broadcast
    /// against the convolution output.
    Broadcast,
    /// The weight's output channel count or the other operand's size is
    /// only known at runtime.
    SymbolicShape(NodeId),
    /// Other reason, for use by custom legality checks.
    Custom(&'static str),
}

impl Display for LegalityViolation {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::WeightNotConstant => write!(f, "weight is not a constant"),
            Self::BiasNotConstant => write!(f, "bias is not a constant"),
            Self::OtherNotConstant => write!(f, "other operand is not a constant"),
            Self::MissingMeta(id) => write!(f, "shape or type of node {} is unknown", id),
            Self::WeightNotFloat(dtype) => write!(f, "weight has non-float type {}", dtype),
            Self::OtherNotFloat(dtype) => write!(f, "other operand has non-float type {}", dtype),
            Self::TypePromotion { weight, other } => write!(
                f,
                "combining {} weight with {} operand would change its type",
                weight, other
            ),
            Self::Broadcast => write!(f, "other operand broadcasts with convolution output"),
            Self::SymbolicShape(id) => write!(f, "shape of node {} is not fixed", id),
            Self::Custom(reason) => write!(f, "{}", reason),
        }
    }
}

impl Error for LegalityViolation {}

/// Errors that occur while rewriting a match which passed its legality
/// check.
///
/// These indicate a bug in a pattern, legality check or rewrite.
#[derive(Clone, Debug, PartialEq)]
pub enum RewriteError {
    /// A structural assumption about the match does not hold.
    InvariantViolation(String),
    /// A graph mutation failed.
    Graph(GraphError),
}

impl Display for RewriteError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::InvariantViolation(msg) => write!(f, "invariant violated: {}", msg),
            Self::Graph(err) => write!(f, "graph update failed: {}", err),
        }
    }
}

impl Error for RewriteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvariantViolation(_) => None,
            Self::Graph(err) => Some(err),
        }
    }
}

impl From<GraphError> for RewriteError {
    fn from(err: GraphError) -> Self {
        RewriteError::Graph(err)
    }
}

/// Errors that occur while applying graph optimizations.
#[derive(Clone, Debug, PartialEq)]
pub enum OptimizeError {
    /// Rewriting a match failed.
    Rewrite {
        pattern: String,
        node: NodeId,
        error: RewriteError,
    },
    /// The number of rewrites exceeded [`OptimizeOptions::max_rewrites`].
    RewriteLimitExceeded(usize),
    /// A graph update failed outside of a pattern rewrite.
    Graph(GraphError),
}

impl Display for OptimizeError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Rewrite {
                pattern,
                node,
                error,
            } => write!(f, "rewrite {} failed at node {}: {}", pattern, node, error),
            Self::RewriteLimitExceeded(limit) => {
                write!(f, "exceeded limit of {} rewrites", limit)
            }
            Self::Graph(err) => write!(f, "graph update failed: {}", err),
        }
    }
}

impl Error for OptimizeError {}

impl From<GraphError> for OptimizeError {
    fn from(err: GraphError) -> Self {
        OptimizeError::Graph(err)
    }
}

/// Options which control graph optimization.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct OptimizeOptions {
    /// Level of diagnostic messages about applied and rejected rewrites.
    pub diagnostics: DiagnosticLevel,

    /// Maximum number of rewrites to apply to a graph.
    ///
    /// Registered rewrites are applied until no more matches are found. This
    /// limit turns a set of rewrites which never reaches a fixed point into
    /// an error.
    pub max_rewrites: usize,

    /// Evaluate operators whose inputs are all constants after rewriting,
    /// and remove unused nodes. Rewriting is then repeated, since the new
    /// constants can make further rewrites legal.
    pub propagate_constants: bool,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions {
            diagnostics: DiagnosticLevel::Off,
            max_rewrites: 10_000,
            propagate_constants: true,
        }
    }
}

impl OptimizeOptions {
    /// Return the default options, updated with any overrides from the
    /// `RTEN_FOLD` environment variable.
    ///
    /// See [`parse_fold_config`] for the format of the variable.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Some(config) = std::env::var_os("RTEN_FOLD") {
            parse_fold_config(&config.to_string_lossy(), &mut opts);
        }
        opts
    }
}

/// Applies optimizations to a [`Graph`] to enable faster inference.
///
/// The default optimizer folds elementwise operations with constant operands
/// into preceding convolutions, then evaluates the constant expressions this
/// creates.
pub struct GraphOptimizer {
    registry: PatternRegistry,
    options: OptimizeOptions,
}

impl GraphOptimizer {
    /// Create a new optimizer with the default set of optimizations enabled.
    ///
    /// Options are read from the environment. See
    /// [`OptimizeOptions::from_env`].
    pub fn new() -> Self {
        Self::with_options(OptimizeOptions::from_env())
    }

    /// Create an optimizer with the default set of optimizations and given
    /// options.
    pub fn with_options(options: OptimizeOptions) -> Self {
        Self::with_registry(PatternRegistry::binary_folding(), options)
    }

    /// Create an optimizer which applies the patterns in `registry`.
    pub fn with_registry(registry: PatternRegistry, options: OptimizeOptions) -> Self {
        GraphOptimizer { registry, options }
    }

    pub fn options(&self) -> &OptimizeOptions {
        &self.options
    }

    /// Apply optimizations to a graph.
    ///
    /// The graph's inputs and outputs will be preserved. Other nodes may be
    /// modified, removed or replaced. Shapes and types are read from node
    /// metadata.
    ///
    /// Returns the optimized graph.
    pub fn optimize(&self, mut graph: Graph) -> Result<Graph, OptimizeError> {
        self.optimize_in_place(&mut graph, &MetaOracle)?;
        Ok(graph)
    }

    /// Apply optimizations to a graph in place, using `oracle` to answer
    /// queries about shapes and types.
    ///
    /// Returns the number of pattern rewrites that were applied.
    pub fn optimize_in_place(
        &self,
        graph: &mut Graph,
        oracle: &dyn ShapeOracle,
    ) -> Result<usize, OptimizeError> {
        let diagnostics = Diagnostics::with_level(self.options.diagnostics);
        let max_rewrites = self.options.max_rewrites;
        let mut n_rewrites = 0;

        loop {
            let n_applied = self
                .registry
                .apply(graph, oracle, &diagnostics, max_rewrites - n_rewrites)
                .map_err(|err| match err {
                    OptimizeError::RewriteLimitExceeded(_) => {
                        OptimizeError::RewriteLimitExceeded(max_rewrites)
                    }
                    err => err,
                })?;
            n_rewrites += n_applied;

            if n_applied == 0 || !self.options.propagate_constants {
                break;
            }

            // Rewrites leave constant expressions in place of weights and
            // biases. Once evaluated, a chain of binary ops after a
            // convolution can be folded further.
            propagate_constants(graph)?;
            graph.eliminate_dead_code();
        }

        Ok(n_rewrites)
    }
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::new()
    }
}
