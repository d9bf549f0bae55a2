//! The typed node variants pipelines are assembled from.
//!
//! - [`RetrievalNode`]: gathers and fuses evidence, assembles context
//! - [`GenerationNode`]: one governed chat-completion call
//! - [`DecisionNode`]: consistency check over generated candidates
//!
//! Map fan-out is declared on the graph, not as a node type; any of
//! these run unchanged inside a branch.

mod decision;
mod generation;
mod retrieval;

pub use decision::{CandidateSource, DecisionNode};
pub use generation::GenerationNode;
pub use retrieval::RetrievalNode;

/// Extra-channel keys shared between the node variants and decision
/// predicates.
pub mod keys {
    /// Assembled context text for the generation prompt.
    pub const CONTEXT: &str = "context";
    /// Chunk ids backing the assembled context.
    pub const CONTEXT_REFS: &str = "context_refs";
    /// Graded sufficiency of the assembled context.
    pub const SUFFICIENCY: &str = "sufficiency";
    /// Set when retrieval produced no usable evidence; read as the
    /// widen hint on the next retrieval.
    pub const INSUFFICIENT_CONTEXT: &str = "insufficient_context";
    /// The generated answer (outside map branches).
    pub const ANSWER: &str = "answer";
    /// Consistency verdict of the last decision node.
    pub const CONSISTENCY: &str = "consistency";
    /// Boolean divergence flag of the last decision node.
    pub const DIVERGENT: &str = "divergent";
}
