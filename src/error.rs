//! Error types for query compilation and evaluation.
//!
//! Every error here is a deterministic function of the query text and the
//! corpus schema; none of them is worth retrying.

use thiserror::Error;

/// The kind of name that failed to resolve against the corpus schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Feature,
    Predicate,
    EdgeLabel,
    SecEdgeLabel,
}

impl std::fmt::Display for NameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NameKind::Feature => "feature",
            NameKind::Predicate => "predicate",
            NameKind::EdgeLabel => "edge label",
            NameKind::SecEdgeLabel => "secondary edge label",
        };
        f.write_str(s)
    }
}

/// Error type for query compilation and evaluation failures.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The parser rejected the input. Carries the pest-reported position.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// An unknown feature, predicate or label was referenced. Surfaced at
    /// compile time, never during evaluation.
    #[error("undefined {kind} '{name}'")]
    UndefinedName { kind: NameKind, name: String },

    /// A node variable was refined to incompatible kinds by different parts
    /// of the query.
    #[error("conflicting node kinds for variable '{0}'")]
    TypeConflict(String),

    /// A feature is constrained by two incompatible literal equalities in
    /// one conjunction, e.g. `cat="NP"&cat="VP"`.
    #[error("feature '{0}' has two conflicting constraints")]
    Conflict(String),

    /// A predicate was called with the wrong argument count or types, or on
    /// a container kind it does not support.
    #[error("predicate error: {0}")]
    Predicate(String),

    /// The constraint graph has disconnected components that would each need
    /// relational checking. Reported instead of guessing a behavior.
    #[error("missing feature: disjoint constraint sets")]
    UnsupportedQueryShape,

    /// A regex literal in the query did not compile.
    #[error("invalid regex /{pattern}/: {message}")]
    BadRegex { pattern: String, message: String },

    /// Internal signal: a literal or regex matches nothing anywhere in the
    /// corpus. Short-circuits the query to zero results; callers of the
    /// public API never observe it as an error.
    #[error("empty result")]
    EmptyResult,

    /// A worker failed during parallel evaluation. The whole evaluation
    /// fails rather than returning a silently partial result set.
    #[error("parallel evaluation worker failed")]
    WorkerFailed,
}
