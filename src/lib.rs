//! Tigersearch: TIGERSearch-style treebank querying
//!
//! A query engine for syntactically annotated corpora: a query language
//! with node descriptions, typed variables and relational constraints,
//! compiled and evaluated against a read-only indexed store.

pub mod ast; // Query AST and canonical printer
pub mod constraints; // The five relational constraints
pub mod error;
pub mod factory; // AST -> compiled query (type inference, constraints)
pub mod memory; // In-memory reference store
pub mod nodesearcher; // Per-variable store lookups + merge join
pub mod normalizer; // Boolean normalization into DNF
pub mod parser; // Query language parser
pub mod predicates; // Node and set predicates
pub mod result; // Constraint checking and result sets
pub mod searcher; // End-to-end evaluation (compile + search + check)
pub mod store; // Indexed-store interface
pub mod variable; // Query variables and kind refinement

// Re-exports for convenience
pub use error::QueryError;
pub use factory::{compile, CompiledQuery, ExecutionMode};
pub use memory::MemoryCorpus;
pub use parser::parse_query;
pub use result::{Binding, EvalOptions, EvalStats, TreeMatches};
pub use searcher::{evaluate, evaluate_compiled, evaluate_parallel};
pub use store::{IndexedStore, NodeRecord};
