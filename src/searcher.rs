//! End-to-end query evaluation.
//!
//! The full pipeline: parse the query string, normalize it, compile it
//! against the store schema, search per-variable candidates, and check the
//! relational constraints. The `EmptyResult` signal raised when a literal
//! or regex matches nothing in the corpus is absorbed here; callers see an
//! ordinary empty result set.

use crate::error::QueryError;
use crate::factory::{self, CompiledQuery};
use crate::result::{self, EvalOptions, EvalStats, ResultBuilder, TreeMatches};
use crate::store::IndexedStore;

type Evaluation = Result<(Vec<TreeMatches>, EvalStats), QueryError>;

fn absorb_empty(outcome: Evaluation) -> Evaluation {
    match outcome {
        Err(QueryError::EmptyResult) => Ok((Vec::new(), EvalStats::default())),
        other => other,
    }
}

/// Parses, compiles and evaluates a query over the whole corpus.
pub fn evaluate<S: IndexedStore>(store: &S, query: &str) -> Evaluation {
    let compiled = factory::compile(store, query)?;
    evaluate_compiled(store, &compiled, &EvalOptions::default())
}

/// Evaluates a compiled query, e.g. one reused across repeated runs.
pub fn evaluate_compiled<S: IndexedStore>(
    store: &S,
    query: &CompiledQuery,
    options: &EvalOptions,
) -> Evaluation {
    absorb_empty(ResultBuilder::new(store, query, options.clone()).evaluate())
}

/// Evaluates a compiled query with one worker per corpus partition.
pub fn evaluate_parallel<S: IndexedStore + Sync>(
    store: &S,
    query: &CompiledQuery,
    options: &EvalOptions,
) -> Evaluation {
    absorb_empty(result::evaluate_parallel(store, query, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::sample_corpus;
    use crate::memory::{node, MemoryCorpus};
    use crate::store::FeatureDomain;

    /// Asserts that the query has exactly one match in one tree and returns
    /// that match's bindings resolved back to builder names.
    fn single_match(
        corpus: &MemoryCorpus,
        query: &str,
        var: &str,
        expected_node: &str,
    ) {
        let (results, _) = evaluate(corpus, query).unwrap();
        assert_eq!(results.len(), 1, "query: {}", query);
        assert_eq!(results[0].matches.len(), 1, "query: {}", query);
        let compiled = factory::compile(corpus, query).unwrap();
        let id = compiled.var_id(var).unwrap();
        assert_eq!(
            results[0].matches[0][&id],
            corpus.node_id_by_name(results[0].tree_id, expected_node).unwrap(),
            "query: {}",
            query
        );
    }

    fn match_count(corpus: &MemoryCorpus, query: &str) -> usize {
        let (results, _) = evaluate(corpus, query).unwrap();
        results.iter().map(|tree| tree.matches.len()).sum()
    }

    #[test]
    fn test_evaluate() {
        let corpus = sample_corpus();
        let (results, stats) = evaluate(&corpus, r#"#a:[cat="S"] > #b:[cat="NP"]"#).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tree_id, 0);
        assert_eq!(results[0].matches.len(), 1);
        assert_eq!(stats.trees_checked, 1);
    }

    #[test]
    fn test_unknown_value_is_an_empty_result() {
        let corpus = sample_corpus();
        let (results, _) = evaluate(&corpus, r#"#a:[cat="PP"]"#).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_unknown_feature_is_an_error() {
        let corpus = sample_corpus();
        assert!(matches!(
            evaluate(&corpus, r#"#a:[tense="past"]"#),
            Err(QueryError::UndefinedName { .. })
        ));
    }

    #[test]
    fn test_kind_conflict_is_an_error() {
        let corpus = sample_corpus();
        assert!(matches!(
            evaluate(&corpus, r#"#a:[cat="S" & pos="NN"]"#),
            Err(QueryError::TypeConflict(name)) if name == "a"
        ));
    }

    #[test]
    fn test_disjoint_constraint_graph_is_unsupported() {
        let corpus = sample_corpus();
        assert!(matches!(
            evaluate(&corpus, "#a > #b & #c > #d"),
            Err(QueryError::UnsupportedQueryShape)
        ));
    }

    #[test]
    fn test_siblings() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="NP"] $ #b:[cat="VP"]"#, "b", "VP");
        single_match(&corpus, r#"#a:[cat="NP"] $.* #b:[cat="VP"]"#, "a", "NP");
        assert_eq!(match_count(&corpus, r#"#a:[cat="VP"] $.* #b:[cat="NP"]"#), 0);
    }

    #[test]
    fn test_labeled_dominance() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="S"] >SB #b"#, "b", "NP");
    }

    #[test]
    fn test_dominance_ranges() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="S"] >* #b:[pos="NN"]"#, "b", "dog");
        single_match(&corpus, r#"root(#a) & #a >2 #b:[pos="NN"]"#, "a", "S");
        assert_eq!(match_count(&corpus, r#"#a:[cat="S"] > #b:[pos="NN"]"#), 0);
    }

    #[test]
    fn test_corners() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="NP"] >@l #b"#, "b", "the");
        single_match(&corpus, r#"#a:[cat="NP"] >@r #b"#, "b", "dog");
    }

    #[test]
    fn test_secondary_edge() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="VP"] >~anaphor #b"#, "b", "NP");
        assert_eq!(match_count(&corpus, r#"#a:[cat="NP"] >~anaphor #b"#), 0);
    }

    #[test]
    fn test_precedence_ranges() {
        let corpus = sample_corpus();
        // NP's effective order is 1, "barked" is at 3.
        assert_eq!(match_count(&corpus, r#"#a:[cat="NP"] . #b:[pos="VBD"]"#), 0);
        single_match(&corpus, r#"#a:[cat="NP"] .2 #b:[pos="VBD"]"#, "a", "NP");
        single_match(&corpus, r#"#a:[cat="NP"] .* #b:[pos="VBD"]"#, "b", "barked");
    }

    #[test]
    fn test_negated_precedence() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="VP"] !. #b:[pos="DT"]"#, "b", "the");
    }

    #[test]
    fn test_arity_predicates_without_relations() {
        let corpus = sample_corpus();
        single_match(&corpus, r#"#a:[cat="NP"] & arity(#a,2)"#, "a", "NP");
        single_match(&corpus, r#"#a:[cat="S"] & tokenarity(#a,3)"#, "a", "S");
        assert_eq!(match_count(&corpus, r#"#a:[cat="NP"] & arity(#a,3,5)"#), 0);
    }

    fn gapped_corpus() -> MemoryCorpus {
        let mut corpus = MemoryCorpus::new();
        corpus.declare_feature("cat", FeatureDomain::Nonterminal);
        corpus.declare_feature("word", FeatureDomain::Terminal);
        let tree = node("S")
            .feature("cat", "S")
            .child(
                node("VP")
                    .feature("cat", "VP")
                    .child(node("a").feature("word", "a").order(1))
                    .child(node("b").feature("word", "b").order(3)),
            )
            .child(node("c").feature("word", "c").order(2));
        corpus.insert_tree(tree).unwrap();
        corpus
    }

    #[test]
    fn test_continuity_predicates() {
        let corpus = gapped_corpus();
        single_match(&corpus, "#v:[NT] & discontinuous(#v)", "v", "VP");
        single_match(&corpus, "#v:[NT] & continuous(#v)", "v", "S");
    }

    #[test]
    fn test_precedence_of_discontinuous_node() {
        let corpus = gapped_corpus();
        // VP takes its left corner's position (1), so it immediately
        // precedes the gap token at 2.
        single_match(&corpus, r#"#v:[cat="VP"] . #w:[word="c"]"#, "w", "c");
    }

    fn six_tree_corpus() -> MemoryCorpus {
        let mut corpus = MemoryCorpus::new();
        corpus.declare_feature("cat", FeatureDomain::Nonterminal);
        corpus.declare_feature("pos", FeatureDomain::Terminal);
        corpus.declare_feature("word", FeatureDomain::Terminal);
        for i in 0..6 {
            let tree = if i % 2 == 0 {
                node("S")
                    .feature("cat", "S")
                    .child(
                        node("NP")
                            .feature("cat", "NP")
                            .child(node("the").feature("pos", "DT").feature("word", "the"))
                            .child(node("dog").feature("pos", "NN").feature("word", "dog")),
                    )
                    .child(
                        node("VP")
                            .feature("cat", "VP")
                            .child(node("barked").feature("pos", "VBD").feature("word", "barked")),
                    )
            } else {
                node("S")
                    .feature("cat", "S")
                    .child(
                        node("NP1")
                            .feature("cat", "NP")
                            .child(node("cats").feature("pos", "NN").feature("word", "cats")),
                    )
                    .child(
                        node("VP")
                            .feature("cat", "VP")
                            .child(node("sleep").feature("pos", "VBD").feature("word", "sleep"))
                            .child(
                                node("NP2")
                                    .feature("cat", "NP")
                                    .child(node("on").feature("pos", "DT").feature("word", "on"))
                                    .child(node("mice").feature("pos", "NN").feature("word", "mice")),
                            ),
                    )
            };
            corpus.insert_tree(tree).unwrap();
        }
        corpus
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let corpus = six_tree_corpus();
        let compiled = factory::compile(&corpus, r#"#a:[cat="S"] >* #b:[pos="NN"]"#).unwrap();

        let sequential =
            evaluate_compiled(&corpus, &compiled, &EvalOptions::default()).unwrap();
        assert_eq!(sequential.0.len(), 6);
        let total: usize = sequential.0.iter().map(|t| t.matches.len()).sum();
        assert_eq!(total, 9);

        let options = EvalOptions {
            sample_trees: 2,
            workers: 3,
        };
        let parallel = evaluate_parallel(&corpus, &compiled, &options).unwrap();
        // Partitions are contiguous and merged in order, so the full result
        // sequence matches the sequential run exactly.
        assert_eq!(parallel.0, sequential.0);
        assert_eq!(parallel.1.trees_checked, sequential.1.trees_checked);
    }

    #[test]
    fn test_compiled_query_reuse() {
        let corpus = six_tree_corpus();
        let compiled = factory::compile(&corpus, r#"#a:[cat="NP"] $ #b:[cat="VP"]"#).unwrap();
        let first = evaluate_compiled(&corpus, &compiled, &EvalOptions::default()).unwrap();
        let second = evaluate_compiled(&corpus, &compiled, &EvalOptions::default()).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.0.len(), 6);
    }
}
