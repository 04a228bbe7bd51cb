//! Boolean normalization: negation pushdown and disjunctive normal form.
//!
//! The normalizer runs between the parser and the query factory. After it,
//! `Negation` nodes wrap only atomic leaves, every boolean layer is a
//! disjunction of conjunctions of atoms, and nested same-kind boolean nodes
//! are flattened. The pass is idempotent: normalizing a normalized tree is
//! a no-op. Node description contents and feature value expressions are
//! normalized independently of the toplevel term list.

use crate::ast::Expr;
use crate::store::IndexedStore;
use crate::variable::NodeKind;

/// Source of the node kind a feature name implies.
///
/// Negating a feature constraint on a kind-restricted feature has to account
/// for nodes of the other kind: `!(pos="NN")` holds for every nonterminal
/// and for terminals whose `pos` differs from `"NN"`. Features that apply to
/// both kinds (and names not in the schema, which the factory rejects later)
/// report `Unknown`.
pub trait FeatureKinds {
    fn feature_kind(&self, name: &str) -> NodeKind;
}

impl<S: IndexedStore + ?Sized> FeatureKinds for S {
    fn feature_kind(&self, name: &str) -> NodeKind {
        match self.feature(name) {
            Some(info) => info.domain.implied_kind(),
            None => NodeKind::Unknown,
        }
    }
}

pub struct Normalizer<'a> {
    kinds: &'a dyn FeatureKinds,
}

impl<'a> Normalizer<'a> {
    pub fn new(kinds: &'a dyn FeatureKinds) -> Self {
        Normalizer { kinds }
    }

    /// Normalizes a whole query AST.
    pub fn normalize(&self, expr: Expr) -> Expr {
        match expr {
            Expr::Conjunction(children) => self.normalize_conjunction(children),
            Expr::Disjunction(children) => self.normalize_disjunction(children),
            Expr::Negation(inner) => self.negate(*inner),
            Expr::NodeDescription(inner) => Expr::description(self.normalize(*inner)),
            Expr::VarDef(var, desc) => Expr::VarDef(var, Box::new(self.normalize(*desc))),
            Expr::FeatureConstraint { feature, value } => Expr::FeatureConstraint {
                feature,
                value: Box::new(self.normalize(*value)),
            },
            Expr::Relation { op, left, right } => Expr::Relation {
                op,
                left: Box::new(self.normalize(*left)),
                right: Box::new(self.normalize(*right)),
            },
            Expr::Predicate { name, args } => Expr::Predicate {
                name,
                args: args.into_iter().map(|a| self.normalize(a)).collect(),
            },
            leaf => leaf,
        }
    }

    /// Applies a negation to `expr` and pushes it down to the leaves.
    fn negate(&self, expr: Expr) -> Expr {
        match expr {
            // !!x
            Expr::Negation(inner) => self.normalize(*inner),
            // De Morgan
            Expr::Conjunction(children) => {
                self.normalize_disjunction(children.into_iter().map(Expr::negation).collect())
            }
            Expr::Disjunction(children) => {
                self.normalize_conjunction(children.into_iter().map(Expr::negation).collect())
            }
            Expr::FeatureRecord(kind) => Expr::FeatureRecord(kind.inverted()),
            Expr::FeatureConstraint { feature, value } => {
                let negated = self.negate(*value);
                let constraint = Expr::constraint(feature.clone(), negated);
                match self.kinds.feature_kind(&feature) {
                    // The constraint only ever holds on one node kind, so
                    // its negation also admits every node of the other kind.
                    NodeKind::Terminal | NodeKind::Nonterminal => {
                        let other = self.kinds.feature_kind(&feature).inverted();
                        self.normalize_disjunction(vec![Expr::FeatureRecord(other), constraint])
                    }
                    NodeKind::Unknown => constraint,
                }
            }
            Expr::Nop => Expr::Nop,
            // Atomic value leaves keep their negation marker.
            leaf if leaf.is_leaf() => Expr::negation(leaf),
            other => Expr::negation(self.normalize(other)),
        }
    }

    /// Normalizes the children of a disjunction and flattens nested
    /// disjunctions.
    fn normalize_disjunction(&self, children: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match self.normalize(child) {
                Expr::Disjunction(nested) => flat.extend(nested),
                // An always-true disjunct makes the whole disjunction true.
                Expr::Nop => return Expr::Nop,
                other => flat.push(other),
            }
        }
        // A disjunct for each node kind covers every node.
        let terminal = flat.contains(&Expr::FeatureRecord(NodeKind::Terminal));
        let nonterminal = flat.contains(&Expr::FeatureRecord(NodeKind::Nonterminal));
        if terminal && nonterminal {
            return Expr::Nop;
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Expr::Disjunction(flat)
        }
    }

    /// Normalizes the children of a conjunction, flattens nested
    /// conjunctions, and distributes over any disjunction children.
    fn normalize_conjunction(&self, children: Vec<Expr>) -> Expr {
        let mut atoms = Vec::with_capacity(children.len());
        let mut disjunctions = Vec::new();
        for child in children {
            match self.normalize(child) {
                Expr::Conjunction(nested) => atoms.extend(nested),
                Expr::Disjunction(nested) => disjunctions.push(nested),
                Expr::Nop => {}
                other => atoms.push(other),
            }
        }

        if disjunctions.is_empty() {
            return match atoms.len() {
                0 => Expr::Nop,
                1 => atoms.remove(0),
                _ => Expr::Conjunction(atoms),
            };
        }

        // (A|B)&C -> (A&C)|(B&C), over every disjunction child at once.
        let mut products: Vec<Vec<Expr>> = vec![atoms];
        for disjuncts in disjunctions {
            let mut next = Vec::with_capacity(products.len() * disjuncts.len());
            for disjunct in disjuncts {
                for product in &products {
                    let mut extended = product.clone();
                    match disjunct.clone() {
                        Expr::Conjunction(nested) => extended.extend(nested),
                        other => extended.push(other),
                    }
                    next.push(extended);
                }
            }
            products = next;
        }

        let disjuncts = products
            .into_iter()
            .map(|mut product| match product.len() {
                0 => Expr::Nop,
                1 => product.remove(0),
                _ => Expr::Conjunction(product),
            })
            .collect::<Vec<_>>();
        if disjuncts.iter().any(|d| matches!(d, Expr::Nop)) {
            return Expr::Nop;
        }
        Expr::Disjunction(disjuncts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;

    /// Kind source for tests: `pos`/`word` are terminal features, `cat` is
    /// nonterminal, everything else applies to both kinds.
    struct TestKinds;

    impl FeatureKinds for TestKinds {
        fn feature_kind(&self, name: &str) -> NodeKind {
            match name {
                "pos" | "word" => NodeKind::Terminal,
                "cat" => NodeKind::Nonterminal,
                _ => NodeKind::Unknown,
            }
        }
    }

    fn normalize_str(query: &str) -> Expr {
        Normalizer::new(&TestKinds).normalize(parse_query(query).unwrap())
    }

    /// No `Negation` may wrap anything but an atomic leaf.
    fn assert_negations_atomic(expr: &Expr) {
        match expr {
            Expr::Negation(inner) => assert!(inner.is_leaf(), "negated non-leaf: {:?}", inner),
            Expr::Conjunction(cs) | Expr::Disjunction(cs) => {
                cs.iter().for_each(assert_negations_atomic)
            }
            Expr::NodeDescription(inner) => assert_negations_atomic(inner),
            Expr::VarDef(_, desc) => assert_negations_atomic(desc),
            Expr::FeatureConstraint { value, .. } => assert_negations_atomic(value),
            Expr::Relation { left, right, .. } => {
                assert_negations_atomic(left);
                assert_negations_atomic(right);
            }
            Expr::Predicate { args, .. } => args.iter().for_each(assert_negations_atomic),
            _ => {}
        }
    }

    #[test]
    fn test_idempotence() {
        let queries = [
            r#"[!(cat="NP" & cat="VP")]"#,
            r#"[(pos="NN"|pos="NE") & word="x"]"#,
            r#"#a:[!(word=("a"|"b"))] & #a > #b"#,
            r#"[!!T]"#,
            r#"[morph!=("sg"|"pl")]"#,
        ];
        for q in queries {
            let once = normalize_str(q);
            let twice = Normalizer::new(&TestKinds).normalize(once.clone());
            assert_eq!(once, twice, "not idempotent for {}", q);
        }
    }

    #[test]
    fn test_double_negation() {
        assert_eq!(
            normalize_str("[!!T]"),
            Expr::description(Expr::FeatureRecord(NodeKind::Terminal))
        );
    }

    #[test]
    fn test_feature_record_flip() {
        assert_eq!(
            normalize_str("[!T]"),
            Expr::description(Expr::FeatureRecord(NodeKind::Nonterminal))
        );
    }

    #[test]
    fn test_de_morgan_and_negation_elimination() {
        let ast = normalize_str(r#"[!(morph="sg" & morph="pl")]"#);
        assert_negations_atomic(&ast);
        // !(a&b) on both-kind features is !a | !b with the negations pushed
        // into the values.
        assert_eq!(
            ast,
            Expr::description(Expr::Disjunction(vec![
                Expr::constraint("morph", Expr::negation(Expr::StringLiteral("sg".into()))),
                Expr::constraint("morph", Expr::negation(Expr::StringLiteral("pl".into()))),
            ]))
        );
    }

    #[test]
    fn test_negated_constraint_admits_other_kind() {
        // pos is terminal-only, so its negation also matches nonterminals.
        let ast = normalize_str(r#"[!(pos="NN")]"#);
        assert_eq!(
            ast,
            Expr::description(Expr::Disjunction(vec![
                Expr::FeatureRecord(NodeKind::Nonterminal),
                Expr::constraint("pos", Expr::negation(Expr::StringLiteral("NN".into()))),
            ]))
        );
    }

    #[test]
    fn test_kind_disjunction_is_an_identity() {
        // !T | !NT admits every node, so the description becomes empty.
        assert_eq!(normalize_str("[!(T & NT)]"), Expr::description(Expr::Nop));
        assert_eq!(normalize_str("[T | NT]"), Expr::description(Expr::Nop));
    }

    #[test]
    fn test_dnf_distribution() {
        let ast = normalize_str(r#"[(morph="a"|morph="b") & deg="c"]"#);
        match ast {
            Expr::NodeDescription(inner) => match *inner {
                Expr::Disjunction(disjuncts) => {
                    assert_eq!(disjuncts.len(), 2);
                    for d in &disjuncts {
                        match d {
                            Expr::Conjunction(atoms) => assert_eq!(atoms.len(), 2),
                            other => panic!("expected conjunction, got {:?}", other),
                        }
                    }
                }
                other => panic!("expected disjunction, got {:?}", other),
            },
            other => panic!("expected description, got {:?}", other),
        }
    }

    #[test]
    fn test_value_negation_pushdown() {
        // word!=("a"|"b") becomes word=(!"a" & !"b").
        let ast = normalize_str(r#"[word!=("a"|"b")]"#);
        assert_negations_atomic(&ast);
        assert_eq!(
            ast,
            Expr::description(Expr::constraint(
                "word",
                Expr::Conjunction(vec![
                    Expr::negation(Expr::StringLiteral("a".into())),
                    Expr::negation(Expr::StringLiteral("b".into())),
                ])
            ))
        );
    }

    #[test]
    fn test_flattening() {
        let nested = Expr::Conjunction(vec![
            Expr::Conjunction(vec![
                Expr::FeatureRecord(NodeKind::Terminal),
                Expr::constraint("morph", Expr::StringLiteral("sg".into())),
            ]),
            Expr::constraint("deg", Expr::StringLiteral("pos".into())),
        ]);
        match Normalizer::new(&TestKinds).normalize(nested) {
            Expr::Conjunction(atoms) => assert_eq!(atoms.len(), 3),
            other => panic!("expected flat conjunction, got {:?}", other),
        }
    }
}
