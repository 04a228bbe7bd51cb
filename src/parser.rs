//! Query language parser.
//!
//! Parses TIGERSearch query strings into [`Expr`] trees using a pest grammar.
//! The parser does not check semantic correctness: predicate names, feature
//! names, variable kinds, value conflicts and distance modifiers are all
//! validated later by the query factory. The only normalization done here is
//! rewriting `feat!=v` into `feat=!v`.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::ast::{CornerSide, Expr, RangeSpec, RelationOp, Variable};
use crate::error::QueryError;
use crate::variable::{ContainerKind, NodeKind};

#[derive(Parser)]
#[grammar = "tsql.pest"]
struct TsqlParser;

impl From<pest::error::Error<Rule>> for QueryError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        QueryError::Syntax(err.to_string())
    }
}

fn malformed(rule: Rule) -> QueryError {
    QueryError::Syntax(format!("malformed {:?} node", rule))
}

/// Returns the single child of a pair whose rule wraps exactly one
/// alternative.
fn only_child(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>, QueryError> {
    let rule = pair.as_rule();
    pair.into_inner().next().ok_or_else(|| malformed(rule))
}

/// Parses a query string into its AST. Queries with more than one term come
/// back as a `Conjunction`.
pub fn parse_query(input: &str) -> Result<Expr, QueryError> {
    let mut pairs = TsqlParser::parse(Rule::query, input)?;
    let query = pairs
        .next()
        .ok_or_else(|| QueryError::Syntax("empty query".to_string()))?;

    let mut terms = Vec::new();
    for pair in query.into_inner() {
        match pair.as_rule() {
            Rule::term => terms.push(parse_term(pair)?),
            Rule::EOI => {}
            _ => {}
        }
    }

    if terms.len() == 1 {
        Ok(terms.remove(0))
    } else {
        Ok(Expr::Conjunction(terms))
    }
}

fn parse_term(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let inner = only_child(pair)?;
    match inner.as_rule() {
        Rule::predicate => parse_predicate(inner),
        Rule::relation => parse_relation(inner),
        Rule::node_operand => parse_node_operand(inner),
        other => Err(malformed(other)),
    }
}

fn parse_relation(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let left = parse_node_operand(inner.next().ok_or_else(|| malformed(rule))?)?;
    let op = parse_rel_op(inner.next().ok_or_else(|| malformed(rule))?)?;
    let right = parse_node_operand(inner.next().ok_or_else(|| malformed(rule))?)?;
    Ok(Expr::Relation {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

fn parse_rel_op(pair: Pair<'_, Rule>) -> Result<RelationOp, QueryError> {
    let op = only_child(pair)?;
    let rule = op.as_rule();

    let mut negated = false;
    let mut label = None;
    let mut range = RangeSpec::IMMEDIATE;
    let mut side = CornerSide::Left;
    let mut ordered = false;

    for modifier in op.into_inner() {
        match modifier.as_rule() {
            Rule::neg => negated = true,
            Rule::edge_label => label = Some(modifier.as_str().to_string()),
            Rule::star => range = RangeSpec::Unbounded,
            Rule::range => range = parse_range(modifier)?,
            Rule::corner_side => {
                side = match modifier.as_str() {
                    "l" => CornerSide::Left,
                    _ => CornerSide::Right,
                }
            }
            Rule::ordered => ordered = true,
            _ => {}
        }
    }

    match rule {
        Rule::dominance_op => Ok(RelationOp::Dominance {
            range,
            label,
            negated,
        }),
        Rule::precedence_op => Ok(RelationOp::Precedence { range, negated }),
        Rule::corner_op => Ok(RelationOp::Corner { side, negated }),
        Rule::secedge_op => Ok(RelationOp::SecEdge { label, negated }),
        Rule::sibling_op => Ok(RelationOp::Sibling { ordered, negated }),
        other => Err(malformed(other)),
    }
}

fn parse_range(pair: Pair<'_, Rule>) -> Result<RangeSpec, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let min = parse_number(inner.next().ok_or_else(|| malformed(rule))?)?;
    let max = match inner.next() {
        Some(n) => parse_number(n)?,
        None => min,
    };
    Ok(RangeSpec::Bounded(min, max))
}

fn parse_number(pair: Pair<'_, Rule>) -> Result<u32, QueryError> {
    pair.as_str()
        .parse()
        .map_err(|_| QueryError::Syntax(format!("integer literal '{}' too large", pair.as_str())))
}

fn parse_node_operand(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let inner = only_child(pair)?;
    match inner.as_rule() {
        Rule::var_def => parse_var_def(inner),
        Rule::var_ref => Ok(Expr::VarRef(parse_var_name(only_child(inner)?)?)),
        Rule::node_description => parse_node_description(inner),
        other => Err(malformed(other)),
    }
}

fn parse_var_def(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let var = parse_var_name(inner.next().ok_or_else(|| malformed(rule))?)?;
    let desc = parse_node_description(inner.next().ok_or_else(|| malformed(rule))?)?;
    Ok(Expr::VarDef(var, Box::new(desc)))
}

fn parse_var_name(pair: Pair<'_, Rule>) -> Result<Variable, QueryError> {
    let text = pair.as_str();
    let container = match text.as_bytes().first() {
        Some(b'#') => ContainerKind::Single,
        Some(b'%') => ContainerKind::Set,
        _ => return Err(malformed(Rule::var_name)),
    };
    Ok(Variable::new(&text[1..], container))
}

fn parse_node_description(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    match pair.into_inner().next() {
        Some(inner) => Ok(Expr::description(parse_feat_expr(inner)?)),
        None => Ok(Expr::description(Expr::Nop)),
    }
}

/// Parses one boolean layer: the `|` level of descriptions and values.
fn parse_disjunction(
    pair: Pair<'_, Rule>,
    child: fn(Pair<'_, Rule>) -> Result<Expr, QueryError>,
) -> Result<Expr, QueryError> {
    let mut children = pair
        .into_inner()
        .map(child)
        .collect::<Result<Vec<_>, _>>()?;
    if children.len() == 1 {
        Ok(children.remove(0))
    } else {
        Ok(Expr::Disjunction(children))
    }
}

/// Parses one boolean layer: the `&` level of descriptions and values.
fn parse_conjunction(
    pair: Pair<'_, Rule>,
    child: fn(Pair<'_, Rule>) -> Result<Expr, QueryError>,
) -> Result<Expr, QueryError> {
    let mut children = pair
        .into_inner()
        .map(child)
        .collect::<Result<Vec<_>, _>>()?;
    if children.len() == 1 {
        Ok(children.remove(0))
    } else {
        Ok(Expr::Conjunction(children))
    }
}

fn parse_feat_expr(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    parse_disjunction(pair, parse_feat_and)
}

fn parse_feat_and(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    parse_conjunction(pair, parse_feat_not)
}

fn parse_feat_not(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed(rule))?;
    match first.as_rule() {
        Rule::neg => {
            let body = parse_feat_not(inner.next().ok_or_else(|| malformed(rule))?)?;
            Ok(Expr::negation(body))
        }
        _ => parse_feat_atom(first),
    }
}

fn parse_feat_atom(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let inner = only_child(pair)?;
    match inner.as_rule() {
        Rule::feature_constraint => parse_feature_constraint(inner),
        Rule::feature_record => Ok(Expr::FeatureRecord(match inner.as_str() {
            "T" => NodeKind::Terminal,
            _ => NodeKind::Nonterminal,
        })),
        Rule::feat_expr => parse_feat_expr(inner),
        other => Err(malformed(other)),
    }
}

fn parse_feature_constraint(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let feature = inner.next().ok_or_else(|| malformed(rule))?.as_str();
    let op = inner.next().ok_or_else(|| malformed(rule))?;
    let value = parse_value_expr(inner.next().ok_or_else(|| malformed(rule))?)?;
    // `f!=v` is sugar for `f=!v`.
    let value = if op.as_str() == "!=" {
        Expr::negation(value)
    } else {
        value
    };
    Ok(Expr::constraint(feature, value))
}

fn parse_value_expr(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    parse_disjunction(pair, parse_value_and)
}

fn parse_value_and(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    parse_conjunction(pair, parse_value_not)
}

fn parse_value_not(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or_else(|| malformed(rule))?;
    match first.as_rule() {
        Rule::neg => {
            let body = parse_value_not(inner.next().ok_or_else(|| malformed(rule))?)?;
            Ok(Expr::negation(body))
        }
        _ => parse_value_atom(first),
    }
}

fn parse_value_atom(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let inner = only_child(pair)?;
    match inner.as_rule() {
        Rule::string => Ok(Expr::StringLiteral(unescape_string(inner.as_str()))),
        Rule::regex => {
            let text = inner.as_str();
            Ok(Expr::RegexLiteral(text[1..text.len() - 1].to_string()))
        }
        Rule::value_expr => parse_value_expr(inner),
        other => Err(malformed(other)),
    }
}

/// Strips the quotes off a string literal and resolves `\c` escapes.
fn unescape_string(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_predicate(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let rule = pair.as_rule();
    let mut inner = pair.into_inner();
    let name = inner
        .next()
        .ok_or_else(|| malformed(rule))?
        .as_str()
        .to_string();
    let args = inner.map(parse_pred_arg).collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::Predicate { name, args })
}

fn parse_pred_arg(pair: Pair<'_, Rule>) -> Result<Expr, QueryError> {
    let inner = only_child(pair)?;
    match inner.as_rule() {
        Rule::node_operand => parse_node_operand(inner),
        Rule::number => Ok(Expr::IntegerLiteral(parse_number(inner)?)),
        other => Err(malformed(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_var(name: &str) -> Expr {
        Expr::VarRef(Variable::new(name, ContainerKind::Single))
    }

    #[test]
    fn test_parse_description() {
        let ast = parse_query(r#"[cat="NP" & !T]"#).unwrap();
        assert_eq!(
            ast,
            Expr::description(Expr::Conjunction(vec![
                Expr::constraint("cat", Expr::StringLiteral("NP".to_string())),
                Expr::negation(Expr::FeatureRecord(NodeKind::Terminal)),
            ]))
        );
    }

    #[test]
    fn test_parse_empty_description() {
        assert_eq!(parse_query("[]").unwrap(), Expr::description(Expr::Nop));
    }

    #[test]
    fn test_parse_inequality_sugar() {
        // `pos!=/N.*/` parses identically to `pos=!/N.*/`.
        let sugar = parse_query(r#"[pos!=/N.*/]"#).unwrap();
        let explicit = parse_query(r#"[pos=!/N.*/]"#).unwrap();
        assert_eq!(sugar, explicit);
        assert_eq!(
            sugar,
            Expr::description(Expr::constraint(
                "pos",
                Expr::negation(Expr::RegexLiteral("N.*".to_string()))
            ))
        );
    }

    #[test]
    fn test_parse_value_disjunction() {
        let ast = parse_query(r#"[word=("vor"|"vorm")]"#).unwrap();
        assert_eq!(
            ast,
            Expr::description(Expr::constraint(
                "word",
                Expr::Disjunction(vec![
                    Expr::StringLiteral("vor".to_string()),
                    Expr::StringLiteral("vorm".to_string()),
                ])
            ))
        );
    }

    #[test]
    fn test_parse_string_escapes() {
        let ast = parse_query(r#"[word="a\"b\\c"]"#).unwrap();
        assert_eq!(
            ast,
            Expr::description(Expr::constraint(
                "word",
                Expr::StringLiteral(r#"a"b\c"#.to_string())
            ))
        );
    }

    #[test]
    fn test_parse_var_def_and_relation() {
        let ast = parse_query(r#"#a:[cat="S"] & #a >* #b"#).unwrap();
        let def = Expr::VarDef(
            Variable::new("a", ContainerKind::Single),
            Box::new(Expr::description(Expr::constraint(
                "cat",
                Expr::StringLiteral("S".to_string()),
            ))),
        );
        let rel = Expr::Relation {
            op: RelationOp::Dominance {
                range: RangeSpec::Unbounded,
                label: None,
                negated: false,
            },
            left: Box::new(single_var("a")),
            right: Box::new(single_var("b")),
        };
        assert_eq!(ast, Expr::Conjunction(vec![def, rel]));
    }

    #[test]
    fn test_parse_operator_modifiers() {
        let cases: Vec<(&str, RelationOp)> = vec![
            (
                ">",
                RelationOp::Dominance {
                    range: RangeSpec::IMMEDIATE,
                    label: None,
                    negated: false,
                },
            ),
            (
                "!>OA",
                RelationOp::Dominance {
                    range: RangeSpec::IMMEDIATE,
                    label: Some("OA".to_string()),
                    negated: true,
                },
            ),
            (
                ">2,4",
                RelationOp::Dominance {
                    range: RangeSpec::Bounded(2, 4),
                    label: None,
                    negated: false,
                },
            ),
            (
                ".2",
                RelationOp::Precedence {
                    range: RangeSpec::Bounded(2, 2),
                    negated: false,
                },
            ),
            (
                "!.*",
                RelationOp::Precedence {
                    range: RangeSpec::Unbounded,
                    negated: true,
                },
            ),
            (
                ">@r",
                RelationOp::Corner {
                    side: CornerSide::Right,
                    negated: false,
                },
            ),
            (
                "!>~",
                RelationOp::SecEdge {
                    label: None,
                    negated: true,
                },
            ),
            (
                ">~MO",
                RelationOp::SecEdge {
                    label: Some("MO".to_string()),
                    negated: false,
                },
            ),
            (
                "$.*",
                RelationOp::Sibling {
                    ordered: true,
                    negated: false,
                },
            ),
            (
                "!$",
                RelationOp::Sibling {
                    ordered: false,
                    negated: true,
                },
            ),
        ];
        for (op_text, expected) in cases {
            let ast = parse_query(&format!("#a {} #b", op_text)).unwrap();
            match ast {
                Expr::Relation { op, .. } => assert_eq!(op, expected, "op {}", op_text),
                other => panic!("expected relation for {}, got {:?}", op_text, other),
            }
        }
    }

    #[test]
    fn test_parse_predicate() {
        let ast = parse_query(r#"arity([cat="NP"], 2, 5)"#).unwrap();
        assert_eq!(
            ast,
            Expr::Predicate {
                name: "arity".to_string(),
                args: vec![
                    Expr::description(Expr::constraint(
                        "cat",
                        Expr::StringLiteral("NP".to_string())
                    )),
                    Expr::IntegerLiteral(2),
                    Expr::IntegerLiteral(5),
                ],
            }
        );
    }

    #[test]
    fn test_parse_set_variable() {
        let ast = parse_query(r#"%all:[pos="NN"]"#).unwrap();
        match ast {
            Expr::VarDef(var, _) => {
                assert_eq!(var.name, "all");
                assert_eq!(var.container, ContainerKind::Set);
            }
            other => panic!("expected var def, got {:?}", other),
        }
    }

    #[test]
    fn test_reject_toplevel_disjunction() {
        assert!(matches!(
            parse_query("[T] | [NT]"),
            Err(QueryError::Syntax(_))
        ));
        assert!(matches!(parse_query(""), Err(QueryError::Syntax(_))));
    }

    #[test]
    fn test_display_round_trip() {
        let queries = [
            r#"#a:[cat="S"] & #a >* #b & root(#a)"#,
            r#"[word=("a"|"b")&pos!="NN"]"#,
            r#"[T] .2,4 [T]"#,
            r#"#a !$ #b & #a >@l #b"#,
        ];
        for q in queries {
            let ast = parse_query(q).unwrap();
            let printed = ast.to_string();
            let reparsed = parse_query(&printed).unwrap();
            assert_eq!(ast, reparsed, "round trip failed for {}", q);
        }
    }
}
