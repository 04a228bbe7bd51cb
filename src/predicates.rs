//! Node and set predicates of the query language.
//!
//! Node predicates compile into [`NodeFilter`] fragments that the node
//! search compiler pushes into the indexed store lookup. Set predicates
//! cannot be pushed down; they are evaluated by the graph iterator once a
//! tree's candidate sets are known.

use crate::ast::Expr;
use crate::error::{NameKind, QueryError};
use crate::store::{ArityField, Continuity, NodeFilter};
use crate::variable::{ContainerKind, NodeKind};

/// A predicate on a single node, evaluated inside the store lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePredicate {
    /// `root(#v)`: the gorn address has length zero.
    Root,
    /// `continuous(#v)` / `discontinuous(#v)`. Terminals match neither;
    /// they carry their own continuity flag.
    Continuity(Continuity),
    /// `arity(#v,n[,m])` / `tokenarity(#v,n[,m])`.
    Arity {
        field: ArityField,
        min: u32,
        max: u32,
    },
    /// Inferred terminal/nonterminal restriction. Not user-constructible;
    /// added by the query factory for variables whose kind is known only
    /// from relations.
    Kind(NodeKind),
}

impl NodePredicate {
    /// The store filter this predicate compiles to.
    pub fn filter(&self) -> NodeFilter {
        match *self {
            NodePredicate::Root => NodeFilter::Root,
            NodePredicate::Continuity(c) => NodeFilter::Continuity(c),
            NodePredicate::Arity { field, min, max } => NodeFilter::ArityRange { field, min, max },
            NodePredicate::Kind(kind) => NodeFilter::Kind(kind),
        }
    }
}

/// A predicate on a Set variable's candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPredicate {
    /// `empty(%v)`.
    Empty,
    /// `nonempty(%v)`.
    NonEmpty,
}

impl SetPredicate {
    pub fn check(self, set_size: usize) -> bool {
        match self {
            SetPredicate::Empty => set_size == 0,
            SetPredicate::NonEmpty => set_size > 0,
        }
    }
}

/// Either kind of predicate, tagged for dispatch in the factory.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Node(NodePredicate),
    Set(SetPredicate),
}

fn type_error(name: &str, message: &str) -> QueryError {
    QueryError::Predicate(format!("'{}': {}", name, message))
}

fn integer_arg(name: &str, args: &[Expr], idx: usize) -> Result<Option<u32>, QueryError> {
    match args.get(idx) {
        None => Ok(None),
        Some(Expr::IntegerLiteral(n)) => Ok(Some(*n)),
        Some(other) => Err(type_error(
            name,
            &format!("argument {} must be an integer, got {}", idx + 1, other),
        )),
    }
}

fn check_arg_count(name: &str, args: &[Expr], min: usize, max: usize) -> Result<(), QueryError> {
    if args.len() < min {
        Err(type_error(name, "missing arguments"))
    } else if args.len() > max {
        Err(type_error(name, "too many arguments"))
    } else {
        Ok(())
    }
}

/// Builds a predicate from a call in the AST.
///
/// By the time this runs, the query factory has already replaced node
/// description operands with variable references, so the first argument is
/// always a `VarRef`. Returns the referenced variable together with the
/// predicate so the caller can attach it.
pub fn from_call(name: &str, args: &[Expr]) -> Result<(crate::ast::Variable, Predicate), QueryError> {
    let var = match args.first() {
        Some(Expr::VarRef(var)) => var.clone(),
        Some(other) => {
            return Err(type_error(
                name,
                &format!("first argument must be a node variable, got {}", other),
            ));
        }
        None => return Err(type_error(name, "missing arguments")),
    };

    let predicate = match name {
        "root" => {
            check_arg_count(name, args, 1, 1)?;
            Predicate::Node(NodePredicate::Root)
        }
        "continuous" | "discontinuous" => {
            check_arg_count(name, args, 1, 1)?;
            let continuity = if name == "discontinuous" {
                Continuity::Discontinuous
            } else {
                Continuity::Continuous
            };
            Predicate::Node(NodePredicate::Continuity(continuity))
        }
        "arity" | "tokenarity" => {
            check_arg_count(name, args, 2, 3)?;
            let field = if name == "tokenarity" {
                ArityField::TokenArity
            } else {
                ArityField::Arity
            };
            let min = integer_arg(name, args, 1)?.ok_or_else(|| type_error(name, "missing arguments"))?;
            let max = integer_arg(name, args, 2)?.unwrap_or(min);
            Predicate::Node(NodePredicate::Arity { field, min, max })
        }
        "empty" | "nonempty" => {
            check_arg_count(name, args, 1, 1)?;
            if var.container != ContainerKind::Set {
                return Err(type_error(name, "only valid for set variables"));
            }
            let pred = if name == "empty" {
                SetPredicate::Empty
            } else {
                SetPredicate::NonEmpty
            };
            Predicate::Set(pred)
        }
        _ => {
            return Err(QueryError::UndefinedName {
                kind: NameKind::Predicate,
                name: name.to_string(),
            });
        }
    };
    Ok((var, predicate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Variable;

    fn var_arg(name: &str, container: ContainerKind) -> Expr {
        Expr::VarRef(Variable::new(name, container))
    }

    #[test]
    fn test_root() {
        let (var, pred) = from_call("root", &[var_arg("a", ContainerKind::Single)]).unwrap();
        assert_eq!(var.name, "a");
        assert_eq!(pred, Predicate::Node(NodePredicate::Root));
    }

    #[test]
    fn test_arity_range() {
        let args = [
            var_arg("a", ContainerKind::Single),
            Expr::IntegerLiteral(2),
            Expr::IntegerLiteral(5),
        ];
        let (_, pred) = from_call("arity", &args).unwrap();
        assert_eq!(
            pred,
            Predicate::Node(NodePredicate::Arity {
                field: ArityField::Arity,
                min: 2,
                max: 5,
            })
        );

        // Single bound means an exact count.
        let (_, pred) = from_call("tokenarity", &args[..2]).unwrap();
        assert_eq!(
            pred,
            Predicate::Node(NodePredicate::Arity {
                field: ArityField::TokenArity,
                min: 2,
                max: 2,
            })
        );
    }

    #[test]
    fn test_arity_argument_errors() {
        let v = var_arg("a", ContainerKind::Single);
        assert!(matches!(
            from_call("arity", std::slice::from_ref(&v)),
            Err(QueryError::Predicate(_))
        ));
        let too_many = [
            v.clone(),
            Expr::IntegerLiteral(1),
            Expr::IntegerLiteral(2),
            Expr::IntegerLiteral(3),
        ];
        assert!(matches!(
            from_call("arity", &too_many),
            Err(QueryError::Predicate(_))
        ));
        let bad_type = [v, var_arg("b", ContainerKind::Single)];
        assert!(matches!(
            from_call("arity", &bad_type),
            Err(QueryError::Predicate(_))
        ));
    }

    #[test]
    fn test_set_predicates_require_set_container() {
        let (_, pred) = from_call("empty", &[var_arg("s", ContainerKind::Set)]).unwrap();
        assert_eq!(pred, Predicate::Set(SetPredicate::Empty));

        assert!(matches!(
            from_call("nonempty", &[var_arg("a", ContainerKind::Single)]),
            Err(QueryError::Predicate(_))
        ));
    }

    #[test]
    fn test_unknown_predicate() {
        assert!(matches!(
            from_call("depth", &[var_arg("a", ContainerKind::Single)]),
            Err(QueryError::UndefinedName {
                kind: NameKind::Predicate,
                ..
            })
        ));
    }

    #[test]
    fn test_set_predicate_check() {
        assert!(SetPredicate::Empty.check(0));
        assert!(!SetPredicate::Empty.check(3));
        assert!(SetPredicate::NonEmpty.check(3));
        assert!(!SetPredicate::NonEmpty.check(0));
    }
}
