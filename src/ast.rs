//! Abstract syntax trees for TIGERSearch queries.
//!
//! The whole query language is represented by one closed sum type, [`Expr`].
//! Nodes are immutable once built; the normalizer rewrites by value and hands
//! back replacement nodes. Structural equality (`PartialEq`) is derived so
//! that normalization idempotence and the print/re-parse round trip can be
//! checked directly, and so the graph iterator can detect byte-identical
//! node descriptions for cursor sharing.

use std::fmt;

use crate::variable::{ContainerKind, NodeKind};

/// Distance range carried by dominance and precedence operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `>n,m` / `.n,m`; a bare operator is `Bounded(1, 1)`.
    Bounded(u32, u32),
    /// `>*` / `.*`: any distance >= 1.
    Unbounded,
}

impl RangeSpec {
    pub const IMMEDIATE: RangeSpec = RangeSpec::Bounded(1, 1);

    pub fn is_immediate(self) -> bool {
        self == RangeSpec::IMMEDIATE
    }
}

/// Side selector of the corner operator `>@l` / `>@r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CornerSide {
    Left,
    Right,
}

/// A node relation operator with its fixed modifier record.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationOp {
    /// `L > R`, with optional range, edge label, and negation.
    Dominance {
        range: RangeSpec,
        label: Option<String>,
        negated: bool,
    },
    /// `L . R`, with optional range and negation.
    Precedence { range: RangeSpec, negated: bool },
    /// `L >@l R` / `L >@r R`.
    Corner { side: CornerSide, negated: bool },
    /// `L >~ R`, with optional label and negation.
    SecEdge {
        label: Option<String>,
        negated: bool,
    },
    /// `L $ R`; `$.*` additionally requires L to precede R and cannot be
    /// negated.
    Sibling { ordered: bool, negated: bool },
}

/// A query variable as written in the source: `#name` or `%name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub container: ContainerKind,
}

impl Variable {
    pub fn new(name: impl Into<String>, container: ContainerKind) -> Self {
        Variable {
            name: name.into(),
            container,
        }
    }
}

/// An AST node. One closed set of variants covers query terms, node
/// descriptions and feature value expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Ordered conjunction of child expressions.
    Conjunction(Vec<Expr>),
    /// Ordered disjunction of child expressions.
    Disjunction(Vec<Expr>),
    /// Negation of a single child.
    Negation(Box<Expr>),
    /// `[...]`: wraps a boolean feature expression (or `Nop` if empty).
    NodeDescription(Box<Expr>),
    /// `#name:[...]`: variable definition; the child is a `NodeDescription`.
    VarDef(Variable, Box<Expr>),
    /// `#name` / `%name`.
    VarRef(Variable),
    /// `name=value` / `name!=value`; the value is a boolean expression of
    /// string and regex literals. `name!=v` parses as
    /// `FeatureConstraint(name, Negation(v))`.
    FeatureConstraint { feature: String, value: Box<Expr> },
    /// `T` / `NT`: all terminals or all nonterminals.
    FeatureRecord(NodeKind),
    /// `name(arg, ...)`.
    Predicate { name: String, args: Vec<Expr> },
    /// A quoted string literal.
    StringLiteral(String),
    /// `/regex/`.
    RegexLiteral(String),
    /// An integer predicate argument.
    IntegerLiteral(u32),
    /// `left OP right`.
    Relation {
        op: RelationOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// An empty node description, used for variables that are only ever
    /// referenced.
    Nop,
}

impl Expr {
    pub fn negation(expr: Expr) -> Expr {
        Expr::Negation(Box::new(expr))
    }

    pub fn description(expr: Expr) -> Expr {
        Expr::NodeDescription(Box::new(expr))
    }

    pub fn constraint(feature: impl Into<String>, value: Expr) -> Expr {
        Expr::FeatureConstraint {
            feature: feature.into(),
            value: Box::new(value),
        }
    }

    /// True for variants that never have child expressions.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            Expr::VarRef(_)
                | Expr::FeatureRecord(_)
                | Expr::StringLiteral(_)
                | Expr::RegexLiteral(_)
                | Expr::IntegerLiteral(_)
                | Expr::Nop
        )
    }
}

// Printing precedence for boolean expressions: disjunction binds loosest,
// negation tightest. Used to decide where parentheses are needed so that
// re-parsing the printed form yields a structurally equal AST.
const PREC_OR: u8 = 0;
const PREC_AND: u8 = 1;
const PREC_NOT: u8 = 2;

fn fmt_bool(expr: &Expr, parent: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let prec = match expr {
        Expr::Disjunction(_) => PREC_OR,
        Expr::Conjunction(_) => PREC_AND,
        Expr::Negation(_) => PREC_NOT,
        _ => return write!(f, "{}", expr),
    };
    let parens = prec < parent;
    if parens {
        f.write_str("(")?;
    }
    match expr {
        Expr::Disjunction(children) => {
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    f.write_str("|")?;
                }
                fmt_bool(c, PREC_OR + 1, f)?;
            }
        }
        Expr::Conjunction(children) => {
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    f.write_str("&")?;
                }
                fmt_bool(c, PREC_AND + 1, f)?;
            }
        }
        Expr::Negation(child) => {
            f.write_str("!")?;
            fmt_bool(child, PREC_NOT, f)?;
        }
        _ => unreachable!(),
    }
    if parens {
        f.write_str(")")?;
    }
    Ok(())
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RangeSpec::Bounded(1, 1) => Ok(()),
            RangeSpec::Bounded(min, max) if min == max => write!(f, "{}", min),
            RangeSpec::Bounded(min, max) => write!(f, "{},{}", min, max),
            RangeSpec::Unbounded => f.write_str("*"),
        }
    }
}

impl fmt::Display for RelationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationOp::Dominance {
                range,
                label,
                negated,
            } => {
                if *negated {
                    f.write_str("!")?;
                }
                f.write_str(">")?;
                match label {
                    Some(l) => f.write_str(l),
                    None => write!(f, "{}", range),
                }
            }
            RelationOp::Precedence { range, negated } => {
                if *negated {
                    f.write_str("!")?;
                }
                write!(f, ".{}", range)
            }
            RelationOp::Corner { side, negated } => {
                if *negated {
                    f.write_str("!")?;
                }
                match side {
                    CornerSide::Left => f.write_str(">@l"),
                    CornerSide::Right => f.write_str(">@r"),
                }
            }
            RelationOp::SecEdge { label, negated } => {
                if *negated {
                    f.write_str("!")?;
                }
                f.write_str(">~")?;
                match label {
                    Some(l) => f.write_str(l),
                    None => Ok(()),
                }
            }
            RelationOp::Sibling { ordered, negated } => {
                if *negated {
                    f.write_str("!")?;
                }
                f.write_str("$")?;
                if *ordered {
                    f.write_str(".*")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.container {
            ContainerKind::Single => "#",
            ContainerKind::Set => "%",
        };
        write!(f, "{}{}", prefix, self.name)
    }
}

/// Canonical query printer. Re-parsing the printed form of any
/// parser-producible AST yields a structurally equal AST.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Conjunction(children) => {
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" & ")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
            Expr::Disjunction(_) | Expr::Negation(_) => fmt_bool(self, PREC_OR, f),
            Expr::NodeDescription(inner) => match inner.as_ref() {
                Expr::Nop => f.write_str("[]"),
                other => {
                    f.write_str("[")?;
                    fmt_bool(other, PREC_OR, f)?;
                    f.write_str("]")
                }
            },
            Expr::VarDef(var, desc) => write!(f, "{}:{}", var, desc),
            Expr::VarRef(var) => write!(f, "{}", var),
            Expr::FeatureConstraint { feature, value } => match value.as_ref() {
                // `f!=v` is the canonical form of an atomically negated value.
                Expr::Negation(inner) if inner.is_leaf() => {
                    write!(f, "{}!={}", feature, inner)
                }
                v if v.is_leaf() => write!(f, "{}={}", feature, v),
                v => {
                    write!(f, "{}=(", feature)?;
                    fmt_bool(v, PREC_OR, f)?;
                    f.write_str(")")
                }
            },
            Expr::FeatureRecord(kind) => match kind {
                NodeKind::Terminal => f.write_str("T"),
                NodeKind::Nonterminal => f.write_str("NT"),
                NodeKind::Unknown => f.write_str("T|NT"),
            },
            Expr::Predicate { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
            Expr::StringLiteral(s) => write!(f, "\"{}\"", escape_string(s)),
            Expr::RegexLiteral(r) => write!(f, "/{}/", r),
            Expr::IntegerLiteral(n) => write!(f, "{}", n),
            Expr::Relation { op, left, right } => write!(f, "{} {} {}", left, op, right),
            Expr::Nop => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_display() {
        assert_eq!(RangeSpec::Bounded(1, 1).to_string(), "");
        assert_eq!(RangeSpec::Bounded(2, 2).to_string(), "2");
        assert_eq!(RangeSpec::Bounded(1, 3).to_string(), "1,3");
        assert_eq!(RangeSpec::Unbounded.to_string(), "*");
    }

    #[test]
    fn test_description_display() {
        let desc = Expr::description(Expr::Conjunction(vec![
            Expr::constraint("cat", Expr::StringLiteral("NP".into())),
            Expr::Negation(Box::new(Expr::FeatureRecord(NodeKind::Terminal))),
        ]));
        assert_eq!(desc.to_string(), r#"[cat="NP"&!T]"#);
    }

    #[test]
    fn test_negated_constraint_display() {
        let c = Expr::constraint(
            "pos",
            Expr::negation(Expr::RegexLiteral("N.*".into())),
        );
        assert_eq!(c.to_string(), "pos!=/N.*/");
    }

    #[test]
    fn test_relation_display() {
        let rel = Expr::Relation {
            op: RelationOp::Dominance {
                range: RangeSpec::Unbounded,
                label: None,
                negated: false,
            },
            left: Box::new(Expr::VarRef(Variable::new("a", ContainerKind::Single))),
            right: Box::new(Expr::VarRef(Variable::new("b", ContainerKind::Single))),
        };
        assert_eq!(rel.to_string(), "#a >* #b");
    }

    #[test]
    fn test_parenthesized_disjunction_display() {
        let e = Expr::Conjunction(vec![
            Expr::Disjunction(vec![
                Expr::StringLiteral("a".into()),
                Expr::StringLiteral("b".into()),
            ]),
            Expr::StringLiteral("c".into()),
        ]);
        let mut s = String::new();
        use std::fmt::Write;
        write!(s, "{}", e).unwrap();
        assert_eq!(s, r#"("a"|"b")&"c""#);
    }
}
