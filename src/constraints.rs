//! Relational constraints between node variables.
//!
//! Each relation operator compiles into one constraint object. The check
//! function is specialized at construction time from a small fixed table
//! keyed on (range, label presence, negation, operand kinds), so the hot
//! check loop runs a plain stored function pointer without branching on
//! modifiers. Constraints also contribute pushdown filters to their
//! operands' node searches, the operand kinds used for type refinement,
//! and a single-match direction used by the checker's prefilter.

use std::fmt;

use crate::ast::{CornerSide, RangeSpec, RelationOp};
use crate::error::{NameKind, QueryError};
use crate::result::EvalContext;
use crate::store::{Continuity, IndexedStore, LabelId, NodeFilter, NodeRecord, SecEdgeEnd};
use crate::variable::NodeKind;

/// Short-circuit hint for 1:1 relations: in the stated direction, a
/// candidate can match at most one partner, so the checker's prefilter may
/// stop scanning after the first success. Only set for non-negated checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LeftToRight,
    RightToLeft,
    None,
    Both,
}

/// A compiled relational constraint between two node variables.
pub trait NodeConstraint: fmt::Debug + Send + Sync {
    /// Evaluates the constraint for one (left, right) candidate pair.
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool;

    /// Store filters this constraint contributes to its operands' node
    /// searches, as `(left filters, right filters)`. Filters are only
    /// pushed for non-negated constraints; a negated constraint is also
    /// satisfied by nodes the filter would exclude.
    fn pushed_filters(&self, right_kind: NodeKind) -> (Vec<NodeFilter>, Vec<NodeFilter>) {
        let _ = right_kind;
        (Vec::new(), Vec::new())
    }

    /// The node kind each operand must have, for type refinement.
    fn operand_kinds(&self) -> (NodeKind, NodeKind) {
        (NodeKind::Unknown, NodeKind::Unknown)
    }

    fn single_match_direction(&self) -> Direction {
        Direction::None
    }
}

type CheckFn<C> = fn(&C, &NodeRecord, &NodeRecord, &mut EvalContext<'_>) -> bool;

/// `L . R`: R's effective token order exceeds L's by a value within range.
pub struct PrecedenceConstraint {
    min: u32,
    max: u32,
    /// What the raw condition must equal; `false` for negated constraints.
    expected: bool,
    direction: Direction,
    check: CheckFn<PrecedenceConstraint>,
}

impl PrecedenceConstraint {
    pub fn new(range: RangeSpec, negated: bool, kinds: (NodeKind, NodeKind)) -> Self {
        let mut constraint = PrecedenceConstraint {
            min: 1,
            max: 1,
            expected: !negated,
            direction: Direction::None,
            check: Self::check_general,
        };
        match range {
            RangeSpec::Bounded(1, 1) => {
                if kinds == (NodeKind::Terminal, NodeKind::Terminal) {
                    constraint.check = Self::check_immediate_tt;
                    // A terminal has exactly one immediate predecessor and
                    // one immediate successor.
                    if !negated {
                        constraint.direction = Direction::Both;
                    }
                } else {
                    constraint.check = Self::check_immediate;
                }
            }
            RangeSpec::Bounded(min, max) => {
                constraint.min = min;
                constraint.max = max;
                constraint.check = Self::check_ranged;
            }
            RangeSpec::Unbounded => constraint.check = Self::check_general,
        }
        constraint
    }

    fn check_immediate_tt(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        (l.token_order + 1 == r.token_order) == self.expected
    }

    fn check_immediate(&self, l: &NodeRecord, r: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        let (l, r) = (ctx.effective_order(l), ctx.effective_order(r));
        (l + 1 == r) == self.expected
    }

    fn check_general(&self, l: &NodeRecord, r: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        let (l, r) = (ctx.effective_order(l), ctx.effective_order(r));
        (l < r) == self.expected
    }

    fn check_ranged(&self, l: &NodeRecord, r: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        let diff = ctx.effective_order(r) as i64 - ctx.effective_order(l) as i64;
        (self.min as i64 <= diff && diff <= self.max as i64) == self.expected
    }
}

impl fmt::Debug for PrecedenceConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecedenceConstraint")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("expected", &self.expected)
            .finish()
    }
}

impl NodeConstraint for PrecedenceConstraint {
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        (self.check)(self, left, right, ctx)
    }

    fn single_match_direction(&self) -> Direction {
        self.direction
    }
}

/// `L > R`: R's gorn address extends L's by a length within range, with an
/// optional label match on R's incoming edge.
pub struct DominanceConstraint {
    min: u32,
    max: u32,
    label: Option<LabelId>,
    negated: bool,
    expected: bool,
    direction: Direction,
    check: CheckFn<DominanceConstraint>,
}

impl DominanceConstraint {
    pub fn new(range: RangeSpec, label: Option<LabelId>, negated: bool) -> Self {
        // The grammar only attaches labels to the immediate form.
        debug_assert!(label.is_none() || range.is_immediate());
        let mut constraint = DominanceConstraint {
            min: 1,
            max: 1,
            label,
            negated,
            expected: !negated,
            direction: Direction::None,
            check: Self::check_general,
        };
        match range {
            RangeSpec::Bounded(1, 1) => {
                // Every node has exactly one parent.
                if !negated {
                    constraint.direction = Direction::RightToLeft;
                }
                constraint.check = if label.is_some() {
                    Self::check_immediate_labeled
                } else {
                    Self::check_immediate
                };
            }
            RangeSpec::Bounded(min, max) => {
                constraint.min = min;
                constraint.max = max;
                constraint.check = Self::check_ranged;
            }
            RangeSpec::Unbounded => {
                constraint.check = if negated {
                    Self::check_general_negated
                } else {
                    Self::check_general
                };
            }
        }
        constraint
    }

    fn check_immediate(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        l.dominates_within(r, 1, 1) == self.expected
    }

    fn check_immediate_labeled(
        &self,
        l: &NodeRecord,
        r: &NodeRecord,
        _ctx: &mut EvalContext<'_>,
    ) -> bool {
        (l.dominates_within(r, 1, 1) && Some(r.edge_label) == self.label) == self.expected
    }

    fn check_ranged(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        l.dominates_within(r, self.min as usize, self.max as usize) == self.expected
    }

    fn check_general(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        l.dominates(r)
    }

    fn check_general_negated(
        &self,
        l: &NodeRecord,
        r: &NodeRecord,
        _ctx: &mut EvalContext<'_>,
    ) -> bool {
        !l.dominates(r)
    }
}

impl fmt::Debug for DominanceConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DominanceConstraint")
            .field("min", &self.min)
            .field("max", &self.max)
            .field("label", &self.label)
            .field("negated", &self.negated)
            .finish()
    }
}

impl NodeConstraint for DominanceConstraint {
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        (self.check)(self, left, right, ctx)
    }

    fn pushed_filters(&self, right_kind: NodeKind) -> (Vec<NodeFilter>, Vec<NodeFilter>) {
        if self.negated {
            return (Vec::new(), Vec::new());
        }
        let mut left = Vec::new();
        if right_kind == NodeKind::Nonterminal {
            left.push(NodeFilter::HasNonterminalChild);
        }
        let right = match self.label {
            Some(label) => vec![NodeFilter::EdgeLabel(label)],
            None => Vec::new(),
        };
        (left, right)
    }

    fn operand_kinds(&self) -> (NodeKind, NodeKind) {
        (NodeKind::Nonterminal, NodeKind::Unknown)
    }

    fn single_match_direction(&self) -> Direction {
        self.direction
    }
}

/// `L >@l R` / `L >@r R`: R is L's corner terminal, or R is L itself when L
/// is a terminal.
pub struct CornerConstraint {
    side: CornerSide,
    negated: bool,
    check: CheckFn<CornerConstraint>,
}

impl CornerConstraint {
    pub fn new(side: CornerSide, negated: bool) -> Self {
        let check = match (side, negated) {
            (CornerSide::Left, false) => Self::check_left,
            (CornerSide::Left, true) => Self::check_left_negated,
            (CornerSide::Right, false) => Self::check_right,
            (CornerSide::Right, true) => Self::check_right_negated,
        };
        CornerConstraint {
            side,
            negated,
            check,
        }
    }

    fn holds(corner: crate::store::NodeId, l: &NodeRecord, r: &NodeRecord) -> bool {
        corner == r.id || (r.id == l.id && l.continuity == Continuity::Token)
    }

    fn check_left(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        Self::holds(l.left_corner, l, r)
    }

    fn check_left_negated(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        !Self::holds(l.left_corner, l, r)
    }

    fn check_right(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        Self::holds(l.right_corner, l, r)
    }

    fn check_right_negated(
        &self,
        l: &NodeRecord,
        r: &NodeRecord,
        _ctx: &mut EvalContext<'_>,
    ) -> bool {
        !Self::holds(l.right_corner, l, r)
    }
}

impl fmt::Debug for CornerConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CornerConstraint")
            .field("side", &self.side)
            .field("negated", &self.negated)
            .finish()
    }
}

impl NodeConstraint for CornerConstraint {
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        (self.check)(self, left, right, ctx)
    }

    fn operand_kinds(&self) -> (NodeKind, NodeKind) {
        (NodeKind::Unknown, NodeKind::Terminal)
    }
}

/// `L >~ R`: a secondary edge from L to R exists in the store, optionally
/// with a matching label.
pub struct SecEdgeConstraint {
    label: Option<LabelId>,
    negated: bool,
}

impl SecEdgeConstraint {
    pub fn new(label: Option<LabelId>, negated: bool) -> Self {
        SecEdgeConstraint { label, negated }
    }
}

impl fmt::Debug for SecEdgeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecEdgeConstraint")
            .field("label", &self.label)
            .field("negated", &self.negated)
            .finish()
    }
}

impl NodeConstraint for SecEdgeConstraint {
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        ctx.has_secedge(left.id, right.id, self.label) != self.negated
    }

    fn pushed_filters(&self, _right_kind: NodeKind) -> (Vec<NodeFilter>, Vec<NodeFilter>) {
        if self.negated {
            (Vec::new(), Vec::new())
        } else {
            (
                vec![NodeFilter::HasSecEdge(SecEdgeEnd::Origin)],
                vec![NodeFilter::HasSecEdge(SecEdgeEnd::Target)],
            )
        }
    }
}

/// `L $ R`: L and R share a parent; `$.*` additionally requires L's
/// effective order to precede R's.
pub struct SiblingConstraint {
    ordered: bool,
    negated: bool,
    check: CheckFn<SiblingConstraint>,
}

impl SiblingConstraint {
    pub fn new(ordered: bool, negated: bool) -> Self {
        // The grammar rejects a negated ordered sibling operator.
        debug_assert!(!(ordered && negated));
        let check = if ordered {
            Self::check_ordered
        } else if negated {
            Self::check_negated
        } else {
            Self::check_normal
        };
        SiblingConstraint {
            ordered,
            negated,
            check,
        }
    }

    fn check_normal(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        l.is_sibling_of(r)
    }

    fn check_negated(&self, l: &NodeRecord, r: &NodeRecord, _ctx: &mut EvalContext<'_>) -> bool {
        !l.is_sibling_of(r)
    }

    fn check_ordered(&self, l: &NodeRecord, r: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        l.is_sibling_of(r) && ctx.effective_order(l) < ctx.effective_order(r)
    }
}

impl fmt::Debug for SiblingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiblingConstraint")
            .field("ordered", &self.ordered)
            .field("negated", &self.negated)
            .finish()
    }
}

impl NodeConstraint for SiblingConstraint {
    fn check(&self, left: &NodeRecord, right: &NodeRecord, ctx: &mut EvalContext<'_>) -> bool {
        (self.check)(self, left, right, ctx)
    }
}

/// Builds the constraint for a relation operator, resolving edge labels
/// against the store. Unknown labels fail here, at compile time.
pub fn from_op(
    op: &RelationOp,
    kinds: (NodeKind, NodeKind),
    store: &dyn IndexedStore,
) -> Result<Box<dyn NodeConstraint>, QueryError> {
    match op {
        RelationOp::Precedence { range, negated } => {
            Ok(Box::new(PrecedenceConstraint::new(*range, *negated, kinds)))
        }
        RelationOp::Dominance {
            range,
            label,
            negated,
        } => {
            let label = resolve_label(label.as_deref(), NameKind::EdgeLabel, |l| {
                store.edge_label_id(l)
            })?;
            Ok(Box::new(DominanceConstraint::new(*range, label, *negated)))
        }
        RelationOp::Corner { side, negated } => Ok(Box::new(CornerConstraint::new(*side, *negated))),
        RelationOp::SecEdge { label, negated } => {
            let label = resolve_label(label.as_deref(), NameKind::SecEdgeLabel, |l| {
                store.secedge_label_id(l)
            })?;
            Ok(Box::new(SecEdgeConstraint::new(label, *negated)))
        }
        RelationOp::Sibling { ordered, negated } => {
            Ok(Box::new(SiblingConstraint::new(*ordered, *negated)))
        }
    }
}

fn resolve_label(
    label: Option<&str>,
    kind: NameKind,
    resolve: impl Fn(&str) -> Option<LabelId>,
) -> Result<Option<LabelId>, QueryError> {
    match label {
        None => Ok(None),
        Some(name) => match resolve(name) {
            Some(id) => Ok(Some(id)),
            None => Err(QueryError::UndefinedName {
                kind,
                name: name.to_string(),
            }),
        },
    }
}
