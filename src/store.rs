//! The indexed-store interface the query engine runs against.
//!
//! The engine never sees raw corpus text; it queries a read-only store of
//! node records, feature values and edge labels that an external indexer has
//! produced. [`IndexedStore`] is the full contract: resolving names to ids,
//! filtered node lookups ordered by tree id, record fetches, secondary-edge
//! probes, and ephemeral value sets materialized from regex constraints.

use regex::Regex;

/// Node id, unique across the whole corpus.
pub type NodeId = u32;
/// Tree (sentence graph) id.
pub type TreeId = u32;
/// Feature id (e.g. `cat`, `pos`, `word`).
pub type FeatureId = u32;
/// Id of one value of one feature.
pub type FeatureValueId = u32;
/// Edge-label or secondary-edge-label id.
pub type LabelId = u32;
/// Handle for a query-scoped regex value set.
pub type ValueSetId = u32;

/// Continuity of a node's terminal yield. Terminals are their own case:
/// a token trivially spans itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// A terminal (token) node.
    Token,
    /// Nonterminal whose terminal yield is a contiguous token span.
    Continuous,
    /// Nonterminal with gaps in its terminal yield.
    Discontinuous,
}

impl Continuity {
    pub fn is_terminal(self) -> bool {
        self == Continuity::Token
    }
}

/// The fixed per-node tuple supplied by the store. Read-only; the evaluator
/// caches records per tree and drops the cache when moving on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub tree_id: TreeId,
    /// Label of the incoming (parent) edge; roots carry the store's
    /// designated root label.
    pub edge_label: LabelId,
    pub continuity: Continuity,
    /// Leftmost terminal descendant by token order (self for terminals).
    pub left_corner: NodeId,
    /// Rightmost terminal descendant by token order (self for terminals).
    pub right_corner: NodeId,
    /// 1-based token position; for continuous nonterminals the left
    /// corner's position.
    pub token_order: u32,
    /// Path of child indices from the root; empty for the root itself.
    pub gorn: Vec<u16>,
}

impl NodeRecord {
    /// True iff `self` dominates `other` with a gorn-address extension of
    /// length within `[min, max]`.
    pub fn dominates_within(&self, other: &NodeRecord, min: usize, max: usize) -> bool {
        let l = self.gorn.len();
        let r = other.gorn.len();
        r >= l + min && r <= l + max && other.gorn[..l] == self.gorn[..]
    }

    /// True iff `self` dominates `other` at any depth >= 1.
    pub fn dominates(&self, other: &NodeRecord) -> bool {
        let l = self.gorn.len();
        other.gorn.len() > l && other.gorn[..l] == self.gorn[..]
    }

    /// True iff both nodes share a parent (equal gorn address minus the
    /// last component).
    pub fn is_sibling_of(&self, other: &NodeRecord) -> bool {
        !self.gorn.is_empty()
            && self.gorn.len() == other.gorn.len()
            && self.gorn[..self.gorn.len() - 1] == other.gorn[..other.gorn.len() - 1]
    }
}

/// Match sense of a feature-value filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchPolicy {
    Match,
    NoMatch,
}

/// Which end of a secondary edge a node must participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecEdgeEnd {
    Origin,
    Target,
}

/// Which arity column an arity filter addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArityField {
    /// Number of children.
    Arity,
    /// Number of terminal descendants.
    TokenArity,
}

/// Node kind filter values; `Unknown` never reaches the store.
pub use crate::variable::NodeKind;

/// A non-feature filter on node lookups. These are the compiled forms of
/// predicates and of filters pushed down from relational constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFilter {
    /// Terminal / nonterminal.
    Kind(NodeKind),
    /// Gorn address has length zero.
    Root,
    /// Continuity flag matches exactly.
    Continuity(Continuity),
    /// Child count or terminal-descendant count within `[min, max]`.
    ArityRange {
        field: ArityField,
        min: u32,
        max: u32,
    },
    /// Incoming edge label equals the id.
    EdgeLabel(LabelId),
    /// At least one child is a nonterminal. Pushed down from dominance
    /// constraints whose right side is a nonterminal; every ancestor of a
    /// nonterminal has one.
    HasNonterminalChild,
    /// Node participates in at least one secondary edge at the given end.
    HasSecEdge(SecEdgeEnd),
    /// Owning tree id within `[start, end)`; `end = None` means unbounded.
    /// Used to partition the corpus for parallel evaluation.
    TreeRange { start: TreeId, end: Option<TreeId> },
}

/// An equality filter on one feature's value id.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatch {
    pub feature: FeatureId,
    pub policy: MatchPolicy,
    pub value: FeatureValueId,
}

/// A membership filter against a materialized regex value set.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSetMatch {
    pub feature: FeatureId,
    pub set: ValueSetId,
}

/// One DNF disjunct of a node lookup: all parts must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeLookup {
    pub features: Vec<FeatureMatch>,
    pub value_sets: Vec<ValueSetMatch>,
    pub filters: Vec<NodeFilter>,
}

/// A compiled per-variable lookup: the union of its disjuncts, ordered by
/// owning tree id so downstream merging is a linear scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeQuery {
    pub disjuncts: Vec<NodeLookup>,
}

/// Which node kind a feature is declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureDomain {
    Terminal,
    Nonterminal,
    Both,
}

impl FeatureDomain {
    /// The node kind implied by using this feature in a constraint.
    pub fn implied_kind(self) -> NodeKind {
        match self {
            FeatureDomain::Terminal => NodeKind::Terminal,
            FeatureDomain::Nonterminal => NodeKind::Nonterminal,
            FeatureDomain::Both => NodeKind::Unknown,
        }
    }
}

/// Schema information about one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureInfo {
    pub id: FeatureId,
    pub domain: FeatureDomain,
}

/// The read-only indexed corpus store.
///
/// Node lookups must return `(node id, tree id)` pairs in non-decreasing
/// tree-id order. Value sets are query-scoped: the caller releases them when
/// the evaluation that materialized them finishes.
pub trait IndexedStore {
    /// Resolves a feature name; `None` means the name is not in the schema.
    fn feature(&self, name: &str) -> Option<FeatureInfo>;

    /// Resolves one value of a feature to its stable id; `None` means the
    /// value occurs nowhere in the corpus.
    fn feature_value_id(&self, feature: FeatureId, value: &str) -> Option<FeatureValueId>;

    fn edge_label_id(&self, label: &str) -> Option<LabelId>;

    fn secedge_label_id(&self, label: &str) -> Option<LabelId>;

    /// Materializes the set of value ids of `feature` whose string matches
    /// (`MatchPolicy::Match`) or does not match (`NoMatch`) the regex. The
    /// regex is already anchored for full-string matching. Returns a handle
    /// plus the set's cardinality, so an empty set can short-circuit the
    /// query upstream.
    fn materialize_value_set(
        &self,
        feature: FeatureId,
        policy: MatchPolicy,
        regex: &Regex,
    ) -> (ValueSetId, usize);

    /// Releases a value set created by `materialize_value_set`.
    fn release_value_set(&self, set: ValueSetId);

    /// Runs a compiled node lookup. The result is ordered by tree id.
    fn search_nodes(&self, query: &NodeQuery) -> Box<dyn Iterator<Item = (NodeId, TreeId)> + '_>;

    /// Fetches the full record of a node.
    fn node(&self, id: NodeId) -> NodeRecord;

    /// True iff a secondary edge `origin -> target` exists, with the given
    /// label if one is specified.
    fn has_secedge(&self, origin: NodeId, target: NodeId, label: Option<LabelId>) -> bool;

    /// Total number of trees in the corpus.
    fn tree_count(&self) -> u32;
}
