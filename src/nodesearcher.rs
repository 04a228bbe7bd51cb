//! Node search: per-variable store lookups and the graph iterator.
//!
//! [`NodeQueryCompiler`] lowers each variable's DNF node description, its
//! predicates and any pushed-down constraint filters into a [`NodeQuery`]
//! against the indexed store. [`GraphIterator`] merge-joins the resulting
//! per-variable node streams, which are ordered by tree id, and yields one
//! candidate set per variable for every tree in which all required
//! variables have at least one candidate.

use std::iter::Peekable;

use log::debug;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::ast::Expr;
use crate::error::{NameKind, QueryError};
use crate::factory::{conjuncts, disjuncts, CompiledQuery};
use crate::predicates::{NodePredicate, SetPredicate};
use crate::store::{
    FeatureId, FeatureMatch, FeatureValueId, IndexedStore, MatchPolicy, NodeFilter, NodeId,
    NodeLookup, NodeQuery, TreeId, ValueSetId, ValueSetMatch,
};
use crate::variable::{NodeKind, VarId};

/// Per-tree candidate node ids, indexed by variable id.
pub type TreeCandidates = Vec<Vec<NodeId>>;

/// A contiguous tree-id range, used to partition the corpus for parallel
/// evaluation. `end = None` means up to the last tree.
#[derive(Debug, Clone, Copy)]
pub struct TreePartition {
    pub start: TreeId,
    pub end: Option<TreeId>,
}

impl TreePartition {
    pub fn all() -> Self {
        TreePartition {
            start: 0,
            end: None,
        }
    }

    fn filter(&self) -> Option<NodeFilter> {
        if self.start == 0 && self.end.is_none() {
            None
        } else {
            Some(NodeFilter::TreeRange {
                start: self.start,
                end: self.end,
            })
        }
    }
}

/// Compiles node descriptions into store lookups. Feature value ids are
/// cached per (feature, value); regex value sets are materialized once per
/// (feature, polarity, pattern) and torn down when the owning
/// [`GraphIterator`] is dropped.
pub struct NodeQueryCompiler<'a> {
    store: &'a dyn IndexedStore,
    value_cache: FxHashMap<(FeatureId, String), FeatureValueId>,
    set_cache: FxHashMap<(FeatureId, MatchPolicy, String), ValueSetId>,
    materialized: Vec<ValueSetId>,
}

impl<'a> NodeQueryCompiler<'a> {
    pub fn new(store: &'a dyn IndexedStore) -> Self {
        NodeQueryCompiler {
            store,
            value_cache: FxHashMap::default(),
            set_cache: FxHashMap::default(),
            materialized: Vec::new(),
        }
    }

    /// Compiles one variable's lookup: one [`NodeLookup`] per description
    /// disjunct, each carrying the variable's predicate and pushdown
    /// filters plus the partition filter.
    pub fn compile_variable(
        &mut self,
        query: &CompiledQuery,
        var: VarId,
        partition: TreePartition,
    ) -> Result<NodeQuery, QueryError> {
        let kind = query.vars.get(var).kind();
        let mut shared_filters: Vec<NodeFilter> = query.node_predicates[var]
            .iter()
            .map(NodePredicate::filter)
            .collect();
        shared_filters.extend(query.pushed_filters[var].iter().cloned());
        if let Some(filter) = partition.filter() {
            shared_filters.push(filter);
        }

        let mut all = Vec::new();
        for disjunct in disjuncts(&query.descriptions[var]) {
            let mut lookups = vec![NodeLookup::default()];
            let mut disjunct_kind = NodeKind::Unknown;
            for atom in conjuncts(disjunct) {
                match atom {
                    Expr::Nop => {}
                    Expr::FeatureRecord(record_kind) => {
                        if kind == NodeKind::Unknown {
                            disjunct_kind = *record_kind;
                        }
                    }
                    Expr::FeatureConstraint { feature, value } => {
                        let info =
                            self.store
                                .feature(feature)
                                .ok_or_else(|| QueryError::UndefinedName {
                                    kind: NameKind::Feature,
                                    name: feature.clone(),
                                })?;
                        self.add_value(&mut lookups, feature, info.id, MatchPolicy::Match, value)?;
                    }
                    other => {
                        return Err(QueryError::Syntax(format!(
                            "unexpected term in node description: {}",
                            other
                        )));
                    }
                }
            }
            for lookup in &mut lookups {
                if disjunct_kind != NodeKind::Unknown {
                    lookup.filters.push(NodeFilter::Kind(disjunct_kind));
                } else if kind != NodeKind::Unknown
                    && lookup.features.is_empty()
                    && lookup.value_sets.is_empty()
                    && !shared_filters.contains(&NodeFilter::Kind(kind))
                {
                    // Unconstrained lookups still narrow to the inferred
                    // node kind.
                    lookup.filters.push(NodeFilter::Kind(kind));
                }
                lookup.filters.extend(shared_filters.iter().cloned());
            }
            all.extend(lookups);
        }
        Ok(NodeQuery { disjuncts: all })
    }

    /// Lowers one feature value expression into match entries, forking the
    /// lookup list at value-level disjunctions.
    fn add_value(
        &mut self,
        lookups: &mut Vec<NodeLookup>,
        feature: &str,
        feature_id: FeatureId,
        policy: MatchPolicy,
        value: &Expr,
    ) -> Result<(), QueryError> {
        match value {
            Expr::StringLiteral(s) => {
                let value_id = self.value_id(feature_id, s)?;
                for lookup in lookups.iter_mut() {
                    self.push_feature_match(lookup, feature, feature_id, policy, value_id)?;
                }
                Ok(())
            }
            Expr::RegexLiteral(pattern) => {
                let set = self.value_set(feature_id, policy, pattern)?;
                for lookup in lookups.iter_mut() {
                    lookup.value_sets.push(ValueSetMatch {
                        feature: feature_id,
                        set,
                    });
                }
                Ok(())
            }
            Expr::Negation(inner) => {
                let flipped = match policy {
                    MatchPolicy::Match => MatchPolicy::NoMatch,
                    MatchPolicy::NoMatch => MatchPolicy::Match,
                };
                self.add_value(lookups, feature, feature_id, flipped, inner)
            }
            Expr::Conjunction(children) => {
                for child in children {
                    self.add_value(lookups, feature, feature_id, policy, child)?;
                }
                Ok(())
            }
            Expr::Disjunction(children) => {
                let base = std::mem::take(lookups);
                for child in children {
                    let mut branch = base.clone();
                    self.add_value(&mut branch, feature, feature_id, policy, child)?;
                    lookups.extend(branch);
                }
                Ok(())
            }
            other => Err(QueryError::Syntax(format!(
                "unexpected feature value: {}",
                other
            ))),
        }
    }

    /// Adds an equality entry, rejecting a second conflicting positive
    /// literal on the same feature and dropping exact duplicates.
    fn push_feature_match(
        &self,
        lookup: &mut NodeLookup,
        feature: &str,
        feature_id: FeatureId,
        policy: MatchPolicy,
        value: FeatureValueId,
    ) -> Result<(), QueryError> {
        for existing in &lookup.features {
            if existing.feature != feature_id {
                continue;
            }
            if existing.policy == policy && existing.value == value {
                return Ok(());
            }
            if existing.policy == MatchPolicy::Match
                && policy == MatchPolicy::Match
                && existing.value != value
            {
                return Err(QueryError::Conflict(feature.to_string()));
            }
        }
        lookup.features.push(FeatureMatch {
            feature: feature_id,
            policy,
            value,
        });
        Ok(())
    }

    fn value_id(&mut self, feature: FeatureId, value: &str) -> Result<FeatureValueId, QueryError> {
        if let Some(&id) = self.value_cache.get(&(feature, value.to_string())) {
            return Ok(id);
        }
        // A value that occurs nowhere in the corpus empties the whole query.
        let id = self
            .store
            .feature_value_id(feature, value)
            .ok_or(QueryError::EmptyResult)?;
        self.value_cache.insert((feature, value.to_string()), id);
        Ok(id)
    }

    fn value_set(
        &mut self,
        feature: FeatureId,
        policy: MatchPolicy,
        pattern: &str,
    ) -> Result<ValueSetId, QueryError> {
        let key = (feature, policy, pattern.to_string());
        if let Some(&set) = self.set_cache.get(&key) {
            return Ok(set);
        }
        // Anchor on both sides: feature values match as whole strings.
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|err| QueryError::BadRegex {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?;
        let (set, size) = self.store.materialize_value_set(feature, policy, &regex);
        self.materialized.push(set);
        if size == 0 {
            return Err(QueryError::EmptyResult);
        }
        self.set_cache.insert(key, set);
        Ok(set)
    }

    /// Releases all value sets materialized so far.
    fn release_sets(&mut self) {
        for set in self.materialized.drain(..) {
            self.store.release_value_set(set);
        }
        self.set_cache.clear();
    }
}

struct Cursor<'a> {
    iter: Peekable<Box<dyn Iterator<Item = (NodeId, TreeId)> + 'a>>,
    vars: Vec<VarId>,
    /// Cursors serving only Set variables do not gate tree selection and
    /// simply run dry when depleted.
    set_only: bool,
}

/// Merge-join over the per-variable node streams. Yields, per tree, the
/// candidate node ids of every variable. Trees missing candidates for a
/// non-Set variable are skipped; trees failing a set predicate are skipped.
pub struct GraphIterator<'a> {
    store: &'a dyn IndexedStore,
    cursors: Vec<Cursor<'a>>,
    set_predicates: Vec<(VarId, Vec<SetPredicate>)>,
    var_count: usize,
    value_sets: Vec<ValueSetId>,
}

impl std::fmt::Debug for GraphIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphIterator")
            .field("var_count", &self.var_count)
            .finish_non_exhaustive()
    }
}

impl Drop for GraphIterator<'_> {
    fn drop(&mut self) {
        for set in self.value_sets.drain(..) {
            self.store.release_value_set(set);
        }
    }
}

impl Iterator for GraphIterator<'_> {
    type Item = (TreeId, TreeCandidates);

    fn next(&mut self) -> Option<(TreeId, TreeCandidates)> {
        'trees: loop {
            // The next possible tree is the furthest-ahead required cursor.
            let mut target: Option<TreeId> = None;
            for cursor in self.cursors.iter_mut().filter(|c| !c.set_only) {
                match cursor.iter.peek() {
                    None => return None,
                    Some(&(_, tree)) => {
                        target = Some(target.map_or(tree, |t: TreeId| t.max(tree)));
                    }
                }
            }
            let mut target = target?;

            // Advance every required cursor to the target; overshooting
            // raises the target and restarts the alignment.
            loop {
                let mut moved = false;
                for cursor in self.cursors.iter_mut().filter(|c| !c.set_only) {
                    while matches!(cursor.iter.peek(), Some(&(_, tree)) if tree < target) {
                        cursor.iter.next();
                    }
                    match cursor.iter.peek() {
                        None => return None,
                        Some(&(_, tree)) if tree > target => {
                            target = tree;
                            moved = true;
                        }
                        _ => {}
                    }
                }
                if !moved {
                    break;
                }
            }

            let mut candidates: TreeCandidates = vec![Vec::new(); self.var_count];
            for cursor in &mut self.cursors {
                while matches!(cursor.iter.peek(), Some(&(_, tree)) if tree < target) {
                    cursor.iter.next();
                }
                let mut nodes = Vec::new();
                while matches!(cursor.iter.peek(), Some(&(_, tree)) if tree == target) {
                    if let Some((node, _)) = cursor.iter.next() {
                        nodes.push(node);
                    }
                }
                for &var in &cursor.vars {
                    candidates[var] = nodes.clone();
                }
            }

            for (var, preds) in &self.set_predicates {
                let size = candidates[*var].len();
                if !preds.iter().all(|p| p.check(size)) {
                    continue 'trees;
                }
            }
            return Some((target, candidates));
        }
    }
}

/// Compiles every variable's lookup and opens the merge-join iterator over
/// one tree partition. Variables with identical compiled lookups share one
/// cursor.
pub fn search_graphs<'a>(
    store: &'a dyn IndexedStore,
    query: &CompiledQuery,
    partition: TreePartition,
) -> Result<GraphIterator<'a>, QueryError> {
    let mut compiler = NodeQueryCompiler::new(store);
    let mut compiled: Vec<(NodeQuery, Vec<VarId>)> = Vec::new();
    for var in query.vars.ids() {
        let node_query = match compiler.compile_variable(query, var, partition) {
            Ok(q) => q,
            Err(err) => {
                compiler.release_sets();
                return Err(err);
            }
        };
        match compiled.iter_mut().find(|(q, _)| *q == node_query) {
            Some((_, vars)) => vars.push(var),
            None => compiled.push((node_query, vec![var])),
        }
    }
    debug!(
        "opening {} cursor(s) for {} variable(s)",
        compiled.len(),
        query.vars.len()
    );

    let mut cursors: Vec<Cursor<'a>> = compiled
        .into_iter()
        .map(|(node_query, vars)| {
            let set_only = vars.iter().all(|&v| query.vars.get(v).is_set());
            Cursor {
                iter: store.search_nodes(&node_query).peekable(),
                vars,
                set_only,
            }
        })
        .collect();

    // With only Set variables no cursor gates the trees; pad with one tick
    // per tree in the partition.
    if cursors.iter().all(|c| c.set_only) {
        let start = partition.start;
        let end = partition
            .end
            .map_or(store.tree_count(), |end| end.min(store.tree_count()));
        let padding: Box<dyn Iterator<Item = (NodeId, TreeId)> + 'a> =
            Box::new((start..end).map(|tree| (0, tree)));
        cursors.push(Cursor {
            iter: padding.peekable(),
            vars: Vec::new(),
            set_only: false,
        });
    }

    let set_predicates = query
        .vars
        .ids()
        .filter(|&var| !query.set_predicates[var].is_empty())
        .map(|var| (var, query.set_predicates[var].clone()))
        .collect();

    Ok(GraphIterator {
        store,
        cursors,
        set_predicates,
        var_count: query.vars.len(),
        value_sets: std::mem::take(&mut compiler.materialized),
    })
}
