//! Result set construction.
//!
//! The node searcher yields per-tree candidate sets for every query
//! variable; this module turns them into variable bindings. Queries without
//! relational constraints go through [`LazyResultSet`], a plain cross
//! product. Constrained queries run the [`ConstraintChecker`], which orders
//! the constraint schedule by candidate-set size (sampled over the first
//! trees, then frozen), prefilters candidates pairwise, and only then
//! enumerates the remaining cross product.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::constraints::Direction;
use crate::error::QueryError;
use crate::factory::{CompiledQuery, ExecutionMode};
use crate::nodesearcher::{search_graphs, TreeCandidates, TreePartition};
use crate::store::{Continuity, IndexedStore, LabelId, NodeId, NodeRecord, TreeId};
use crate::variable::VarId;

/// One query match: node ids bound to the non-set variables.
pub type Binding = BTreeMap<VarId, NodeId>;

/// All matches within one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMatches {
    pub tree_id: TreeId,
    pub matches: Vec<Binding>,
}

/// Evaluation counters, aggregated across partitions in parallel runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub trees_checked: u64,
    pub constraint_checks: u64,
    pub node_cache_hits: u64,
    pub node_cache_misses: u64,
}

impl EvalStats {
    fn absorb(&mut self, other: &EvalStats) {
        self.trees_checked += other.trees_checked;
        self.constraint_checks += other.constraint_checks;
        self.node_cache_hits += other.node_cache_hits;
        self.node_cache_misses += other.node_cache_misses;
    }
}

/// Per-evaluation state shared with constraint checks: the store handle, a
/// node record cache scoped to the current tree, and counters.
pub struct EvalContext<'a> {
    store: &'a dyn IndexedStore,
    cache: FxHashMap<NodeId, Rc<NodeRecord>>,
    pub stats: EvalStats,
}

impl<'a> EvalContext<'a> {
    pub fn new(store: &'a dyn IndexedStore) -> Self {
        EvalContext {
            store,
            cache: FxHashMap::default(),
            stats: EvalStats::default(),
        }
    }

    pub fn store(&self) -> &'a dyn IndexedStore {
        self.store
    }

    /// Fetches a node record through the per-tree cache.
    pub fn node(&mut self, id: NodeId) -> Rc<NodeRecord> {
        if let Some(record) = self.cache.get(&id) {
            self.stats.node_cache_hits += 1;
            return Rc::clone(record);
        }
        self.stats.node_cache_misses += 1;
        let record = Rc::new(self.store.node(id));
        self.cache.insert(id, Rc::clone(&record));
        record
    }

    /// Token position used for precedence checks. Discontinuous nodes use
    /// their left corner's position.
    pub fn effective_order(&mut self, record: &NodeRecord) -> u32 {
        if record.continuity == Continuity::Discontinuous {
            self.node(record.left_corner).token_order
        } else {
            record.token_order
        }
    }

    pub fn has_secedge(&mut self, origin: NodeId, target: NodeId, label: Option<LabelId>) -> bool {
        self.store.has_secedge(origin, target, label)
    }

    /// Drops the node cache when evaluation moves to the next tree.
    pub fn enter_tree(&mut self) {
        self.cache.clear();
        self.stats.trees_checked += 1;
    }
}

/// Cross product over named candidate lists, yielding one binding per
/// combination. An empty item list yields a single empty binding; an empty
/// candidate list yields nothing.
struct CrossProduct<'a> {
    items: &'a [(VarId, Vec<NodeId>)],
    indices: Vec<usize>,
    done: bool,
}

impl<'a> CrossProduct<'a> {
    fn new(items: &'a [(VarId, Vec<NodeId>)]) -> Self {
        CrossProduct {
            items,
            indices: vec![0; items.len()],
            done: items.iter().any(|(_, candidates)| candidates.is_empty()),
        }
    }
}

impl Iterator for CrossProduct<'_> {
    type Item = Binding;

    fn next(&mut self) -> Option<Binding> {
        if self.done {
            return None;
        }
        let binding = self
            .items
            .iter()
            .zip(&self.indices)
            .map(|((var, candidates), &idx)| (*var, candidates[idx]))
            .collect();
        let mut pos = self.items.len();
        loop {
            if pos == 0 {
                self.done = true;
                break;
            }
            pos -= 1;
            self.indices[pos] += 1;
            if self.indices[pos] < self.items[pos].1.len() {
                break;
            }
            self.indices[pos] = 0;
        }
        Some(binding)
    }
}

/// Result set of a constraint-free tree: every combination of the non-set
/// variables' candidates matches.
pub struct LazyResultSet {
    items: Vec<(VarId, Vec<NodeId>)>,
}

impl LazyResultSet {
    pub fn new(query: &CompiledQuery, candidates: &TreeCandidates) -> Self {
        let items = query
            .vars
            .iter()
            .filter(|(_, var)| !var.is_set())
            .map(|(id, _)| (id, candidates[id].clone()))
            .collect();
        LazyResultSet { items }
    }

    pub fn len(&self) -> usize {
        self.items
            .iter()
            .map(|(_, candidates)| candidates.len())
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Binding> + '_ {
        CrossProduct::new(&self.items)
    }
}

/// One step of the prepared constraint schedule. `exchanged` means the
/// stored constraint relates (right, left) and the operands must be swapped
/// before checking. `fail_after_success` means the constraint's single-match
/// direction guarantees at most one partner per scheduled left node, so the
/// scan can stop at the first hit.
#[derive(Debug, Clone, Copy)]
struct ScheduledConstraint {
    left: VarId,
    right: VarId,
    index: usize,
    exchanged: bool,
    fail_after_success: bool,
}

/// A frozen constraint evaluation order.
#[derive(Debug, Clone)]
pub struct CheckerPlan {
    schedule: Vec<ScheduledConstraint>,
}

impl CheckerPlan {
    /// Orders the constrained variables by ascending candidate count (set
    /// variables last) and schedules every constraint at the earliest pair
    /// position, smaller variable on the left.
    pub fn prepare(query: &CompiledQuery, sizes: &[u64]) -> CheckerPlan {
        let mut vars: Vec<VarId> = Vec::new();
        for entry in &query.constraints {
            for var in [entry.left, entry.right] {
                if !vars.contains(&var) {
                    vars.push(var);
                }
            }
        }
        let set_weight: u64 = sizes.iter().sum::<u64>() + 1;
        vars.sort_by_key(|&var| {
            let weight = if query.vars.get(var).is_set() {
                set_weight
            } else {
                sizes.get(var).copied().unwrap_or(0)
            };
            (weight, var)
        });

        let mut schedule = Vec::new();
        for lower in 1..vars.len() {
            for upper in 0..lower {
                let (small, large) = (vars[upper], vars[lower]);
                for (index, entry) in query.constraints.iter().enumerate() {
                    if entry.left == small && entry.right == large {
                        let direction = entry.constraint.single_match_direction();
                        schedule.push(ScheduledConstraint {
                            left: small,
                            right: large,
                            index,
                            exchanged: false,
                            fail_after_success: matches!(
                                direction,
                                Direction::Both | Direction::LeftToRight
                            ),
                        });
                    } else if entry.left == large && entry.right == small {
                        let direction = entry.constraint.single_match_direction();
                        schedule.push(ScheduledConstraint {
                            left: small,
                            right: large,
                            index,
                            exchanged: true,
                            fail_after_success: matches!(
                                direction,
                                Direction::Both | Direction::RightToLeft
                            ),
                        });
                    }
                }
            }
        }
        CheckerPlan { schedule }
    }
}

/// Evaluates the constraint schedule against one tree's candidate sets.
pub struct ConstraintChecker<'a> {
    plan: &'a CheckerPlan,
    query: &'a CompiledQuery,
    ok: Vec<FxHashSet<(NodeId, NodeId)>>,
}

impl<'a> ConstraintChecker<'a> {
    pub fn new(plan: &'a CheckerPlan, query: &'a CompiledQuery) -> Self {
        ConstraintChecker {
            plan,
            query,
            ok: vec![FxHashSet::default(); plan.schedule.len()],
        }
    }

    /// Prefilters the candidate sets, then extracts the matching bindings.
    pub fn evaluate(
        mut self,
        candidates: &mut TreeCandidates,
        ctx: &mut EvalContext<'_>,
    ) -> Vec<Binding> {
        if !self.prefilter(candidates, ctx) {
            return Vec::new();
        }
        self.extract(candidates)
    }

    /// Pairwise constraint pass. Candidates that survive no pairing with the
    /// partner variable are removed, narrowing later constraints. A set
    /// variable on the right requires the constraint to hold against every
    /// one of its candidates.
    fn prefilter(&mut self, candidates: &mut TreeCandidates, ctx: &mut EvalContext<'_>) -> bool {
        for (step, sc) in self.plan.schedule.iter().enumerate() {
            let entry = &self.query.constraints[sc.index];
            let right_is_set = self.query.vars.get(sc.right).is_set();
            let mut left_ok: FxHashSet<NodeId> = FxHashSet::default();
            let mut right_ok: FxHashSet<NodeId> = FxHashSet::default();

            for &left in &candidates[sc.left] {
                let left_record = ctx.node(left);
                let mut broke = false;
                for &right in &candidates[sc.right] {
                    let right_record = ctx.node(right);
                    let (first, second) = if sc.exchanged {
                        (&*right_record, &*left_record)
                    } else {
                        (&*left_record, &*right_record)
                    };
                    ctx.stats.constraint_checks += 1;
                    if entry.constraint.check(first, second, ctx) {
                        self.ok[step].insert((left, right));
                        if !right_is_set {
                            left_ok.insert(left);
                            right_ok.insert(right);
                            if sc.fail_after_success {
                                broke = true;
                                break;
                            }
                        }
                    } else if right_is_set {
                        broke = true;
                        break;
                    }
                }
                if right_is_set && !broke {
                    left_ok.insert(left);
                    right_ok.extend(candidates[sc.right].iter().copied());
                }
            }

            if left_ok.is_empty() {
                return false;
            }
            if right_ok.is_empty() && !right_is_set {
                return false;
            }
            candidates[sc.left] = sorted(left_ok);
            candidates[sc.right] = sorted(right_ok);
        }
        true
    }

    fn extract(&self, candidates: &TreeCandidates) -> Vec<Binding> {
        let items: Vec<(VarId, Vec<NodeId>)> = self
            .query
            .vars
            .iter()
            .filter(|(_, var)| !var.is_set())
            .map(|(id, _)| (id, candidates[id].clone()))
            .collect();
        CrossProduct::new(&items)
            .filter(|binding| self.passes(binding, candidates))
            .collect()
    }

    /// Re-checks a full binding against the recorded ok-pairs. Needed
    /// because the prefilter only guarantees per-pair consistency, not that
    /// one node combination satisfies all constraints at once.
    fn passes(&self, binding: &Binding, candidates: &TreeCandidates) -> bool {
        for (step, sc) in self.plan.schedule.iter().enumerate() {
            let ok = &self.ok[step];
            let left_set = self.query.vars.get(sc.left).is_set();
            let right_set = self.query.vars.get(sc.right).is_set();
            let holds = match (left_set, right_set) {
                (false, false) => ok.contains(&(binding[&sc.left], binding[&sc.right])),
                (false, true) => candidates[sc.right]
                    .iter()
                    .all(|&right| ok.contains(&(binding[&sc.left], right))),
                (true, false) => candidates[sc.left]
                    .iter()
                    .all(|&left| ok.contains(&(left, binding[&sc.right]))),
                (true, true) => candidates[sc.left].iter().all(|&left| {
                    candidates[sc.right]
                        .iter()
                        .all(|&right| ok.contains(&(left, right)))
                }),
            };
            if !holds {
                return false;
            }
        }
        true
    }
}

fn sorted(set: FxHashSet<NodeId>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = set.into_iter().collect();
    ids.sort_unstable();
    ids
}

/// Evaluation knobs.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Number of trees whose candidate counts are sampled before the
    /// constraint schedule is re-prepared and frozen.
    pub sample_trees: u64,
    /// Worker count for parallel evaluation.
    pub workers: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            sample_trees: 100,
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}

/// Sequential query evaluator over one tree partition.
pub struct ResultBuilder<'a> {
    store: &'a dyn IndexedStore,
    query: &'a CompiledQuery,
    options: EvalOptions,
}

impl<'a> ResultBuilder<'a> {
    pub fn new(store: &'a dyn IndexedStore, query: &'a CompiledQuery, options: EvalOptions) -> Self {
        ResultBuilder {
            store,
            query,
            options,
        }
    }

    /// Evaluates the query over the whole corpus.
    pub fn evaluate(&self) -> Result<(Vec<TreeMatches>, EvalStats), QueryError> {
        self.evaluate_partition(TreePartition::all())
    }

    /// Evaluates the query over one tree-id range.
    pub fn evaluate_partition(
        &self,
        partition: TreePartition,
    ) -> Result<(Vec<TreeMatches>, EvalStats), QueryError> {
        let mut ctx = EvalContext::new(self.store);
        let mut results = Vec::new();

        let graphs = search_graphs(self.store, self.query, partition)?;
        match self.query.mode {
            ExecutionMode::Lazy => {
                for (tree_id, candidates) in graphs {
                    ctx.enter_tree();
                    let matches: Vec<Binding> =
                        LazyResultSet::new(self.query, &candidates).iter().collect();
                    if !matches.is_empty() {
                        results.push(TreeMatches { tree_id, matches });
                    }
                }
            }
            ExecutionMode::Checked => {
                let mut counts = vec![0u64; self.query.vars.len()];
                let mut plan = CheckerPlan::prepare(self.query, &counts);
                for (tree_id, mut candidates) in graphs {
                    ctx.enter_tree();
                    if ctx.stats.trees_checked == self.options.sample_trees {
                        plan = CheckerPlan::prepare(self.query, &counts);
                        debug!("constraint schedule frozen after {} trees", ctx.stats.trees_checked);
                    } else if ctx.stats.trees_checked < self.options.sample_trees {
                        for (var, list) in candidates.iter().enumerate() {
                            counts[var] += list.len() as u64;
                        }
                    }
                    let checker = ConstraintChecker::new(&plan, self.query);
                    let matches = checker.evaluate(&mut candidates, &mut ctx);
                    if !matches.is_empty() {
                        results.push(TreeMatches { tree_id, matches });
                    }
                }
            }
        }
        Ok((results, ctx.stats))
    }
}

/// Evaluates the query in parallel over contiguous tree-id partitions, one
/// worker per partition. Workers share nothing but the store; partial
/// results are concatenated in partition order, so the output matches the
/// sequential evaluation.
pub fn evaluate_parallel<S: IndexedStore + Sync>(
    store: &S,
    query: &CompiledQuery,
    options: &EvalOptions,
) -> Result<(Vec<TreeMatches>, EvalStats), QueryError> {
    let tree_count = store.tree_count();
    let workers = options.workers.clamp(1, (tree_count as usize).max(1));
    if workers == 1 {
        return ResultBuilder::new(store, query, options.clone()).evaluate();
    }

    let chunk = tree_count.div_ceil(workers as u32);
    let mut outcomes: Vec<Option<(Vec<TreeMatches>, EvalStats)>> = Vec::new();
    outcomes.resize_with(workers, || None);

    thread::scope(|scope| -> Result<(), QueryError> {
        let (sender, receiver) = mpsc::channel();
        for worker in 0..workers {
            let sender = sender.clone();
            let options = options.clone();
            let partition = TreePartition {
                start: worker as u32 * chunk,
                end: if worker + 1 == workers {
                    None
                } else {
                    Some((worker as u32 + 1) * chunk)
                },
            };
            scope.spawn(move || {
                let builder = ResultBuilder::new(store, query, options);
                let outcome = builder.evaluate_partition(partition);
                // A send failure means the collector already gave up.
                let _ = sender.send((worker, outcome));
            });
        }
        drop(sender);

        for _ in 0..workers {
            let (worker, outcome) = receiver.recv().map_err(|_| QueryError::WorkerFailed)?;
            outcomes[worker] = Some(outcome?);
        }
        Ok(())
    })?;

    let mut results = Vec::new();
    let mut stats = EvalStats::default();
    for outcome in outcomes {
        let (partial, partial_stats) = outcome.ok_or(QueryError::WorkerFailed)?;
        results.extend(partial);
        stats.absorb(&partial_stats);
    }
    Ok((results, stats))
}
