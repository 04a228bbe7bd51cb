//! Query factory: from a normalized AST to a compiled query.
//!
//! A single traversal partitions the term list into node variable
//! definitions, predicates and relational constraints. Anonymous node
//! descriptions get synthesized variables, repeated definitions of one
//! variable merge by conjunction, and every variable's node kind is
//! inferred from its feature constraints and refined by the relations it
//! participates in. The result is a [`CompiledQuery`] that is immutable
//! and reusable across evaluations.

use log::debug;

use crate::ast::{Expr, RelationOp, Variable};
use crate::constraints::{self, NodeConstraint};
use crate::error::{NameKind, QueryError};
use crate::normalizer::Normalizer;
use crate::predicates::{self, NodePredicate, Predicate, SetPredicate};
use crate::store::{IndexedStore, NodeFilter};
use crate::variable::{ContainerKind, NodeKind, VarId, VariableTable};

/// One relational constraint between two registered variables.
pub struct ConstraintEntry {
    pub left: VarId,
    pub right: VarId,
    pub constraint: Box<dyn NodeConstraint>,
}

impl std::fmt::Debug for ConstraintEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?} {}", self.left, self.constraint, self.right)
    }
}

/// How the evaluator combines candidate sets per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// No relations between variables: plain lazy cross-product of the
    /// candidate sets.
    Lazy,
    /// A connected constraint graph: full constraint checking.
    Checked,
}

/// The compiled form of one query string. Immutable once built; safe to
/// share across threads and reuse for repeated evaluation.
#[derive(Debug)]
pub struct CompiledQuery {
    pub vars: VariableTable,
    /// Per variable: the DNF feature expression of its node description
    /// (`Nop` for variables that are only referenced).
    pub descriptions: Vec<Expr>,
    pub node_predicates: Vec<Vec<NodePredicate>>,
    pub set_predicates: Vec<Vec<SetPredicate>>,
    /// Per variable: filters pushed down from constraints.
    pub pushed_filters: Vec<Vec<NodeFilter>>,
    pub constraints: Vec<ConstraintEntry>,
    pub mode: ExecutionMode,
}

impl CompiledQuery {
    pub fn var_id(&self, name: &str) -> Option<VarId> {
        self.vars.lookup(name)
    }
}

pub struct QueryFactory<'a, S: IndexedStore> {
    store: &'a S,
    vars: VariableTable,
    descriptions: Vec<Expr>,
    node_predicates: Vec<Vec<NodePredicate>>,
    set_predicates: Vec<Vec<SetPredicate>>,
    pushed_filters: Vec<Vec<NodeFilter>>,
    pending_predicates: Vec<(String, Vec<Expr>)>,
    pending_relations: Vec<(VarId, VarId, RelationOp)>,
    anon_counter: usize,
}

impl<'a, S: IndexedStore> QueryFactory<'a, S> {
    pub fn new(store: &'a S) -> Self {
        QueryFactory {
            store,
            vars: VariableTable::new(),
            descriptions: Vec::new(),
            node_predicates: Vec::new(),
            set_predicates: Vec::new(),
            pushed_filters: Vec::new(),
            pending_predicates: Vec::new(),
            pending_relations: Vec::new(),
            anon_counter: 0,
        }
    }

    /// Compiles a raw (parser-produced) AST.
    pub fn from_ast(mut self, ast: Expr) -> Result<CompiledQuery, QueryError> {
        let ast = Normalizer::new(self.store).normalize(ast);

        let terms = match ast {
            Expr::Conjunction(terms) => terms,
            single => vec![single],
        };
        for term in terms {
            self.process_term(term)?;
        }

        self.infer_variable_kinds()?;
        self.process_predicates()?;
        let constraints = self.process_relations()?;
        self.add_implicit_kind_predicates();
        let mode = self.execution_mode(&constraints)?;

        debug!(
            "compiled query: {} variables, {} constraints, mode {:?}",
            self.vars.len(),
            constraints.len(),
            mode
        );

        Ok(CompiledQuery {
            vars: self.vars,
            descriptions: self.descriptions,
            node_predicates: self.node_predicates,
            set_predicates: self.set_predicates,
            pushed_filters: self.pushed_filters,
            constraints,
            mode,
        })
    }

    fn process_term(&mut self, term: Expr) -> Result<(), QueryError> {
        match term {
            Expr::NodeDescription(_) | Expr::VarDef(..) | Expr::VarRef(_) => {
                self.register_operand(term)?;
                Ok(())
            }
            Expr::Predicate { name, args } => {
                let args = args
                    .into_iter()
                    .map(|arg| match arg {
                        Expr::IntegerLiteral(_) => Ok(arg),
                        operand => {
                            let id = self.register_operand(operand)?;
                            Ok(Expr::VarRef(self.var_ref(id)))
                        }
                    })
                    .collect::<Result<Vec<_>, QueryError>>()?;
                self.pending_predicates.push((name, args));
                Ok(())
            }
            Expr::Relation { op, left, right } => {
                let left = self.register_operand(*left)?;
                let right = self.register_operand(*right)?;
                self.pending_relations.push((left, right, op));
                Ok(())
            }
            other => Err(QueryError::Syntax(format!(
                "unexpected toplevel term: {}",
                other
            ))),
        }
    }

    fn var_ref(&self, id: VarId) -> Variable {
        let var = self.vars.get(id);
        Variable::new(var.name.clone(), var.container)
    }

    /// Turns a node operand into a registered variable, synthesizing a name
    /// for anonymous descriptions and merging repeated definitions by
    /// conjunction.
    fn register_operand(&mut self, operand: Expr) -> Result<VarId, QueryError> {
        match operand {
            Expr::NodeDescription(inner) => {
                let name = format!(":anon{}", self.anon_counter);
                self.anon_counter += 1;
                let var = Variable::new(name, ContainerKind::Single);
                let id = self.intern(&var)?;
                self.descriptions[id] = *inner;
                Ok(id)
            }
            Expr::VarDef(var, desc) => {
                let id = self.intern(&var)?;
                let inner = match *desc {
                    Expr::NodeDescription(inner) => *inner,
                    other => other,
                };
                let merged = match std::mem::replace(&mut self.descriptions[id], Expr::Nop) {
                    Expr::Nop => inner,
                    existing => {
                        // Feature expressions accumulate; renormalize so the
                        // merged description is in DNF again.
                        Normalizer::new(self.store)
                            .normalize(Expr::Conjunction(vec![existing, inner]))
                    }
                };
                self.descriptions[id] = merged;
                Ok(id)
            }
            Expr::VarRef(var) => self.intern(&var),
            other => Err(QueryError::Syntax(format!(
                "expected a node operand, found: {}",
                other
            ))),
        }
    }

    /// Interns a variable, extending the per-variable tables. Reusing a
    /// name with a different container prefix is a type error.
    fn intern(&mut self, var: &Variable) -> Result<VarId, QueryError> {
        if let Some(id) = self.vars.lookup(&var.name) {
            if self.vars.get(id).container != var.container {
                return Err(QueryError::TypeConflict(var.name.clone()));
            }
            return Ok(id);
        }
        let id = self.vars.intern(&var.name, var.container);
        self.descriptions.push(Expr::Nop);
        self.node_predicates.push(Vec::new());
        self.set_predicates.push(Vec::new());
        self.pushed_filters.push(Vec::new());
        Ok(id)
    }

    /// Infers each variable's node kind from its description. A single
    /// disjunct requiring both kinds is a type error; differing kinds
    /// across disjuncts leave the variable `Unknown`. Variables whose
    /// description names a kind via `T`/`NT` and resolves to a single kind
    /// get an explicit kind predicate.
    fn infer_variable_kinds(&mut self) -> Result<(), QueryError> {
        for id in self.vars.ids() {
            let (mut any_t, mut any_nt, mut has_record) = (false, false, false);
            for disjunct in disjuncts(&self.descriptions[id]) {
                let (mut t, mut nt) = (false, false);
                for atom in conjuncts(disjunct) {
                    match atom {
                        Expr::FeatureConstraint { feature, .. } => {
                            let info = self.store.feature(feature).ok_or_else(|| {
                                QueryError::UndefinedName {
                                    kind: NameKind::Feature,
                                    name: feature.clone(),
                                }
                            })?;
                            match info.domain.implied_kind() {
                                NodeKind::Terminal => t = true,
                                NodeKind::Nonterminal => nt = true,
                                NodeKind::Unknown => {}
                            }
                        }
                        Expr::FeatureRecord(kind) => {
                            has_record = true;
                            match kind {
                                NodeKind::Terminal => t = true,
                                NodeKind::Nonterminal => nt = true,
                                NodeKind::Unknown => {}
                            }
                        }
                        _ => {}
                    }
                }
                if t && nt {
                    return Err(QueryError::TypeConflict(self.vars.get(id).name.clone()));
                }
                any_t |= t;
                any_nt |= nt;
            }
            let kind = match (any_t, any_nt) {
                (true, false) => NodeKind::Terminal,
                (false, true) => NodeKind::Nonterminal,
                _ => NodeKind::Unknown,
            };
            if kind != NodeKind::Unknown {
                self.vars.get_mut(id).refine(kind)?;
                if has_record {
                    self.node_predicates[id].push(NodePredicate::Kind(kind));
                }
            }
        }
        Ok(())
    }

    fn process_predicates(&mut self) -> Result<(), QueryError> {
        let pending = std::mem::take(&mut self.pending_predicates);
        for (name, args) in &pending {
            let (var, predicate) = predicates::from_call(name, args)?;
            let id = self.intern(&var)?;
            match predicate {
                Predicate::Node(p) => self.node_predicates[id].push(p),
                Predicate::Set(p) => self.set_predicates[id].push(p),
            }
        }
        Ok(())
    }

    /// Builds the constraint objects, refines operand kinds, then collects
    /// the pushdown filters with the final kinds.
    fn process_relations(&mut self) -> Result<Vec<ConstraintEntry>, QueryError> {
        let pending = std::mem::take(&mut self.pending_relations);
        let mut entries = Vec::with_capacity(pending.len());
        for (left, right, op) in pending {
            let kinds = (self.vars.get(left).kind(), self.vars.get(right).kind());
            let constraint = constraints::from_op(&op, kinds, self.store)?;

            let (left_kind, right_kind) = constraint.operand_kinds();
            self.refine(left, left_kind)?;
            self.refine(right, right_kind)?;

            entries.push(ConstraintEntry {
                left,
                right,
                constraint,
            });
        }

        for entry in &entries {
            let right_kind = self.vars.get(entry.right).kind();
            let (left_filters, right_filters) = entry.constraint.pushed_filters(right_kind);
            self.pushed_filters[entry.left].extend(left_filters);
            self.pushed_filters[entry.right].extend(right_filters);
        }
        Ok(entries)
    }

    fn refine(&mut self, id: VarId, kind: NodeKind) -> Result<(), QueryError> {
        self.vars.get_mut(id).refine(kind)
    }

    /// Variables with an empty description, no predicates and a known kind
    /// still get a kind filter, so type information discovered purely from
    /// relations narrows the node search.
    fn add_implicit_kind_predicates(&mut self) {
        for id in self.vars.ids() {
            let kind = self.vars.get(id).kind();
            if matches!(self.descriptions[id], Expr::Nop)
                && self.node_predicates[id].is_empty()
                && self.set_predicates[id].is_empty()
                && self.pushed_filters[id].is_empty()
                && kind != NodeKind::Unknown
            {
                self.node_predicates[id].push(NodePredicate::Kind(kind));
            }
        }
    }

    /// Chooses the execution mode from the constraint graph's shape. A
    /// partially connected graph has no defined evaluation order and is
    /// rejected.
    fn execution_mode(&self, constraints: &[ConstraintEntry]) -> Result<ExecutionMode, QueryError> {
        if constraints.is_empty() {
            return Ok(ExecutionMode::Lazy);
        }
        let mut parent: Vec<VarId> = (0..self.vars.len()).collect();
        fn find(parent: &mut [VarId], mut x: VarId) -> VarId {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }
        for entry in constraints {
            let l = find(&mut parent, entry.left);
            let r = find(&mut parent, entry.right);
            parent[l] = r;
        }
        let components = (0..self.vars.len())
            .filter(|&id| find(&mut parent, id) == id)
            .count();
        if components == 1 {
            Ok(ExecutionMode::Checked)
        } else {
            Err(QueryError::UnsupportedQueryShape)
        }
    }
}

pub(crate) fn disjuncts(expr: &Expr) -> impl Iterator<Item = &Expr> {
    match expr {
        Expr::Disjunction(children) => children.iter(),
        other => std::slice::from_ref(other).iter(),
    }
}

pub(crate) fn conjuncts(expr: &Expr) -> impl Iterator<Item = &Expr> {
    match expr {
        Expr::Conjunction(children) => children.iter(),
        other => std::slice::from_ref(other).iter(),
    }
}

/// Parses and compiles a query string against a store.
pub fn compile<S: IndexedStore>(store: &S, query: &str) -> Result<CompiledQuery, QueryError> {
    QueryFactory::new(store).from_ast(crate::parser::parse_query(query)?)
}
