//! Node variables and their kind inference state.

use rustc_hash::FxHashMap;

use crate::error::QueryError;

/// Whether a variable binds one node per match or the full candidate set of
/// a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// `#name`: exactly one node per match.
    Single,
    /// `%name`: all nodes satisfying the description within a tree.
    Set,
}

/// The inferred kind of the nodes a variable can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Terminal,
    Nonterminal,
    Unknown,
}

impl NodeKind {
    /// `T` <-> `NT`; negating an unknown record stays unknown.
    pub fn inverted(self) -> NodeKind {
        match self {
            NodeKind::Terminal => NodeKind::Nonterminal,
            NodeKind::Nonterminal => NodeKind::Terminal,
            NodeKind::Unknown => NodeKind::Unknown,
        }
    }
}

/// Index of a variable in the query's [`VariableTable`].
pub type VarId = usize;

/// A node variable: identity is the name; the kind is refined monotonically
/// while the query factory walks the AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVariable {
    pub name: String,
    pub container: ContainerKind,
    kind: NodeKind,
}

impl NodeVariable {
    pub fn new(name: impl Into<String>, container: ContainerKind) -> Self {
        NodeVariable {
            name: name.into(),
            container,
            kind: NodeKind::Unknown,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_set(&self) -> bool {
        self.container == ContainerKind::Set
    }

    /// Refines the variable's kind. Refining from `Unknown` is allowed and
    /// re-asserting the current kind is a no-op; switching between
    /// `Terminal` and `Nonterminal` is a type error.
    pub fn refine(&mut self, kind: NodeKind) -> Result<(), QueryError> {
        match (self.kind, kind) {
            (_, NodeKind::Unknown) => Ok(()),
            (NodeKind::Unknown, k) => {
                self.kind = k;
                Ok(())
            }
            (current, k) if current == k => Ok(()),
            _ => Err(QueryError::TypeConflict(self.name.clone())),
        }
    }
}

/// Interning table for the variables of one query. `VarId`s index into it;
/// the table is owned by the compiled query.
#[derive(Debug, Default, Clone)]
pub struct VariableTable {
    vars: Vec<NodeVariable>,
    by_name: FxHashMap<String, VarId>,
}

impl VariableTable {
    pub fn new() -> Self {
        VariableTable::default()
    }

    /// Returns the id for `name`, creating the variable on first sight.
    pub fn intern(&mut self, name: &str, container: ContainerKind) -> VarId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.vars.len();
        self.vars.push(NodeVariable::new(name, container));
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: VarId) -> &NodeVariable {
        &self.vars[id]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut NodeVariable {
        &mut self.vars[id]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &NodeVariable)> {
        self.vars.iter().enumerate()
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> + use<> {
        0..self.vars.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refine_monotonic() {
        let mut var = NodeVariable::new("a", ContainerKind::Single);
        assert_eq!(var.kind(), NodeKind::Unknown);

        var.refine(NodeKind::Terminal).unwrap();
        assert_eq!(var.kind(), NodeKind::Terminal);

        // Re-asserting the same kind is a no-op.
        var.refine(NodeKind::Terminal).unwrap();
        assert_eq!(var.kind(), NodeKind::Terminal);

        // Unknown never downgrades an established kind.
        var.refine(NodeKind::Unknown).unwrap();
        assert_eq!(var.kind(), NodeKind::Terminal);

        let err = var.refine(NodeKind::Nonterminal).unwrap_err();
        assert!(matches!(err, QueryError::TypeConflict(name) if name == "a"));
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut table = VariableTable::new();
        let a = table.intern("a", ContainerKind::Single);
        let b = table.intern("b", ContainerKind::Set);
        assert_eq!(table.intern("a", ContainerKind::Single), a);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.get(b).is_set());
    }
}
