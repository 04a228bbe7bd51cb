//! In-memory indexed corpus store.
//!
//! [`MemoryCorpus`] is the reference [`IndexedStore`] implementation: trees
//! are inserted through a small builder API ([`NodeSpec`]) and indexed on
//! the fly into the node records the query engine evaluates against. Derived
//! data (gorn addresses, corners, token orders, continuity, arities) is
//! computed at insertion so lookups stay simple scans.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{NameKind, QueryError};
use crate::store::{
    ArityField, Continuity, FeatureDomain, FeatureId, FeatureInfo, FeatureValueId, IndexedStore,
    LabelId, MatchPolicy, NodeFilter, NodeId, NodeLookup, NodeQuery, NodeRecord, SecEdgeEnd,
    TreeId, ValueSetId,
};
use crate::variable::NodeKind;

/// Edge label carried by nodes without an explicit label, including roots.
const ROOT_EDGE_LABEL: &str = "--";

/// Declarative description of one node for corpus construction. A node
/// without children is a terminal.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    name: String,
    edge: Option<String>,
    features: Vec<(String, String)>,
    children: Vec<NodeSpec>,
    order: Option<u32>,
}

/// Starts a node description. The name is unique within its tree and used
/// to address the node later (e.g. for secondary edges).
pub fn node(name: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_string(),
        edge: None,
        features: Vec::new(),
        children: Vec::new(),
        order: None,
    }
}

impl NodeSpec {
    pub fn edge(mut self, label: &str) -> Self {
        self.edge = Some(label.to_string());
        self
    }

    pub fn feature(mut self, name: &str, value: &str) -> Self {
        self.features.push((name.to_string(), value.to_string()));
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    /// Overrides a terminal's token order. Give either all or none of a
    /// tree's terminals explicit orders; mixing the two is unsupported.
    pub fn order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Default)]
struct Interner {
    names: Vec<String>,
    ids: FxHashMap<String, u32>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    fn get(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }
}

#[derive(Debug)]
struct FeatureEntry {
    domain: FeatureDomain,
    values: Interner,
}

#[derive(Debug)]
struct MemoryNode {
    record: NodeRecord,
    features: FxHashMap<FeatureId, FeatureValueId>,
    arity: u32,
    token_arity: u32,
    has_nonterminal_child: bool,
    is_secedge_origin: bool,
    is_secedge_target: bool,
}

#[derive(Default)]
struct ValueSets {
    next_id: ValueSetId,
    sets: FxHashMap<ValueSetId, FxHashSet<FeatureValueId>>,
}

/// An in-memory treebank with the index structures the query engine needs.
pub struct MemoryCorpus {
    nodes: Vec<MemoryNode>,
    tree_count: u32,
    features: Vec<FeatureEntry>,
    feature_ids: FxHashMap<String, FeatureId>,
    edge_labels: Interner,
    secedge_labels: Interner,
    secedges: Vec<(NodeId, NodeId, LabelId)>,
    by_name: FxHashMap<(TreeId, String), NodeId>,
    value_sets: Mutex<ValueSets>,
}

impl Default for MemoryCorpus {
    fn default() -> Self {
        MemoryCorpus::new()
    }
}

impl MemoryCorpus {
    pub fn new() -> Self {
        let mut edge_labels = Interner::default();
        edge_labels.intern(ROOT_EDGE_LABEL);
        MemoryCorpus {
            nodes: Vec::new(),
            tree_count: 0,
            features: Vec::new(),
            feature_ids: FxHashMap::default(),
            edge_labels,
            secedge_labels: Interner::default(),
            secedges: Vec::new(),
            by_name: FxHashMap::default(),
            value_sets: Mutex::new(ValueSets::default()),
        }
    }

    /// Declares a feature and the node kind it applies to. Features must be
    /// declared before trees using them are inserted.
    pub fn declare_feature(&mut self, name: &str, domain: FeatureDomain) {
        let id = self.features.len() as FeatureId;
        self.features.push(FeatureEntry {
            domain,
            values: Interner::default(),
        });
        self.feature_ids.insert(name.to_string(), id);
    }

    /// Inserts one tree and returns its id. Tree ids are assigned in
    /// insertion order, which keeps node scans ordered by tree id.
    pub fn insert_tree(&mut self, root: NodeSpec) -> Result<TreeId, QueryError> {
        let tree_id = self.tree_count;
        self.tree_count += 1;
        let mut next_order = 1;
        self.insert_node(tree_id, &root, Vec::new(), &mut next_order)?;
        Ok(tree_id)
    }

    fn insert_node(
        &mut self,
        tree_id: TreeId,
        spec: &NodeSpec,
        gorn: Vec<u16>,
        next_order: &mut u32,
    ) -> Result<(NodeId, Vec<(u32, NodeId)>), QueryError> {
        let id = self.nodes.len() as NodeId;
        // Placeholder, patched below once the children are known.
        self.nodes.push(MemoryNode {
            record: NodeRecord {
                id,
                tree_id,
                edge_label: 0,
                continuity: Continuity::Token,
                left_corner: id,
                right_corner: id,
                token_order: 0,
                gorn: gorn.clone(),
            },
            features: FxHashMap::default(),
            arity: spec.children.len() as u32,
            token_arity: 0,
            has_nonterminal_child: false,
            is_secedge_origin: false,
            is_secedge_target: false,
        });
        self.by_name.insert((tree_id, spec.name.clone()), id);

        let mut terminals = Vec::new();
        let mut has_nonterminal_child = false;
        for (idx, child) in spec.children.iter().enumerate() {
            let mut child_gorn = gorn.clone();
            child_gorn.push(idx as u16);
            let (_, mut child_terminals) =
                self.insert_node(tree_id, child, child_gorn, next_order)?;
            has_nonterminal_child |= !child.children.is_empty();
            terminals.append(&mut child_terminals);
        }

        let is_terminal = spec.children.is_empty();
        if is_terminal {
            let order = spec.order.unwrap_or_else(|| {
                let order = *next_order;
                *next_order += 1;
                order
            });
            terminals.push((order, id));
        }

        let mut features = FxHashMap::default();
        for (name, value) in &spec.features {
            let feature_id =
                *self
                    .feature_ids
                    .get(name)
                    .ok_or_else(|| QueryError::UndefinedName {
                        kind: NameKind::Feature,
                        name: name.clone(),
                    })?;
            let value_id = self.features[feature_id as usize].values.intern(value);
            features.insert(feature_id, value_id);
        }

        let edge_label = match &spec.edge {
            Some(label) => self.edge_labels.intern(label),
            None => 0,
        };

        let (min_order, left_corner) = terminals
            .iter()
            .min_by_key(|(order, _)| *order)
            .copied()
            .unwrap_or((0, id));
        let (max_order, right_corner) = terminals
            .iter()
            .max_by_key(|(order, _)| *order)
            .copied()
            .unwrap_or((0, id));
        let continuity = if is_terminal {
            Continuity::Token
        } else if (max_order - min_order + 1) as usize == terminals.len() {
            Continuity::Continuous
        } else {
            Continuity::Discontinuous
        };

        let node = &mut self.nodes[id as usize];
        node.record.edge_label = edge_label;
        node.record.continuity = continuity;
        node.record.left_corner = left_corner;
        node.record.right_corner = right_corner;
        node.record.token_order = min_order;
        node.features = features;
        node.token_arity = if is_terminal { 0 } else { terminals.len() as u32 };
        node.has_nonterminal_child = has_nonterminal_child;

        Ok((id, terminals))
    }

    /// Adds a secondary edge between two named nodes of a tree.
    pub fn add_secedge(
        &mut self,
        tree_id: TreeId,
        origin: &str,
        target: &str,
        label: &str,
    ) -> Result<(), QueryError> {
        let origin_id = self.node_id_by_name(tree_id, origin).ok_or_else(|| {
            QueryError::UndefinedName {
                kind: NameKind::Feature,
                name: origin.to_string(),
            }
        })?;
        let target_id = self.node_id_by_name(tree_id, target).ok_or_else(|| {
            QueryError::UndefinedName {
                kind: NameKind::Feature,
                name: target.to_string(),
            }
        })?;
        let label_id = self.secedge_labels.intern(label);
        self.secedges.push((origin_id, target_id, label_id));
        self.nodes[origin_id as usize].is_secedge_origin = true;
        self.nodes[target_id as usize].is_secedge_target = true;
        Ok(())
    }

    /// Looks a node up by its builder name. Mostly useful in tests.
    pub fn node_id_by_name(&self, tree_id: TreeId, name: &str) -> Option<NodeId> {
        self.by_name.get(&(tree_id, name.to_string())).copied()
    }

    fn sets(&self) -> MutexGuard<'_, ValueSets> {
        self.value_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn matches_lookup(&self, node: &MemoryNode, lookup: &NodeLookup, sets: &ValueSets) -> bool {
        for feature_match in &lookup.features {
            // A node without the feature matches neither polarity; the
            // constraint implies the node kind that carries the feature.
            let Some(&value) = node.features.get(&feature_match.feature) else {
                return false;
            };
            let holds = match feature_match.policy {
                MatchPolicy::Match => value == feature_match.value,
                MatchPolicy::NoMatch => value != feature_match.value,
            };
            if !holds {
                return false;
            }
        }
        for set_match in &lookup.value_sets {
            let Some(&value) = node.features.get(&set_match.feature) else {
                return false;
            };
            match sets.sets.get(&set_match.set) {
                Some(set) if set.contains(&value) => {}
                _ => return false,
            }
        }
        lookup.filters.iter().all(|f| self.matches_filter(node, f))
    }

    fn matches_filter(&self, node: &MemoryNode, filter: &NodeFilter) -> bool {
        let record = &node.record;
        match filter {
            NodeFilter::Kind(NodeKind::Terminal) => record.continuity.is_terminal(),
            NodeFilter::Kind(NodeKind::Nonterminal) => !record.continuity.is_terminal(),
            NodeFilter::Kind(NodeKind::Unknown) => true,
            NodeFilter::Root => record.gorn.is_empty(),
            NodeFilter::Continuity(continuity) => record.continuity == *continuity,
            NodeFilter::ArityRange { field, min, max } => {
                let value = match field {
                    ArityField::Arity => node.arity,
                    ArityField::TokenArity => node.token_arity,
                };
                *min <= value && value <= *max
            }
            NodeFilter::EdgeLabel(label) => record.edge_label == *label,
            NodeFilter::HasNonterminalChild => node.has_nonterminal_child,
            NodeFilter::HasSecEdge(SecEdgeEnd::Origin) => node.is_secedge_origin,
            NodeFilter::HasSecEdge(SecEdgeEnd::Target) => node.is_secedge_target,
            NodeFilter::TreeRange { start, end } => {
                record.tree_id >= *start && end.is_none_or(|end| record.tree_id < end)
            }
        }
    }
}

impl IndexedStore for MemoryCorpus {
    fn feature(&self, name: &str) -> Option<FeatureInfo> {
        let id = *self.feature_ids.get(name)?;
        Some(FeatureInfo {
            id,
            domain: self.features[id as usize].domain,
        })
    }

    fn feature_value_id(&self, feature: FeatureId, value: &str) -> Option<FeatureValueId> {
        self.features.get(feature as usize)?.values.get(value)
    }

    fn edge_label_id(&self, label: &str) -> Option<LabelId> {
        self.edge_labels.get(label)
    }

    fn secedge_label_id(&self, label: &str) -> Option<LabelId> {
        self.secedge_labels.get(label)
    }

    fn materialize_value_set(
        &self,
        feature: FeatureId,
        policy: MatchPolicy,
        regex: &Regex,
    ) -> (ValueSetId, usize) {
        let matching: FxHashSet<FeatureValueId> = match self.features.get(feature as usize) {
            Some(entry) => entry
                .values
                .names
                .iter()
                .enumerate()
                .filter(|(_, value)| {
                    let matches = regex.is_match(value);
                    match policy {
                        MatchPolicy::Match => matches,
                        MatchPolicy::NoMatch => !matches,
                    }
                })
                .map(|(id, _)| id as FeatureValueId)
                .collect(),
            None => FxHashSet::default(),
        };
        let size = matching.len();
        let mut sets = self.sets();
        let id = sets.next_id;
        sets.next_id += 1;
        sets.sets.insert(id, matching);
        debug!("materialized value set {} with {} values", id, size);
        (id, size)
    }

    fn release_value_set(&self, set: ValueSetId) {
        self.sets().sets.remove(&set);
    }

    fn search_nodes(&self, query: &NodeQuery) -> Box<dyn Iterator<Item = (NodeId, TreeId)> + '_> {
        let sets = self.sets();
        let hits: Vec<(NodeId, TreeId)> = self
            .nodes
            .iter()
            .filter(|node| {
                query
                    .disjuncts
                    .iter()
                    .any(|lookup| self.matches_lookup(node, lookup, &sets))
            })
            .map(|node| (node.record.id, node.record.tree_id))
            .collect();
        Box::new(hits.into_iter())
    }

    fn node(&self, id: NodeId) -> NodeRecord {
        self.nodes[id as usize].record.clone()
    }

    fn has_secedge(&self, origin: NodeId, target: NodeId, label: Option<LabelId>) -> bool {
        self.secedges.iter().any(|&(o, t, l)| {
            o == origin && t == target && label.is_none_or(|label| label == l)
        })
    }

    fn tree_count(&self) -> u32 {
        self.tree_count
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// One-tree corpus used across the unit tests:
    /// `S(NP(DT "the", NN "dog"), VP(VBD "barked"))` with a secondary edge
    /// `VP ->anaphor NP`.
    pub(crate) fn sample_corpus() -> MemoryCorpus {
        let mut corpus = MemoryCorpus::new();
        corpus.declare_feature("cat", FeatureDomain::Nonterminal);
        corpus.declare_feature("pos", FeatureDomain::Terminal);
        corpus.declare_feature("word", FeatureDomain::Terminal);
        corpus.declare_feature("morph", FeatureDomain::Both);

        let tree = node("S")
            .feature("cat", "S")
            .child(
                node("NP")
                    .feature("cat", "NP")
                    .edge("SB")
                    .child(node("the").feature("pos", "DT").feature("word", "the"))
                    .child(node("dog").feature("pos", "NN").feature("word", "dog")),
            )
            .child(
                node("VP")
                    .feature("cat", "VP")
                    .edge("HD")
                    .child(node("barked").feature("pos", "VBD").feature("word", "barked")),
            );
        corpus.insert_tree(tree).unwrap();
        corpus.add_secedge(0, "VP", "NP", "anaphor").unwrap();
        corpus
    }

    #[test]
    fn test_derived_node_data() {
        let corpus = sample_corpus();
        let s = corpus.node(corpus.node_id_by_name(0, "S").unwrap());
        let np = corpus.node(corpus.node_id_by_name(0, "NP").unwrap());
        let the = corpus.node(corpus.node_id_by_name(0, "the").unwrap());
        let barked = corpus.node(corpus.node_id_by_name(0, "barked").unwrap());

        assert_eq!(s.gorn, Vec::<u16>::new());
        assert_eq!(np.gorn, vec![0]);
        assert_eq!(the.gorn, vec![0, 0]);
        assert_eq!(barked.gorn, vec![1, 0]);

        assert_eq!(the.token_order, 1);
        assert_eq!(barked.token_order, 3);
        assert_eq!(np.token_order, 1);

        assert_eq!(np.continuity, Continuity::Continuous);
        assert_eq!(the.continuity, Continuity::Token);
        assert_eq!(np.left_corner, the.id);
        assert_eq!(s.right_corner, barked.id);
    }

    #[test]
    fn test_discontinuous_constituent() {
        let mut corpus = MemoryCorpus::new();
        corpus.declare_feature("cat", FeatureDomain::Nonterminal);
        corpus.declare_feature("word", FeatureDomain::Terminal);
        // VP spans tokens 1 and 3, with a token from outside in between.
        let tree = node("S")
            .feature("cat", "S")
            .child(
                node("VP")
                    .feature("cat", "VP")
                    .child(node("a").feature("word", "a").order(1))
                    .child(node("b").feature("word", "b").order(3)),
            )
            .child(node("c").feature("word", "c").order(2));
        corpus.insert_tree(tree).unwrap();

        let vp = corpus.node(corpus.node_id_by_name(0, "VP").unwrap());
        assert_eq!(vp.continuity, Continuity::Discontinuous);
        let s = corpus.node(corpus.node_id_by_name(0, "S").unwrap());
        assert_eq!(s.continuity, Continuity::Continuous);
    }

    #[test]
    fn test_feature_search() {
        let corpus = sample_corpus();
        let cat = corpus.feature("cat").unwrap();
        let np = corpus.feature_value_id(cat.id, "NP").unwrap();

        let query = NodeQuery {
            disjuncts: vec![NodeLookup {
                features: vec![crate::store::FeatureMatch {
                    feature: cat.id,
                    policy: MatchPolicy::Match,
                    value: np,
                }],
                ..NodeLookup::default()
            }],
        };
        let hits: Vec<_> = corpus.search_nodes(&query).collect();
        assert_eq!(hits, vec![(corpus.node_id_by_name(0, "NP").unwrap(), 0)]);

        // Unknown values do not resolve at all.
        assert_eq!(corpus.feature_value_id(cat.id, "PP"), None);
    }

    #[test]
    fn test_filter_search() {
        let corpus = sample_corpus();
        let roots = NodeQuery {
            disjuncts: vec![NodeLookup {
                filters: vec![NodeFilter::Root],
                ..NodeLookup::default()
            }],
        };
        let hits: Vec<_> = corpus.search_nodes(&roots).collect();
        assert_eq!(hits, vec![(corpus.node_id_by_name(0, "S").unwrap(), 0)]);

        let terminals = NodeQuery {
            disjuncts: vec![NodeLookup {
                filters: vec![NodeFilter::Kind(NodeKind::Terminal)],
                ..NodeLookup::default()
            }],
        };
        assert_eq!(corpus.search_nodes(&terminals).count(), 3);

        let branching = NodeQuery {
            disjuncts: vec![NodeLookup {
                filters: vec![NodeFilter::ArityRange {
                    field: ArityField::Arity,
                    min: 2,
                    max: u32::MAX,
                }],
                ..NodeLookup::default()
            }],
        };
        // S and NP both have two children.
        assert_eq!(corpus.search_nodes(&branching).count(), 2);
    }

    #[test]
    fn test_value_set_lifecycle() {
        let corpus = sample_corpus();
        let pos = corpus.feature("pos").unwrap();
        let regex = Regex::new("^(?:D.*)$").unwrap();
        let (set, size) = corpus.materialize_value_set(pos.id, MatchPolicy::Match, &regex);
        assert_eq!(size, 1);

        let query = NodeQuery {
            disjuncts: vec![NodeLookup {
                value_sets: vec![crate::store::ValueSetMatch {
                    feature: pos.id,
                    set,
                }],
                ..NodeLookup::default()
            }],
        };
        let hits: Vec<_> = corpus.search_nodes(&query).collect();
        assert_eq!(hits, vec![(corpus.node_id_by_name(0, "the").unwrap(), 0)]);

        corpus.release_value_set(set);
        assert!(corpus.search_nodes(&query).next().is_none());
    }

    #[test]
    fn test_secedges() {
        let corpus = sample_corpus();
        let vp = corpus.node_id_by_name(0, "VP").unwrap();
        let np = corpus.node_id_by_name(0, "NP").unwrap();
        let label = corpus.secedge_label_id("anaphor").unwrap();

        assert!(corpus.has_secedge(vp, np, None));
        assert!(corpus.has_secedge(vp, np, Some(label)));
        assert!(!corpus.has_secedge(np, vp, None));
    }
}
