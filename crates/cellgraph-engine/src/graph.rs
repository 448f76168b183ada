//! Arena-backed dependency graph.
//!
//! Nodes live in insertion-ordered slots addressed by `NodeId`; the canonical
//! address index maps each address to its slot. Edges are per-slot adjacency
//! lists, precedent -> dependent. Cycles are legal and never detected here;
//! the evaluator bounds them with iteration counters.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::node::Node;

/// Opaque handle to a node slot. Stable for the life of the node; slots of
/// deleted nodes are tombstoned, never reused.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    fn as_index(self) -> usize {
        self.0 as usize
    }
}

type EdgeList = SmallVec<[NodeId; 4]>;

#[derive(Debug, Default)]
pub struct DepGraph {
    slots: Vec<Option<Node>>,
    index: FxHashMap<String, NodeId>,
    precedents: Vec<EdgeList>,
    dependents: Vec<EdgeList>,
    next_cell_id: u32,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic cell identity counter.
    pub fn next_cell_id(&mut self) -> u32 {
        self.next_cell_id += 1;
        self.next_cell_id
    }

    /// Advance the identity counter past reloaded ids.
    pub fn bump_cell_counter(&mut self, seen: u32) {
        self.next_cell_id = self.next_cell_id.max(seen);
    }

    pub fn insert(&mut self, node: Node) -> NodeId {
        let key = node.canonical();
        debug_assert!(!self.index.contains_key(&key), "duplicate node {key}");
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(node));
        self.precedents.push(EdgeList::new());
        self.dependents.push(EdgeList::new());
        self.index.insert(key, id);
        id
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    pub fn id_of(&self, address: &str) -> Option<NodeId> {
        self.index.get(address).copied()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.as_index()).and_then(|s| s.as_ref())
    }

    /// Panics on a tombstoned slot; callers hold ids obtained from the live
    /// index.
    pub fn node(&self, id: NodeId) -> &Node {
        self.get(id).expect("live node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.slots[id.as_index()].as_mut().expect("live node")
    }

    /// Add a precedent -> dependent edge, deduplicated.
    pub fn add_edge(&mut self, precedent: NodeId, dependent: NodeId) {
        let out = &mut self.dependents[precedent.as_index()];
        if !out.contains(&dependent) {
            out.push(dependent);
            self.precedents[dependent.as_index()].push(precedent);
        }
    }

    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id.as_index()]
    }

    pub fn precedents(&self, id: NodeId) -> &[NodeId] {
        &self.precedents[id.as_index()]
    }

    /// Live node ids in insertion order.
    pub fn iter_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Canonical addresses in insertion order.
    pub fn addresses(&self) -> impl Iterator<Item = String> + '_ {
        self.iter_ids().map(move |id| self.node(id).canonical())
    }

    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.iter().map(|d| d.len()).sum()
    }

    /// Tombstone a node and drop its index entry. Dangling edge ids are left
    /// behind; call [`DepGraph::scrub_edges`] after a batch of removals.
    pub fn remove(&mut self, address: &str) -> bool {
        match self.index.remove(address) {
            Some(id) => {
                self.slots[id.as_index()] = None;
                self.precedents[id.as_index()].clear();
                self.dependents[id.as_index()].clear();
                true
            }
            None => false,
        }
    }

    /// Drop adjacency entries that point at tombstoned slots.
    pub fn scrub_edges(&mut self) {
        let live: Vec<bool> = self.slots.iter().map(|s| s.is_some()).collect();
        for list in self.precedents.iter_mut().chain(self.dependents.iter_mut()) {
            list.retain(|id| live[id.as_index()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CellNode;
    use cellgraph_common::{Address, Value};

    fn cell(graph: &mut DepGraph, addr: &str, value: i64) -> NodeId {
        let id = graph.next_cell_id();
        graph.insert(Node::Cell(CellNode {
            address: Address::parse(addr).unwrap(),
            value: Some(Value::Int(value)),
            formula: None,
            iterations: 0,
            id,
        }))
    }

    #[test]
    fn edges_deduplicate() {
        let mut g = DepGraph::new();
        let a = cell(&mut g, "S!A1", 1);
        let b = cell(&mut g, "S!B1", 2);
        g.add_edge(a, b);
        g.add_edge(a, b);
        assert_eq!(g.dependents(a), &[b]);
        assert_eq!(g.precedents(b), &[a]);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn removal_tombstones_and_scrubs() {
        let mut g = DepGraph::new();
        let a = cell(&mut g, "S!A1", 1);
        let b = cell(&mut g, "S!B1", 2);
        let c = cell(&mut g, "S!C1", 3);
        g.add_edge(a, b);
        g.add_edge(a, c);

        assert!(g.remove("S!B1"));
        assert!(!g.contains("S!B1"));
        assert_eq!(g.node_count(), 2);

        g.scrub_edges();
        assert_eq!(g.dependents(a), &[c]);

        // insertion order survives removal
        let order: Vec<String> = g.addresses().collect();
        assert_eq!(order, vec!["S!A1", "S!C1"]);
    }
}
