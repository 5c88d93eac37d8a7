//! Op graph: an id-keyed node arena plus an adjacency table.
//!
//! The orchestrator rewrites this graph while it is live (MoE expansion adds
//! nodes and rewires successors mid-run), so every mutation works on ids and
//! payload ownership never moves. Successor bookkeeping is recomputed through
//! per-node `remaining_deps` counters owned by the orchestrator, not here.

use std::collections::BTreeMap;

use tessera_types::{NodePayload, OpType, Target};

/// One node of the op DAG.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub id: u64,
    pub op_type: OpType,
    pub target: Target,
    /// Fallback latency when the payload carries none.
    pub latency: u64,
    pub deps: Vec<u64>,
    pub payload: NodePayload,
    pub batch_id: u64,
}

impl OpNode {
    pub fn new(id: u64, op_type: OpType, target: Target) -> Self {
        Self {
            id,
            op_type,
            target,
            latency: 0,
            deps: Vec::new(),
            payload: NodePayload::Empty,
            batch_id: 0,
        }
    }
}

/// DAG of op nodes. Insertion order is preserved by the BTreeMap's id order;
/// node ids are allocated monotonically by the owner.
#[derive(Debug, Clone, Default)]
pub struct OpGraph {
    nodes: BTreeMap<u64, OpNode>,
    adjacency: BTreeMap<u64, Vec<u64>>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: OpNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn node(&self, id: u64) -> Option<&OpNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: u64) -> Option<&mut OpNode> {
        self.nodes.get_mut(&id)
    }

    pub fn remove_node(&mut self, id: u64) -> Option<OpNode> {
        self.adjacency.remove(&id);
        self.nodes.remove(&id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OpNode> {
        self.nodes.values()
    }

    /// Add the edge `from -> to`. Idempotent.
    pub fn add_edge(&mut self, from: u64, to: u64) {
        let succ = self.adjacency.entry(from).or_default();
        if !succ.contains(&to) {
            succ.push(to);
        }
    }

    /// Remove the edge `from -> to` if present; drops the adjacency entry
    /// entirely once its successor list is empty.
    pub fn remove_edge(&mut self, from: u64, to: u64) {
        if let Some(succ) = self.adjacency.get_mut(&from) {
            succ.retain(|&s| s != to);
            if succ.is_empty() {
                self.adjacency.remove(&from);
            }
        }
    }

    pub fn successors(&self, id: u64) -> &[u64] {
        self.adjacency.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Nodes with zero incoming edges, in id order.
    pub fn roots(&self) -> Vec<u64> {
        let mut has_incoming = std::collections::BTreeSet::new();
        for succ in self.adjacency.values() {
            has_incoming.extend(succ.iter().copied());
        }
        self.nodes
            .keys()
            .copied()
            .filter(|id| !has_incoming.contains(id))
            .collect()
    }

    /// In-degree of every node, for seeding `remaining_deps` counters.
    pub fn in_degrees(&self) -> BTreeMap<u64, usize> {
        let mut degrees: BTreeMap<u64, usize> =
            self.nodes.keys().map(|&id| (id, 0)).collect();
        for succ in self.adjacency.values() {
            for &to in succ {
                if let Some(d) = degrees.get_mut(&to) {
                    *d += 1;
                }
            }
        }
        degrees
    }

    /// Deep copy for streaming templates. Node metadata, dependency lists and
    /// adjacency all get fresh storage; command payloads are re-boxed per node
    /// so a later batch mutating its commands cannot leak into the template.
    pub fn deep_clone(&self) -> Self {
        let mut nodes = BTreeMap::new();
        for (&id, node) in &self.nodes {
            let payload = match &node.payload {
                NodePayload::Command(cmd) => NodePayload::Command(cmd.clone()),
                other => other.clone(),
            };
            nodes.insert(
                id,
                OpNode {
                    id: node.id,
                    op_type: node.op_type,
                    target: node.target,
                    latency: node.latency,
                    deps: node.deps.clone(),
                    payload,
                    batch_id: node.batch_id,
                },
            );
        }
        Self {
            nodes,
            adjacency: self.adjacency.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64) -> OpNode {
        OpNode::new(id, OpType::Compute, Target::Digital)
    }

    #[test]
    fn add_edge_is_idempotent() {
        let mut g = OpGraph::new();
        g.add_node(node(1));
        g.add_node(node(2));
        g.add_edge(1, 2);
        g.add_edge(1, 2);
        assert_eq!(g.successors(1), &[2]);
    }

    #[test]
    fn remove_edge_drops_empty_entry() {
        let mut g = OpGraph::new();
        g.add_node(node(1));
        g.add_node(node(2));
        g.add_edge(1, 2);
        g.remove_edge(1, 2);
        assert!(g.successors(1).is_empty());
        // Node 2 regained root status once its only incoming edge went away.
        assert_eq!(g.roots(), vec![1, 2]);
    }

    #[test]
    fn roots_scan_adjacency() {
        let mut g = OpGraph::new();
        for id in 1..=4 {
            g.add_node(node(id));
        }
        g.add_edge(1, 3);
        g.add_edge(2, 3);
        g.add_edge(3, 4);
        assert_eq!(g.roots(), vec![1, 2]);
        let degrees = g.in_degrees();
        assert_eq!(degrees[&3], 2);
        assert_eq!(degrees[&4], 1);
    }

    #[test]
    fn deep_clone_decouples_command_payloads() {
        use tessera_types::{Command, CommandKind, NodePayload};

        let mut g = OpGraph::new();
        let mut n = node(1);
        n.payload = NodePayload::Command(Box::new(Command::new(CommandKind::PeGemm)));
        g.add_node(n);

        let mut copy = g.deep_clone();
        if let Some(cmd) = copy.node_mut(1).unwrap().payload.command_mut() {
            cmd.deps.push(99);
        }
        assert!(g.node(1).unwrap().payload.command().unwrap().deps.is_empty());
    }
}
