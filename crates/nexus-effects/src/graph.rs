//! Graph storage collaborator
//!
//! The replication core never touches physical storage directly. It talks
//! to a [`GraphStore`]: node/edge create and delete, label add/remove and
//! attribute get/set keyed by opaque ids, wrapped in a local transaction.
//!
//! [`MemoryGraph`] is the in-memory implementation used by replicas in
//! tests and by the in-process harness. Its transactions keep an undo log:
//! every primitive records its inverse, and rollback replays the log
//! backwards.

use crate::effects::{Attribute, EntityKind};
use crate::schema::{KeyId, LabelId, TypeId};
use crate::value::PropertyValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Node identifier
pub type NodeId = u64;

/// Edge identifier
pub type EdgeId = u64;

/// Stored node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node ID
    pub id: NodeId,
    /// Attached labels
    pub labels: BTreeSet<LabelId>,
    /// Attributes by key
    pub attributes: BTreeMap<KeyId, PropertyValue>,
}

/// Stored edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Edge ID
    pub id: EdgeId,
    /// Relationship type, immutable after creation
    pub relationship_type: TypeId,
    /// Source node
    pub src: NodeId,
    /// Destination node
    pub dst: NodeId,
    /// Attributes by key
    pub attributes: BTreeMap<KeyId, PropertyValue>,
}

/// Complete committed content of a graph, as transferred on resync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphContent {
    /// Nodes, ordered by id
    pub nodes: Vec<NodeRecord>,
    /// Edges, ordered by id
    pub edges: Vec<EdgeRecord>,
}

/// Storage primitives the encoder observes and the applier replays onto
pub trait GraphStore: Send {
    /// Start a local transaction
    fn begin(&mut self) -> Result<()>;

    /// Make the running transaction's changes durable and visible
    fn commit(&mut self) -> Result<()>;

    /// Undo every change of the running transaction
    fn rollback(&mut self);

    /// Pick the id for a node about to be created (storage reuse policy)
    fn allocate_node_id(&mut self) -> NodeId;

    /// Pick the id for an edge about to be created
    fn allocate_edge_id(&mut self) -> EdgeId;

    /// Create a node with an explicit id
    fn create_node(&mut self, id: NodeId, labels: &[LabelId], attributes: &[Attribute]) -> Result<()>;

    /// Delete a node that has no remaining edges
    fn delete_node(&mut self, id: NodeId) -> Result<NodeRecord>;

    /// Create an edge with an explicit id between two existing nodes
    fn create_edge(
        &mut self,
        id: EdgeId,
        relationship_type: TypeId,
        src: NodeId,
        dst: NodeId,
        attributes: &[Attribute],
    ) -> Result<()>;

    /// Delete an edge
    fn delete_edge(&mut self, id: EdgeId) -> Result<EdgeRecord>;

    /// Attach a label; returns false if it was already attached
    fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<bool>;

    /// Detach a label; returns false if it was not attached
    fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<bool>;

    /// Assign (`Some`) or delete (`None`) an attribute, returning the
    /// previous value
    fn set_attribute(
        &mut self,
        kind: EntityKind,
        id: u64,
        key: KeyId,
        value: Option<PropertyValue>,
    ) -> Result<Option<PropertyValue>>;

    /// Read an attribute
    fn attribute(&self, kind: EntityKind, id: u64, key: KeyId) -> Option<&PropertyValue>;

    /// Look up a node
    fn node(&self, id: NodeId) -> Option<&NodeRecord>;

    /// Look up an edge
    fn edge(&self, id: EdgeId) -> Option<&EdgeRecord>;

    /// Edges incident to a node (outgoing and incoming), ordered by id
    fn edges_of(&self, node: NodeId) -> Vec<EdgeId>;

    /// Copy out the committed content
    fn export(&self) -> GraphContent;

    /// Replace the whole content (full resynchronization)
    fn import(&mut self, content: GraphContent) -> Result<()>;
}

#[derive(Debug, Clone)]
enum UndoOp {
    RemoveNode(NodeId),
    RestoreNode(NodeRecord),
    RemoveEdge(EdgeId),
    RestoreEdge(EdgeRecord),
    DetachLabel(NodeId, LabelId),
    AttachLabel(NodeId, LabelId),
    RestoreAttribute(EntityKind, u64, KeyId, Option<PropertyValue>),
}

#[derive(Debug, Clone, Default)]
struct IdAllocator {
    next: u64,
    free: BTreeSet<u64>,
}

impl IdAllocator {
    fn allocate(&self) -> u64 {
        self.free.first().copied().unwrap_or(self.next)
    }

    /// Ids skipped over by an explicit claim are not tracked as free; only
    /// released ids are reused.
    fn claim(&mut self, id: u64) -> Result<()> {
        if id == u64::MAX {
            return Err(Error::referential(format!("Id {} is out of range", id)));
        }
        if !self.free.remove(&id) {
            self.next = self.next.max(id + 1);
        }
        Ok(())
    }

    fn release(&mut self, id: u64) {
        self.free.insert(id);
    }
}

#[derive(Debug)]
struct Transaction {
    undo: Vec<UndoOp>,
    node_ids: IdAllocator,
    edge_ids: IdAllocator,
}

/// In-memory graph store
#[derive(Debug, Default)]
pub struct MemoryGraph {
    nodes: HashMap<NodeId, NodeRecord>,
    edges: HashMap<EdgeId, EdgeRecord>,
    /// node → incident edges
    adjacency: HashMap<NodeId, BTreeSet<EdgeId>>,
    node_ids: IdAllocator,
    edge_ids: IdAllocator,
    tx: Option<Transaction>,
}

impl MemoryGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph holding `content`
    pub fn from_content(content: GraphContent) -> Result<Self> {
        let mut graph = Self::new();
        graph.import(content)?;
        Ok(graph)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Check if a transaction is running
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn record(&mut self, op: UndoOp) {
        if let Some(tx) = self.tx.as_mut() {
            tx.undo.push(op);
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| Error::referential(format!("Node {} does not exist", id)))
    }

    fn attributes_mut(&mut self, kind: EntityKind, id: u64) -> Result<&mut BTreeMap<KeyId, PropertyValue>> {
        match kind {
            EntityKind::Node => self.nodes.get_mut(&id).map(|n| &mut n.attributes),
            EntityKind::Edge => self.edges.get_mut(&id).map(|e| &mut e.attributes),
        }
        .ok_or_else(|| {
            Error::referential(format!(
                "{} {} does not exist",
                match kind {
                    EntityKind::Node => "Node",
                    EntityKind::Edge => "Edge",
                },
                id
            ))
        })
    }

    fn insert_edge(&mut self, edge: EdgeRecord) {
        self.adjacency.entry(edge.src).or_default().insert(edge.id);
        self.adjacency.entry(edge.dst).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge);
    }

    fn take_edge(&mut self, id: EdgeId) -> Option<EdgeRecord> {
        let edge = self.edges.remove(&id)?;
        for endpoint in [edge.src, edge.dst] {
            if let Some(incident) = self.adjacency.get_mut(&endpoint) {
                incident.remove(&id);
                if incident.is_empty() {
                    self.adjacency.remove(&endpoint);
                }
            }
        }
        Some(edge)
    }

    fn undo(&mut self, op: UndoOp) {
        match op {
            UndoOp::RemoveNode(id) => {
                self.nodes.remove(&id);
            }
            UndoOp::RestoreNode(node) => {
                self.nodes.insert(node.id, node);
            }
            UndoOp::RemoveEdge(id) => {
                self.take_edge(id);
            }
            UndoOp::RestoreEdge(edge) => self.insert_edge(edge),
            UndoOp::DetachLabel(node, label) => {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.labels.remove(&label);
                }
            }
            UndoOp::AttachLabel(node, label) => {
                if let Some(n) = self.nodes.get_mut(&node) {
                    n.labels.insert(label);
                }
            }
            UndoOp::RestoreAttribute(kind, id, key, previous) => {
                if let Ok(attributes) = self.attributes_mut(kind, id) {
                    match previous {
                        Some(v) => attributes.insert(key, v),
                        None => attributes.remove(&key),
                    };
                }
            }
        }
    }
}

fn attribute_map(attributes: &[Attribute]) -> BTreeMap<KeyId, PropertyValue> {
    // later assignments to the same key win, as with replayed AttributeSet
    attributes.iter().cloned().collect()
}

impl GraphStore for MemoryGraph {
    fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::internal("Transaction already running"));
        }
        self.tx = Some(Transaction {
            undo: Vec::new(),
            node_ids: self.node_ids.clone(),
            edge_ids: self.edge_ids.clone(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.tx
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::internal("No transaction to commit"))
    }

    fn rollback(&mut self) {
        if let Some(tx) = self.tx.take() {
            for op in tx.undo.into_iter().rev() {
                self.undo(op);
            }
            self.node_ids = tx.node_ids;
            self.edge_ids = tx.edge_ids;
        }
    }

    fn allocate_node_id(&mut self) -> NodeId {
        self.node_ids.allocate()
    }

    fn allocate_edge_id(&mut self) -> EdgeId {
        self.edge_ids.allocate()
    }

    fn create_node(&mut self, id: NodeId, labels: &[LabelId], attributes: &[Attribute]) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::referential(format!("Node {} already exists", id)));
        }
        self.node_ids.claim(id)?;
        self.nodes.insert(
            id,
            NodeRecord {
                id,
                labels: labels.iter().copied().collect(),
                attributes: attribute_map(attributes),
            },
        );
        self.record(UndoOp::RemoveNode(id));
        Ok(())
    }

    fn delete_node(&mut self, id: NodeId) -> Result<NodeRecord> {
        if let Some(incident) = self.adjacency.get(&id) {
            return Err(Error::referential(format!(
                "Node {} still has {} edges",
                id,
                incident.len()
            )));
        }
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| Error::referential(format!("Node {} does not exist", id)))?;
        self.node_ids.release(id);
        self.record(UndoOp::RestoreNode(node.clone()));
        Ok(node)
    }

    fn create_edge(
        &mut self,
        id: EdgeId,
        relationship_type: TypeId,
        src: NodeId,
        dst: NodeId,
        attributes: &[Attribute],
    ) -> Result<()> {
        if self.edges.contains_key(&id) {
            return Err(Error::referential(format!("Edge {} already exists", id)));
        }
        for endpoint in [src, dst] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(Error::referential(format!(
                    "Edge {} endpoint node {} does not exist",
                    id, endpoint
                )));
            }
        }
        self.edge_ids.claim(id)?;
        self.insert_edge(EdgeRecord {
            id,
            relationship_type,
            src,
            dst,
            attributes: attribute_map(attributes),
        });
        self.record(UndoOp::RemoveEdge(id));
        Ok(())
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<EdgeRecord> {
        let edge = self
            .take_edge(id)
            .ok_or_else(|| Error::referential(format!("Edge {} does not exist", id)))?;
        self.edge_ids.release(id);
        self.record(UndoOp::RestoreEdge(edge.clone()));
        Ok(edge)
    }

    fn add_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        let added = self.node_mut(node)?.labels.insert(label);
        if added {
            self.record(UndoOp::DetachLabel(node, label));
        }
        Ok(added)
    }

    fn remove_label(&mut self, node: NodeId, label: LabelId) -> Result<bool> {
        let removed = self.node_mut(node)?.labels.remove(&label);
        if removed {
            self.record(UndoOp::AttachLabel(node, label));
        }
        Ok(removed)
    }

    fn set_attribute(
        &mut self,
        kind: EntityKind,
        id: u64,
        key: KeyId,
        value: Option<PropertyValue>,
    ) -> Result<Option<PropertyValue>> {
        let attributes = self.attributes_mut(kind, id)?;
        let previous = match value {
            Some(v) => attributes.insert(key, v),
            None => attributes.remove(&key),
        };
        self.record(UndoOp::RestoreAttribute(kind, id, key, previous.clone()));
        Ok(previous)
    }

    fn attribute(&self, kind: EntityKind, id: u64, key: KeyId) -> Option<&PropertyValue> {
        match kind {
            EntityKind::Node => self.nodes.get(&id)?.attributes.get(&key),
            EntityKind::Edge => self.edges.get(&id)?.attributes.get(&key),
        }
    }

    fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    fn edge(&self, id: EdgeId) -> Option<&EdgeRecord> {
        self.edges.get(&id)
    }

    fn edges_of(&self, node: NodeId) -> Vec<EdgeId> {
        self.adjacency
            .get(&node)
            .map(|incident| incident.iter().copied().collect())
            .unwrap_or_default()
    }

    fn export(&self) -> GraphContent {
        let mut nodes: Vec<NodeRecord> = self.nodes.values().cloned().collect();
        let mut edges: Vec<EdgeRecord> = self.edges.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        edges.sort_by_key(|e| e.id);
        GraphContent { nodes, edges }
    }

    fn import(&mut self, content: GraphContent) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::internal("Cannot import inside a transaction"));
        }

        let mut graph = MemoryGraph::new();
        for node in content.nodes {
            let id = node.id;
            if graph.nodes.insert(id, node).is_some() {
                return Err(Error::snapshot(format!("Duplicate node {} in content", id)));
            }
            graph.node_ids.claim(id).map_err(|e| Error::snapshot(e.to_string()))?;
        }
        for edge in content.edges {
            if graph.edges.contains_key(&edge.id) {
                return Err(Error::snapshot(format!("Duplicate edge {} in content", edge.id)));
            }
            if !graph.nodes.contains_key(&edge.src) || !graph.nodes.contains_key(&edge.dst) {
                return Err(Error::snapshot(format!(
                    "Edge {} references a missing endpoint",
                    edge.id
                )));
            }
            graph
                .edge_ids
                .claim(edge.id)
                .map_err(|e| Error::snapshot(e.to_string()))?;
            graph.insert_edge(edge);
        }

        *self = graph;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_nodes(n: u64) -> MemoryGraph {
        let mut graph = MemoryGraph::new();
        for id in 0..n {
            graph.create_node(id, &[], &[]).unwrap();
        }
        graph
    }

    #[test]
    fn test_create_and_delete_node() {
        let mut graph = MemoryGraph::new();
        let id = graph.allocate_node_id();
        graph
            .create_node(id, &[1, 0], &[(0, PropertyValue::Integer(1))])
            .unwrap();

        let node = graph.node(id).unwrap();
        assert_eq!(node.labels.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(node.attributes.get(&0), Some(&PropertyValue::Integer(1)));

        graph.delete_node(id).unwrap();
        assert!(graph.node(id).is_none());
    }

    #[test]
    fn test_duplicate_and_missing_ids_are_referential_errors() {
        let mut graph = graph_with_nodes(1);
        assert!(matches!(
            graph.create_node(0, &[], &[]).unwrap_err(),
            Error::Referential(_)
        ));
        assert!(matches!(graph.delete_node(5).unwrap_err(), Error::Referential(_)));
        assert!(matches!(graph.add_label(5, 0).unwrap_err(), Error::Referential(_)));
        assert!(matches!(
            graph
                .set_attribute(EntityKind::Edge, 0, 0, Some(PropertyValue::Null))
                .unwrap_err(),
            Error::Referential(_)
        ));
        assert!(matches!(
            graph.create_edge(0, 0, 0, 9, &[]).unwrap_err(),
            Error::Referential(_)
        ));
    }

    #[test]
    fn test_node_with_edges_cannot_be_deleted() {
        let mut graph = graph_with_nodes(2);
        graph.create_edge(0, 0, 0, 1, &[]).unwrap();
        assert!(matches!(graph.delete_node(1).unwrap_err(), Error::Referential(_)));

        graph.delete_edge(0).unwrap();
        graph.delete_node(1).unwrap();
    }

    #[test]
    fn test_id_reuse() {
        let mut graph = graph_with_nodes(3);
        graph.delete_node(1).unwrap();
        assert_eq!(graph.allocate_node_id(), 1);
        graph.create_node(1, &[], &[]).unwrap();
        assert_eq!(graph.allocate_node_id(), 3);
    }

    #[test]
    fn test_explicit_id_moves_allocation_past_it() {
        let mut graph = MemoryGraph::new();
        graph.create_node(4, &[], &[]).unwrap();
        assert_eq!(graph.allocate_node_id(), 5);
        graph.create_node(2, &[], &[]).unwrap();
        assert_eq!(graph.allocate_node_id(), 5);
    }

    #[test]
    fn test_sparse_ids_stay_cheap() {
        let mut graph = MemoryGraph::new();
        graph.begin().unwrap();
        graph.create_node(1 << 40, &[], &[]).unwrap();
        graph.create_node(u64::MAX - 1, &[], &[]).unwrap();
        graph.create_edge(1 << 50, 0, 1 << 40, u64::MAX - 1, &[]).unwrap();
        graph.commit().unwrap();
        assert_eq!(graph.allocate_node_id(), u64::MAX);
        assert_eq!(graph.allocate_edge_id(), (1 << 50) + 1);

        // a following transaction does not pay for the gaps
        graph.begin().unwrap();
        graph.create_node(0, &[], &[]).unwrap();
        graph.commit().unwrap();
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_max_id_rejected() {
        let mut graph = graph_with_nodes(1);
        assert!(matches!(
            graph.create_node(u64::MAX, &[], &[]).unwrap_err(),
            Error::Referential(_)
        ));
        assert!(graph.node(u64::MAX).is_none());
        assert!(matches!(
            graph.create_edge(u64::MAX, 0, 0, 0, &[]).unwrap_err(),
            Error::Referential(_)
        ));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_rollback_restores_allocator() {
        let mut graph = MemoryGraph::new();
        graph.begin().unwrap();
        graph.create_node(1 << 40, &[], &[]).unwrap();
        graph.rollback();
        assert_eq!(graph.allocate_node_id(), 0);
    }

    #[test]
    fn test_edges_of() {
        let mut graph = graph_with_nodes(3);
        graph.create_edge(0, 0, 0, 1, &[]).unwrap();
        graph.create_edge(1, 0, 2, 0, &[]).unwrap();
        graph.create_edge(2, 0, 1, 2, &[]).unwrap();
        assert_eq!(graph.edges_of(0), vec![0, 1]);
        graph.delete_edge(0).unwrap();
        assert_eq!(graph.edges_of(0), vec![1]);
    }

    #[test]
    fn test_rollback_restores_everything() {
        let mut graph = graph_with_nodes(2);
        graph.create_edge(0, 0, 0, 1, &[(0, PropertyValue::from("v"))]).unwrap();
        graph.add_label(0, 3).unwrap();
        let before = graph.export();

        graph.begin().unwrap();
        graph.create_node(2, &[1], &[]).unwrap();
        graph.delete_edge(0).unwrap();
        graph.delete_node(1).unwrap();
        graph.remove_label(0, 3).unwrap();
        graph.add_label(0, 4).unwrap();
        graph
            .set_attribute(EntityKind::Node, 0, 1, Some(PropertyValue::Integer(5)))
            .unwrap();
        graph.rollback();

        assert_eq!(graph.export(), before);
        assert!(!graph.in_transaction());
        assert_eq!(graph.edges_of(1), vec![0]);
        assert_eq!(graph.allocate_node_id(), 2);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let mut graph = MemoryGraph::new();
        graph.begin().unwrap();
        graph.create_node(0, &[], &[]).unwrap();
        graph.commit().unwrap();
        graph.rollback();
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_nested_begin_rejected() {
        let mut graph = MemoryGraph::new();
        graph.begin().unwrap();
        assert!(graph.begin().is_err());
    }

    #[test]
    fn test_attribute_overwrite_and_delete() {
        let mut graph = graph_with_nodes(1);
        let prev = graph
            .set_attribute(EntityKind::Node, 0, 0, Some(PropertyValue::Integer(1)))
            .unwrap();
        assert_eq!(prev, None);
        let prev = graph
            .set_attribute(EntityKind::Node, 0, 0, Some(PropertyValue::Integer(2)))
            .unwrap();
        assert_eq!(prev, Some(PropertyValue::Integer(1)));
        graph.set_attribute(EntityKind::Node, 0, 0, None).unwrap();
        assert!(graph.attribute(EntityKind::Node, 0, 0).is_none());
    }

    #[test]
    fn test_export_import() {
        let mut graph = graph_with_nodes(3);
        graph.create_edge(7, 1, 0, 2, &[]).unwrap();
        let content = graph.export();

        let copy = MemoryGraph::from_content(content.clone()).unwrap();
        assert_eq!(copy.export(), content);
        assert_eq!(copy.edges_of(2), vec![7]);
    }

    #[test]
    fn test_import_rejects_dangling_edge() {
        let content = GraphContent {
            nodes: vec![],
            edges: vec![EdgeRecord {
                id: 0,
                relationship_type: 0,
                src: 0,
                dst: 1,
                attributes: BTreeMap::new(),
            }],
        };
        assert!(MemoryGraph::from_content(content).is_err());
    }
}
