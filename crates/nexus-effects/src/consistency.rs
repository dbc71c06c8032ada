//! Graph comparison for replication consistency checks
//!
//! Master and replica graphs are compared through a [`GraphView`]: every
//! label, relationship type and attribute key is resolved to its name, so
//! two graphs are equal when they hold the same nodes and edges with the
//! same names and values, whatever order they were built in. Doubles
//! compare bit-exactly.

use crate::graph::{EdgeId, GraphContent, GraphStore, NodeId};
use crate::replication::snapshot::GraphSnapshot;
use crate::schema::{SchemaNamespace, SchemaRegistry};
use crate::value::PropertyValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Node with names resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Node ID
    pub id: NodeId,
    /// Label names
    pub labels: BTreeSet<String>,
    /// Attributes by key name
    pub attributes: BTreeMap<String, PropertyValue>,
}

/// Edge with names resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    /// Edge ID
    pub id: EdgeId,
    /// Relationship type name
    pub relationship_type: String,
    /// Source node
    pub src: NodeId,
    /// Destination node
    pub dst: NodeId,
    /// Attributes by key name
    pub attributes: BTreeMap<String, PropertyValue>,
}

/// Order-independent, name-resolved view of a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphView {
    /// Nodes by id
    pub nodes: BTreeMap<NodeId, NodeView>,
    /// Edges by id
    pub edges: BTreeMap<EdgeId, EdgeView>,
}

impl GraphView {
    /// Capture the committed content of a store
    pub fn capture<S: GraphStore + ?Sized>(schema: &SchemaRegistry, store: &S) -> Result<Self> {
        Self::from_content(schema, &store.export())
    }

    /// View of a resync snapshot
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self> {
        let schema = SchemaRegistry::from_snapshot(snapshot.schema.clone())?;
        Self::from_content(&schema, &snapshot.content)
    }

    /// Resolve raw content through a schema registry
    pub fn from_content(schema: &SchemaRegistry, content: &GraphContent) -> Result<Self> {
        let mut view = Self::default();

        for node in &content.nodes {
            let labels = node
                .labels
                .iter()
                .map(|id| resolve(schema, SchemaNamespace::Label, *id))
                .collect::<Result<_>>()?;
            view.nodes.insert(
                node.id,
                NodeView {
                    id: node.id,
                    labels,
                    attributes: resolve_attributes(schema, &node.attributes)?,
                },
            );
        }

        for edge in &content.edges {
            view.edges.insert(
                edge.id,
                EdgeView {
                    id: edge.id,
                    relationship_type: resolve(schema, SchemaNamespace::RelationshipType, edge.relationship_type)?,
                    src: edge.src,
                    dst: edge.dst,
                    attributes: resolve_attributes(schema, &edge.attributes)?,
                },
            );
        }

        Ok(view)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

fn resolve(schema: &SchemaRegistry, namespace: SchemaNamespace, id: u32) -> Result<String> {
    schema
        .name_of(namespace, id)
        .map(str::to_string)
        .ok_or_else(|| Error::schema_divergence(format!("No {:?} name for id {}", namespace, id)))
}

fn resolve_attributes(
    schema: &SchemaRegistry,
    attributes: &BTreeMap<u32, PropertyValue>,
) -> Result<BTreeMap<String, PropertyValue>> {
    attributes
        .iter()
        .map(|(key, value)| Ok((resolve(schema, SchemaNamespace::Attribute, *key)?, value.clone())))
        .collect()
}

/// A node present on both sides with different content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMismatch {
    /// Master's node
    pub master: NodeView,
    /// Replica's node
    pub replica: NodeView,
}

/// An edge present on both sides with different content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeMismatch {
    /// Master's edge
    pub master: EdgeView,
    /// Replica's edge
    pub replica: EdgeView,
}

/// Differences between a master graph and a replica graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    /// Nodes the replica lacks
    pub missing_nodes: Vec<NodeView>,
    /// Nodes only the replica has
    pub extra_nodes: Vec<NodeView>,
    /// Nodes with different labels or attributes
    pub differing_nodes: Vec<NodeMismatch>,
    /// Edges the replica lacks
    pub missing_edges: Vec<EdgeView>,
    /// Edges only the replica has
    pub extra_edges: Vec<EdgeView>,
    /// Edges with different type, endpoints or attributes
    pub differing_edges: Vec<EdgeMismatch>,
}

impl GraphDiff {
    /// True when both graphs are equivalent
    pub fn is_empty(&self) -> bool {
        self.missing_nodes.is_empty()
            && self.extra_nodes.is_empty()
            && self.differing_nodes.is_empty()
            && self.missing_edges.is_empty()
            && self.extra_edges.is_empty()
            && self.differing_edges.is_empty()
    }

    /// Total number of differences
    pub fn len(&self) -> usize {
        self.missing_nodes.len()
            + self.extra_nodes.len()
            + self.differing_nodes.len()
            + self.missing_edges.len()
            + self.extra_edges.len()
            + self.differing_edges.len()
    }
}

impl fmt::Display for GraphDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "graphs are equivalent");
        }

        writeln!(
            f,
            "nodes: {} missing, {} extra, {} differing; edges: {} missing, {} extra, {} differing",
            self.missing_nodes.len(),
            self.extra_nodes.len(),
            self.differing_nodes.len(),
            self.missing_edges.len(),
            self.extra_edges.len(),
            self.differing_edges.len()
        )?;
        for node in &self.missing_nodes {
            writeln!(f, "  missing node {:?}", node)?;
        }
        for node in &self.extra_nodes {
            writeln!(f, "  extra node {:?}", node)?;
        }
        for m in &self.differing_nodes {
            writeln!(f, "  node {}: master {:?} replica {:?}", m.master.id, m.master, m.replica)?;
        }
        for edge in &self.missing_edges {
            writeln!(f, "  missing edge {:?}", edge)?;
        }
        for edge in &self.extra_edges {
            writeln!(f, "  extra edge {:?}", edge)?;
        }
        for m in &self.differing_edges {
            writeln!(f, "  edge {}: master {:?} replica {:?}", m.master.id, m.master, m.replica)?;
        }
        Ok(())
    }
}

/// Compare a master view against a replica view
pub fn compare(master: &GraphView, replica: &GraphView) -> GraphDiff {
    let mut diff = GraphDiff::default();

    for (id, node) in &master.nodes {
        match replica.nodes.get(id) {
            None => diff.missing_nodes.push(node.clone()),
            Some(other) if other != node => diff.differing_nodes.push(NodeMismatch {
                master: node.clone(),
                replica: other.clone(),
            }),
            Some(_) => {}
        }
    }
    diff.extra_nodes = replica
        .nodes
        .iter()
        .filter(|(id, _)| !master.nodes.contains_key(id))
        .map(|(_, node)| node.clone())
        .collect();

    for (id, edge) in &master.edges {
        match replica.edges.get(id) {
            None => diff.missing_edges.push(edge.clone()),
            Some(other) if other != edge => diff.differing_edges.push(EdgeMismatch {
                master: edge.clone(),
                replica: other.clone(),
            }),
            Some(_) => {}
        }
    }
    diff.extra_edges = replica
        .edges
        .iter()
        .filter(|(id, _)| !master.edges.contains_key(id))
        .map(|(_, edge)| edge.clone())
        .collect();

    diff
}

/// Compare two stores with their schemas
pub fn compare_stores<M, R>(
    master_schema: &SchemaRegistry,
    master: &M,
    replica_schema: &SchemaRegistry,
    replica: &R,
) -> Result<GraphDiff>
where
    M: GraphStore + ?Sized,
    R: GraphStore + ?Sized,
{
    let master = GraphView::capture(master_schema, master)?;
    let replica = GraphView::capture(replica_schema, replica)?;
    Ok(compare(&master, &replica))
}
