//! Effect encoder - master side
//!
//! The query engine reports every change a write transaction performs as a
//! [`Mutation`] (names, not ids). The encoder resolves names through the
//! schema registry, validates values against the encode limits and appends
//! one [`Effect`] per mutation to the transaction's batch.
//!
//! Failures are sticky: after the first encode error the transaction can
//! only be aborted, and every schema id it allocated is released again.

use super::{Attribute, Effect, EffectBatch, EntityKind};
use crate::effects::applier::apply_to_store;
use crate::graph::{EdgeId, GraphStore, NodeId};
use crate::schema::{KeyId, LabelId, SchemaMark, SchemaNamespace, SchemaRegistry, TypeId};
use crate::value::{EncodeLimits, PropertyValue, encode_into};
use crate::{Error, Result};
use tracing::{debug, trace};

/// One change performed by a write transaction, as reported by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Node created with initial labels and attributes
    NodeCreated {
        /// Node ID chosen by storage
        id: NodeId,
        /// Label names
        labels: Vec<String>,
        /// Attributes by key name
        attributes: Vec<(String, PropertyValue)>,
    },
    /// Node deleted (its edges were reported deleted before)
    NodeDeleted {
        /// Node ID
        id: NodeId,
    },
    /// Edge created
    EdgeCreated {
        /// Edge ID chosen by storage
        id: EdgeId,
        /// Relationship type name
        relationship_type: String,
        /// Source node
        src: NodeId,
        /// Destination node
        dst: NodeId,
        /// Attributes by key name
        attributes: Vec<(String, PropertyValue)>,
    },
    /// Edge deleted
    EdgeDeleted {
        /// Edge ID
        id: EdgeId,
        /// Relationship type name
        relationship_type: String,
        /// Source node
        src: NodeId,
        /// Destination node
        dst: NodeId,
    },
    /// Label attached to a node
    LabelAdded {
        /// Node ID
        node: NodeId,
        /// Label name
        label: String,
    },
    /// Label detached from a node
    LabelRemoved {
        /// Node ID
        node: NodeId,
        /// Label name
        label: String,
    },
    /// Attribute assigned; assigning Null removes the key
    AttributeSet {
        /// Entity kind
        entity_kind: EntityKind,
        /// Entity ID
        entity: u64,
        /// Key name
        key: String,
        /// New value
        value: PropertyValue,
    },
    /// Attribute removed
    AttributeRemoved {
        /// Entity kind
        entity_kind: EntityKind,
        /// Entity ID
        entity: u64,
        /// Key name
        key: String,
    },
}

/// Per-transaction effect encoder
///
/// Dropping an encoder without calling [`finish`](Self::finish) aborts it.
pub struct EffectEncoder<'a> {
    schema: &'a mut SchemaRegistry,
    limits: EncodeLimits,
    batch: EffectBatch,
    mark: SchemaMark,
    failure: Option<String>,
    done: bool,
    scratch: Vec<u8>,
}

impl<'a> EffectEncoder<'a> {
    /// Start encoding a transaction against the graph's schema registry
    pub fn new(schema: &'a mut SchemaRegistry, limits: EncodeLimits) -> Self {
        let mark = schema.mark();
        Self {
            schema,
            limits,
            batch: EffectBatch::new(),
            mark,
            failure: None,
            done: false,
            scratch: Vec::new(),
        }
    }

    /// Schema registry as seen by this transaction
    pub fn schema(&self) -> &SchemaRegistry {
        &*self.schema
    }

    /// Effects recorded so far
    pub fn batch(&self) -> &EffectBatch {
        &self.batch
    }

    /// Check whether an earlier mutation failed to encode
    pub fn has_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Record one mutation
    ///
    /// Returns the error of the first failing mutation; every later call
    /// fails as well.
    pub fn observe(&mut self, mutation: Mutation) -> Result<()> {
        if let Some(reason) = &self.failure {
            return Err(Error::encode(format!("Transaction already failed: {}", reason)));
        }

        if let Err(e) = self.record(mutation) {
            self.fail(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Record a node creation
    pub fn node_created(
        &mut self,
        id: NodeId,
        labels: &[&str],
        attributes: &[(&str, PropertyValue)],
    ) -> Result<()> {
        self.observe(Mutation::NodeCreated {
            id,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            attributes: owned_attributes(attributes),
        })
    }

    /// Record a node deletion
    pub fn node_deleted(&mut self, id: NodeId) -> Result<()> {
        self.observe(Mutation::NodeDeleted { id })
    }

    /// Record an edge creation
    pub fn edge_created(
        &mut self,
        id: EdgeId,
        relationship_type: &str,
        src: NodeId,
        dst: NodeId,
        attributes: &[(&str, PropertyValue)],
    ) -> Result<()> {
        self.observe(Mutation::EdgeCreated {
            id,
            relationship_type: relationship_type.to_string(),
            src,
            dst,
            attributes: owned_attributes(attributes),
        })
    }

    /// Record an edge deletion
    pub fn edge_deleted(&mut self, id: EdgeId, relationship_type: &str, src: NodeId, dst: NodeId) -> Result<()> {
        self.observe(Mutation::EdgeDeleted {
            id,
            relationship_type: relationship_type.to_string(),
            src,
            dst,
        })
    }

    /// Record a label addition
    pub fn label_added(&mut self, node: NodeId, label: &str) -> Result<()> {
        self.observe(Mutation::LabelAdded {
            node,
            label: label.to_string(),
        })
    }

    /// Record a label removal
    pub fn label_removed(&mut self, node: NodeId, label: &str) -> Result<()> {
        self.observe(Mutation::LabelRemoved {
            node,
            label: label.to_string(),
        })
    }

    /// Record an attribute assignment
    pub fn attribute_set(
        &mut self,
        entity_kind: EntityKind,
        entity: u64,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        self.observe(Mutation::AttributeSet {
            entity_kind,
            entity,
            key: key.to_string(),
            value,
        })
    }

    /// Record an attribute removal
    pub fn attribute_removed(&mut self, entity_kind: EntityKind, entity: u64, key: &str) -> Result<()> {
        self.observe(Mutation::AttributeRemoved {
            entity_kind,
            entity,
            key: key.to_string(),
        })
    }

    /// Close the transaction
    ///
    /// Returns `None` for a transaction that changed nothing. On a failed
    /// transaction the schema allocations are rolled back and the first
    /// error is returned.
    pub fn finish(mut self) -> Result<Option<EffectBatch>> {
        self.complete()
    }

    /// Abandon the transaction, releasing its schema allocations
    pub fn abort(mut self) {
        self.discard();
    }

    pub(crate) fn fail(&mut self, reason: String) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    pub(crate) fn last_effect(&self) -> Option<&Effect> {
        self.batch.effects().last()
    }

    pub(crate) fn complete(&mut self) -> Result<Option<EffectBatch>> {
        if let Some(reason) = self.failure.take() {
            self.discard();
            return Err(Error::encode(reason));
        }

        if self.batch.len() > self.limits.max_batch_effects {
            let count = self.batch.len();
            self.discard();
            return Err(Error::encode(format!(
                "Batch too large: {} effects (max: {})",
                count, self.limits.max_batch_effects
            )));
        }

        self.done = true;
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return Ok(None);
        }
        debug!("Encoded transaction: {} effects", batch.len());
        Ok(Some(batch))
    }

    pub(crate) fn discard(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.schema.rollback_to(self.mark);
        self.batch = EffectBatch::new();
        debug!("Transaction aborted, schema rolled back");
    }

    fn record(&mut self, mutation: Mutation) -> Result<()> {
        let effect = match mutation {
            Mutation::NodeCreated {
                id,
                labels,
                attributes,
            } => {
                if labels.len() > self.limits.max_labels {
                    return Err(Error::encode(format!(
                        "Node {} has {} labels (max: {})",
                        id,
                        labels.len(),
                        self.limits.max_labels
                    )));
                }
                let mut label_ids: Vec<LabelId> = Vec::with_capacity(labels.len());
                for label in &labels {
                    let label_id = self.ensure(SchemaNamespace::Label, label)?;
                    if !label_ids.contains(&label_id) {
                        label_ids.push(label_id);
                    }
                }
                let attributes = self.attributes(attributes)?;
                Effect::NodeCreate {
                    id,
                    labels: label_ids,
                    attributes,
                }
            }
            Mutation::NodeDeleted { id } => Effect::NodeDelete { id },
            Mutation::EdgeCreated {
                id,
                relationship_type,
                src,
                dst,
                attributes,
            } => {
                let relationship_type = self.ensure(SchemaNamespace::RelationshipType, &relationship_type)?;
                let attributes = self.attributes(attributes)?;
                Effect::EdgeCreate {
                    id,
                    relationship_type,
                    src,
                    dst,
                    attributes,
                }
            }
            Mutation::EdgeDeleted {
                id,
                relationship_type,
                src,
                dst,
            } => Effect::EdgeDelete {
                id,
                relationship_type: self.known(SchemaNamespace::RelationshipType, &relationship_type)?,
                src,
                dst,
            },
            Mutation::LabelAdded { node, label } => Effect::LabelAdd {
                node,
                label: self.ensure(SchemaNamespace::Label, &label)?,
            },
            Mutation::LabelRemoved { node, label } => Effect::LabelRemove {
                node,
                label: self.known(SchemaNamespace::Label, &label)?,
            },
            Mutation::AttributeSet {
                entity_kind,
                entity,
                key,
                value,
            } => {
                let key = self.ensure(SchemaNamespace::Attribute, &key)?;
                let value = if value.is_null() {
                    None
                } else {
                    self.check_value(&value)?;
                    Some(value)
                };
                Effect::AttributeSet {
                    entity_kind,
                    entity,
                    key,
                    value,
                }
            }
            Mutation::AttributeRemoved {
                entity_kind,
                entity,
                key,
            } => Effect::AttributeSet {
                entity_kind,
                entity,
                key: self.known(SchemaNamespace::Attribute, &key)?,
                value: None,
            },
        };

        trace!("Effect {:?}", effect.kind());
        self.batch.push(effect);
        Ok(())
    }

    fn ensure(&mut self, namespace: SchemaNamespace, name: &str) -> Result<u32> {
        self.schema.ensure(namespace, name, &mut self.batch)
    }

    fn known(&self, namespace: SchemaNamespace, name: &str) -> Result<u32> {
        self.schema
            .id_of(namespace, name)
            .ok_or_else(|| Error::encode(format!("Unknown {} '{}'", namespace, name)))
    }

    /// Resolve an initial attribute set; Null entries are not stored
    fn attributes(&mut self, attributes: Vec<(String, PropertyValue)>) -> Result<Vec<Attribute>> {
        let mut resolved: Vec<Attribute> = Vec::with_capacity(attributes.len());
        for (name, value) in attributes {
            if value.is_null() {
                continue;
            }
            self.check_value(&value)?;
            let key: KeyId = self.ensure(SchemaNamespace::Attribute, &name)?;
            // a repeated key keeps its last value
            match resolved.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => resolved.push((key, value)),
            }
        }

        if resolved.len() > self.limits.max_attributes {
            return Err(Error::encode(format!(
                "Attribute set too large: {} (max: {})",
                resolved.len(),
                self.limits.max_attributes
            )));
        }
        Ok(resolved)
    }

    fn check_value(&mut self, value: &PropertyValue) -> Result<()> {
        self.scratch.clear();
        encode_into(value, &mut self.scratch, &self.limits)
    }
}

impl Drop for EffectEncoder<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}

fn owned_attributes(attributes: &[(&str, PropertyValue)]) -> Vec<(String, PropertyValue)> {
    attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// A write transaction on a master store
///
/// Every store mutation goes through the encoder first, then the resolved
/// effect is applied to the store, so the batch describes exactly what the
/// store did. Dropping without [`commit`](Self::commit) rolls back.
pub struct WriteTransaction<'a, S: GraphStore + ?Sized> {
    store: &'a mut S,
    encoder: EffectEncoder<'a>,
    done: bool,
}

impl<'a, S: GraphStore + ?Sized> WriteTransaction<'a, S> {
    /// Begin a transaction on `store`
    pub fn begin(store: &'a mut S, schema: &'a mut SchemaRegistry, limits: EncodeLimits) -> Result<Self> {
        store.begin()?;
        Ok(Self {
            store,
            encoder: EffectEncoder::new(schema, limits),
            done: false,
        })
    }

    /// Read access to the store, including this transaction's changes
    pub fn store(&self) -> &S {
        &*self.store
    }

    /// Schema as seen by this transaction
    pub fn schema(&self) -> &SchemaRegistry {
        self.encoder.schema()
    }

    /// Create a node; returns its id
    pub fn create_node(&mut self, labels: &[&str], attributes: &[(&str, PropertyValue)]) -> Result<NodeId> {
        let id = self.store.allocate_node_id();
        self.encoder.node_created(id, labels, attributes)?;
        self.apply_last()?;
        Ok(id)
    }

    /// Create an edge between two existing nodes; returns its id
    pub fn create_edge(
        &mut self,
        relationship_type: &str,
        src: NodeId,
        dst: NodeId,
        attributes: &[(&str, PropertyValue)],
    ) -> Result<EdgeId> {
        let id = self.store.allocate_edge_id();
        self.encoder.edge_created(id, relationship_type, src, dst, attributes)?;
        self.apply_last()?;
        Ok(id)
    }

    /// Delete an edge
    pub fn delete_edge(&mut self, id: EdgeId) -> Result<()> {
        let endpoints = self
            .store
            .edge(id)
            .map(|edge| (edge.relationship_type, edge.src, edge.dst));
        let Some((relationship_type, src, dst)) = endpoints else {
            return Err(self.reject(format!("Edge {} does not exist", id)));
        };
        let name = self.type_name(relationship_type)?;
        self.encoder.edge_deleted(id, &name, src, dst)?;
        self.apply_last()
    }

    /// Delete a node together with its edges (edge deletions come first)
    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        if self.store.node(id).is_none() {
            return Err(self.reject(format!("Node {} does not exist", id)));
        }
        for edge in self.store.edges_of(id) {
            self.delete_edge(edge)?;
        }
        self.encoder.node_deleted(id)?;
        self.apply_last()
    }

    /// Attach a label; returns false (and records nothing) if already attached
    pub fn add_label(&mut self, node: NodeId, label: &str) -> Result<bool> {
        let Some(attached) = self.label_attached(node, label) else {
            return Err(self.reject(format!("Node {} does not exist", node)));
        };
        if attached {
            return Ok(false);
        }
        self.encoder.label_added(node, label)?;
        self.apply_last()?;
        Ok(true)
    }

    /// Detach a label; returns false (and records nothing) if not attached
    pub fn remove_label(&mut self, node: NodeId, label: &str) -> Result<bool> {
        let Some(attached) = self.label_attached(node, label) else {
            return Err(self.reject(format!("Node {} does not exist", node)));
        };
        if !attached {
            return Ok(false);
        }
        self.encoder.label_removed(node, label)?;
        self.apply_last()?;
        Ok(true)
    }

    /// Assign an attribute; Null removes the key
    pub fn set_attribute(
        &mut self,
        entity_kind: EntityKind,
        entity: u64,
        key: &str,
        value: PropertyValue,
    ) -> Result<()> {
        if value.is_null() {
            return self.remove_attribute(entity_kind, entity, key).map(|_| ());
        }
        self.require_entity(entity_kind, entity)?;
        self.encoder.attribute_set(entity_kind, entity, key, value)?;
        self.apply_last()
    }

    /// Remove an attribute; returns false (and records nothing) if absent
    pub fn remove_attribute(&mut self, entity_kind: EntityKind, entity: u64, key: &str) -> Result<bool> {
        self.require_entity(entity_kind, entity)?;
        let present = self
            .encoder
            .schema()
            .id_of(SchemaNamespace::Attribute, key)
            .is_some_and(|k| self.store.attribute(entity_kind, entity, k).is_some());
        if !present {
            return Ok(false);
        }
        self.encoder.attribute_removed(entity_kind, entity, key)?;
        self.apply_last()?;
        Ok(true)
    }

    /// Commit the store transaction and hand out the batch
    ///
    /// Returns `None` for a transaction that changed nothing.
    pub fn commit(mut self) -> Result<Option<EffectBatch>> {
        self.done = true;
        match self.encoder.complete() {
            Ok(batch) => {
                self.store.commit()?;
                Ok(batch)
            }
            Err(e) => {
                self.store.rollback();
                Err(e)
            }
        }
    }

    /// Roll back the store and the schema allocations
    pub fn rollback(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        self.done = true;
        self.encoder.discard();
        self.store.rollback();
    }

    fn apply_last(&mut self) -> Result<()> {
        let result = match self.encoder.last_effect() {
            Some(effect) => apply_to_store(&mut *self.store, effect),
            None => Err(Error::internal("No effect recorded")),
        };
        if let Err(e) = &result {
            self.encoder.fail(e.to_string());
        }
        result
    }

    fn reject(&mut self, reason: String) -> Error {
        self.encoder.fail(reason.clone());
        Error::referential(reason)
    }

    /// `None` if the node does not exist
    fn label_attached(&self, node: NodeId, label: &str) -> Option<bool> {
        let record = self.store.node(node)?;
        Some(
            self.encoder
                .schema()
                .id_of(SchemaNamespace::Label, label)
                .is_some_and(|id| record.labels.contains(&id)),
        )
    }

    fn require_entity(&mut self, kind: EntityKind, id: u64) -> Result<()> {
        let exists = match kind {
            EntityKind::Node => self.store.node(id).is_some(),
            EntityKind::Edge => self.store.edge(id).is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(self.reject(format!("{:?} {} does not exist", kind, id)))
        }
    }

    fn type_name(&mut self, relationship_type: TypeId) -> Result<String> {
        let name = self
            .encoder
            .schema()
            .name_of(SchemaNamespace::RelationshipType, relationship_type)
            .map(str::to_string);
        match name {
            Some(name) => Ok(name),
            None => Err(self.reject(format!("Unknown relationship type id {}", relationship_type))),
        }
    }
}

impl<S: GraphStore + ?Sized> Drop for WriteTransaction<'_, S> {
    fn drop(&mut self) {
        if !self.done {
            self.abandon();
        }
    }
}
