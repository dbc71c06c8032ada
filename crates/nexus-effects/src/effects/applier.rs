//! Effect applier - replica side
//!
//! Replays incoming batches against the replica's own store, one batch per
//! local transaction:
//!
//! ```text
//!            apply ok
//!          ┌─────────┐
//!          ▼         │
//!      ┌────────┐    │   decode / schema / referential error
//!      │ Synced │────┴──────────────────────────┐
//!      └────────┘                               ▼
//!          ▲                              ┌──────────┐
//!          └──────── resynchronize ───────│ Diverged │◄─┐ apply refused
//!                                         └──────────┘──┘
//! ```
//!
//! A failed batch is rolled back completely before the applier turns
//! Diverged, so a reader never sees part of a batch.

use super::{Effect, EffectBatch};
use crate::graph::GraphStore;
use crate::replication::snapshot::GraphSnapshot;
use crate::schema::{SchemaNamespace, SchemaRegistry};
use crate::value::EncodeLimits;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Replica applier state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplierState {
    /// Applying batches
    Synced,
    /// Refusing batches until a full resynchronization completes
    Diverged {
        /// First error that caused the divergence
        reason: String,
    },
}

impl ApplierState {
    /// Check if the state is Synced
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }
}

/// Applier statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplierStats {
    /// Batches committed
    pub batches_applied: u64,
    /// Effects committed
    pub effects_applied: u64,
    /// Transitions to Diverged
    pub divergences: u64,
    /// Completed full resynchronizations
    pub resyncs: u64,
    /// Batches refused while Diverged
    pub batches_refused: u64,
}

/// Replays effect batches onto a replica store
pub struct EffectApplier<S: GraphStore> {
    store: S,
    schema: SchemaRegistry,
    state: watch::Sender<ApplierState>,
    stats: ApplierStats,
    max_depth: usize,
}

impl<S: GraphStore> EffectApplier<S> {
    /// Create an applier over an (empty or resynchronized) replica store
    pub fn new(store: S) -> Self {
        Self::with_schema(store, SchemaRegistry::new())
    }

    /// Create an applier with an existing schema registry
    pub fn with_schema(store: S, schema: SchemaRegistry) -> Self {
        let (state, _) = watch::channel(ApplierState::Synced);
        Self {
            store,
            schema,
            state,
            stats: ApplierStats::default(),
            max_depth: EncodeLimits::default().max_array_depth,
        }
    }

    /// Bound the array nesting accepted on decode
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Current state
    pub fn state(&self) -> ApplierState {
        self.state.borrow().clone()
    }

    /// Check if the applier is Diverged
    pub fn is_diverged(&self) -> bool {
        !self.state.borrow().is_synced()
    }

    /// Watch state transitions (the Diverged signal for the serving layer)
    pub fn subscribe_state(&self) -> watch::Receiver<ApplierState> {
        self.state.subscribe()
    }

    /// Statistics
    pub fn stats(&self) -> &ApplierStats {
        &self.stats
    }

    /// Replica store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replica schema registry
    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Decode and apply one serialized batch; returns the number of effects
    pub fn apply(&mut self, payload: &[u8]) -> Result<usize> {
        self.refuse_if_diverged()?;

        let batch = match EffectBatch::decode_with_depth(payload, self.max_depth) {
            Ok(batch) => batch,
            Err(e) => {
                self.diverge(&e);
                return Err(e);
            }
        };
        self.apply_batch(&batch)
    }

    /// Apply a decoded batch as one local transaction
    pub fn apply_batch(&mut self, batch: &EffectBatch) -> Result<usize> {
        self.refuse_if_diverged()?;

        self.store.begin()?;
        let mark = self.schema.mark();

        let mut result = Ok(());
        for (index, effect) in batch.iter().enumerate() {
            if let Err(e) = self.replay(effect) {
                result = Err(annotate(e, index));
                break;
            }
        }
        if result.is_ok() {
            result = self.store.commit();
        }

        if let Err(e) = result {
            self.store.rollback();
            self.schema.rollback_to(mark);
            self.diverge(&e);
            return Err(e);
        }

        self.stats.batches_applied += 1;
        self.stats.effects_applied += batch.len() as u64;
        debug!("Applied batch of {} effects", batch.len());
        Ok(batch.len())
    }

    /// Force the Diverged state (e.g. a batch sequence gap seen by the transport)
    pub fn mark_diverged(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.diverge(&Error::replication(reason));
    }

    /// Replace store and schema with a full snapshot and return to Synced
    pub fn resynchronize(&mut self, snapshot: GraphSnapshot) -> Result<()> {
        let schema = SchemaRegistry::from_snapshot(snapshot.schema)?;
        validate_content(&schema, &snapshot.content)?;

        self.store.import(snapshot.content)?;
        self.schema = schema;
        self.stats.resyncs += 1;
        self.state.send_replace(ApplierState::Synced);

        info!(
            "Replica resynchronized for graph '{}' ({} labels, {} types, {} keys)",
            snapshot.graph_id,
            self.schema.len(SchemaNamespace::Label),
            self.schema.len(SchemaNamespace::RelationshipType),
            self.schema.len(SchemaNamespace::Attribute)
        );
        Ok(())
    }

    fn refuse_if_diverged(&mut self) -> Result<()> {
        if let ApplierState::Diverged { reason } = &*self.state.borrow() {
            self.stats.batches_refused += 1;
            return Err(Error::replication(format!(
                "Replica diverged ({}), resynchronization required",
                reason
            )));
        }
        Ok(())
    }

    fn diverge(&mut self, cause: &Error) {
        error!("Replica diverged: {}", cause);
        self.stats.divergences += 1;
        self.state.send_replace(ApplierState::Diverged {
            reason: cause.to_string(),
        });
    }

    fn replay(&mut self, effect: &Effect) -> Result<()> {
        match effect {
            Effect::SchemaAdd {
                namespace,
                id,
                name,
            } => return self.schema.apply(*namespace, name, *id),
            Effect::NodeCreate {
                labels, attributes, ..
            } => {
                for label in labels {
                    self.require(SchemaNamespace::Label, *label)?;
                }
                for (key, _) in attributes {
                    self.require(SchemaNamespace::Attribute, *key)?;
                }
            }
            Effect::EdgeCreate {
                relationship_type,
                attributes,
                ..
            } => {
                self.require(SchemaNamespace::RelationshipType, *relationship_type)?;
                for (key, _) in attributes {
                    self.require(SchemaNamespace::Attribute, *key)?;
                }
            }
            Effect::EdgeDelete {
                relationship_type, ..
            } => self.require(SchemaNamespace::RelationshipType, *relationship_type)?,
            Effect::LabelAdd { label, .. } | Effect::LabelRemove { label, .. } => {
                self.require(SchemaNamespace::Label, *label)?
            }
            Effect::AttributeSet { key, .. } => self.require(SchemaNamespace::Attribute, *key)?,
            Effect::NodeDelete { .. } => {}
        }
        apply_to_store(&mut self.store, effect)
    }

    fn require(&self, namespace: SchemaNamespace, id: u32) -> Result<()> {
        if self.schema.contains_id(namespace, id) {
            Ok(())
        } else {
            Err(Error::schema_divergence(format!(
                "{} id {} used before it was announced",
                namespace, id
            )))
        }
    }
}

fn annotate(error: Error, index: usize) -> Error {
    match error {
        Error::Referential(msg) => Error::referential(format!("effect {}: {}", index, msg)),
        Error::SchemaDivergence(msg) => Error::schema_divergence(format!("effect {}: {}", index, msg)),
        other => other,
    }
}

/// Perform the store primitive of one effect
///
/// Referential inconsistencies (unknown or duplicate ids, a label that is
/// already attached or missing, an edge whose type or endpoints differ from
/// the stored one) are errors, never skipped.
pub(crate) fn apply_to_store<S: GraphStore + ?Sized>(store: &mut S, effect: &Effect) -> Result<()> {
    match effect {
        Effect::SchemaAdd { .. } => Ok(()),
        Effect::NodeCreate {
            id,
            labels,
            attributes,
        } => store.create_node(*id, labels, attributes),
        Effect::NodeDelete { id } => store.delete_node(*id).map(|_| ()),
        Effect::EdgeCreate {
            id,
            relationship_type,
            src,
            dst,
            attributes,
        } => store.create_edge(*id, *relationship_type, *src, *dst, attributes),
        Effect::EdgeDelete {
            id,
            relationship_type,
            src,
            dst,
        } => {
            let stored = store
                .edge(*id)
                .ok_or_else(|| Error::referential(format!("Edge {} does not exist", id)))?;
            if stored.relationship_type != *relationship_type || stored.src != *src || stored.dst != *dst {
                return Err(Error::referential(format!(
                    "Edge {} is ({})-[{}]->({}) locally but master deleted ({})-[{}]->({})",
                    id, stored.src, stored.relationship_type, stored.dst, src, relationship_type, dst
                )));
            }
            store.delete_edge(*id).map(|_| ())
        }
        Effect::LabelAdd { node, label } => {
            if store.add_label(*node, *label)? {
                Ok(())
            } else {
                Err(Error::referential(format!("Node {} already has label {}", node, label)))
            }
        }
        Effect::LabelRemove { node, label } => {
            if store.remove_label(*node, *label)? {
                Ok(())
            } else {
                Err(Error::referential(format!("Node {} does not have label {}", node, label)))
            }
        }
        Effect::AttributeSet {
            entity_kind,
            entity,
            key,
            value,
        } => store
            .set_attribute(*entity_kind, *entity, *key, value.clone())
            .map(|_| ()),
    }
}

fn validate_content(schema: &SchemaRegistry, content: &crate::graph::GraphContent) -> Result<()> {
    let check = |namespace, id| {
        if schema.contains_id(namespace, id) {
            Ok(())
        } else {
            Err(Error::snapshot(format!("Snapshot references unknown {} id {}", namespace, id)))
        }
    };

    for node in &content.nodes {
        for label in &node.labels {
            check(SchemaNamespace::Label, *label)?;
        }
        for key in node.attributes.keys() {
            check(SchemaNamespace::Attribute, *key)?;
        }
    }
    for edge in &content.edges {
        check(SchemaNamespace::RelationshipType, edge.relationship_type)?;
        for key in edge.attributes.keys() {
            check(SchemaNamespace::Attribute, *key)?;
        }
    }
    Ok(())
}
