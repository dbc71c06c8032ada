//! Schema synchronizer - Label/Type/Key dictionaries
//!
//! Maintains three independent bijective mappings, one per namespace:
//! - Labels (node labels) ↔ LabelId
//! - Relationship types ↔ TypeId
//! - Attribute keys ↔ KeyId
//!
//! Ids are 0-based and assigned in first-seen order. On the master a new
//! name is introduced through [`SchemaRegistry::ensure`], which appends a
//! SchemaAdd effect to the current batch. A replica only ever learns names
//! by replaying those effects through [`SchemaRegistry::apply`], so both
//! sides hold identical dictionaries as long as batches arrive in order
//! and without gaps.

use crate::effects::{Effect, EffectBatch};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Label ID type
pub type LabelId = u32;

/// Relationship type ID
pub type TypeId = u32;

/// Attribute key ID
pub type KeyId = u32;

/// Schema namespace
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaNamespace {
    /// Node labels
    Label = 0,
    /// Relationship types
    RelationshipType = 1,
    /// Attribute keys (shared by nodes and edges)
    Attribute = 2,
}

impl TryFrom<u8> for SchemaNamespace {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Label),
            1 => Ok(Self::RelationshipType),
            2 => Ok(Self::Attribute),
            _ => Err(Error::decode(format!("Unknown schema namespace: {}", value))),
        }
    }
}

impl fmt::Display for SchemaNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label => write!(f, "label"),
            Self::RelationshipType => write!(f, "relationship type"),
            Self::Attribute => write!(f, "attribute"),
        }
    }
}

/// One namespace: name → id and id → name
#[derive(Debug, Clone, Default)]
struct NameTable {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl NameTable {
    fn from_names(names: Vec<String>) -> Result<Self> {
        let mut ids = HashMap::with_capacity(names.len());
        for (id, name) in names.iter().enumerate() {
            if ids.insert(name.clone(), id as u32).is_some() {
                return Err(Error::schema_divergence(format!(
                    "Duplicate name '{}' in schema snapshot",
                    name
                )));
            }
        }
        Ok(Self { names, ids })
    }

    fn id_of(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    fn next_id(&self) -> Result<u32> {
        u32::try_from(self.names.len())
            .map_err(|_| Error::encode("Schema namespace exhausted".to_string()))
    }

    fn push(&mut self, name: &str) -> Result<u32> {
        let id = self.next_id()?;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        Ok(id)
    }

    fn truncate(&mut self, len: usize) {
        for name in self.names.drain(len.min(self.names.len())..) {
            self.ids.remove(&name);
        }
    }
}

/// Position in the dictionaries that can be rolled back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaMark {
    labels: usize,
    relationship_types: usize,
    attributes: usize,
}

/// Serializable dictionary state, transferred on full resynchronization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Label names, index is the id
    pub labels: Vec<String>,
    /// Relationship type names, index is the id
    pub relationship_types: Vec<String>,
    /// Attribute key names, index is the id
    pub attributes: Vec<String>,
}

/// Per-graph schema synchronizer
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    labels: NameTable,
    relationship_types: NameTable,
    attributes: NameTable,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from a resynchronization snapshot
    pub fn from_snapshot(snapshot: SchemaSnapshot) -> Result<Self> {
        Ok(Self {
            labels: NameTable::from_names(snapshot.labels)?,
            relationship_types: NameTable::from_names(snapshot.relationship_types)?,
            attributes: NameTable::from_names(snapshot.attributes)?,
        })
    }

    /// Capture the dictionaries
    pub fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            labels: self.labels.names.clone(),
            relationship_types: self.relationship_types.names.clone(),
            attributes: self.attributes.names.clone(),
        }
    }

    fn table(&self, namespace: SchemaNamespace) -> &NameTable {
        match namespace {
            SchemaNamespace::Label => &self.labels,
            SchemaNamespace::RelationshipType => &self.relationship_types,
            SchemaNamespace::Attribute => &self.attributes,
        }
    }

    fn table_mut(&mut self, namespace: SchemaNamespace) -> &mut NameTable {
        match namespace {
            SchemaNamespace::Label => &mut self.labels,
            SchemaNamespace::RelationshipType => &mut self.relationship_types,
            SchemaNamespace::Attribute => &mut self.attributes,
        }
    }

    /// Resolve `name`, allocating the next id if it is new
    ///
    /// A newly allocated id is announced by a SchemaAdd effect appended to
    /// `batch`, ahead of any effect the caller goes on to append with it.
    pub fn ensure(
        &mut self,
        namespace: SchemaNamespace,
        name: &str,
        batch: &mut EffectBatch,
    ) -> Result<u32> {
        if let Some(id) = self.table(namespace).id_of(name) {
            return Ok(id);
        }

        let id = self.table_mut(namespace).push(name)?;
        tracing::trace!("Schema {} '{}' allocated id {}", namespace, name, id);
        batch.push(Effect::SchemaAdd {
            namespace,
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    /// Replay a SchemaAdd effect
    ///
    /// Re-applying a pair that is already known is a no-op. Any mismatch
    /// between the carried id and the local mapping, or an id that skips
    /// ahead of the next free one, is a schema divergence.
    pub fn apply(&mut self, namespace: SchemaNamespace, name: &str, id: u32) -> Result<()> {
        let table = self.table(namespace);

        if let Some(existing) = table.id_of(name) {
            if existing == id {
                return Ok(());
            }
            return Err(Error::schema_divergence(format!(
                "{} '{}' is mapped to id {} locally but master sent id {}",
                namespace, name, existing, id
            )));
        }

        if let Some(other) = table.name_of(id) {
            return Err(Error::schema_divergence(format!(
                "{} id {} is bound to '{}' locally but master sent '{}'",
                namespace, id, other, name
            )));
        }

        let expected = table.next_id()?;
        if id != expected {
            return Err(Error::schema_divergence(format!(
                "{} '{}' carries id {} but the next id is {}",
                namespace, name, id, expected
            )));
        }

        self.table_mut(namespace).push(name)?;
        Ok(())
    }

    /// Look up the id bound to `name`
    pub fn id_of(&self, namespace: SchemaNamespace, name: &str) -> Option<u32> {
        self.table(namespace).id_of(name)
    }

    /// Look up the name bound to `id`
    pub fn name_of(&self, namespace: SchemaNamespace, id: u32) -> Option<&str> {
        self.table(namespace).name_of(id)
    }

    /// Check whether `id` is bound in `namespace`
    pub fn contains_id(&self, namespace: SchemaNamespace, id: u32) -> bool {
        self.table(namespace).name_of(id).is_some()
    }

    /// Number of names in `namespace`
    pub fn len(&self, namespace: SchemaNamespace) -> usize {
        self.table(namespace).names.len()
    }

    /// Check whether all namespaces are empty
    pub fn is_empty(&self) -> bool {
        self.labels.names.is_empty()
            && self.relationship_types.names.is_empty()
            && self.attributes.names.is_empty()
    }

    /// Current position, to roll back an aborted transaction
    pub fn mark(&self) -> SchemaMark {
        SchemaMark {
            labels: self.labels.names.len(),
            relationship_types: self.relationship_types.names.len(),
            attributes: self.attributes.names.len(),
        }
    }

    /// Forget every name allocated after `mark`
    pub fn rollback_to(&mut self, mark: SchemaMark) {
        self.labels.truncate(mark.labels);
        self.relationship_types.truncate(mark.relationship_types);
        self.attributes.truncate(mark.attributes);
    }

    /// Drop every mapping (full resynchronization starts from scratch)
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
