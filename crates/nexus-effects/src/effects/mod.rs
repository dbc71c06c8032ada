//! Effects - replayable descriptions of graph mutations
//!
//! A write transaction on the master produces one [`EffectBatch`]: the
//! ordered effects of every structural or attribute change it performed.
//! The batch is the unit of delivery and of replay.
//!
//! # Wire Format
//!
//! ```text
//! [effect_count:u32]
//!   [kind:1][fields...]   (repeated effect_count times)
//! ```
//!
//! All integers are fixed-width little-endian; property values go through
//! the value codec ([`crate::value`]).
//!
//! | kind | effect       | fields                                              |
//! |------|--------------|-----------------------------------------------------|
//! | 0x01 | SchemaAdd    | namespace:u8 id:u32 name:str                        |
//! | 0x02 | NodeCreate   | id:u64 labels:u16 label:u32* attrs:u16 (key:u32 value)* |
//! | 0x03 | NodeDelete   | id:u64                                              |
//! | 0x04 | EdgeCreate   | id:u64 type:u32 src:u64 dst:u64 attrs:u16 (key:u32 value)* |
//! | 0x05 | EdgeDelete   | id:u64 type:u32 src:u64 dst:u64                     |
//! | 0x06 | LabelAdd     | node:u64 label:u32                                  |
//! | 0x07 | LabelRemove  | node:u64 label:u32                                  |
//! | 0x08 | AttributeSet | kind:u8 id:u64 key:u32 value-or-tombstone           |

pub mod applier;
pub mod encoder;

pub use applier::{ApplierState, ApplierStats, EffectApplier};
pub use encoder::{EffectEncoder, Mutation, WriteTransaction};

use crate::graph::{EdgeId, NodeId};
use crate::schema::{KeyId, LabelId, SchemaNamespace, TypeId};
use crate::value::{
    EncodeLimits, PropertyValue, WireReader, checked_u16, checked_u32, encode_attribute,
    encode_into, put_str,
};
use crate::{Error, Result};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Effect kind tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    /// New schema name
    SchemaAdd = 0x01,
    /// Node creation
    NodeCreate = 0x02,
    /// Node deletion
    NodeDelete = 0x03,
    /// Edge creation
    EdgeCreate = 0x04,
    /// Edge deletion
    EdgeDelete = 0x05,
    /// Label added to a node
    LabelAdd = 0x06,
    /// Label removed from a node
    LabelRemove = 0x07,
    /// Attribute assigned or deleted
    AttributeSet = 0x08,
}

impl TryFrom<u8> for EffectKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SchemaAdd),
            0x02 => Ok(Self::NodeCreate),
            0x03 => Ok(Self::NodeDelete),
            0x04 => Ok(Self::EdgeCreate),
            0x05 => Ok(Self::EdgeDelete),
            0x06 => Ok(Self::LabelAdd),
            0x07 => Ok(Self::LabelRemove),
            0x08 => Ok(Self::AttributeSet),
            _ => Err(Error::decode(format!("Unknown effect kind: 0x{:02x}", value))),
        }
    }
}

/// Kind of entity an attribute belongs to
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Node
    Node = 0,
    /// Edge
    Edge = 1,
}

impl TryFrom<u8> for EntityKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Node),
            1 => Ok(Self::Edge),
            _ => Err(Error::decode(format!("Unknown entity kind: {}", value))),
        }
    }
}

/// Attribute carried by a create effect
pub type Attribute = (KeyId, PropertyValue);

/// One replayable graph mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// A name entered a schema namespace with the given id
    SchemaAdd {
        /// Namespace
        namespace: SchemaNamespace,
        /// Id assigned on the master
        id: u32,
        /// Name
        name: String,
    },
    /// Node creation
    NodeCreate {
        /// Node ID
        id: NodeId,
        /// Initial labels
        labels: Vec<LabelId>,
        /// Initial attributes
        attributes: Vec<Attribute>,
    },
    /// Node deletion
    NodeDelete {
        /// Node ID
        id: NodeId,
    },
    /// Edge creation
    EdgeCreate {
        /// Edge ID
        id: EdgeId,
        /// Relationship type
        relationship_type: TypeId,
        /// Source node
        src: NodeId,
        /// Destination node
        dst: NodeId,
        /// Initial attributes
        attributes: Vec<Attribute>,
    },
    /// Edge deletion, with the edge's type and endpoints for verification
    EdgeDelete {
        /// Edge ID
        id: EdgeId,
        /// Relationship type
        relationship_type: TypeId,
        /// Source node
        src: NodeId,
        /// Destination node
        dst: NodeId,
    },
    /// Label added to a node
    LabelAdd {
        /// Node ID
        node: NodeId,
        /// Label
        label: LabelId,
    },
    /// Label removed from a node
    LabelRemove {
        /// Node ID
        node: NodeId,
        /// Label
        label: LabelId,
    },
    /// Attribute assignment; `None` is the tombstone of a deleted key
    AttributeSet {
        /// Entity kind
        entity_kind: EntityKind,
        /// Entity ID
        entity: u64,
        /// Attribute key
        key: KeyId,
        /// New value, or `None` when the key is removed
        value: Option<PropertyValue>,
    },
}

impl Effect {
    /// Kind tag of this effect
    pub fn kind(&self) -> EffectKind {
        match self {
            Self::SchemaAdd { .. } => EffectKind::SchemaAdd,
            Self::NodeCreate { .. } => EffectKind::NodeCreate,
            Self::NodeDelete { .. } => EffectKind::NodeDelete,
            Self::EdgeCreate { .. } => EffectKind::EdgeCreate,
            Self::EdgeDelete { .. } => EffectKind::EdgeDelete,
            Self::LabelAdd { .. } => EffectKind::LabelAdd,
            Self::LabelRemove { .. } => EffectKind::LabelRemove,
            Self::AttributeSet { .. } => EffectKind::AttributeSet,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>, limits: &EncodeLimits) -> Result<()> {
        buf.put_u8(self.kind() as u8);
        match self {
            Self::SchemaAdd {
                namespace,
                id,
                name,
            } => {
                buf.put_u8(*namespace as u8);
                buf.put_u32_le(*id);
                put_str(buf, name)?;
            }
            Self::NodeCreate {
                id,
                labels,
                attributes,
            } => {
                if labels.len() > limits.max_labels {
                    return Err(Error::encode(format!(
                        "Node {} has {} labels (max: {})",
                        id,
                        labels.len(),
                        limits.max_labels
                    )));
                }
                buf.put_u64_le(*id);
                buf.put_u16_le(checked_u16(labels.len(), "label count")?);
                for label in labels {
                    buf.put_u32_le(*label);
                }
                put_attributes(buf, attributes, limits)?;
            }
            Self::NodeDelete { id } => buf.put_u64_le(*id),
            Self::EdgeCreate {
                id,
                relationship_type,
                src,
                dst,
                attributes,
            } => {
                buf.put_u64_le(*id);
                buf.put_u32_le(*relationship_type);
                buf.put_u64_le(*src);
                buf.put_u64_le(*dst);
                put_attributes(buf, attributes, limits)?;
            }
            Self::EdgeDelete {
                id,
                relationship_type,
                src,
                dst,
            } => {
                buf.put_u64_le(*id);
                buf.put_u32_le(*relationship_type);
                buf.put_u64_le(*src);
                buf.put_u64_le(*dst);
            }
            Self::LabelAdd { node, label } | Self::LabelRemove { node, label } => {
                buf.put_u64_le(*node);
                buf.put_u32_le(*label);
            }
            Self::AttributeSet {
                entity_kind,
                entity,
                key,
                value,
            } => {
                buf.put_u8(*entity_kind as u8);
                buf.put_u64_le(*entity);
                buf.put_u32_le(*key);
                encode_attribute(value.as_ref(), buf, limits)?;
            }
        }
        Ok(())
    }

    fn decode_from(reader: &mut WireReader<'_>, max_depth: usize) -> Result<Self> {
        let kind = EffectKind::try_from(reader.u8()?)?;
        let effect = match kind {
            EffectKind::SchemaAdd => Self::SchemaAdd {
                namespace: SchemaNamespace::try_from(reader.u8()?)?,
                id: reader.u32()?,
                name: reader.string()?,
            },
            EffectKind::NodeCreate => {
                let id = reader.u64()?;
                let label_count = reader.u16()? as usize;
                let mut labels = Vec::with_capacity(label_count.min(reader.remaining() / 4));
                for _ in 0..label_count {
                    labels.push(reader.u32()?);
                }
                let attributes = read_attributes(reader, max_depth)?;
                Self::NodeCreate {
                    id,
                    labels,
                    attributes,
                }
            }
            EffectKind::NodeDelete => Self::NodeDelete { id: reader.u64()? },
            EffectKind::EdgeCreate => Self::EdgeCreate {
                id: reader.u64()?,
                relationship_type: reader.u32()?,
                src: reader.u64()?,
                dst: reader.u64()?,
                attributes: read_attributes(reader, max_depth)?,
            },
            EffectKind::EdgeDelete => Self::EdgeDelete {
                id: reader.u64()?,
                relationship_type: reader.u32()?,
                src: reader.u64()?,
                dst: reader.u64()?,
            },
            EffectKind::LabelAdd => Self::LabelAdd {
                node: reader.u64()?,
                label: reader.u32()?,
            },
            EffectKind::LabelRemove => Self::LabelRemove {
                node: reader.u64()?,
                label: reader.u32()?,
            },
            EffectKind::AttributeSet => Self::AttributeSet {
                entity_kind: EntityKind::try_from(reader.u8()?)?,
                entity: reader.u64()?,
                key: reader.u32()?,
                value: reader.attribute(max_depth)?,
            },
        };
        Ok(effect)
    }
}

fn put_attributes(buf: &mut Vec<u8>, attributes: &[Attribute], limits: &EncodeLimits) -> Result<()> {
    if attributes.len() > limits.max_attributes {
        return Err(Error::encode(format!(
            "Attribute set too large: {} (max: {})",
            attributes.len(),
            limits.max_attributes
        )));
    }
    buf.put_u16_le(checked_u16(attributes.len(), "attribute count")?);
    for (key, value) in attributes {
        buf.put_u32_le(*key);
        encode_into(value, buf, limits)?;
    }
    Ok(())
}

fn read_attributes(reader: &mut WireReader<'_>, max_depth: usize) -> Result<Vec<Attribute>> {
    let count = reader.u16()? as usize;
    let mut attributes = Vec::with_capacity(count.min(reader.remaining() / 5));
    for _ in 0..count {
        let key = reader.u32()?;
        let value = reader.value(max_depth)?;
        attributes.push((key, value));
    }
    Ok(attributes)
}

/// Ordered effects of exactly one source transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectBatch {
    effects: Vec<Effect>,
}

impl EffectBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from effects in replay order
    pub fn from_effects(effects: Vec<Effect>) -> Self {
        Self { effects }
    }

    /// Append an effect
    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Number of effects
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Check if the batch carries no effect
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Effects in replay order
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Take the effects out of the batch
    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }

    /// Iterate the effects in replay order
    pub fn iter(&self) -> std::slice::Iter<'_, Effect> {
        self.effects.iter()
    }

    /// Serialize the batch
    pub fn encode(&self, limits: &EncodeLimits) -> Result<Vec<u8>> {
        if self.effects.len() > limits.max_batch_effects {
            return Err(Error::encode(format!(
                "Batch too large: {} effects (max: {})",
                self.effects.len(),
                limits.max_batch_effects
            )));
        }

        let mut buf = Vec::with_capacity(4 + self.effects.len() * 16);
        buf.put_u32_le(checked_u32(self.effects.len(), "effect count")?);
        for effect in &self.effects {
            effect.encode_into(&mut buf, limits)?;
        }
        Ok(buf)
    }

    /// Deserialize a batch; the whole buffer must be consumed
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Self::decode_with_depth(buf, EncodeLimits::default().max_array_depth)
    }

    /// Deserialize a batch, bounding array nesting at `max_depth`
    pub fn decode_with_depth(buf: &[u8], max_depth: usize) -> Result<Self> {
        let mut reader = WireReader::new(buf);
        let count = reader.u32()? as usize;
        // every effect needs at least its kind byte
        if count > reader.remaining() {
            return Err(Error::decode(format!(
                "Batch declares {} effects but only {} bytes remain",
                count,
                reader.remaining()
            )));
        }

        let mut effects = Vec::with_capacity(count);
        for index in 0..count {
            let effect = Effect::decode_from(&mut reader, max_depth).map_err(|e| match e {
                Error::Decode(msg) => Error::decode(format!("effect {}: {}", index, msg)),
                other => other,
            })?;
            effects.push(effect);
        }

        if reader.remaining() != 0 {
            return Err(Error::decode(format!(
                "{} trailing bytes after {} effects",
                reader.remaining(),
                count
            )));
        }

        Ok(Self { effects })
    }
}

impl<'a> IntoIterator for &'a EffectBatch {
    type Item = &'a Effect;
    type IntoIter = std::slice::Iter<'a, Effect>;

    fn into_iter(self) -> Self::IntoIter {
        self.effects.iter()
    }
}
