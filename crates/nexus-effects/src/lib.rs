//! Nexus Effects - Effects-based graph replication core
//!
//! This crate replicates a property graph from a master to its replicas by
//! shipping *effects*, the replayable outcome of each mutation, instead of
//! re-executing queries:
//! - Value codec for the closed set of property value types
//! - Per-graph schema synchronizer (label, relationship type and attribute ids)
//! - Effect encoder observing a write transaction on the master
//! - Effect dispatcher fanning batches out to replicas in commit order
//! - Effect applier replaying batches atomically on a replica
//! - Consistency checks comparing master and replica graphs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Master: WriteTransaction              │
//! │   (GraphStore mutations + EffectEncoder)    │
//! └──────────────┬──────────────────────────────┘
//!                │ EffectBatch
//! ┌──────────────┴──────────────────────────────┐
//! │             Dispatcher                       │
//! │  (sequence, per-replica FIFO, monitor tap)  │
//! └──────────────┬──────────────────────────────┘
//!                │ GRAPH.EFFECT graph_id payload
//! ┌──────────────┴──────────────────────────────┐
//! │        Replica: EffectApplier                │
//! │  (one local transaction per batch, resync)  │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod consistency;
pub mod effects;
pub mod error;
pub mod graph;
pub mod replication;
pub mod schema;
pub mod testing;
pub mod value;

pub use consistency::{GraphDiff, GraphView, compare};
pub use effects::{Effect, EffectApplier, EffectBatch, EffectEncoder, Mutation, WriteTransaction};
pub use error::{Error, Result};
pub use graph::{GraphStore, MemoryGraph};
pub use schema::{SchemaNamespace, SchemaRegistry};
pub use value::{EncodeLimits, Point, PropertyValue};
