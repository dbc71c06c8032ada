//! Effect replication between a master graph and its replicas
//!
//! This module implements master-replica replication with:
//! - One effect batch per committed write transaction
//! - Per-replica FIFO delivery with bounded retries
//! - Full resync (snapshot transfer) for new, stale or diverged replicas
//! - Heartbeats in both directions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   GRAPH.EFFECT    ┌─────────────────┐
//! │     Master      │ ────────────────► │    Replica 1    │
//! │                 │ ◄──────────────── │  EffectApplier  │
//! │ WriteTransaction│    EffectsAck     └─────────────────┘
//! │   Dispatcher    │   GRAPH.EFFECT    ┌─────────────────┐
//! │                 │ ────────────────► │    Replica 2    │
//! └─────────────────┘                   └─────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! All messages use bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```
//!
//! The effect payload inside an `Effects` message is the little-endian
//! batch encoding of [`crate::effects::EffectBatch`], not bincode.

pub mod config;
pub mod dispatcher;
pub mod master;
pub mod protocol;
pub mod replica;
pub mod snapshot;

pub use config::{DeliveryPolicy, ReplicationConfig, ReplicationRole};
pub use dispatcher::{
    ChannelLink, DeliveryReport, Dispatcher, LinkState, LinkStats, MonitoredCommand, ReplicaLink, ReplicaStatus,
};
pub use master::{Master, MasterStats, ReplicaInfo};
pub use protocol::{COMMAND_NAME, EffectCommand, ReplicationMessage, ReplicationMessageType};
pub use replica::{Replica, ReplicaStats};
pub use snapshot::{GraphSnapshot, SnapshotAssembler, SnapshotMetadata, decode_snapshot, encode_snapshot};

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

/// Number of missed heartbeats before considering the peer dead
pub const MISSED_HEARTBEATS_THRESHOLD: u32 = 3;

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15475;
