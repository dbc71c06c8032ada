//! In-process replication harness for tests
//!
//! [`ReplicationHarness`] pairs a master graph with a replica applier in
//! the same process: each write transaction runs on the master, its batch
//! goes through the wire encoding and is replayed on the replica. No
//! sockets, no tasks.
//!
//! ```rust
//! use nexus_effects::testing::ReplicationHarness;
//! use nexus_effects::value::PropertyValue;
//!
//! let mut harness = ReplicationHarness::new();
//! harness
//!     .commit(|tx| tx.create_node(&["Person"], &[("name", PropertyValue::from("Ada"))]))
//!     .unwrap();
//! harness.assert_consistent();
//! ```

use crate::consistency::{GraphDiff, GraphView, compare};
use crate::effects::{EffectApplier, EffectBatch, WriteTransaction};
use crate::graph::MemoryGraph;
use crate::replication::snapshot::{GraphSnapshot, decode_snapshot, encode_snapshot};
use crate::schema::SchemaRegistry;
use crate::value::EncodeLimits;
use crate::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a test log subscriber once (`RUST_LOG` wins over the default)
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "nexus_effects=warn".into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Master graph and replica applier wired through the batch encoding
pub struct ReplicationHarness {
    master: MemoryGraph,
    schema: SchemaRegistry,
    limits: EncodeLimits,
    replica: EffectApplier<MemoryGraph>,
    sequence: u64,
}

impl Default for ReplicationHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationHarness {
    /// Empty master and replica with default limits
    pub fn new() -> Self {
        Self::with_limits(EncodeLimits::default())
    }

    /// Empty master and replica with custom limits
    pub fn with_limits(limits: EncodeLimits) -> Self {
        Self {
            master: MemoryGraph::new(),
            schema: SchemaRegistry::new(),
            limits,
            replica: EffectApplier::new(MemoryGraph::new()).with_max_depth(limits.max_array_depth),
            sequence: 0,
        }
    }

    /// Master store
    pub fn master(&self) -> &MemoryGraph {
        &self.master
    }

    /// Master schema registry
    pub fn master_schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    /// Replica applier
    pub fn replica(&self) -> &EffectApplier<MemoryGraph> {
        &self.replica
    }

    /// Mutable replica applier, e.g. to feed it hand-made payloads
    pub fn replica_mut(&mut self) -> &mut EffectApplier<MemoryGraph> {
        &mut self.replica
    }

    /// Batches produced so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Run a transaction on the master only and return its batch
    ///
    /// A closure error rolls the master back.
    pub fn execute<T>(
        &mut self,
        f: impl FnOnce(&mut WriteTransaction<'_, MemoryGraph>) -> Result<T>,
    ) -> Result<(T, Option<EffectBatch>)> {
        let mut tx = WriteTransaction::begin(&mut self.master, &mut self.schema, self.limits)?;
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };
        let batch = tx.commit()?;
        if batch.is_some() {
            self.sequence += 1;
        }
        Ok((value, batch))
    }

    /// Ship a batch to the replica through its wire encoding
    pub fn replicate(&mut self, batch: &EffectBatch) -> Result<usize> {
        let payload = batch.encode(&self.limits)?;
        self.replica.apply(&payload)
    }

    /// Run a transaction on the master and replay its batch on the replica
    pub fn commit<T>(
        &mut self,
        f: impl FnOnce(&mut WriteTransaction<'_, MemoryGraph>) -> Result<T>,
    ) -> Result<(T, Option<EffectBatch>)> {
        let (value, batch) = self.execute(f)?;
        if let Some(batch) = &batch {
            self.replicate(batch)?;
        }
        Ok((value, batch))
    }

    /// Full resync of the replica from the master's current state
    pub fn resync(&mut self) -> Result<()> {
        let snapshot = GraphSnapshot::capture("harness", &self.schema, &self.master);
        let encoded = encode_snapshot(&snapshot, self.sequence, 1)?;
        let decoded = decode_snapshot(&encoded.data, encoded.metadata.checksum)?;
        self.replica.resynchronize(decoded)
    }

    /// Differences between master and replica
    pub fn diff(&self) -> Result<GraphDiff> {
        let master = GraphView::capture(&self.schema, &self.master)?;
        let replica = GraphView::capture(self.replica.schema(), self.replica.store())?;
        Ok(compare(&master, &replica))
    }

    /// Panic with the diff unless master and replica are equivalent
    #[track_caller]
    pub fn assert_consistent(&self) {
        match self.diff() {
            Ok(diff) => assert!(diff.is_empty(), "replica differs from master: {}", diff),
            Err(e) => panic!("cannot compare master and replica: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphStore;
    use crate::value::PropertyValue;

    #[test]
    fn test_commit_replicates() {
        let mut harness = ReplicationHarness::new();
        let (id, batch) = harness
            .commit(|tx| tx.create_node(&["L"], &[("x", PropertyValue::Integer(1))]))
            .unwrap();
        assert!(batch.is_some());
        assert_eq!(harness.sequence(), 1);
        assert!(harness.replica().store().node(id).is_some());
        harness.assert_consistent();
    }

    #[test]
    fn test_execute_without_replicate_differs() {
        let mut harness = ReplicationHarness::new();
        harness.execute(|tx| tx.create_node(&["L"], &[])).unwrap();

        let diff = harness.diff().unwrap();
        assert_eq!(diff.missing_nodes.len(), 1);

        harness.resync().unwrap();
        harness.assert_consistent();
        assert_eq!(harness.replica().stats().resyncs, 1);
    }

    #[test]
    fn test_failed_transaction_touches_nothing() {
        let mut harness = ReplicationHarness::new();
        let result = harness.commit(|tx| {
            tx.create_node(&["L"], &[])?;
            tx.delete_edge(42)
        });
        assert!(result.is_err());
        assert_eq!(harness.sequence(), 0);
        assert!(harness.master_schema().is_empty());
        harness.assert_consistent();
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
