//! Replica node implementation for replication
//!
//! The replica node:
//! - Connects to master via TCP and asks for a full resync
//! - Replays effect batches through its [`EffectApplier`]
//! - Acknowledges every batch, refusing them while diverged
//! - Requests a new resync on divergence or sequence gaps
//! - Reconnects with exponential backoff

use crate::effects::{ApplierState, ApplierStats, EffectApplier};
use crate::graph::{GraphStore, MemoryGraph};
use crate::replication::config::ReplicationConfig;
use crate::replication::protocol::{PROTOCOL_VERSION, ReplicationMessage};
use crate::replication::snapshot::{SnapshotAssembler, SnapshotChunk, SnapshotMetadata};
use crate::schema::SchemaRegistry;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// Replica node statistics
#[derive(Debug, Clone, Default)]
pub struct ReplicaStats {
    /// Effect batches received
    pub batches_received: u64,
    /// Effect batches applied
    pub batches_applied: u64,
    /// Batches refused (diverged, resyncing or out of sequence)
    pub batches_refused: u64,
    /// Duplicate batches already covered by a snapshot
    pub batches_skipped: u64,
    /// Payload and snapshot bytes received
    pub bytes_received: u64,
    /// Completed resyncs
    pub resyncs: u64,
    /// Number of reconnects
    pub reconnects: u32,
    /// Sequence of the master at the last Welcome
    pub master_sequence: u64,
    /// Last successful resync time
    pub last_resync_time: Option<Instant>,
    /// Master ID
    pub master_id: Option<String>,
    /// Is connected to master
    pub connected: bool,
}

/// Progress of a running snapshot transfer
struct PendingResync {
    sequence: u64,
    assembler: Option<SnapshotAssembler>,
}

/// Replica node for replication
pub struct Replica<S: GraphStore + 'static = MemoryGraph> {
    /// Replica ID
    id: String,
    /// Configuration
    config: ReplicationConfig,
    /// Local copy of the graph
    applier: Mutex<EffectApplier<S>>,
    /// Sequence of the last applied batch
    current_sequence: AtomicU64,
    /// Statistics
    stats: Mutex<ReplicaStats>,
    /// Running flag
    running: AtomicBool,
    /// Connected flag
    connected: AtomicBool,
    /// Shutdown signal sender
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Replica<MemoryGraph> {
    /// Create a replica over an empty in-memory graph
    pub fn in_memory(config: ReplicationConfig) -> Result<Self> {
        Self::new(config, MemoryGraph::new())
    }
}

impl<S: GraphStore + 'static> Replica<S> {
    /// Create a new replica node
    ///
    /// Fails with a config error if `config` does not validate.
    pub fn new(config: ReplicationConfig, store: S) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        let applier = EffectApplier::new(store).with_max_depth(config.limits.max_array_depth);
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config,
            applier: Mutex::new(applier),
            current_sequence: AtomicU64::new(0),
            stats: Mutex::new(ReplicaStats::default()),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        })
    }

    /// Use a fixed replica ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Get replica ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sequence of the last applied batch
    pub fn current_sequence(&self) -> u64 {
        self.current_sequence.load(Ordering::SeqCst)
    }

    /// Check if connected to master
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Check if the replica loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Applier state
    pub fn state(&self) -> ApplierState {
        self.applier.lock().state()
    }

    /// Watch applier state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ApplierState> {
        self.applier.lock().subscribe_state()
    }

    /// Read the local graph
    pub fn read<T>(&self, f: impl FnOnce(&S, &SchemaRegistry) -> T) -> T {
        let applier = self.applier.lock();
        f(applier.store(), applier.schema())
    }

    /// Applier statistics
    pub fn applier_stats(&self) -> ApplierStats {
        self.applier.lock().stats().clone()
    }

    /// Get replica statistics
    pub fn stats(&self) -> ReplicaStats {
        self.stats.lock().clone()
    }

    /// Run the replica until [`Replica::stop`] is called
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Replica already running"));
        }

        let Some(master_addr) = self.config.master_addr else {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::replication("Master address not configured"));
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let initial_delay = self.config.retry_backoff.max(Duration::from_millis(10));
        let mut reconnect_delay = initial_delay;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Replica {} shutting down", self.id);
                    break;
                }
                result = self.connect_and_sync(master_addr) => {
                    self.connected.store(false, Ordering::SeqCst);
                    {
                        let mut stats = self.stats.lock();
                        stats.connected = false;
                        stats.reconnects += 1;
                    }

                    match result {
                        Ok(()) => {
                            // Normal disconnect, reset delay
                            reconnect_delay = initial_delay;
                            tracing::info!("Master closed the connection, reconnecting");
                        }
                        Err(e) => {
                            tracing::error!("Replication error: {}. Reconnecting in {:?}", e, reconnect_delay);
                            tokio::time::sleep(reconnect_delay).await;
                            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.stats.lock().connected = false;
        Ok(())
    }

    /// Stop the replica node
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Wait until the replica is resynced and applied `sequence`
    pub async fn wait_for_sequence(&self, sequence: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while !self.caught_up(sequence) {
            if start.elapsed() > timeout {
                return Err(Error::replication(format!(
                    "Replica {} at sequence {}, expected {}",
                    self.id,
                    self.current_sequence(),
                    sequence
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn caught_up(&self, sequence: u64) -> bool {
        self.stats.lock().resyncs > 0 && self.current_sequence() >= sequence && self.state().is_synced()
    }

    /// Connect to master and start syncing
    async fn connect_and_sync(&self, master_addr: SocketAddr) -> Result<()> {
        tracing::info!("Connecting to master at {}", master_addr);

        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(master_addr))
            .await
            .map_err(|_| Error::replication("Connection timeout"))??;
        let _ = stream.set_nodelay(true);

        let hello = ReplicationMessage::Hello {
            replica_id: self.id.clone(),
            graph_id: self.config.graph_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        };
        hello.write_to(&mut stream).await?;

        let welcome = tokio::time::timeout(self.config.read_timeout, ReplicationMessage::read_from(&mut stream))
            .await
            .map_err(|_| Error::replication("Timed out waiting for Welcome"))??;
        let (master_id, master_sequence) = match welcome {
            ReplicationMessage::Welcome {
                master_id,
                current_sequence,
            } => (master_id, current_sequence),
            ReplicationMessage::Error { code, message } => {
                return Err(Error::replication(format!(
                    "Master rejected: {} (code {})",
                    message, code
                )));
            }
            _ => {
                return Err(Error::replication("Expected Welcome message"));
            }
        };

        tracing::info!("Connected to master {} (sequence: {})", master_id, master_sequence);
        self.connected.store(true, Ordering::SeqCst);
        {
            let mut stats = self.stats.lock();
            stats.master_id = Some(master_id);
            stats.master_sequence = master_sequence;
            stats.connected = true;
        }

        // batches missed while disconnected are gone; always start from a snapshot
        let mut pending = Some(self.request_resync(&mut stream, "initial sync").await?);
        self.receive_messages(&mut stream, &mut pending).await
    }

    async fn request_resync(&self, stream: &mut TcpStream, reason: &str) -> Result<PendingResync> {
        tracing::info!("Requesting resync: {}", reason);
        let request = ReplicationMessage::RequestResync {
            replica_id: self.id.clone(),
            reason: reason.to_string(),
        };
        request.write_to(stream).await?;
        Ok(PendingResync {
            sequence: 0,
            assembler: None,
        })
    }

    /// Receive batches, heartbeats and snapshots from master
    async fn receive_messages(&self, stream: &mut TcpStream, pending: &mut Option<PendingResync>) -> Result<()> {
        let heartbeat_timeout = self
            .config
            .heartbeat_interval
            .saturating_mul(self.config.missed_heartbeats_threshold.max(1) + 1);

        loop {
            let msg = match tokio::time::timeout(heartbeat_timeout, ReplicationMessage::read_from(stream)).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::warn!("Master appears dead (no message for {:?})", heartbeat_timeout);
                    return Err(Error::replication("Master heartbeat timeout"));
                }
            };

            match msg {
                ReplicationMessage::Ping { timestamp } => {
                    ReplicationMessage::Pong { timestamp }.write_to(stream).await?;
                }
                ReplicationMessage::Pong { .. } => {}
                ReplicationMessage::Effects {
                    graph_id,
                    sequence,
                    payload,
                } => {
                    let (success, resync_reason) = self.handle_effects(&graph_id, sequence, &payload, pending.is_some());
                    ReplicationMessage::EffectsAck { sequence, success }.write_to(stream).await?;
                    if let Some(reason) = resync_reason {
                        *pending = Some(self.request_resync(stream, &reason).await?);
                    }
                }
                ReplicationMessage::ResyncMeta {
                    snapshot_id,
                    sequence,
                    total_size,
                    chunk_count,
                    checksum,
                } => {
                    let Some(resync) = pending.as_mut() else {
                        return Err(Error::replication("Unrequested snapshot"));
                    };
                    tracing::info!(
                        "Receiving snapshot {} at sequence {} ({} bytes, {} chunks)",
                        snapshot_id,
                        sequence,
                        total_size,
                        chunk_count
                    );
                    let metadata = SnapshotMetadata {
                        id: snapshot_id,
                        created_at: 0,
                        sequence,
                        uncompressed_size: 0,
                        compressed_size: total_size,
                        checksum,
                    };
                    resync.sequence = sequence;
                    resync.assembler = Some(SnapshotAssembler::new(metadata, chunk_count));
                }
                ReplicationMessage::ResyncChunk {
                    snapshot_id,
                    chunk_index,
                    data,
                    checksum,
                } => {
                    let assembler = pending
                        .as_mut()
                        .and_then(|p| p.assembler.as_mut())
                        .ok_or_else(|| Error::replication("Snapshot chunk without metadata"))?;
                    if assembler.metadata().id != snapshot_id {
                        return Err(Error::replication("Snapshot ID mismatch"));
                    }
                    self.stats.lock().bytes_received += data.len() as u64;
                    assembler.push(SnapshotChunk {
                        index: chunk_index,
                        data,
                        checksum,
                    })?;
                }
                ReplicationMessage::ResyncComplete { snapshot_id, success } => {
                    let resync = pending
                        .take()
                        .ok_or_else(|| Error::replication("Unrequested snapshot"))?;
                    let assembler = resync
                        .assembler
                        .ok_or_else(|| Error::replication("Snapshot completed without metadata"))?;
                    if !success {
                        return Err(Error::replication("Snapshot transfer failed on master"));
                    }
                    if assembler.metadata().id != snapshot_id {
                        return Err(Error::replication("Snapshot ID mismatch"));
                    }
                    self.install_snapshot(assembler, resync.sequence)?;
                }
                ReplicationMessage::Error { code, message } => {
                    return Err(Error::replication(format!("Master error {}: {}", code, message)));
                }
                other => {
                    tracing::warn!("Unexpected {:?} from master", other.message_type());
                }
            }
        }
    }

    /// Apply one batch; returns the ack and, if needed, a resync reason
    fn handle_effects(&self, graph_id: &str, sequence: u64, payload: &[u8], resyncing: bool) -> (bool, Option<String>) {
        {
            let mut stats = self.stats.lock();
            stats.batches_received += 1;
            stats.bytes_received += payload.len() as u64;
        }

        if graph_id != self.config.graph_id {
            tracing::warn!("Ignoring batch {} for graph '{}'", sequence, graph_id);
            self.stats.lock().batches_refused += 1;
            return (false, None);
        }

        if resyncing {
            self.stats.lock().batches_refused += 1;
            return (false, None);
        }

        let current = self.current_sequence();
        if sequence <= current {
            self.stats.lock().batches_skipped += 1;
            return (true, None);
        }

        let mut applier = self.applier.lock();
        if sequence != current + 1 {
            let reason = format!("sequence gap: expected {}, got {}", current + 1, sequence);
            applier.mark_diverged(reason.clone());
            self.stats.lock().batches_refused += 1;
            return (false, Some(reason));
        }

        match applier.apply(payload) {
            Ok(count) => {
                self.current_sequence.store(sequence, Ordering::SeqCst);
                self.stats.lock().batches_applied += 1;
                tracing::debug!("Applied batch {} ({} effects)", sequence, count);
                (true, None)
            }
            Err(e) => {
                self.stats.lock().batches_refused += 1;
                (false, Some(format!("batch {} failed: {}", sequence, e)))
            }
        }
    }

    fn install_snapshot(&self, assembler: SnapshotAssembler, sequence: u64) -> Result<()> {
        let snapshot_id = assembler.metadata().id.clone();
        let snapshot = assembler.finish()?;
        if snapshot.graph_id != self.config.graph_id {
            return Err(Error::snapshot(format!(
                "Snapshot belongs to graph '{}', expected '{}'",
                snapshot.graph_id, self.config.graph_id
            )));
        }

        self.applier.lock().resynchronize(snapshot)?;
        self.current_sequence.store(sequence, Ordering::SeqCst);

        {
            let mut stats = self.stats.lock();
            stats.resyncs += 1;
            stats.last_resync_time = Some(Instant::now());
        }
        tracing::info!(
            "Snapshot {} applied successfully, sequence now {}",
            snapshot_id,
            sequence
        );
        Ok(())
    }
}
