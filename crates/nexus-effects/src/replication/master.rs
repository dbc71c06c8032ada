//! Master node implementation for replication
//!
//! The master node:
//! - Owns the authoritative graph and commits write transactions
//! - Hands every committed batch to the [`Dispatcher`]
//! - Accepts replica connections and serves full resyncs
//! - Monitors replica health through heartbeats and acks

use crate::effects::WriteTransaction;
use crate::graph::{GraphStore, MemoryGraph};
use crate::replication::config::ReplicationConfig;
use crate::replication::dispatcher::{DeliveryReport, Dispatcher, LinkState, ReplicaLink};
use crate::replication::protocol::{EffectCommand, PROTOCOL_VERSION, ReplicationMessage};
use crate::replication::snapshot::{GraphSnapshot, encode_snapshot};
use crate::schema::SchemaRegistry;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Error code sent when protocol versions differ
pub const ERROR_PROTOCOL_VERSION: u32 = 1;
/// Error code sent when the replica asks for another graph
pub const ERROR_GRAPH_MISMATCH: u32 = 2;

/// Information about a connected replica
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// Replica ID
    pub id: String,
    /// Replica address
    pub addr: SocketAddr,
    /// Highest sequence the replica acknowledged as applied
    pub last_ack_sequence: u64,
    /// Batches the replica refused
    pub refused: u64,
    /// Full resyncs served to this replica
    pub resyncs: u64,
    /// Last message received
    pub last_heartbeat: Instant,
    /// Connection time
    pub connected_at: Instant,
}

/// Master node statistics
#[derive(Debug, Clone, Default)]
pub struct MasterStats {
    /// Committed transactions that produced a batch
    pub batches_committed: u64,
    /// Effects in those batches
    pub effects_committed: u64,
    /// Committed transactions without effects
    pub empty_commits: u64,
    /// Number of connected replicas
    pub connected_replicas: u32,
    /// Positive acks received
    pub acks: u64,
    /// Negative acks received
    pub nacks: u64,
    /// Number of snapshot transfers
    pub snapshot_transfers: u64,
    /// Compressed snapshot bytes sent
    pub snapshot_bytes: u64,
}

struct GraphState<S> {
    store: S,
    schema: SchemaRegistry,
}

/// Link writing effect commands onto a replica's TCP connection
struct TcpReplicaLink {
    id: String,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    write_timeout: Duration,
}

#[async_trait]
impl ReplicaLink for TcpReplicaLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, command: &EffectCommand) -> Result<()> {
        let message = ReplicationMessage::from(command.clone());
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(self.write_timeout, message.write_to(&mut *writer))
            .await
            .map_err(|_| Error::delivery(format!("Write to replica {} timed out", self.id)))?
            .map_err(|e| Error::delivery(format!("Write to replica {} failed: {}", self.id, e)))
    }
}

/// Master node for replication
pub struct Master<S: GraphStore + 'static = MemoryGraph> {
    /// Master ID
    id: String,
    /// Configuration
    config: ReplicationConfig,
    /// Authoritative graph; the lock also orders dispatch
    graph: Mutex<GraphState<S>>,
    /// Batch fan-out
    dispatcher: Dispatcher,
    /// Connected replicas
    replicas: RwLock<HashMap<String, ReplicaInfo>>,
    /// Statistics
    stats: Mutex<MasterStats>,
    /// Running flag
    running: AtomicBool,
    /// Shutdown signal sender
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Connection tasks
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl Master<MemoryGraph> {
    /// Create a master over an empty in-memory graph
    pub fn in_memory(config: ReplicationConfig) -> Result<Self> {
        Self::new(config, MemoryGraph::new())
    }
}

impl<S: GraphStore + 'static> Master<S> {
    /// Create a new master node
    pub fn new(config: ReplicationConfig, store: S) -> Result<Self> {
        Self::with_schema(config, store, SchemaRegistry::new())
    }

    /// Create a master over an existing graph and its schema
    ///
    /// Fails with a config error if `config` does not validate.
    pub fn with_schema(config: ReplicationConfig, store: S, schema: SchemaRegistry) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            dispatcher: Dispatcher::new(&config),
            config,
            graph: Mutex::new(GraphState { store, schema }),
            replicas: RwLock::new(HashMap::new()),
            stats: Mutex::new(MasterStats::default()),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Get master ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Effect dispatcher of this graph
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Sequence of the last dispatched batch
    pub fn current_sequence(&self) -> u64 {
        self.dispatcher.current_sequence()
    }

    /// Check if the listener is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one write transaction and dispatch its batch
    ///
    /// Returns the closure's value and, when the transaction produced
    /// effects, the delivery report. A closure error rolls everything back
    /// and nothing is dispatched.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_, S>) -> Result<T>,
    ) -> Result<(T, Option<DeliveryReport>)> {
        let mut graph = self.graph.lock();
        let GraphState { store, schema } = &mut *graph;

        let mut tx = WriteTransaction::begin(store, schema, self.config.limits)?;
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                tx.rollback();
                return Err(e);
            }
        };

        let Some(batch) = tx.commit()? else {
            self.stats.lock().empty_commits += 1;
            return Ok((value, None));
        };

        let report = match self.dispatcher.send(&batch) {
            Ok(report) => report,
            Err(e) => {
                // committed locally but never shipped
                for replica in self.dispatcher.replicas() {
                    let _ = self.dispatcher.mark_stale(&replica.id, "committed batch could not be dispatched");
                }
                return Err(e);
            }
        };
        drop(graph);

        let mut stats = self.stats.lock();
        stats.batches_committed += 1;
        stats.effects_committed += batch.len() as u64;
        Ok((value, Some(report)))
    }

    /// Read the committed graph
    pub fn read<T>(&self, f: impl FnOnce(&S, &SchemaRegistry) -> T) -> T {
        let graph = self.graph.lock();
        f(&graph.store, &graph.schema)
    }

    /// Capture a full snapshot together with the sequence it covers
    pub fn snapshot(&self) -> (GraphSnapshot, u64) {
        let graph = self.graph.lock();
        let snapshot = GraphSnapshot::capture(&self.config.graph_id, &graph.schema, &graph.store);
        (snapshot, self.dispatcher.current_sequence())
    }

    /// Start accepting replicas; returns the bound address
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::replication("Master already running"));
        }

        let listener = match TcpListener::bind(self.config.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        tracing::info!(
            "Master {} for graph '{}' listening on {}",
            self.id,
            self.config.graph_id,
            local_addr
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let master = self.clone();
        tokio::spawn(async move { master.accept_loop(listener, shutdown_rx).await });
        Ok(local_addr)
    }

    /// Stop the master node and drop every replica connection
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        for task in self.connections.lock().drain(..) {
            task.abort();
        }
        for id in self.replicas.write().drain().map(|(id, _)| id) {
            self.dispatcher.unregister(&id);
        }
        self.update_replica_count();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let master = self.clone();
                            let task = tokio::spawn(async move {
                                master.handle_replica_connection(stream, addr).await;
                            });
                            let mut connections = self.connections.lock();
                            connections.retain(|t| !t.is_finished());
                            connections.push(task);
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("Master shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Handle a new replica connection
    async fn handle_replica_connection(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) {
        tracing::info!("Replica connected from {}", addr);
        let _ = stream.set_nodelay(true);

        let hello = match tokio::time::timeout(self.config.read_timeout, ReplicationMessage::read_from(&mut stream)).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                tracing::error!("Failed to read Hello from {}: {}", addr, e);
                return;
            }
            Err(_) => {
                tracing::error!("Timed out waiting for Hello from {}", addr);
                return;
            }
        };

        let replica_id = match hello {
            ReplicationMessage::Hello {
                replica_id,
                graph_id,
                protocol_version,
            } => {
                let rejection = if protocol_version != PROTOCOL_VERSION {
                    Some((
                        ERROR_PROTOCOL_VERSION,
                        format!(
                            "Protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    ))
                } else if graph_id != self.config.graph_id {
                    Some((
                        ERROR_GRAPH_MISMATCH,
                        format!("Unknown graph '{}', serving '{}'", graph_id, self.config.graph_id),
                    ))
                } else {
                    None
                };
                if let Some((code, message)) = rejection {
                    tracing::warn!("Rejecting replica {} from {}: {}", replica_id, addr, message);
                    let _ = ReplicationMessage::Error { code, message }.write_to(&mut stream).await;
                    return;
                }
                replica_id
            }
            _ => {
                tracing::error!("Expected Hello message from {}", addr);
                return;
            }
        };

        let welcome = ReplicationMessage::Welcome {
            master_id: self.id.clone(),
            current_sequence: self.current_sequence(),
        };
        if let Err(e) = welcome.write_to(&mut stream).await {
            tracing::error!("Failed to send Welcome to {}: {}", addr, e);
            return;
        }

        let now = Instant::now();
        self.replicas.write().insert(
            replica_id.clone(),
            ReplicaInfo {
                id: replica_id.clone(),
                addr,
                last_ack_sequence: 0,
                refused: 0,
                resyncs: 0,
                last_heartbeat: now,
                connected_at: now,
            },
        );
        self.update_replica_count();

        let (reader, writer) = stream.into_split();
        let link = Arc::new(TcpReplicaLink {
            id: replica_id.clone(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            write_timeout: self.config.write_timeout,
        });

        // reads go through a channel so the select loop never cancels a partial frame
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match ReplicationMessage::read_from(&mut reader).await {
                    Ok(msg) => {
                        if msg_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Replica read ended: {}", e);
                        break;
                    }
                }
            }
        });

        if let Err(e) = self.serve_replica(&link, msg_rx).await {
            tracing::warn!("Replica {} connection closed: {}", replica_id, e);
        }

        reader_task.abort();
        self.dispatcher.unregister(&replica_id);
        self.replicas.write().remove(&replica_id);
        self.update_replica_count();
        tracing::info!("Replica {} disconnected", replica_id);
    }

    async fn serve_replica(
        &self,
        link: &Arc<TcpReplicaLink>,
        mut msg_rx: mpsc::Receiver<ReplicationMessage>,
    ) -> Result<()> {
        let replica_id = link.id.as_str();
        let heartbeat_interval = self.config.heartbeat_interval;
        let dead_after = heartbeat_interval.saturating_mul(self.config.missed_heartbeats_threshold.max(1));
        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut last_seen = Instant::now();
        let mut registered = false;

        loop {
            tokio::select! {
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else {
                        return Ok(());
                    };
                    last_seen = Instant::now();
                    self.touch(replica_id, |info| info.last_heartbeat = last_seen);

                    match msg {
                        ReplicationMessage::Ping { timestamp } => {
                            self.send(link, ReplicationMessage::Pong { timestamp }).await?;
                        }
                        ReplicationMessage::Pong { .. } => {}
                        ReplicationMessage::EffectsAck { sequence, success } => {
                            self.record_ack(replica_id, sequence, success);
                        }
                        ReplicationMessage::RequestResync { reason, .. } => {
                            tracing::info!("Replica {} requested resync: {}", replica_id, reason);
                            self.serve_resync(link, registered).await?;
                            registered = true;
                        }
                        ReplicationMessage::Error { code, message } => {
                            return Err(Error::replication(format!(
                                "Replica reported error {}: {}",
                                code, message
                            )));
                        }
                        other => {
                            tracing::warn!(
                                "Unexpected {:?} from replica {}",
                                other.message_type(),
                                replica_id
                            );
                        }
                    }
                }

                _ = heartbeat_timer.tick() => {
                    if last_seen.elapsed() > dead_after {
                        return Err(Error::replication(format!(
                            "No heartbeat from replica {} for {:?}",
                            replica_id,
                            last_seen.elapsed()
                        )));
                    }
                    let ping = ReplicationMessage::Ping { timestamp: unix_millis() };
                    self.send(link, ping).await?;
                }
            }
        }
    }

    /// Send a full snapshot and resume batch delivery right after it
    async fn serve_resync(&self, link: &Arc<TcpReplicaLink>, registered: bool) -> Result<()> {
        // holding the writer keeps batches queued behind the snapshot
        let mut writer = link.writer.lock().await;

        let (snapshot, sequence) = {
            let graph = self.graph.lock();
            let snapshot = GraphSnapshot::capture(&self.config.graph_id, &graph.schema, &graph.store);
            let sequence = self.dispatcher.current_sequence();
            if registered {
                self.dispatcher.mark_resynced(&link.id, sequence)?;
            } else {
                let shared: Arc<dyn ReplicaLink> = link.clone();
                self.dispatcher.register(shared, sequence);
            }
            (snapshot, sequence)
        };

        let encoded = encode_snapshot(&snapshot, sequence, self.config.snapshot_compression_level)?;
        let chunk_size = self.config.snapshot_chunk_size;
        let snapshot_id = encoded.metadata.id.clone();

        let mut messages = Vec::with_capacity(encoded.chunk_count(chunk_size) as usize + 2);
        messages.push(ReplicationMessage::ResyncMeta {
            snapshot_id: snapshot_id.clone(),
            sequence,
            total_size: encoded.metadata.compressed_size,
            chunk_count: encoded.chunk_count(chunk_size),
            checksum: encoded.metadata.checksum,
        });
        messages.extend(encoded.chunks(chunk_size).map(|chunk| ReplicationMessage::ResyncChunk {
            snapshot_id: snapshot_id.clone(),
            chunk_index: chunk.index,
            data: chunk.data,
            checksum: chunk.checksum,
        }));
        messages.push(ReplicationMessage::ResyncComplete {
            snapshot_id,
            success: true,
        });

        for message in &messages {
            tokio::time::timeout(self.config.write_timeout, message.write_to(&mut *writer))
                .await
                .map_err(|_| Error::replication(format!("Snapshot write to {} timed out", link.id)))??;
        }
        drop(writer);

        self.touch(&link.id, |info| {
            info.resyncs += 1;
            info.last_ack_sequence = sequence;
        });
        {
            let mut stats = self.stats.lock();
            stats.snapshot_transfers += 1;
            stats.snapshot_bytes += encoded.metadata.compressed_size;
        }

        tracing::info!(
            "Snapshot {} sent to replica {} at sequence {} ({} bytes)",
            encoded.metadata.id,
            link.id,
            sequence,
            encoded.metadata.compressed_size
        );
        Ok(())
    }

    async fn send(&self, link: &TcpReplicaLink, message: ReplicationMessage) -> Result<()> {
        let mut writer = link.writer.lock().await;
        tokio::time::timeout(self.config.write_timeout, message.write_to(&mut *writer))
            .await
            .map_err(|_| Error::replication(format!("Write to {} timed out", link.id)))?
    }

    fn record_ack(&self, replica_id: &str, sequence: u64, success: bool) {
        self.touch(replica_id, |info| {
            if success {
                info.last_ack_sequence = info.last_ack_sequence.max(sequence);
            } else {
                info.refused += 1;
            }
        });

        let mut stats = self.stats.lock();
        if success {
            stats.acks += 1;
        } else {
            stats.nacks += 1;
            tracing::debug!("Replica {} refused batch {}", replica_id, sequence);
        }
    }

    fn touch(&self, replica_id: &str, f: impl FnOnce(&mut ReplicaInfo)) {
        if let Some(info) = self.replicas.write().get_mut(replica_id) {
            f(info);
        }
    }

    /// Update replica count stats
    fn update_replica_count(&self) {
        let count = self.replicas.read().len() as u32;
        self.stats.lock().connected_replicas = count;
    }

    /// Get replica info
    pub fn get_replica(&self, replica_id: &str) -> Option<ReplicaInfo> {
        self.replicas.read().get(replica_id).cloned()
    }

    /// Get all connected replicas
    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.replicas.read().values().cloned().collect()
    }

    /// Delivery state of a replica
    pub fn link_state(&self, replica_id: &str) -> Option<LinkState> {
        self.dispatcher.link_state(replica_id)
    }

    /// Get master statistics
    pub fn stats(&self) -> MasterStats {
        self.stats.lock().clone()
    }

    /// Wait until `count` replicas acknowledged `sequence`
    pub async fn wait_for_acks(&self, sequence: u64, count: usize, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            let acked = self
                .replicas
                .read()
                .values()
                .filter(|r| r.last_ack_sequence >= sequence)
                .count();
            if acked >= count {
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Error::replication(format!(
                    "Ack timeout: {} of {} replicas at sequence {}",
                    acked, count, sequence
                )));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl<S: GraphStore + 'static> Drop for Master<S> {
    fn drop(&mut self) {
        for task in self.connections.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PropertyValue;

    fn master() -> Master {
        let config = ReplicationConfig::master("127.0.0.1:0".parse().unwrap()).with_graph_id("g");
        Master::in_memory(config).unwrap()
    }

    #[test]
    fn test_write_dispatches_batch() {
        let master = master();
        let mut monitor = master.dispatcher().monitor();

        let (id, report) = master
            .write(|tx| tx.create_node(&["Person"], &[("name", PropertyValue::from("Ada"))]))
            .unwrap();
        let report = report.unwrap();
        assert_eq!(report.sequence, 1);
        assert!(report.queued.is_empty());
        assert_eq!(master.current_sequence(), 1);

        assert!(master.read(|store, _| store.node(id).is_some()));
        assert_eq!(monitor.try_recv().unwrap().sequence, 1);

        let stats = master.stats();
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.effects_committed, 3);
    }

    #[test]
    fn test_failed_write_dispatches_nothing() {
        let master = master();
        let result = master.write(|tx| {
            tx.create_node(&["Person"], &[])?;
            tx.delete_node(999)
        });
        assert!(result.is_err());
        assert_eq!(master.current_sequence(), 0);
        assert!(master.read(|store, schema| store.export().nodes.is_empty() && schema.is_empty()));
    }

    #[test]
    fn test_empty_write_consumes_no_sequence() {
        let master = master();
        let (_, report) = master.write(|_| Ok(())).unwrap();
        assert!(report.is_none());
        assert_eq!(master.current_sequence(), 0);
        assert_eq!(master.stats().empty_commits, 1);
    }

    #[test]
    fn test_snapshot_carries_sequence() {
        let master = master();
        master.write(|tx| tx.create_node(&["A"], &[])).unwrap();
        master.write(|tx| tx.create_node(&["B"], &[])).unwrap();

        let (snapshot, sequence) = master.snapshot();
        assert_eq!(sequence, 2);
        assert_eq!(snapshot.graph_id, "g");
        assert_eq!(snapshot.content.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let master = Arc::new(master());
        let addr = master.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(master.is_running());
        assert!(master.start().await.is_err());

        master.stop();
        for _ in 0..100 {
            if !master.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!master.is_running());
    }

    #[tokio::test]
    async fn test_rejects_wrong_graph() {
        let master = Arc::new(master());
        let addr = master.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        ReplicationMessage::Hello {
            replica_id: "r".into(),
            graph_id: "other".into(),
            protocol_version: PROTOCOL_VERSION,
        }
        .write_to(&mut stream)
        .await
        .unwrap();

        match ReplicationMessage::read_from(&mut stream).await.unwrap() {
            ReplicationMessage::Error { code, .. } => assert_eq!(code, ERROR_GRAPH_MISMATCH),
            other => panic!("unexpected {:?}", other),
        }
        master.stop();
    }

    #[tokio::test]
    async fn test_rejects_protocol_version() {
        let master = Arc::new(master());
        let addr = master.start().await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        ReplicationMessage::Hello {
            replica_id: "r".into(),
            graph_id: "g".into(),
            protocol_version: PROTOCOL_VERSION + 1,
        }
        .write_to(&mut stream)
        .await
        .unwrap();

        match ReplicationMessage::read_from(&mut stream).await.unwrap() {
            ReplicationMessage::Error { code, .. } => assert_eq!(code, ERROR_PROTOCOL_VERSION),
            other => panic!("unexpected {:?}", other),
        }
        master.stop();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let config = ReplicationConfig::master(addr).with_max_queued_batches(0);
        assert!(matches!(Master::in_memory(config), Err(Error::Config(_))));

        let config = ReplicationConfig::master(addr).with_graph_id("");
        assert!(matches!(Master::in_memory(config), Err(Error::Config(_))));
    }
}
