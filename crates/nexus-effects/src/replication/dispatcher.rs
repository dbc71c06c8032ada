//! Effect dispatcher
//!
//! Ships each committed batch to every registered replica as one wire
//! command. The batch is encoded once and stamped with the graph's next
//! sequence number; every replica then gets it through its own FIFO,
//! drained by one task per replica:
//!
//! ```text
//!                 ┌──────────┐   FIFO   ┌────────────┐
//!  send(batch) ──►│ sequence │ ───────► │ replica A  │ deliver, retry
//!                 │ + encode │   FIFO   ├────────────┤
//!                 │          │ ───────► │ replica B  │ deliver, retry
//!                 └────┬─────┘          └────────────┘
//!                      │ monitor tap (observability only)
//!                      ▼
//!               MonitoredCommand
//! ```
//!
//! Replicas progress independently, but each sees its batches in commit
//! order. A replica that cannot keep up is marked [`LinkState::Stale`]:
//! it receives nothing until [`Dispatcher::mark_resynced`] is called after
//! a full resynchronization.

use crate::effects::EffectBatch;
use crate::replication::config::{DeliveryPolicy, ReplicationConfig};
use crate::replication::protocol::{COMMAND_NAME, EffectCommand};
use crate::value::EncodeLimits;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A connection to one replica
#[async_trait]
pub trait ReplicaLink: Send + Sync {
    /// Replica ID
    fn id(&self) -> &str;

    /// Deliver one command; an error means the replica did not get it
    async fn deliver(&self, command: &EffectCommand) -> Result<()>;
}

/// In-process link backed by a tokio channel
pub struct ChannelLink {
    id: String,
    tx: mpsc::Sender<EffectCommand>,
}

impl ChannelLink {
    /// Create a link and the receiving end the replica reads from
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<EffectCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id: id.into(), tx }, rx)
    }
}

#[async_trait]
impl ReplicaLink for ChannelLink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, command: &EffectCommand) -> Result<()> {
        self.tx
            .send(command.clone())
            .await
            .map_err(|_| Error::delivery(format!("Replica {} channel closed", self.id)))
    }
}

/// Delivery state of one replica link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Batches flow normally
    Connected,
    /// The last delivery failed and is being retried
    Retrying,
    /// Batches were lost for this replica; full resync required
    Stale,
}

/// Command as published on the monitor tap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredCommand {
    /// Command name, always [`COMMAND_NAME`]
    pub name: &'static str,
    /// Graph ID
    pub graph_id: String,
    /// Batch sequence
    pub sequence: u64,
    /// Serialized batch
    pub payload: Vec<u8>,
}

/// Outcome of one [`Dispatcher::send`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sequence assigned to the batch
    pub sequence: u64,
    /// Replicas the batch was queued for
    pub queued: Vec<String>,
    /// Replicas skipped because they are stale (or just became stale)
    pub skipped: Vec<String>,
}

/// Per-replica delivery statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Batches delivered
    pub delivered: u64,
    /// Delivery attempts that failed (including retried ones)
    pub failed_attempts: u64,
    /// Batches discarded for this replica
    pub dropped: u64,
    /// Sequence of the last delivered batch
    pub last_sequence: u64,
}

/// Snapshot of one replica's delivery status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Replica ID
    pub id: String,
    /// Link state
    pub state: LinkState,
    /// Statistics
    pub stats: LinkStats,
}

struct LinkShared {
    id: String,
    state: RwLock<LinkState>,
    /// Commands at or below this sequence are covered by the last resync
    resume_after: AtomicU64,
    stats: Mutex<LinkStats>,
}

impl LinkShared {
    fn state(&self) -> LinkState {
        *self.state.read()
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    fn mark_stale(&self, reason: &str) {
        let mut state = self.state.write();
        if *state != LinkState::Stale {
            tracing::warn!("Replica {} marked stale: {}", self.id, reason);
            *state = LinkState::Stale;
        }
    }
}

struct LinkEntry {
    shared: Arc<LinkShared>,
    tx: mpsc::Sender<Arc<EffectCommand>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct DispatchSettings {
    policy: DeliveryPolicy,
    queue_capacity: usize,
    max_retries: u32,
    retry_backoff: Duration,
    limits: EncodeLimits,
}

/// Per-graph effect dispatcher
pub struct Dispatcher {
    graph_id: String,
    settings: DispatchSettings,
    /// Last assigned sequence; held while enqueuing to keep FIFOs in order
    sequence: Mutex<u64>,
    links: RwLock<HashMap<String, LinkEntry>>,
    monitor: broadcast::Sender<MonitoredCommand>,
}

impl Dispatcher {
    /// Create a dispatcher for one graph
    pub fn new(config: &ReplicationConfig) -> Self {
        let (monitor, _) = broadcast::channel(config.monitor_capacity.max(1));
        Self {
            graph_id: config.graph_id.clone(),
            settings: DispatchSettings {
                policy: config.delivery_policy,
                queue_capacity: config.max_queued_batches.max(1),
                max_retries: config.max_delivery_retries,
                retry_backoff: config.retry_backoff,
                limits: config.limits,
            },
            sequence: Mutex::new(0),
            links: RwLock::new(HashMap::new()),
            monitor,
        }
    }

    /// Graph ID
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Behaviour towards replicas that cannot take a batch
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        self.settings.policy
    }

    /// Sequence of the last dispatched batch (0 before the first)
    pub fn current_sequence(&self) -> u64 {
        *self.sequence.lock()
    }

    /// Tap on every dispatched command
    pub fn monitor(&self) -> broadcast::Receiver<MonitoredCommand> {
        self.monitor.subscribe()
    }

    /// Register a replica; it receives batches after `resume_after`
    ///
    /// Must be called from within a tokio runtime. A link registered under
    /// an existing id replaces the previous one.
    pub fn register(&self, link: Arc<dyn ReplicaLink>, resume_after: u64) {
        let id = link.id().to_string();
        let shared = Arc::new(LinkShared {
            id: id.clone(),
            state: RwLock::new(LinkState::Connected),
            resume_after: AtomicU64::new(resume_after),
            stats: Mutex::new(LinkStats {
                last_sequence: resume_after,
                ..Default::default()
            }),
        });
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let task = tokio::spawn(drain_link(link, rx, shared.clone(), self.settings.clone()));

        if let Some(old) = self.links.write().insert(id.clone(), LinkEntry { shared, tx, task }) {
            old.task.abort();
        }
        tracing::info!("Replica {} registered for graph '{}' after sequence {}", id, self.graph_id, resume_after);
    }

    /// Remove a replica
    pub fn unregister(&self, id: &str) -> bool {
        match self.links.write().remove(id) {
            Some(entry) => {
                entry.task.abort();
                tracing::info!("Replica {} unregistered", id);
                true
            }
            None => false,
        }
    }

    /// Mark a replica stale (e.g. it reported divergence)
    pub fn mark_stale(&self, id: &str, reason: &str) -> Result<()> {
        let links = self.links.read();
        let entry = links
            .get(id)
            .ok_or_else(|| Error::replication(format!("Unknown replica {}", id)))?;
        entry.shared.mark_stale(reason);
        Ok(())
    }

    /// Return a replica to Connected after it was resynced at `sequence`
    pub fn mark_resynced(&self, id: &str, sequence: u64) -> Result<()> {
        let links = self.links.read();
        let entry = links
            .get(id)
            .ok_or_else(|| Error::replication(format!("Unknown replica {}", id)))?;
        entry.shared.resume_after.store(sequence, Ordering::SeqCst);
        entry.shared.stats.lock().last_sequence = sequence;
        entry.shared.set_state(LinkState::Connected);
        tracing::info!("Replica {} resynced at sequence {}", id, sequence);
        Ok(())
    }

    /// State of one replica
    pub fn link_state(&self, id: &str) -> Option<LinkState> {
        self.links.read().get(id).map(|e| e.shared.state())
    }

    /// Status of every replica
    pub fn replicas(&self) -> Vec<ReplicaStatus> {
        let mut replicas: Vec<ReplicaStatus> = self
            .links
            .read()
            .values()
            .map(|e| ReplicaStatus {
                id: e.shared.id.clone(),
                state: e.shared.state(),
                stats: e.shared.stats.lock().clone(),
            })
            .collect();
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        replicas
    }

    /// Dispatch one committed batch
    ///
    /// Encode errors are returned before a sequence number is consumed, so
    /// nothing malformed ever leaves the master. Enqueuing never blocks.
    pub fn send(&self, batch: &EffectBatch) -> Result<DeliveryReport> {
        let payload = batch.encode(&self.settings.limits)?;

        let mut sequence = self.sequence.lock();
        *sequence += 1;
        let command = Arc::new(EffectCommand {
            graph_id: self.graph_id.clone(),
            sequence: *sequence,
            payload,
        });

        // no subscribers is fine
        let _ = self.monitor.send(MonitoredCommand {
            name: COMMAND_NAME,
            graph_id: command.graph_id.clone(),
            sequence: command.sequence,
            payload: command.payload.clone(),
        });

        let mut report = DeliveryReport {
            sequence: command.sequence,
            ..Default::default()
        };

        for (id, entry) in self.links.read().iter() {
            if self.enqueue(entry, &command) {
                report.queued.push(id.clone());
            } else {
                entry.shared.stats.lock().dropped += 1;
                report.skipped.push(id.clone());
            }
        }
        drop(sequence);

        report.queued.sort();
        report.skipped.sort();
        tracing::debug!(
            "Dispatched batch {} of graph '{}' ({} effects) to {} replicas",
            report.sequence,
            self.graph_id,
            batch.len(),
            report.queued.len()
        );
        Ok(report)
    }

    fn enqueue(&self, entry: &LinkEntry, command: &Arc<EffectCommand>) -> bool {
        match entry.shared.state() {
            LinkState::Stale => return false,
            LinkState::Retrying if self.settings.policy == DeliveryPolicy::Drop => {
                entry.shared.mark_stale("unreachable under drop policy");
                return false;
            }
            _ => {}
        }

        match entry.tx.try_send(command.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let reason = match self.settings.policy {
                    DeliveryPolicy::Queue => "delivery queue overflow",
                    DeliveryPolicy::Drop => "replica not keeping up under drop policy",
                };
                entry.shared.mark_stale(reason);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                entry.shared.mark_stale("delivery task stopped");
                false
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for entry in self.links.get_mut().values() {
            entry.task.abort();
        }
    }
}

/// FIFO drain of one replica: strictly in order, whole-batch retries under
/// the queue policy, none under the drop policy
async fn drain_link(
    link: Arc<dyn ReplicaLink>,
    mut rx: mpsc::Receiver<Arc<EffectCommand>>,
    shared: Arc<LinkShared>,
    settings: DispatchSettings,
) {
    while let Some(command) = rx.recv().await {
        if shared.state() == LinkState::Stale || command.sequence <= shared.resume_after.load(Ordering::SeqCst) {
            shared.stats.lock().dropped += 1;
            continue;
        }

        let mut attempt = 0u32;
        loop {
            match link.deliver(&command).await {
                Ok(()) => {
                    if shared.state() == LinkState::Retrying {
                        shared.set_state(LinkState::Connected);
                    }
                    let mut stats = shared.stats.lock();
                    stats.delivered += 1;
                    stats.last_sequence = command.sequence;
                    break;
                }
                Err(e) => {
                    shared.stats.lock().failed_attempts += 1;
                    if settings.policy == DeliveryPolicy::Drop {
                        tracing::warn!(
                            "Delivery of batch {} to replica {} failed, dropping under drop policy: {}",
                            command.sequence,
                            shared.id,
                            e
                        );
                        shared.mark_stale("unreachable under drop policy");
                        shared.stats.lock().dropped += 1;
                        break;
                    }
                    if !e.is_retryable() || attempt >= settings.max_retries {
                        tracing::warn!(
                            "Delivery of batch {} to replica {} failed after {} attempts: {}",
                            command.sequence,
                            shared.id,
                            attempt + 1,
                            e
                        );
                        shared.mark_stale("delivery failed");
                        shared.stats.lock().dropped += 1;
                        break;
                    }

                    let delay = settings.retry_backoff.saturating_mul(1u32 << attempt.min(16));
                    attempt += 1;
                    shared.set_state(LinkState::Retrying);
                    tracing::warn!(
                        "Delivery of batch {} to replica {} failed ({}), retry {} in {:?}",
                        command.sequence,
                        shared.id,
                        e,
                        attempt,
                        delay
                    );
                    tokio::time::sleep(delay).await;

                    if shared.state() == LinkState::Stale {
                        shared.stats.lock().dropped += 1;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::Effect;
    use std::sync::atomic::AtomicU32;

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
            .with_graph_id("g")
            .with_retries(2, Duration::from_millis(1))
    }

    fn batch(id: u64) -> EffectBatch {
        EffectBatch::from_effects(vec![Effect::NodeDelete { id }])
    }

    /// Fails the first `failures` deliveries, then forwards
    struct FlakyLink {
        inner: ChannelLink,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ReplicaLink for FlakyLink {
        fn id(&self) -> &str {
            self.inner.id()
        }

        async fn deliver(&self, command: &EffectCommand) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::delivery("connection reset"));
            }
            self.inner.deliver(command).await
        }
    }

    #[tokio::test]
    async fn test_batches_arrive_in_order() {
        let dispatcher = Dispatcher::new(&config());
        let (link, mut rx) = ChannelLink::new("r1", 16);
        dispatcher.register(Arc::new(link), 0);

        for i in 0..5 {
            let report = dispatcher.send(&batch(i)).unwrap();
            assert_eq!(report.sequence, i + 1);
            assert_eq!(report.queued, vec!["r1".to_string()]);
        }

        for expected in 1..=5 {
            let cmd = rx.recv().await.unwrap();
            assert_eq!(cmd.sequence, expected);
            assert_eq!(cmd.graph_id, "g");
            assert_eq!(EffectBatch::decode(&cmd.payload).unwrap(), batch(expected - 1));
        }
    }

    #[tokio::test]
    async fn test_independent_replicas() {
        let dispatcher = Dispatcher::new(&config());
        let (a, mut rx_a) = ChannelLink::new("a", 16);
        let (b, mut rx_b) = ChannelLink::new("b", 16);
        dispatcher.register(Arc::new(a), 0);
        dispatcher.register(Arc::new(b), 0);

        let report = dispatcher.send(&batch(1)).unwrap();
        assert_eq!(report.queued, vec!["a".to_string(), "b".to_string()]);

        assert_eq!(rx_b.recv().await.unwrap().sequence, 1);
        assert_eq!(rx_a.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_monitor_tap() {
        let dispatcher = Dispatcher::new(&config());
        let mut monitor = dispatcher.monitor();

        dispatcher.send(&batch(3)).unwrap();
        let seen = monitor.recv().await.unwrap();
        assert_eq!(seen.name, "GRAPH.EFFECT");
        assert_eq!(seen.graph_id, "g");
        assert_eq!(seen.sequence, 1);
        assert_eq!(EffectBatch::decode(&seen.payload).unwrap(), batch(3));
    }

    #[tokio::test]
    async fn test_encode_error_consumes_no_sequence() {
        let limits = EncodeLimits {
            max_batch_effects: 0,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(&config().with_limits(limits));
        assert!(matches!(dispatcher.send(&batch(1)).unwrap_err(), Error::Encode(_)));
        assert_eq!(dispatcher.current_sequence(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_whole() {
        let dispatcher = Dispatcher::new(&config());
        let (inner, mut rx) = ChannelLink::new("r1", 16);
        let link = FlakyLink {
            inner,
            failures: AtomicU32::new(2),
        };
        dispatcher.register(Arc::new(link), 0);

        dispatcher.send(&batch(1)).unwrap();
        dispatcher.send(&batch(2)).unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 1);
        assert_eq!(rx.recv().await.unwrap().sequence, 2);
        assert_eq!(dispatcher.link_state("r1"), Some(LinkState::Connected));

        let status = &dispatcher.replicas()[0];
        assert_eq!(status.stats.failed_attempts, 2);
        assert_eq!(status.stats.delivered, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_stale() {
        let dispatcher = Dispatcher::new(&config());
        let (link, rx) = ChannelLink::new("r1", 16);
        drop(rx);
        dispatcher.register(Arc::new(link), 0);

        dispatcher.send(&batch(1)).unwrap();
        for _ in 0..200 {
            if dispatcher.link_state("r1") == Some(LinkState::Stale) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.link_state("r1"), Some(LinkState::Stale));

        let report = dispatcher.send(&batch(2)).unwrap();
        assert_eq!(report.skipped, vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_overflow_marks_stale() {
        let config = config().with_max_queued_batches(1);
        let dispatcher = Dispatcher::new(&config);
        // receiver kept but never read: capacity 1 link channel plus 1 queued
        let (link, _rx) = ChannelLink::new("slow", 1);
        dispatcher.register(Arc::new(link), 0);

        let mut skipped = false;
        for i in 0..10 {
            let report = dispatcher.send(&batch(i)).unwrap();
            if !report.skipped.is_empty() {
                skipped = true;
                break;
            }
        }
        assert!(skipped);
        assert_eq!(dispatcher.link_state("slow"), Some(LinkState::Stale));
    }

    #[tokio::test]
    async fn test_resynced_replica_resumes_after_snapshot_sequence() {
        let dispatcher = Dispatcher::new(&config());
        let (link, mut rx) = ChannelLink::new("r1", 16);
        dispatcher.register(Arc::new(link), 0);

        dispatcher.mark_stale("r1", "diverged").unwrap();
        assert_eq!(dispatcher.send(&batch(1)).unwrap().skipped.len(), 1);
        assert_eq!(dispatcher.send(&batch(2)).unwrap().skipped.len(), 1);

        // snapshot taken at sequence 2
        dispatcher.mark_resynced("r1", 2).unwrap();
        dispatcher.send(&batch(3)).unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 3);
        assert_eq!(dispatcher.link_state("r1"), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_registration_skips_covered_batches() {
        let dispatcher = Dispatcher::new(&config());
        dispatcher.send(&batch(1)).unwrap();

        let (link, mut rx) = ChannelLink::new("late", 16);
        dispatcher.register(Arc::new(link), dispatcher.current_sequence());
        dispatcher.send(&batch(2)).unwrap();

        assert_eq!(rx.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_unregister() {
        let dispatcher = Dispatcher::new(&config());
        let (link, _rx) = ChannelLink::new("r1", 16);
        dispatcher.register(Arc::new(link), 0);

        assert!(dispatcher.unregister("r1"));
        assert!(!dispatcher.unregister("r1"));
        assert!(dispatcher.send(&batch(1)).unwrap().queued.is_empty());
        assert!(dispatcher.mark_resynced("r1", 0).is_err());
    }

    #[tokio::test]
    async fn test_drop_policy_failure_marks_stale_without_retry() {
        let dispatcher = Dispatcher::new(&config().with_delivery_policy(DeliveryPolicy::Drop));
        let (inner, mut rx) = ChannelLink::new("r1", 16);
        let link = FlakyLink {
            inner,
            failures: AtomicU32::new(1),
        };
        dispatcher.register(Arc::new(link), 0);

        dispatcher.send(&batch(1)).unwrap();
        for _ in 0..200 {
            if dispatcher.link_state("r1") == Some(LinkState::Stale) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.link_state("r1"), Some(LinkState::Stale));

        // the failed batch is discarded, not retried
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        let status = &dispatcher.replicas()[0];
        assert_eq!(status.stats.failed_attempts, 1);
        assert_eq!(status.stats.delivered, 0);
        assert_eq!(status.stats.dropped, 1);

        assert_eq!(dispatcher.send(&batch(2)).unwrap().skipped, vec!["r1".to_string()]);

        dispatcher.mark_resynced("r1", 2).unwrap();
        dispatcher.send(&batch(3)).unwrap();
        assert_eq!(rx.recv().await.unwrap().sequence, 3);
        assert_eq!(dispatcher.link_state("r1"), Some(LinkState::Connected));
    }

    #[test]
    fn test_policy_exposed() {
        let dispatcher = Dispatcher::new(&config().with_delivery_policy(DeliveryPolicy::Drop));
        assert_eq!(dispatcher.delivery_policy(), DeliveryPolicy::Drop);
    }
}
