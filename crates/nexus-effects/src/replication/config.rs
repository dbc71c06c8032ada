//! Replication configuration

use crate::value::EncodeLimits;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Node role in replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    /// Primary node - accepts writes, encodes and dispatches effects
    Master,
    /// Secondary node - applies effects
    Replica,
    /// Standalone node - no replication
    #[default]
    Standalone,
}

impl std::str::FromStr for ReplicationRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "replica" => Ok(Self::Replica),
            "standalone" => Ok(Self::Standalone),
            other => Err(Error::config(format!("Unknown replication role: {}", other))),
        }
    }
}

/// What happens to batches for a replica that cannot take them right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPolicy {
    /// Discard the batch and mark the replica stale (full resync required)
    Drop,
    /// Hold batches in the replica's FIFO; overflow marks it stale
    #[default]
    Queue,
}

impl std::str::FromStr for DeliveryPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "queue" => Ok(Self::Queue),
            other => Err(Error::config(format!("Unknown delivery policy: {}", other))),
        }
    }
}

/// Durations are written as milliseconds in config files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node's role
    pub role: ReplicationRole,

    /// Graph replicated over this link
    pub graph_id: String,

    /// Address to bind for replication connections
    pub bind_addr: SocketAddr,

    /// Master address (for replicas)
    pub master_addr: Option<SocketAddr>,

    /// Heartbeat interval
    #[serde(with = "duration_ms", rename = "heartbeat_interval_ms")]
    pub heartbeat_interval: Duration,

    /// Connection timeout
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,

    /// Read timeout for replication stream
    #[serde(with = "duration_ms", rename = "read_timeout_ms")]
    pub read_timeout: Duration,

    /// Write timeout for replication stream
    #[serde(with = "duration_ms", rename = "write_timeout_ms")]
    pub write_timeout: Duration,

    /// Number of missed heartbeats before the peer is considered dead
    pub missed_heartbeats_threshold: u32,

    /// Behaviour towards unreachable replicas
    pub delivery_policy: DeliveryPolicy,

    /// Per-replica FIFO capacity under [`DeliveryPolicy::Queue`]
    pub max_queued_batches: usize,

    /// Whole-batch resend attempts after a delivery error
    pub max_delivery_retries: u32,

    /// Base delay between resend attempts (doubled each attempt)
    #[serde(with = "duration_ms", rename = "retry_backoff_ms")]
    pub retry_backoff: Duration,

    /// Longest reconnect delay for replicas
    #[serde(with = "duration_ms", rename = "max_reconnect_delay_ms")]
    pub max_reconnect_delay: Duration,

    /// Snapshot compression level (1-22, zstd)
    pub snapshot_compression_level: i32,

    /// Snapshot transfer chunk size in bytes
    pub snapshot_chunk_size: usize,

    /// Capacity of the monitor tap
    pub monitor_capacity: usize,

    /// Encode-time limits
    pub limits: EncodeLimits,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            role: ReplicationRole::Standalone,
            graph_id: "default".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], super::DEFAULT_REPLICATION_PORT)),
            master_addr: None,
            heartbeat_interval: Duration::from_millis(super::DEFAULT_HEARTBEAT_MS),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            missed_heartbeats_threshold: super::MISSED_HEARTBEATS_THRESHOLD,
            delivery_policy: DeliveryPolicy::Queue,
            max_queued_batches: 10_000,
            max_delivery_retries: 3,
            retry_backoff: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            snapshot_compression_level: 3,
            snapshot_chunk_size: 1024 * 1024,
            monitor_capacity: 1024,
            limits: EncodeLimits::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a master configuration
    pub fn master(bind_addr: SocketAddr) -> Self {
        Self {
            role: ReplicationRole::Master,
            bind_addr,
            ..Default::default()
        }
    }

    /// Create a replica configuration
    pub fn replica(master_addr: SocketAddr) -> Self {
        Self {
            role: ReplicationRole::Replica,
            master_addr: Some(master_addr),
            ..Default::default()
        }
    }

    /// Create a standalone configuration (no replication)
    pub fn standalone() -> Self {
        Self::default()
    }

    /// Set the replicated graph
    pub fn with_graph_id(mut self, graph_id: impl Into<String>) -> Self {
        self.graph_id = graph_id.into();
        self
    }

    /// Set the delivery policy
    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.delivery_policy = policy;
        self
    }

    /// Set the per-replica queue capacity
    pub fn with_max_queued_batches(mut self, max: usize) -> Self {
        self.max_queued_batches = max;
        self
    }

    /// Set the resend budget and base backoff
    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.max_delivery_retries = retries;
        self.retry_backoff = backoff;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the encode limits
    pub fn with_limits(mut self, limits: EncodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("Invalid replication config: {}", e)))
    }

    /// Load a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded replication configuration from {:?}", path);
        Ok(config)
    }

    /// Override fields from `NEXUS_REPLICATION_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Override fields from a variable lookup
    ///
    /// Priority: variables > config file > defaults.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| Error::config(format!("Invalid {}='{}': {}", name, raw, e)))
        }

        if let Some(v) = lookup("NEXUS_REPLICATION_ROLE") {
            self.role = v.parse()?;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_GRAPH") {
            self.graph_id = v;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_BIND_ADDR") {
            self.bind_addr = parse("NEXUS_REPLICATION_BIND_ADDR", &v)?;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_MASTER_ADDR") {
            self.master_addr = Some(parse("NEXUS_REPLICATION_MASTER_ADDR", &v)?);
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_HEARTBEAT_MS") {
            self.heartbeat_interval = Duration::from_millis(parse("NEXUS_REPLICATION_HEARTBEAT_MS", &v)?);
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_DELIVERY_POLICY") {
            self.delivery_policy = v.parse()?;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_MAX_QUEUED_BATCHES") {
            self.max_queued_batches = parse("NEXUS_REPLICATION_MAX_QUEUED_BATCHES", &v)?;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_MAX_RETRIES") {
            self.max_delivery_retries = parse("NEXUS_REPLICATION_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("NEXUS_REPLICATION_COMPRESSION_LEVEL") {
            self.snapshot_compression_level = parse("NEXUS_REPLICATION_COMPRESSION_LEVEL", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.role {
            ReplicationRole::Replica => {
                if self.master_addr.is_none() {
                    return Err("Replica requires master_addr".into());
                }
            }
            ReplicationRole::Master | ReplicationRole::Standalone => {}
        }

        if self.graph_id.is_empty() {
            return Err("graph_id must not be empty".into());
        }

        if self.missed_heartbeats_threshold == 0 {
            return Err("missed_heartbeats_threshold must be at least 1".into());
        }

        if self.delivery_policy == DeliveryPolicy::Queue && self.max_queued_batches == 0 {
            return Err("max_queued_batches must be at least 1 with the queue policy".into());
        }

        if !(1..=22).contains(&self.snapshot_compression_level) {
            return Err("snapshot_compression_level must be between 1 and 22".into());
        }

        if self.snapshot_chunk_size == 0 {
            return Err("snapshot_chunk_size must be at least 1".into());
        }

        if self.monitor_capacity == 0 {
            return Err("monitor_capacity must be at least 1".into());
        }

        self.limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();
        assert_eq!(config.role, ReplicationRole::Standalone);
        assert_eq!(config.delivery_policy, DeliveryPolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_config() {
        let addr: SocketAddr = "0.0.0.0:15475".parse().unwrap();
        let config = ReplicationConfig::master(addr);
        assert_eq!(config.role, ReplicationRole::Master);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_config() {
        let addr: SocketAddr = "127.0.0.1:15475".parse().unwrap();
        let config = ReplicationConfig::replica(addr);
        assert_eq!(config.role, ReplicationRole::Replica);
        assert_eq!(config.master_addr, Some(addr));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_replica_without_master() {
        let config = ReplicationConfig {
            role: ReplicationRole::Replica,
            master_addr: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_policy_needs_capacity() {
        let config = ReplicationConfig::default().with_max_queued_batches(0);
        assert!(config.validate().is_err());

        let config = config.with_delivery_policy(DeliveryPolicy::Drop);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let limits = EncodeLimits {
            max_array_depth: 0,
            ..Default::default()
        };
        assert!(ReplicationConfig::default().with_limits(limits).validate().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = ReplicationConfig::from_toml_str(
            r#"
            role = "master"
            graph_id = "social"
            bind_addr = "127.0.0.1:16000"
            heartbeat_interval_ms = 250
            delivery_policy = "drop"

            [limits]
            max_array_depth = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.role, ReplicationRole::Master);
        assert_eq!(config.graph_id, "social");
        assert_eq!(config.bind_addr.port(), 16000);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.delivery_policy, DeliveryPolicy::Drop);
        assert_eq!(config.limits.max_array_depth, 8);
        // untouched keys keep their defaults
        assert_eq!(config.max_delivery_retries, 3);
        assert_eq!(config.limits.max_labels, u16::MAX as usize);
    }

    #[test]
    fn test_from_toml_str_invalid() {
        let err = ReplicationConfig::from_toml_str("role = \"leader\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "role = \"replica\"\nmaster_addr = \"10.0.0.1:15475\"").unwrap();

        let config = ReplicationConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.role, ReplicationRole::Replica);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReplicationConfig::from_toml_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_overrides_take_priority() {
        let vars: HashMap<&str, &str> = [
            ("NEXUS_REPLICATION_ROLE", "Replica"),
            ("NEXUS_REPLICATION_MASTER_ADDR", "192.168.1.10:15475"),
            ("NEXUS_REPLICATION_DELIVERY_POLICY", "drop"),
            ("NEXUS_REPLICATION_MAX_RETRIES", "7"),
        ]
        .into_iter()
        .collect();

        let mut config = ReplicationConfig::from_toml_str("role = \"master\"").unwrap();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.role, ReplicationRole::Replica);
        assert_eq!(config.master_addr.unwrap().port(), 15475);
        assert_eq!(config.delivery_policy, DeliveryPolicy::Drop);
        assert_eq!(config.max_delivery_retries, 7);
    }

    #[test]
    fn test_invalid_override() {
        let mut config = ReplicationConfig::default();
        let err = config
            .apply_overrides(|name| (name == "NEXUS_REPLICATION_HEARTBEAT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("NEXUS_REPLICATION_GRAPH", "from-env");
        }
        let mut config = ReplicationConfig::default();
        let result = config.apply_env_overrides();
        unsafe {
            std::env::remove_var("NEXUS_REPLICATION_GRAPH");
        }

        result.unwrap();
        assert_eq!(config.graph_id, "from-env");
    }
}
