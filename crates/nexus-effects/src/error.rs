//! Error types for the effects replication core

use thiserror::Error;

/// Result type alias using the effects Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for effect encoding, delivery and replay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from replication connections
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or truncated effect bytes, unknown tag
    #[error("Decode error: {0}")]
    Decode(String),

    /// Schema id/name mismatch while replaying a SchemaAdd
    #[error("Schema divergence: {0}")]
    SchemaDivergence(String),

    /// Structural effect referencing an unknown or already-existing entity
    #[error("Referential error: {0}")]
    Referential(String),

    /// Transport failure while sending a batch
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Value or effect that cannot be encoded (detected on the master)
    #[error("Encode error: {0}")]
    Encode(String),

    /// Replication protocol and state errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// Full resynchronization snapshot errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a schema divergence error
    pub fn schema_divergence(msg: impl Into<String>) -> Self {
        Self::SchemaDivergence(msg.into())
    }

    /// Create a referential error
    pub fn referential(msg: impl Into<String>) -> Self {
        Self::Referential(msg.into())
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    /// Create an encode error
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a snapshot error
    pub fn snapshot(msg: impl Into<String>) -> Self {
        Self::Snapshot(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Apply-time errors after which the replica can no longer trust its
    /// state and must be driven through full resynchronization.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::SchemaDivergence(_) | Self::Referential(_)
        )
    }

    /// Errors the dispatcher may retry by resending the whole batch
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Delivery(_) | Self::Io(_))
    }
}
