//! The fabric contract: a keyed record store with optimistic concurrency plus
//! the message channels the engine dispatches through.
//!
//! The engine is backend-agnostic; in-memory, file-based or cloud table/queue
//! storage all implement this same trait.

use crate::record::{RoutineRecord, RoutineStatus};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use routine_core::{ETag, RoutineKey, TransitionMessage};

/// Error type for fabric operations.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// Create found an existing record, or replace presented a stale tag.
    #[error("Conflict on record {key}")]
    Conflict { key: RoutineKey },
    /// Replace targeted a record that does not exist.
    #[error("Record not found: {0}")]
    NotFound(RoutineKey),
    /// A write tried to move a record's status backwards.
    #[error("Record {key} cannot move from {from:?} to {to:?}")]
    InvalidStatusTransition {
        key: RoutineKey,
        from: RoutineStatus,
        to: RoutineStatus,
    },
    /// The backend has no record store configured.
    #[error("Unsupported by this fabric: {0}")]
    Unsupported(&'static str),
    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl FabricError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, FabricError::Conflict { .. })
    }
}

/// An event handed to the external publication channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub topic: String,
    pub payload: Bytes,
}

/// Storage and messaging backend.
///
/// Implementations must make `create_if_absent` exclusive (first writer wins)
/// and must issue a new [`ETag`] on every successful write.
#[async_trait]
pub trait Fabric: Send + Sync + 'static {
    /// Whether the record store is available. Queue-only fabrics return false.
    fn supports_persistence(&self) -> bool {
        true
    }

    /// Create a record if none exists for its key.
    ///
    /// # Errors
    ///
    /// Returns `FabricError::Conflict` if a record already exists.
    async fn create_if_absent(&self, record: RoutineRecord) -> Result<ETag, FabricError>;

    /// Replace a record if its current tag equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `FabricError::Conflict` on a tag mismatch,
    /// `FabricError::NotFound` if the record is gone and
    /// `FabricError::InvalidStatusTransition` if the status would regress.
    async fn replace_if_match(
        &self,
        record: RoutineRecord,
        expected: &ETag,
    ) -> Result<ETag, FabricError>;

    /// Read a record, returning `None` if it does not exist.
    async fn try_read(&self, key: &RoutineKey) -> Result<Option<RoutineRecord>, FabricError>;

    /// Put a message on the queue, invisible until `visible_at` if given.
    async fn enqueue(
        &self,
        message: TransitionMessage,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<(), FabricError>;

    /// Take up to `limit` visible messages off the queue.
    async fn dequeue(&self, limit: usize) -> Result<Vec<TransitionMessage>, FabricError>;

    /// Hand an event to the external publication channel.
    async fn publish_event(&self, event: PublishedEvent) -> Result<(), FabricError>;

    /// Park a message that will not be processed again.
    async fn dead_letter(&self, message: TransitionMessage, reason: String)
    -> Result<(), FabricError>;
}
