//! Error types for the transition engine.

use routine_core::{CoreError, MethodId, RoutineKey, TaskId};
use routine_fabric::FabricError;

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// Another writer advanced the record first.
    #[error("Concurrent transition on {key}")]
    ConcurrentTransition { key: RoutineKey },
    /// The turn suspended in a shape the engine cannot persist.
    #[error("Unclassifiable suspension in {method}: {reason}")]
    Unclassifiable { method: MethodId, reason: String },
    /// The message does not fit the stored record (missing, evicted, malformed).
    #[error("Invalid state for {key}: {reason}")]
    InvalidState { key: RoutineKey, reason: String },
    /// A delivered result does not match a pending placeholder.
    #[error("Placeholder mismatch for task {task_id} in {key}: {source}")]
    PlaceholderMismatch {
        key: RoutineKey,
        task_id: TaskId,
        #[source]
        source: CoreError,
    },
    /// State has to be persisted but the fabric has no record store.
    #[error("Method {0} requires persistence but no record store is configured")]
    MissingPersistence(MethodId),
    #[error("No transition is in progress on this task")]
    OutsideTransition,
    #[error("No routine registered for {0}")]
    UnknownTarget(MethodId),
    #[error("The completion subscription was dropped before a result arrived")]
    SubscriptionClosed,
    #[error("Fabric error: {0}")]
    Fabric(#[source] FabricError),
    #[error("Codec error: {0}")]
    Codec(String),
}

impl TransitionError {
    /// Whether reprocessing the original message may succeed: a lost race,
    /// or a backend failure that may be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransitionError::ConcurrentTransition { .. }
                | TransitionError::Fabric(FabricError::Backend(_))
        )
    }

    pub(crate) fn codec(context: &str, error: anyhow::Error) -> Self {
        TransitionError::Codec(format!("{context}: {error:#}"))
    }
}

impl From<FabricError> for TransitionError {
    fn from(error: FabricError) -> Self {
        match error {
            FabricError::Conflict { key } => TransitionError::ConcurrentTransition { key },
            other => TransitionError::Fabric(other),
        }
    }
}
