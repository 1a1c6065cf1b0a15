//! Error types for routine-core.

use crate::primitives::{MethodId, TaskId};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A method was registered twice.
    #[error("Duplicate method: '{0}'")]
    DuplicateMethod(MethodId),
    /// No routine is registered for the method.
    #[error("Method '{0}' not found in registry")]
    MethodNotFound(MethodId),
    /// A delivered result names a placeholder the routine does not have.
    #[error("No pending placeholder for task {0}")]
    PlaceholderMissing(TaskId),
    /// A delivered result names a placeholder that was already resolved.
    #[error("Placeholder for task {0} is already resolved")]
    PlaceholderResolved(TaskId),
    /// Encoding or decoding a blob failed.
    #[error("Codec error: {0}")]
    Codec(String),
}
