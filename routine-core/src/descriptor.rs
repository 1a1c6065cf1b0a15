//! Descriptors that travel with messages and persisted records.

use crate::primitives::{ETag, IntentId, MethodId, RoutineId, RoutineKey, TaskId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of operation an inbound message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    /// Start a new routine instance.
    Invoke,
    /// Deliver a result (or a resume signal) to a suspended routine.
    Continue,
}

/// One durable invocation instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineDescriptor {
    pub method: MethodId,
    pub intent_id: IntentId,
    pub routine_id: RoutineId,
    /// Tag of the record as last observed by this transition, if one exists.
    pub etag: Option<ETag>,
}

impl RoutineDescriptor {
    pub fn key(&self) -> RoutineKey {
        RoutineKey::new(self.method.service.clone(), self.routine_id.clone())
    }
}

/// Who started a routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerDescriptor {
    pub method: MethodId,
    pub routine_id: RoutineId,
    pub intent_id: IntentId,
}

/// Where and when to deliver a result.
///
/// When state roams, `roamed` holds the encoded state envelope of the target
/// routine so that it can be resumed without a store round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationDescriptor {
    pub target: MethodId,
    pub routine_id: RoutineId,
    pub intent_id: IntentId,
    pub task_id: TaskId,
    pub resume_at: Option<DateTime<Utc>>,
    pub roamed: Option<Bytes>,
}

impl ContinuationDescriptor {
    pub fn key(&self) -> RoutineKey {
        RoutineKey::new(self.target.service.clone(), self.routine_id.clone())
    }
}

/// Caller identity plus every continuation to notify on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub caller: Option<CallerDescriptor>,
    pub continuations: Vec<ContinuationDescriptor>,
}

impl CallerInfo {
    pub fn external() -> Self {
        Self::default()
    }

    pub fn from_continuation(
        caller: CallerDescriptor,
        continuation: ContinuationDescriptor,
    ) -> Self {
        Self {
            caller: Some(caller),
            continuations: vec![continuation],
        }
    }
}
