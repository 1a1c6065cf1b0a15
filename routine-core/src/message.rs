use crate::descriptor::{CallerInfo, ContinuationDescriptor, RoutineDescriptor, TransitionKind};
use crate::primitives::{IntentId, MethodId, RoutineId, RoutineKey, TaskId};
use crate::state::RoutineResult;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a message reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOrigin {
    /// Started from outside the engine.
    External,
    /// Dispatched by another routine over a queue.
    Call,
    /// Served on the caller's stack over the synchronous-reply channel.
    Direct,
    /// Fan-out of a raised event to a subscribed handler.
    Event,
    /// A routine resuming itself (checkpoint, timer, trigger).
    Resume,
}

/// A result delivered to one pending placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub task_id: TaskId,
    pub result: RoutineResult,
}

/// The carrier of one transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionMessage {
    pub kind: TransitionKind,
    pub target: MethodId,
    pub routine_id: RoutineId,
    pub intent_id: IntentId,
    /// Intent of the commit that dispatched this message.
    pub dispatch_id: Option<IntentId>,
    pub input: Bytes,
    pub delivery: Option<Delivery>,
    /// Inline state envelope when state roams.
    pub roamed: Option<Bytes>,
    pub caller: CallerInfo,
    pub flow_context: BTreeMap<String, String>,
    pub origin: MessageOrigin,
    /// Whether someone may later read the result from the store.
    pub pollable: bool,
    pub attempt: u32,
}

impl TransitionMessage {
    /// An external `Invoke` of `target`. The routine id defaults to the intent id.
    pub fn invoke(target: MethodId, input: Bytes) -> Self {
        let intent_id = IntentId::new();
        Self {
            kind: TransitionKind::Invoke,
            target,
            routine_id: RoutineId::from(&intent_id),
            intent_id,
            dispatch_id: None,
            input,
            delivery: None,
            roamed: None,
            caller: CallerInfo::external(),
            flow_context: BTreeMap::new(),
            origin: MessageOrigin::External,
            pollable: true,
            attempt: 0,
        }
    }

    /// A `Continue` that delivers `result` through `continuation`.
    pub fn resume(continuation: &ContinuationDescriptor, result: RoutineResult) -> Self {
        Self {
            kind: TransitionKind::Continue,
            target: continuation.target.clone(),
            routine_id: continuation.routine_id.clone(),
            intent_id: continuation.intent_id,
            dispatch_id: None,
            input: Bytes::new(),
            delivery: Some(Delivery {
                task_id: continuation.task_id,
                result,
            }),
            roamed: continuation.roamed.clone(),
            caller: CallerInfo::external(),
            flow_context: BTreeMap::new(),
            origin: MessageOrigin::Call,
            pollable: true,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn with_routine_id(mut self, routine_id: RoutineId) -> Self {
        self.routine_id = routine_id;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: MessageOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_flow_context(mut self, flow_context: BTreeMap<String, String>) -> Self {
        self.flow_context = flow_context;
        self
    }

    pub fn key(&self) -> RoutineKey {
        RoutineKey::new(self.target.service.clone(), self.routine_id.clone())
    }

    pub fn descriptor(&self) -> RoutineDescriptor {
        RoutineDescriptor {
            method: self.target.clone(),
            intent_id: self.intent_id,
            routine_id: self.routine_id.clone(),
            etag: None,
        }
    }
}
