//! Durable side effects produced by one turn.
//!
//! A turn never performs effects directly. It accumulates [`Intent`]s in a
//! [`ScheduledActions`] bundle which the commit step consumes exactly once.

use crate::descriptor::ContinuationDescriptor;
use crate::message::TransitionMessage;
use crate::primitives::{IntentId, MethodId, RoutineId, TaskId, TriggerId};
use crate::state::{RoutineResult, StateEnvelope};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Start a new routine on behalf of the current one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRoutineIntent {
    pub intent_id: IntentId,
    pub task_id: TaskId,
    pub target: MethodId,
    pub routine_id: RoutineId,
    pub input: Bytes,
    /// Attached once the host turn is known to await this call.
    pub continuation: Option<ContinuationDescriptor>,
    /// Trigger placeholders handed to the callee.
    pub triggers: Vec<TriggerId>,
}

/// Deliver a final result to a waiting routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationIntent {
    pub continuation: ContinuationDescriptor,
    pub result: RoutineResult,
}

/// Resume the current routine later, optionally at a given time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRoutineIntent {
    pub continuation: ContinuationDescriptor,
    pub result: RoutineResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseEventIntent {
    pub intent_id: IntentId,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeTriggerIntent {
    pub trigger: TriggerId,
    pub task_id: TaskId,
    /// Attached once the host turn is known to await the trigger.
    pub continuation: Option<ContinuationDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateTriggerIntent {
    pub trigger: TriggerId,
    pub result: RoutineResult,
}

/// One durable side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    ExecuteRoutine(ExecuteRoutineIntent),
    Continuation(ContinuationIntent),
    ResumeRoutine(ResumeRoutineIntent),
    RaiseEvent(RaiseEventIntent),
    RegisterTrigger(TriggerId),
    SubscribeTrigger(SubscribeTriggerIntent),
    ActivateTrigger(ActivateTriggerIntent),
}

impl Intent {
    /// Trigger ids referenced by this intent.
    pub fn triggers(&self) -> Vec<&TriggerId> {
        match self {
            Intent::ExecuteRoutine(call) => call.triggers.iter().collect(),
            Intent::RegisterTrigger(trigger) => vec![trigger],
            Intent::SubscribeTrigger(subscribe) => vec![&subscribe.trigger],
            Intent::ActivateTrigger(activate) => vec![&activate.trigger],
            Intent::Continuation(_) | Intent::ResumeRoutine(_) | Intent::RaiseEvent(_) => {
                Vec::new()
            }
        }
    }
}

/// What the turn asks to be saved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveKind {
    #[default]
    Nothing,
    LocalState,
    FinalResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveStateIntent {
    pub kind: SaveKind,
    /// State to roam or persist when `kind` is `LocalState`.
    pub envelope: Option<StateEnvelope>,
    /// Result to persist when `kind` is `FinalResult`.
    pub result: Option<RoutineResult>,
    /// Set when no outbound message can carry the state inline.
    pub requires_persistence: bool,
}

/// All durable effects of one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActions {
    pub save_state: SaveStateIntent,
    pub intents: Vec<Intent>,
}

impl ScheduledActions {
    pub fn push(&mut self, intent: Intent) {
        self.intents.push(intent);
    }

    pub fn is_final(&self) -> bool {
        self.save_state.kind == SaveKind::FinalResult
    }

    pub fn calls(&self) -> impl Iterator<Item = &ExecuteRoutineIntent> {
        self.intents.iter().filter_map(|intent| match intent {
            Intent::ExecuteRoutine(call) => Some(call),
            _ => None,
        })
    }

    pub fn find_call_mut(&mut self, task_id: TaskId) -> Option<&mut ExecuteRoutineIntent> {
        self.intents.iter_mut().find_map(|intent| match intent {
            Intent::ExecuteRoutine(call) if call.task_id == task_id => Some(call),
            _ => None,
        })
    }

    pub fn find_subscription_mut(
        &mut self,
        task_id: TaskId,
    ) -> Option<&mut SubscribeTriggerIntent> {
        self.intents.iter_mut().find_map(|intent| match intent {
            Intent::SubscribeTrigger(subscribe) if subscribe.task_id == task_id => Some(subscribe),
            _ => None,
        })
    }

    pub fn has_resume(&self, task_id: TaskId) -> bool {
        self.intents.iter().any(|intent| {
            matches!(
                intent,
                Intent::ResumeRoutine(resume) if resume.continuation.task_id == task_id
            )
        })
    }

    /// Whether a register intent for `trigger` is already scheduled.
    pub fn registers(&self, trigger: &TriggerId) -> bool {
        self.intents
            .iter()
            .any(|intent| matches!(intent, Intent::RegisterTrigger(t) if t == trigger))
    }
}

/// Outbound intents of a commit, stored next to the state or result it wrote.
///
/// The commit that writes a record and the dispatches that follow are not
/// atomic. When the message that drove the commit is delivered again, the
/// stored outbox is dispatched again instead of being lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbox {
    /// Intent of the routine that committed.
    pub intent_id: IntentId,
    /// Placeholder the committing message delivered, `None` for an `Invoke`.
    pub delivered_task: Option<TaskId>,
    pub intents: Vec<Intent>,
}

impl Outbox {
    pub fn new(message: &TransitionMessage, intents: Vec<Intent>) -> Self {
        Self {
            intent_id: message.intent_id,
            delivered_task: message.delivery.as_ref().map(|d| d.task_id),
            intents,
        }
    }

    /// Whether `message` is the one this outbox was committed for.
    pub fn answers(&self, message: &TransitionMessage) -> bool {
        self.intent_id == message.intent_id
            && self.delivered_task == message.delivery.as_ref().map(|d| d.task_id)
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}
