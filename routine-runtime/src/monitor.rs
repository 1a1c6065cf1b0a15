//! Drives the bookkeeping of one turn and classifies how it ended.
//!
//! While the routine runs, every effect it asks for through its
//! [`TurnContext`](routine_core::TurnContext) is recorded here as an
//! [`Intent`]. When the turn ends, [`TransitionMonitor::track_completion`]
//! decides what has to be saved and wires a continuation back into this
//! routine for every placeholder it now waits on.

use crate::error::TransitionError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use routine_core::intent::{
    ActivateTriggerIntent, ExecuteRoutineIntent, Intent, RaiseEventIntent, ResumeRoutineIntent,
    SaveKind, SaveStateIntent, ScheduledActions, SubscribeTriggerIntent,
};
use routine_core::state::PendingKind;
use routine_core::{
    Awaiting, CallerDescriptor, CallerInfo, ContinuationDescriptor, MethodId, RoutineDescriptor,
    RoutineId, RoutineResult, RoutineState, StateEnvelope, TaskId, TriggerId, TurnHost,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// How a turn ended, with errors and panics already folded into a fault.
#[derive(Debug)]
pub enum TurnResult {
    Finished(RoutineResult),
    Suspended {
        state: RoutineState,
        awaiting: Awaiting,
    },
}

#[derive(Default)]
struct MonitorState {
    next_task: u64,
    next_trigger: u64,
    next_event: u64,
    actions: ScheduledActions,
    /// Placeholders created during this turn.
    opened: Vec<(TaskId, PendingKind)>,
    created_triggers: Vec<TriggerId>,
}

/// Accumulates the intents of one turn.
pub struct TransitionMonitor {
    routine: RoutineDescriptor,
    caller: CallerInfo,
    flow_context: BTreeMap<String, String>,
    /// Task counter at the start of the turn. Unique per turn of a routine.
    turn_base: u64,
    inner: Mutex<MonitorState>,
}

impl TransitionMonitor {
    /// Start tracking a turn. Task ids continue from `next_task`.
    pub fn start(
        routine: RoutineDescriptor,
        caller: CallerInfo,
        flow_context: BTreeMap<String, String>,
        next_task: u64,
    ) -> Self {
        tracing::trace!(
            method = %routine.method,
            routine_id = %routine.routine_id,
            next_task,
            "Turn started"
        );
        Self {
            routine,
            caller,
            flow_context,
            turn_base: next_task,
            inner: Mutex::new(MonitorState {
                next_task,
                ..MonitorState::default()
            }),
        }
    }

    pub fn descriptor(&self) -> &RoutineDescriptor {
        &self.routine
    }

    pub fn caller_info(&self) -> &CallerInfo {
        &self.caller
    }

    /// Triggers created with `new_trigger` during this turn.
    pub fn created_triggers(&self) -> Vec<TriggerId> {
        self.lock().created_triggers.clone()
    }

    /// A continuation that routes a result back into this routine.
    pub fn continuation(
        &self,
        task_id: TaskId,
        resume_at: Option<DateTime<Utc>>,
    ) -> ContinuationDescriptor {
        self_continuation(&self.routine, task_id, resume_at)
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(state: &mut MonitorState) -> TaskId {
        let task = TaskId::new(state.next_task);
        state.next_task += 1;
        task
    }

    /// Turn the outcome of a turn into the bundle of scheduled actions.
    ///
    /// `persisted` tells whether this routine's state lives in the record
    /// store, which is what allows waiting on placeholders opened by an
    /// earlier turn.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::Unclassifiable` for any suspension whose
    /// awaited placeholders cannot be wired to a continuation.
    pub fn track_completion(
        &self,
        result: TurnResult,
        persisted: bool,
        flow: &dyn IntrinsicFlow,
    ) -> Result<ScheduledActions, TransitionError> {
        let (mut actions, opened, next_task) = {
            let mut inner = self.lock();
            (
                std::mem::take(&mut inner.actions),
                std::mem::take(&mut inner.opened),
                inner.next_task,
            )
        };

        match result {
            TurnResult::Finished(result) => {
                if result.is_fault() {
                    actions.intents.clear();
                } else {
                    // Nobody is left to receive a resume.
                    actions.intents.retain(|intent| {
                        !matches!(intent, Intent::ResumeRoutine(_) | Intent::SubscribeTrigger(_))
                    });
                }
                tracing::debug!(
                    method = %self.routine.method,
                    routine_id = %self.routine.routine_id,
                    fault = result.is_fault(),
                    "Turn finished"
                );
                actions.save_state = SaveStateIntent {
                    kind: SaveKind::FinalResult,
                    envelope: None,
                    result: Some(result),
                    requires_persistence: false,
                };
            }
            TurnResult::Suspended {
                mut state,
                awaiting,
            } => {
                let requires_persistence = {
                    let mut wiring = BranchWiring {
                        routine: &self.routine,
                        actions: &mut actions,
                        opened: &opened,
                        state: &state,
                        persisted,
                        requires_persistence: false,
                    };
                    match &awaiting {
                        Awaiting::One(task) => wiring.wire_single(*task)?,
                        Awaiting::All(_) | Awaiting::Any(_) => {
                            flow.wire(&awaiting, &mut wiring)?;
                            wiring.require_persistence();
                        }
                    }
                    wiring.requires_persistence
                };

                for (task, kind) in opened {
                    state.open_slot(task, kind);
                }
                state.advance_next_task(next_task);
                state.set_awaiting(awaiting.tasks());

                tracing::debug!(
                    method = %self.routine.method,
                    routine_id = %self.routine.routine_id,
                    step = state.step,
                    awaiting = ?awaiting,
                    requires_persistence,
                    "Turn suspended"
                );
                actions.save_state = SaveStateIntent {
                    kind: SaveKind::LocalState,
                    envelope: Some(StateEnvelope {
                        state,
                        caller: self.caller.clone(),
                    }),
                    result: None,
                    requires_persistence,
                };
            }
        }

        Ok(actions)
    }
}

fn self_continuation(
    routine: &RoutineDescriptor,
    task_id: TaskId,
    resume_at: Option<DateTime<Utc>>,
) -> ContinuationDescriptor {
    ContinuationDescriptor {
        target: routine.method.clone(),
        routine_id: routine.routine_id.clone(),
        intent_id: routine.intent_id,
        task_id,
        resume_at,
        roamed: None,
    }
}

impl TurnHost for TransitionMonitor {
    fn routine(&self) -> RoutineDescriptor {
        self.routine.clone()
    }

    fn caller(&self) -> Option<CallerDescriptor> {
        self.caller.caller.clone()
    }

    fn flow_context(&self) -> BTreeMap<String, String> {
        self.flow_context.clone()
    }

    fn call(
        &self,
        target: MethodId,
        routine_id: Option<RoutineId>,
        input: Bytes,
        triggers: Vec<TriggerId>,
    ) -> TaskId {
        let mut inner = self.lock();
        let task_id = Self::allocate(&mut inner);
        let intent_id = self.routine.intent_id.derive(&format!("call/{task_id}"));
        let routine_id = routine_id.unwrap_or_else(|| RoutineId::from(&intent_id));

        tracing::trace!(
            method = %self.routine.method,
            target = %target,
            task_id = %task_id,
            "Call registered"
        );
        inner.opened.push((task_id, PendingKind::Call(target.clone())));
        inner.actions.push(Intent::ExecuteRoutine(ExecuteRoutineIntent {
            intent_id,
            task_id,
            target,
            routine_id,
            input,
            continuation: None,
            triggers,
        }));
        task_id
    }

    fn checkpoint(&self, resume_at: Option<DateTime<Utc>>) -> TaskId {
        let mut inner = self.lock();
        let task_id = Self::allocate(&mut inner);
        inner.opened.push((task_id, PendingKind::Checkpoint));
        inner.actions.push(Intent::ResumeRoutine(ResumeRoutineIntent {
            continuation: self_continuation(&self.routine, task_id, resume_at),
            result: RoutineResult::Value(Bytes::new()),
        }));
        task_id
    }

    fn new_trigger(&self) -> TriggerId {
        let mut inner = self.lock();
        let n = inner.next_trigger;
        inner.next_trigger += 1;
        let trigger = TriggerId::new(
            self.routine
                .intent_id
                .derive(&format!("trigger/{}/{n}", self.turn_base))
                .to_string(),
        );
        inner.created_triggers.push(trigger.clone());
        trigger
    }

    fn await_trigger(&self, trigger: TriggerId) -> TaskId {
        let mut inner = self.lock();
        let task_id = Self::allocate(&mut inner);
        inner
            .opened
            .push((task_id, PendingKind::Trigger(trigger.clone())));
        inner
            .actions
            .push(Intent::SubscribeTrigger(SubscribeTriggerIntent {
                trigger,
                task_id,
                continuation: None,
            }));
        task_id
    }

    fn activate_trigger(&self, trigger: TriggerId, result: RoutineResult) {
        self.lock()
            .actions
            .push(Intent::ActivateTrigger(ActivateTriggerIntent { trigger, result }));
    }

    fn raise_event(&self, topic: String, payload: Bytes) {
        let mut inner = self.lock();
        let n = inner.next_event;
        inner.next_event += 1;
        let intent_id = self
            .routine
            .intent_id
            .derive(&format!("event/{}/{n}", self.turn_base));
        inner.actions.push(Intent::RaiseEvent(RaiseEventIntent {
            intent_id,
            topic,
            payload,
        }));
    }
}

/// Where an awaited placeholder came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOrigin {
    /// Created by the turn being classified.
    ThisTurn,
    /// Still pending from an earlier turn.
    Earlier,
    /// Already holds a result.
    Resolved,
    Unknown,
}

/// Continuation wiring for the placeholders a suspended turn waits on.
pub struct BranchWiring<'a> {
    routine: &'a RoutineDescriptor,
    actions: &'a mut ScheduledActions,
    opened: &'a [(TaskId, PendingKind)],
    state: &'a RoutineState,
    persisted: bool,
    requires_persistence: bool,
}

impl BranchWiring<'_> {
    pub fn method(&self) -> &MethodId {
        &self.routine.method
    }

    pub fn origin(&self, task_id: TaskId) -> BranchOrigin {
        if self.opened.iter().any(|(id, _)| *id == task_id) {
            BranchOrigin::ThisTurn
        } else if self.state.is_pending(task_id) {
            BranchOrigin::Earlier
        } else if self.state.is_resolved(task_id) {
            BranchOrigin::Resolved
        } else {
            BranchOrigin::Unknown
        }
    }

    /// Attach a continuation back into this routine to the intent that
    /// created `task_id` during this turn.
    pub fn attach(&mut self, task_id: TaskId) -> Result<(), TransitionError> {
        let kind = self
            .opened
            .iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, kind)| kind.clone());
        let continuation = self_continuation(self.routine, task_id, None);

        match kind {
            Some(PendingKind::Call(_)) => {
                if let Some(call) = self.actions.find_call_mut(task_id) {
                    call.continuation = Some(continuation);
                    return Ok(());
                }
                Err(self.unclassifiable(format!("call intent for task {task_id} is gone")))
            }
            Some(PendingKind::Checkpoint) if self.actions.has_resume(task_id) => Ok(()),
            Some(PendingKind::Trigger(_)) => {
                if let Some(subscription) = self.actions.find_subscription_mut(task_id) {
                    subscription.continuation = Some(continuation);
                    // The continuation lives in the trigger record, not in a message.
                    self.requires_persistence = true;
                    return Ok(());
                }
                Err(self.unclassifiable(format!(
                    "trigger subscription for task {task_id} is gone"
                )))
            }
            _ => Err(self.unclassifiable(format!(
                "task {task_id} was not created by this turn"
            ))),
        }
    }

    pub fn require_persistence(&mut self) {
        self.requires_persistence = true;
    }

    pub fn unclassifiable(&self, reason: impl Into<String>) -> TransitionError {
        TransitionError::Unclassifiable {
            method: self.routine.method.clone(),
            reason: reason.into(),
        }
    }

    fn wire_single(&mut self, task_id: TaskId) -> Result<(), TransitionError> {
        match self.origin(task_id) {
            BranchOrigin::ThisTurn => self.attach(task_id),
            // Wired by the earlier turn; only safe when state is read back from the store.
            BranchOrigin::Earlier if self.persisted => Ok(()),
            BranchOrigin::Earlier => Err(self.unclassifiable(format!(
                "task {task_id} is from an earlier turn and state roams"
            ))),
            BranchOrigin::Resolved => {
                Err(self.unclassifiable(format!("task {task_id} is already resolved")))
            }
            BranchOrigin::Unknown => {
                Err(self.unclassifiable(format!("task {task_id} is unknown")))
            }
        }
    }
}

/// Classification policy for composite (fan-in) suspensions.
pub trait IntrinsicFlow: Send + Sync {
    /// Wire every branch of `awaiting`, or reject the shape.
    fn wire(&self, awaiting: &Awaiting, branches: &mut BranchWiring<'_>)
    -> Result<(), TransitionError>;
}

/// Default fan-in policy: branches opened this turn get a continuation,
/// branches still pending from earlier turns are already wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinFlow;

impl IntrinsicFlow for JoinFlow {
    fn wire(
        &self,
        awaiting: &Awaiting,
        branches: &mut BranchWiring<'_>,
    ) -> Result<(), TransitionError> {
        let tasks = awaiting.tasks();
        if tasks.is_empty() {
            return Err(branches.unclassifiable("composite wait with no branches"));
        }

        let any = matches!(awaiting, Awaiting::Any(_));
        for task_id in tasks {
            match branches.origin(task_id) {
                BranchOrigin::ThisTurn => branches.attach(task_id)?,
                BranchOrigin::Earlier => {}
                BranchOrigin::Resolved if !any => {}
                BranchOrigin::Resolved => {
                    return Err(branches.unclassifiable(format!(
                        "any-wait on task {task_id} which is already resolved"
                    )));
                }
                BranchOrigin::Unknown => {
                    return Err(branches.unclassifiable(format!("branch {task_id} is unknown")));
                }
            }
        }
        Ok(())
    }
}
