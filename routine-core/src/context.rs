use crate::descriptor::{CallerDescriptor, RoutineDescriptor};
use crate::primitives::{MethodId, RoutineId, TaskId, TriggerId};
use crate::state::RoutineResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The side of the engine a turn talks to.
///
/// Every method records an intent; nothing is performed until the turn is
/// committed.
pub trait TurnHost: Send + Sync {
    fn routine(&self) -> RoutineDescriptor;
    fn caller(&self) -> Option<CallerDescriptor>;
    fn flow_context(&self) -> BTreeMap<String, String>;
    fn call(
        &self,
        target: MethodId,
        routine_id: Option<RoutineId>,
        input: Bytes,
        triggers: Vec<TriggerId>,
    ) -> TaskId;
    fn checkpoint(&self, resume_at: Option<DateTime<Utc>>) -> TaskId;
    fn new_trigger(&self) -> TriggerId;
    fn await_trigger(&self, trigger: TriggerId) -> TaskId;
    fn activate_trigger(&self, trigger: TriggerId, result: RoutineResult);
    fn raise_event(&self, topic: String, payload: Bytes);
}

/// Handle passed to a routine for the duration of one turn.
#[derive(Clone)]
pub struct TurnContext {
    host: Arc<dyn TurnHost>,
}

impl TurnContext {
    pub fn new(host: Arc<dyn TurnHost>) -> Self {
        Self { host }
    }

    pub fn routine(&self) -> RoutineDescriptor {
        self.host.routine()
    }

    pub fn caller(&self) -> Option<CallerDescriptor> {
        self.host.caller()
    }

    pub fn flow_context(&self) -> BTreeMap<String, String> {
        self.host.flow_context()
    }

    /// Schedule a call to `target`. The callee gets a fresh routine id.
    pub fn call(&self, target: MethodId, input: Bytes) -> TaskId {
        self.host.call(target, None, input, Vec::new())
    }

    /// Schedule a call to a specific routine instance of `target`.
    pub fn call_routine(&self, target: MethodId, routine_id: RoutineId, input: Bytes) -> TaskId {
        self.host.call(target, Some(routine_id), input, Vec::new())
    }

    /// Schedule a call that hands trigger placeholders to the callee.
    pub fn call_with_triggers(
        &self,
        target: MethodId,
        input: Bytes,
        triggers: Vec<TriggerId>,
    ) -> TaskId {
        self.host.call(target, None, input, triggers)
    }

    /// Voluntarily suspend; the routine resumes itself, at `resume_at` if given.
    pub fn checkpoint(&self, resume_at: Option<DateTime<Utc>>) -> TaskId {
        self.host.checkpoint(resume_at)
    }

    pub fn new_trigger(&self) -> TriggerId {
        self.host.new_trigger()
    }

    pub fn await_trigger(&self, trigger: TriggerId) -> TaskId {
        self.host.await_trigger(trigger)
    }

    pub fn activate_trigger(&self, trigger: TriggerId, result: RoutineResult) {
        self.host.activate_trigger(trigger, result)
    }

    pub fn raise_event(&self, topic: impl Into<String>, payload: Bytes) {
        self.host.raise_event(topic.into(), payload)
    }
}
