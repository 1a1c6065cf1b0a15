//! The explicit, serializable state machine of a routine.
//!
//! A routine's progress is a step discriminator, a set of named fields, the
//! original input and one placeholder per outstanding effect. Nothing about
//! the suspended computation is captured implicitly: whatever the routine
//! needs on its next turn must be written into this structure.

use crate::codec::{Codec, sealed};
use crate::descriptor::CallerInfo;
use crate::error::CoreError;
use crate::primitives::{MethodId, TaskId, TriggerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A routine failure captured as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub message: String,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for Fault {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{error:#}"))
    }
}

/// Final outcome of a routine or of one awaited effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutineResult {
    Value(Bytes),
    Fault(Fault),
    Cancelled,
}

impl RoutineResult {
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            RoutineResult::Value(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, RoutineResult::Fault(_))
    }
}

/// What a pending placeholder is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingKind {
    Call(MethodId),
    Checkpoint,
    Trigger(TriggerId),
}

/// Placeholder for one outstanding effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Pending(PendingKind),
    Resolved(RoutineResult),
}

/// The state machine a routine is compiled to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineState {
    pub step: u32,
    pub input: Bytes,
    fields: BTreeMap<String, Bytes>,
    slots: BTreeMap<TaskId, Slot>,
    next_task: u64,
    awaiting: Vec<TaskId>,
}

impl RoutineState {
    /// Fresh state for an `Invoke`, seeded with the call input.
    pub fn seeded(input: Bytes) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn field(&self, name: &str) -> Option<&Bytes> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Bytes) {
        self.fields.insert(name.into(), value);
    }

    /// Decode a named field with the given codec.
    pub fn get<C, T>(&self, codec: &C, name: &str) -> Result<Option<T>, CoreError>
    where
        C: Codec + sealed::DecodeValue<T>,
    {
        self.fields
            .get(name)
            .map(|bytes| codec.decode::<T>(bytes.clone()))
            .transpose()
            .map_err(|e| CoreError::Codec(format!("field '{name}': {e}")))
    }

    /// Encode a value into a named field with the given codec.
    pub fn put<C, T>(&mut self, codec: &C, name: &str, value: &T) -> Result<(), CoreError>
    where
        C: Codec + sealed::EncodeValue<T>,
    {
        let bytes = codec
            .encode(value)
            .map_err(|e| CoreError::Codec(format!("field '{name}': {e}")))?;
        self.fields.insert(name.to_string(), bytes);
        Ok(())
    }

    pub fn fields(&self) -> &BTreeMap<String, Bytes> {
        &self.fields
    }

    /// Next task id that a new placeholder will receive.
    pub fn next_task(&self) -> u64 {
        self.next_task
    }

    /// Move the task counter forward to at least `next`. Never moves it back.
    pub fn advance_next_task(&mut self, next: u64) {
        self.next_task = self.next_task.max(next);
    }

    /// Register a pending placeholder created during a turn.
    pub fn open_slot(&mut self, task_id: TaskId, kind: PendingKind) {
        self.slots.insert(task_id, Slot::Pending(kind));
        self.advance_next_task(task_id.get() + 1);
    }

    pub fn slot(&self, task_id: TaskId) -> Option<&Slot> {
        self.slots.get(&task_id)
    }

    /// Inject a delivered result into its pending placeholder.
    pub fn resolve(&mut self, task_id: TaskId, result: RoutineResult) -> Result<(), CoreError> {
        match self.slots.get_mut(&task_id) {
            Some(slot @ Slot::Pending(_)) => {
                *slot = Slot::Resolved(result);
                self.awaiting.retain(|id| *id != task_id);
                Ok(())
            }
            Some(Slot::Resolved(_)) => Err(CoreError::PlaceholderResolved(task_id)),
            None => Err(CoreError::PlaceholderMissing(task_id)),
        }
    }

    /// Remove and return a resolved result. Pending slots are left in place.
    pub fn take_result(&mut self, task_id: TaskId) -> Option<RoutineResult> {
        match self.slots.get(&task_id) {
            Some(Slot::Resolved(_)) => match self.slots.remove(&task_id) {
                Some(Slot::Resolved(result)) => Some(result),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_resolved(&self, task_id: TaskId) -> bool {
        matches!(self.slots.get(&task_id), Some(Slot::Resolved(_)))
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        matches!(self.slots.get(&task_id), Some(Slot::Pending(_)))
    }

    /// Ids of all placeholders still waiting for a result.
    pub fn pending(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.slots.iter().filter_map(|(id, slot)| match slot {
            Slot::Pending(_) => Some(*id),
            Slot::Resolved(_) => None,
        })
    }

    /// The "currently awaiting" marker written when the routine suspends.
    pub fn awaiting(&self) -> &[TaskId] {
        &self.awaiting
    }

    pub fn set_awaiting(&mut self, tasks: Vec<TaskId>) {
        self.awaiting = tasks;
    }
}

/// The blob that is either roamed inline or persisted in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub state: RoutineState,
    pub caller: CallerInfo,
}
