use bytes::Bytes;
use routine_core::{CallerInfo, ETag, IntentId, RoutineKey};
use serde::{Deserialize, Serialize};

/// Lifecycle of a persisted routine record.
///
/// The order of the variants is the order of advancement: a record's status
/// never moves backwards and `Complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoutineStatus {
    Scheduled,
    Awaiting,
    Complete,
}

impl RoutineStatus {
    /// Whether a write may move a record from `self` to `next`.
    ///
    /// `Awaiting -> Awaiting` is allowed: a routine may suspend several times.
    pub fn can_advance_to(self, next: RoutineStatus) -> bool {
        match self {
            RoutineStatus::Complete => false,
            RoutineStatus::Awaiting => next >= RoutineStatus::Awaiting,
            RoutineStatus::Scheduled => next >= RoutineStatus::Scheduled,
        }
    }
}

/// One persisted routine row, keyed by (service, routine id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineRecord {
    pub key: RoutineKey,
    pub intent_id: IntentId,
    pub status: RoutineStatus,
    /// Encoded state envelope while the routine is suspended.
    pub state: Option<Bytes>,
    /// Encoded continuation list (triggers keep their subscribers here).
    pub continuation: Option<Bytes>,
    /// Encoded final result once `Complete`.
    pub result: Option<Bytes>,
    pub caller: Option<CallerInfo>,
    /// Encoded outbox of the commit that wrote this record.
    pub outbox: Option<Bytes>,
    /// Issued by the fabric; ignored on writes.
    pub etag: Option<ETag>,
}

impl RoutineRecord {
    pub fn new(key: RoutineKey, intent_id: IntentId, status: RoutineStatus) -> Self {
        Self {
            key,
            intent_id,
            status,
            state: None,
            continuation: None,
            result: None,
            caller: None,
            outbox: None,
            etag: None,
        }
    }

    #[must_use]
    pub fn with_caller(mut self, caller: CallerInfo) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status == RoutineStatus::Complete
    }
}
