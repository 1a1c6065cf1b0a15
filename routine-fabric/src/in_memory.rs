//! In-memory implementation of [`Fabric`].
//!
//! Records live in a HashMap, the queue in a VecDeque. Useful for testing and
//! as a reference implementation of the create/replace semantics.

use crate::backend::{Fabric, FabricError, PublishedEvent};
use crate::record::{RoutineRecord, RoutineStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use routine_core::{ETag, RoutineKey, TransitionMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

struct QueuedMessage {
    message: TransitionMessage,
    visible_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RecordTable {
    rows: HashMap<RoutineKey, RoutineRecord>,
    /// Every status a key has been written with, in order.
    history: HashMap<RoutineKey, Vec<RoutineStatus>>,
}

/// In-memory fabric.
///
/// Thread-safe and cheap to clone; clones share the same tables.
///
/// # Example
///
/// ```rust,ignore
/// use routine_fabric::{Fabric, InMemoryFabric, RoutineRecord, RoutineStatus};
///
/// let fabric = InMemoryFabric::new();
/// let tag = fabric.create_if_absent(record).await?;
/// let next = fabric.replace_if_match(updated, &tag).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryFabric {
    records: Option<Arc<RwLock<RecordTable>>>,
    queue: Arc<Mutex<VecDeque<QueuedMessage>>>,
    events: Arc<Mutex<Vec<PublishedEvent>>>,
    dead_letters: Arc<Mutex<Vec<(TransitionMessage, String)>>>,
    next_tag: Arc<AtomicU64>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self {
            records: Some(Arc::new(RwLock::new(RecordTable::default()))),
            ..Self::queue_only()
        }
    }

    /// A fabric without a record store: every record operation is unsupported.
    pub fn queue_only() -> Self {
        Self {
            records: None,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            next_tag: Arc::new(AtomicU64::new(1)),
        }
    }

    fn table(&self) -> Result<&Arc<RwLock<RecordTable>>, FabricError> {
        self.records
            .as_ref()
            .ok_or(FabricError::Unsupported("record store"))
    }

    fn issue_tag(&self) -> ETag {
        ETag::new(format!("W/{}", self.next_tag.fetch_add(1, Ordering::SeqCst)))
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> FabricError {
        FabricError::Backend(format!("Lock error: {}", e))
    }

    /// Statuses written for `key`, oldest first.
    pub fn status_history(&self, key: &RoutineKey) -> Vec<RoutineStatus> {
        self.records
            .as_ref()
            .and_then(|table| table.read().ok())
            .and_then(|table| table.history.get(key).cloned())
            .unwrap_or_default()
    }

    /// Number of queued messages, visible or not.
    pub fn queued(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Copies of the queued messages, in queue order.
    pub fn queued_messages(&self) -> Vec<TransitionMessage> {
        self.queue
            .lock()
            .map(|queue| queue.iter().map(|q| q.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn published_events(&self) -> Vec<PublishedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<(TransitionMessage, String)> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fabric for InMemoryFabric {
    fn supports_persistence(&self) -> bool {
        self.records.is_some()
    }

    async fn create_if_absent(&self, mut record: RoutineRecord) -> Result<ETag, FabricError> {
        let mut table = self.table()?.write().map_err(Self::lock_error)?;
        if table.rows.contains_key(&record.key) {
            return Err(FabricError::Conflict {
                key: record.key.clone(),
            });
        }

        let tag = self.issue_tag();
        record.etag = Some(tag.clone());
        table
            .history
            .entry(record.key.clone())
            .or_default()
            .push(record.status);
        table.rows.insert(record.key.clone(), record);
        Ok(tag)
    }

    async fn replace_if_match(
        &self,
        mut record: RoutineRecord,
        expected: &ETag,
    ) -> Result<ETag, FabricError> {
        let mut table = self.table()?.write().map_err(Self::lock_error)?;
        let current = table
            .rows
            .get(&record.key)
            .ok_or_else(|| FabricError::NotFound(record.key.clone()))?;

        if current.etag.as_ref() != Some(expected) {
            return Err(FabricError::Conflict {
                key: record.key.clone(),
            });
        }
        if !current.status.can_advance_to(record.status) {
            return Err(FabricError::InvalidStatusTransition {
                key: record.key.clone(),
                from: current.status,
                to: record.status,
            });
        }

        let tag = self.issue_tag();
        record.etag = Some(tag.clone());
        table
            .history
            .entry(record.key.clone())
            .or_default()
            .push(record.status);
        table.rows.insert(record.key.clone(), record);
        Ok(tag)
    }

    async fn try_read(&self, key: &RoutineKey) -> Result<Option<RoutineRecord>, FabricError> {
        let table = self.table()?.read().map_err(Self::lock_error)?;
        Ok(table.rows.get(key).cloned())
    }

    async fn enqueue(
        &self,
        message: TransitionMessage,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<(), FabricError> {
        let mut queue = self.queue.lock().map_err(Self::lock_error)?;
        queue.push_back(QueuedMessage {
            message,
            visible_at,
        });
        Ok(())
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<TransitionMessage>, FabricError> {
        let now = Utc::now();
        let mut queue = self.queue.lock().map_err(Self::lock_error)?;

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        while let Some(queued) = queue.pop_front() {
            let visible = queued.visible_at.is_none_or(|at| at <= now);
            if visible && taken.len() < limit {
                taken.push(queued.message);
            } else {
                remaining.push_back(queued);
            }
        }
        *queue = remaining;
        Ok(taken)
    }

    async fn publish_event(&self, event: PublishedEvent) -> Result<(), FabricError> {
        let mut events = self.events.lock().map_err(Self::lock_error)?;
        events.push(event);
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: TransitionMessage,
        reason: String,
    ) -> Result<(), FabricError> {
        tracing::error!(
            service = %message.target.service,
            routine_id = %message.routine_id,
            intent_id = %message.intent_id,
            reason = %reason,
            "Message dead-lettered"
        );
        let mut letters = self.dead_letters.lock().map_err(Self::lock_error)?;
        letters.push((message, reason));
        Ok(())
    }
}
