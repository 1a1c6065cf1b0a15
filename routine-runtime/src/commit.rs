//! Applies the scheduled actions of a turn.
//!
//! Order: validate, save state or result, dispatch calls, deliver
//! continuations and self-resumes, publish events, apply trigger intents,
//! notify local waiters. Every step is safe to re-run after a crash: writes
//! are guarded by create-if-absent or the record's tag, and every outbound
//! message carries deterministic intent ids plus the dispatching intent.
//!
//! A record write also stores the commit's outbox. If dispatching fails
//! after the write, the redelivered message finds the record already
//! advanced and replays the outbox instead of running the turn again.

use crate::error::TransitionError;
use crate::monitor::TransitionMonitor;
use crate::runner::{TransitionOutcome, TransitionRunner};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use routine_core::codec::StateCodec;
use routine_core::intent::{
    ActivateTriggerIntent, ExecuteRoutineIntent, Intent, Outbox, RaiseEventIntent, SaveKind,
    ScheduledActions, SubscribeTriggerIntent,
};
use routine_core::{
    CallerDescriptor, CallerInfo, ContinuationDescriptor, ETag, MessageOrigin, RoutineDescriptor,
    RoutineId, RoutineKey, RoutineResult, ServiceId, TransitionKind, TransitionMessage, TriggerId,
};
use routine_fabric::{Fabric, PublishedEvent, RoutineRecord, RoutineStatus};

/// Partition that holds trigger records.
pub const TRIGGER_PARTITION: &str = "$trigger";

/// Read-modify-write rounds on a trigger record before giving up.
const TRIGGER_WRITE_ATTEMPTS: usize = 8;

/// Record key of a trigger.
pub fn trigger_key(trigger: &TriggerId) -> RoutineKey {
    RoutineKey::new(
        ServiceId::new(TRIGGER_PARTITION),
        RoutineId::new(trigger.as_str()),
    )
}

#[derive(Default)]
struct Dispatches {
    calls: Vec<ExecuteRoutineIntent>,
    /// Continuation, result and the origin of the resume message.
    deliveries: Vec<(ContinuationDescriptor, RoutineResult, MessageOrigin)>,
    events: Vec<RaiseEventIntent>,
    registers: Vec<TriggerId>,
    subscribes: Vec<SubscribeTriggerIntent>,
    activates: Vec<ActivateTriggerIntent>,
}

impl Dispatches {
    fn split(intents: Vec<Intent>) -> Self {
        let mut dispatches = Self::default();
        for intent in intents {
            match intent {
                Intent::ExecuteRoutine(call) => dispatches.calls.push(call),
                Intent::Continuation(c) => {
                    dispatches
                        .deliveries
                        .push((c.continuation, c.result, MessageOrigin::Call))
                }
                Intent::ResumeRoutine(r) => {
                    dispatches
                        .deliveries
                        .push((r.continuation, r.result, MessageOrigin::Resume))
                }
                Intent::RaiseEvent(event) => dispatches.events.push(event),
                Intent::RegisterTrigger(trigger) => dispatches.registers.push(trigger),
                Intent::SubscribeTrigger(subscribe) => dispatches.subscribes.push(subscribe),
                Intent::ActivateTrigger(activate) => dispatches.activates.push(activate),
            }
        }
        dispatches
    }

    fn needs_store(&self) -> bool {
        !self.registers.is_empty() || !self.subscribes.is_empty() || !self.activates.is_empty()
    }
}

/// Whether the final result write can be skipped: a direct caller already
/// has the reply and nobody polls, or an event handler has no caller.
fn skips_result_save(message: &TransitionMessage) -> bool {
    match message.origin {
        MessageOrigin::Direct => !message.pollable,
        MessageOrigin::Event => true,
        _ => false,
    }
}

impl<F, C> TransitionRunner<F, C>
where
    F: Fabric,
    C: StateCodec,
{
    pub(crate) async fn commit(
        &self,
        message: &TransitionMessage,
        monitor: &TransitionMonitor,
        mut actions: ScheduledActions,
        persisted: bool,
        etag: Option<ETag>,
    ) -> Result<(), TransitionError> {
        let routine = monitor.descriptor();
        let key = routine.key();
        let persist_state = persisted || actions.save_state.requires_persistence;
        let kind = actions.save_state.kind;

        let needs_store = match kind {
            SaveKind::LocalState => persist_state,
            SaveKind::FinalResult | SaveKind::Nothing => persisted,
        };
        let intents = std::mem::take(&mut actions.intents);
        let outbox = Outbox::new(message, intents.clone());
        let mut dispatches = Dispatches::split(intents);
        if (needs_store || dispatches.needs_store()) && !self.fabric.supports_persistence() {
            return Err(TransitionError::MissingPersistence(routine.method.clone()));
        }

        let mut final_result = None;
        match kind {
            SaveKind::LocalState => {
                let envelope = actions.save_state.envelope.take().ok_or_else(|| {
                    TransitionError::InvalidState {
                        key: key.clone(),
                        reason: "suspended turn without state".to_string(),
                    }
                })?;
                let blob = self.encode("state envelope", &envelope)?;
                if persist_state {
                    let mut record =
                        RoutineRecord::new(key.clone(), routine.intent_id, RoutineStatus::Awaiting)
                            .with_caller(envelope.caller);
                    record.state = Some(blob);
                    record.outbox = self.encode_outbox(&outbox)?;
                    self.write_record(message, record, etag).await?;
                } else {
                    roam(&mut dispatches, &blob);
                }
            }
            SaveKind::FinalResult => {
                let result = actions.save_state.result.take().ok_or_else(|| {
                    TransitionError::InvalidState {
                        key: key.clone(),
                        reason: "finished turn without a result".to_string(),
                    }
                })?;
                // An existing record must still reach Complete.
                if etag.is_none() && skips_result_save(message) {
                    tracing::trace!(key = %key, origin = ?message.origin, "Result save skipped");
                } else if self.fabric.supports_persistence() {
                    let mut record =
                        RoutineRecord::new(key.clone(), routine.intent_id, RoutineStatus::Complete)
                            .with_caller(monitor.caller_info().clone());
                    record.result = Some(self.encode("result", &result)?);
                    record.outbox = self.encode_outbox(&outbox)?;
                    self.write_final(record, etag).await?;
                }
                final_result = Some(result);
            }
            SaveKind::Nothing => {}
        }

        self.dispatch(routine, message, dispatches).await?;

        if let Some(result) = final_result {
            tracing::info!(
                key = %key,
                intent_id = %routine.intent_id,
                fault = result.is_fault(),
                "Routine complete"
            );
            // Direct replies are fed to the hub by the dispatching side.
            if message.origin != MessageOrigin::Direct {
                self.hub.notify_completion(&key, &result);
            }
        }
        Ok(())
    }

    /// Send out everything a commit asked for, in commit order.
    async fn dispatch(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        dispatches: Dispatches,
    ) -> Result<(), TransitionError> {
        for call in dispatches.calls {
            self.dispatch_call(routine, message, call).await?;
        }

        for (continuation, result, origin) in dispatches.deliveries {
            let visible_at = match origin {
                MessageOrigin::Resume => continuation.resume_at,
                _ => None,
            };
            self.deliver(routine, message, &continuation, result, origin, visible_at)
                .await?;
        }

        for event in dispatches.events {
            self.raise(routine, message, event).await?;
        }

        for trigger in dispatches.registers {
            self.register_trigger(routine, &trigger).await?;
        }
        for subscribe in dispatches.subscribes {
            self.subscribe_trigger(routine, message, subscribe).await?;
        }
        for activate in dispatches.activates {
            self.activate_trigger(routine, message, activate).await?;
        }
        Ok(())
    }

    /// Dispatch the outbox stored in `record` again if it was committed for
    /// `message`. Returns whether it was.
    ///
    /// Every dispatch carries deterministic intent ids, so receivers that
    /// already saw the first copy treat the second as a duplicate.
    pub(crate) async fn replay_outbox(
        &self,
        message: &TransitionMessage,
        record: &RoutineRecord,
    ) -> Result<bool, TransitionError> {
        let Some(blob) = record.outbox.clone() else {
            return Ok(false);
        };
        let outbox: Outbox = self.decode("outbox", blob)?;
        if !outbox.answers(message) {
            return Ok(false);
        }

        tracing::info!(
            key = %record.key,
            status = ?record.status,
            intents = outbox.intents.len(),
            "Replaying the outbox of an interrupted commit"
        );
        let mut routine = message.descriptor();
        routine.etag = record.etag.clone();
        self.dispatch(&routine, message, Dispatches::split(outbox.intents))
            .await?;

        if record.is_complete() && message.origin != MessageOrigin::Direct {
            let result = self.stored_result(record)?;
            self.hub.notify_completion(&record.key, &result);
        }
        Ok(true)
    }

    fn encode_outbox(&self, outbox: &Outbox) -> Result<Option<Bytes>, TransitionError> {
        if outbox.is_empty() {
            return Ok(None);
        }
        self.encode("outbox", outbox).map(Some)
    }

    /// Create when no tag is known, else replace guarded by the tag.
    ///
    /// A create that finds a record written by an earlier attempt at the same
    /// message keeps that record; the dispatches that follow are the same.
    async fn write_record(
        &self,
        message: &TransitionMessage,
        record: RoutineRecord,
        etag: Option<ETag>,
    ) -> Result<(), TransitionError> {
        let key = record.key.clone();
        let status = record.status;
        let tag = match etag {
            Some(expected) => self.fabric.replace_if_match(record, &expected).await?,
            None => match self.fabric.create_if_absent(record).await {
                Ok(tag) => tag,
                Err(e) if e.is_conflict() => return self.written_earlier(message, &key).await,
                Err(e) => return Err(e.into()),
            },
        };
        tracing::debug!(key = %key, status = ?status, etag = %tag, "Record written");
        Ok(())
    }

    async fn written_earlier(
        &self,
        message: &TransitionMessage,
        key: &RoutineKey,
    ) -> Result<(), TransitionError> {
        let earlier = match self.fabric.try_read(key).await? {
            Some(record) => match &record.outbox {
                Some(blob) => self.decode::<Outbox>("outbox", blob.clone())?.answers(message),
                None => false,
            },
            None => false,
        };
        if earlier {
            tracing::debug!(key = %key, "Record already written by an earlier attempt");
            Ok(())
        } else {
            Err(TransitionError::ConcurrentTransition { key: key.clone() })
        }
    }

    /// Like `write_record`, but a roaming routine's duplicate completion
    /// finds the record already there and keeps it.
    async fn write_final(
        &self,
        record: RoutineRecord,
        etag: Option<ETag>,
    ) -> Result<(), TransitionError> {
        if let Some(expected) = etag {
            let key = record.key.clone();
            let tag = self.fabric.replace_if_match(record, &expected).await?;
            tracing::debug!(key = %key, etag = %tag, "Result written");
            return Ok(());
        }
        let key = record.key.clone();
        match self.fabric.create_if_absent(record).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                tracing::debug!(key = %key, "Result already stored, duplicate tolerated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dispatch_call(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        call: ExecuteRoutineIntent,
    ) -> Result<(), TransitionError> {
        let direct = self.options.is_direct(&call.target.service);
        let outbound = TransitionMessage {
            kind: TransitionKind::Invoke,
            target: call.target,
            routine_id: call.routine_id,
            intent_id: call.intent_id,
            dispatch_id: Some(routine.intent_id),
            input: call.input,
            delivery: None,
            roamed: None,
            caller: CallerInfo {
                caller: Some(CallerDescriptor {
                    method: routine.method.clone(),
                    routine_id: routine.routine_id.clone(),
                    intent_id: routine.intent_id,
                }),
                continuations: call.continuation.into_iter().collect(),
            },
            flow_context: message.flow_context.clone(),
            origin: if direct {
                MessageOrigin::Direct
            } else {
                MessageOrigin::Call
            },
            pollable: !direct,
            attempt: 0,
        };

        tracing::debug!(
            from = %routine.method,
            target = %outbound.target,
            routine_id = %outbound.routine_id,
            direct,
            "Dispatching call"
        );
        if direct {
            self.dispatch_direct(outbound).await
        } else {
            Ok(self.fabric.enqueue(outbound, None).await?)
        }
    }

    /// Serve a call on the current stack as a nested transition.
    async fn dispatch_direct(&self, outbound: TransitionMessage) -> Result<(), TransitionError> {
        let key = outbound.key();
        match self.run(outbound.clone()).await {
            TransitionOutcome::Complete(result) => {
                self.hub.deliver_reply(&key, &result);
            }
            TransitionOutcome::Paused => {}
            TransitionOutcome::Retry => {
                tracing::warn!(key = %key, "Direct call lost a race, falling back to the queue");
                let mut queued = outbound;
                queued.origin = MessageOrigin::Call;
                queued.pollable = true;
                self.fabric.enqueue(queued, None).await?;
            }
            TransitionOutcome::Fatal(e) => {
                self.fabric.dead_letter(outbound, e.to_string()).await?;
            }
        }
        Ok(())
    }

    async fn deliver(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        continuation: &ContinuationDescriptor,
        result: RoutineResult,
        origin: MessageOrigin,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<(), TransitionError> {
        let mut resume = TransitionMessage::resume(continuation, result)
            .with_origin(origin)
            .with_flow_context(message.flow_context.clone());
        resume.dispatch_id = Some(routine.intent_id);

        tracing::debug!(
            target = %continuation.target,
            routine_id = %continuation.routine_id,
            task_id = %continuation.task_id,
            origin = ?origin,
            "Delivering result"
        );
        Ok(self.fabric.enqueue(resume, visible_at).await?)
    }

    async fn raise(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        event: RaiseEventIntent,
    ) -> Result<(), TransitionError> {
        self.fabric
            .publish_event(PublishedEvent {
                topic: event.topic.clone(),
                payload: event.payload.clone(),
            })
            .await?;

        for handler in self.options.handlers_for(&event.topic) {
            let intent_id = event.intent_id.derive(&handler.to_string());
            let mut invocation = TransitionMessage::invoke(handler.clone(), event.payload.clone())
                .with_origin(MessageOrigin::Event)
                .with_flow_context(message.flow_context.clone());
            invocation.intent_id = intent_id;
            invocation.routine_id = RoutineId::from(&intent_id);
            invocation.dispatch_id = Some(routine.intent_id);
            invocation.pollable = false;

            tracing::debug!(topic = %event.topic, handler = %handler, "Fanning out event");
            self.fabric.enqueue(invocation, None).await?;
        }
        Ok(())
    }

    async fn register_trigger(
        &self,
        routine: &RoutineDescriptor,
        trigger: &TriggerId,
    ) -> Result<(), TransitionError> {
        let record = RoutineRecord::new(
            trigger_key(trigger),
            routine.intent_id,
            RoutineStatus::Scheduled,
        );
        match self.fabric.create_if_absent(record).await {
            Ok(_) => {
                tracing::debug!(trigger = %trigger, "Trigger registered");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn subscribe_trigger(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        subscribe: SubscribeTriggerIntent,
    ) -> Result<(), TransitionError> {
        let Some(continuation) = subscribe.continuation else {
            tracing::debug!(trigger = %subscribe.trigger, "Unawaited subscription dropped");
            return Ok(());
        };
        let key = trigger_key(&subscribe.trigger);

        for _ in 0..TRIGGER_WRITE_ATTEMPTS {
            match self.fabric.try_read(&key).await? {
                None => {
                    let mut record = RoutineRecord::new(
                        key.clone(),
                        routine.intent_id,
                        RoutineStatus::Scheduled,
                    );
                    record.continuation =
                        Some(self.encode("subscribers", &vec![continuation.clone()])?);
                    match self.fabric.create_if_absent(record).await {
                        Ok(_) => return Ok(()),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(record) if record.is_complete() => {
                    let result = self.stored_result(&record)?;
                    tracing::debug!(trigger = %subscribe.trigger, "Trigger already active");
                    return self
                        .deliver(
                            routine,
                            message,
                            &continuation,
                            result,
                            MessageOrigin::Resume,
                            None,
                        )
                        .await;
                }
                Some(mut record) => {
                    let mut subscribers = self.subscribers(&record)?;
                    if subscribers.iter().any(|s| {
                        s.intent_id == continuation.intent_id && s.task_id == continuation.task_id
                    }) {
                        return Ok(());
                    }
                    subscribers.push(continuation.clone());
                    record.continuation = Some(self.encode("subscribers", &subscribers)?);
                    let expected = record.etag.clone().ok_or_else(|| self.untagged(&key))?;
                    match self.fabric.replace_if_match(record, &expected).await {
                        Ok(_) => return Ok(()),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Err(TransitionError::ConcurrentTransition { key })
    }

    /// Complete a trigger and resume every subscriber. The first activation wins.
    async fn activate_trigger(
        &self,
        routine: &RoutineDescriptor,
        message: &TransitionMessage,
        activate: ActivateTriggerIntent,
    ) -> Result<(), TransitionError> {
        let key = trigger_key(&activate.trigger);
        let blob = self.encode("result", &activate.result)?;

        for _ in 0..TRIGGER_WRITE_ATTEMPTS {
            let subscribers = match self.fabric.try_read(&key).await? {
                None => {
                    let mut record =
                        RoutineRecord::new(key.clone(), routine.intent_id, RoutineStatus::Complete);
                    record.result = Some(blob.clone());
                    match self.fabric.create_if_absent(record).await {
                        Ok(_) => Vec::new(),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(record) if record.is_complete() => {
                    tracing::debug!(trigger = %activate.trigger, "Trigger already activated");
                    return Ok(());
                }
                Some(mut record) => {
                    let subscribers = self.subscribers(&record)?;
                    let expected = record.etag.clone().ok_or_else(|| self.untagged(&key))?;
                    record.status = RoutineStatus::Complete;
                    record.result = Some(blob.clone());
                    match self.fabric.replace_if_match(record, &expected).await {
                        Ok(_) => subscribers,
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            tracing::debug!(
                trigger = %activate.trigger,
                subscribers = subscribers.len(),
                "Trigger activated"
            );
            for subscriber in subscribers {
                self.deliver(
                    routine,
                    message,
                    &subscriber,
                    activate.result.clone(),
                    MessageOrigin::Resume,
                    None,
                )
                .await?;
            }
            return Ok(());
        }
        Err(TransitionError::ConcurrentTransition { key })
    }

    fn subscribers(
        &self,
        record: &RoutineRecord,
    ) -> Result<Vec<ContinuationDescriptor>, TransitionError> {
        match &record.continuation {
            Some(blob) => self.decode("subscribers", blob.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn untagged(&self, key: &RoutineKey) -> TransitionError {
        TransitionError::InvalidState {
            key: key.clone(),
            reason: "record read without a tag".to_string(),
        }
    }
}

/// Put the encoded state on every continuation that leads back here.
fn roam(dispatches: &mut Dispatches, blob: &Bytes) {
    for call in &mut dispatches.calls {
        if let Some(continuation) = call.continuation.as_mut() {
            continuation.roamed = Some(blob.clone());
        }
    }
    for (continuation, _, origin) in &mut dispatches.deliveries {
        if *origin == MessageOrigin::Resume {
            continuation.roamed = Some(blob.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routine_core::IntentId;

    #[test]
    fn result_save_skipped_only_for_direct_and_event() {
        let mut message = TransitionMessage::invoke(
            routine_core::MethodId::new("Orders", "PlaceOrder"),
            Bytes::new(),
        );
        assert!(!skips_result_save(&message));

        message.origin = MessageOrigin::Direct;
        message.pollable = false;
        assert!(skips_result_save(&message));
        message.pollable = true;
        assert!(!skips_result_save(&message));

        message.origin = MessageOrigin::Event;
        assert!(skips_result_save(&message));
    }

    #[test]
    fn triggers_live_in_their_own_partition() {
        let trigger = TriggerId::new(IntentId::new().to_string());
        let key = trigger_key(&trigger);
        assert_eq!(key.service.as_str(), TRIGGER_PARTITION);
        assert_eq!(key.routine_id.as_str(), trigger.as_str());
    }
}
