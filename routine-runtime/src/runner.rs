//! The transition runner: one inbound message, one turn, one commit.
//!
//! `run` resolves the target routine, seeds (`Invoke`) or restores
//! (`Continue`) its state, executes exactly one turn inside a transition
//! scope, lets the monitor classify the result and commits the scheduled
//! actions. Every failure is folded into a [`TransitionOutcome`].
//!
//! The scope opens once the state is loaded and covers the turn and its
//! commit. Its monitor starts from the loaded record's tag and the state's
//! task counter, neither of which exists before. Resolving and loading read
//! nothing from the ambient context, so nothing is lost by running them
//! outside it.

use crate::error::TransitionError;
use crate::hub::CompletionHub;
use crate::monitor::{IntrinsicFlow, JoinFlow, TransitionMonitor, TurnResult};
use crate::options::EngineOptions;
use crate::scope;
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use routine_core::codec::{StateCodec, sealed};
use routine_core::intent::{ContinuationIntent, Intent, ScheduledActions};
use routine_core::task::UntypedRoutine;
use routine_core::{
    CallerInfo, ETag, Fault, RoutineResolver, RoutineResult, RoutineState, StateEnvelope,
    StatePolicy, TransitionKind, TransitionMessage, TriggerId, Turn, TurnContext, TurnPoll,
};
use routine_fabric::{Fabric, RoutineRecord, RoutineStatus};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// How one transition ended.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The routine finished, now or in an earlier transition.
    Complete(RoutineResult),
    /// The routine suspended and will be resumed by a later message.
    Paused,
    /// Another writer raced this one; reprocess the original message.
    Retry,
    /// The message cannot be processed.
    Fatal(TransitionError),
}

impl TransitionOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, TransitionOutcome::Complete(_))
    }
}

/// State a turn starts from.
pub(crate) struct Loaded {
    pub state: RoutineState,
    pub caller: CallerInfo,
    /// Tag of the record the state was read from or created in.
    pub etag: Option<ETag>,
}

enum Start {
    Run(Loaded),
    /// Nothing to run; the record already answers the message.
    Done(TransitionOutcome),
}

/// Drives routines through transitions against a fabric.
pub struct TransitionRunner<F, C> {
    pub(crate) fabric: Arc<F>,
    pub(crate) codec: Arc<C>,
    pub(crate) resolver: Arc<dyn RoutineResolver>,
    pub(crate) hub: CompletionHub,
    pub(crate) options: Arc<EngineOptions>,
    pub(crate) flow: Arc<dyn IntrinsicFlow>,
}

impl<F, C> Clone for TransitionRunner<F, C> {
    fn clone(&self) -> Self {
        Self {
            fabric: Arc::clone(&self.fabric),
            codec: Arc::clone(&self.codec),
            resolver: Arc::clone(&self.resolver),
            hub: self.hub.clone(),
            options: Arc::clone(&self.options),
            flow: Arc::clone(&self.flow),
        }
    }
}

impl<F, C> TransitionRunner<F, C>
where
    F: Fabric,
    C: StateCodec,
{
    pub fn new(
        fabric: Arc<F>,
        codec: Arc<C>,
        resolver: Arc<dyn RoutineResolver>,
        hub: CompletionHub,
        options: EngineOptions,
    ) -> Self {
        Self {
            fabric,
            codec,
            resolver,
            hub,
            options: Arc::new(options),
            flow: Arc::new(JoinFlow),
        }
    }

    /// Replace the fan-in classification policy.
    #[must_use]
    pub fn with_flow(mut self, flow: Arc<dyn IntrinsicFlow>) -> Self {
        self.flow = flow;
        self
    }

    pub fn fabric(&self) -> &Arc<F> {
        &self.fabric
    }

    pub fn hub(&self) -> &CompletionHub {
        &self.hub
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Process one message. Never panics and never returns an error:
    /// failures become `Retry` or `Fatal`.
    pub fn run(&self, message: TransitionMessage) -> BoxFuture<'_, TransitionOutcome> {
        Box::pin(async move {
            let key = message.key();
            match self.transition(message).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(key = %key, error = %e, "Transition interrupted, retrying");
                    TransitionOutcome::Retry
                }
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Transition failed");
                    TransitionOutcome::Fatal(e)
                }
            }
        })
    }

    async fn transition(
        &self,
        message: TransitionMessage,
    ) -> Result<TransitionOutcome, TransitionError> {
        let (routine, method_options) = self
            .resolver
            .resolve(&message.target)
            .ok_or_else(|| TransitionError::UnknownTarget(message.target.clone()))?;

        let policy = method_options.resolve_policy(self.options.state_policy);
        let persisted = policy == StatePolicy::Persisted;
        if persisted && !self.fabric.supports_persistence() {
            return Err(TransitionError::MissingPersistence(message.target.clone()));
        }

        tracing::debug!(
            kind = ?message.kind,
            method = %message.target,
            routine_id = %message.routine_id,
            origin = ?message.origin,
            attempt = message.attempt,
            "Transition started"
        );

        let start = match message.kind {
            TransitionKind::Invoke => self.seed(&message, persisted).await?,
            TransitionKind::Continue => self.restore(&message).await?,
        };
        let Loaded {
            state,
            caller,
            etag,
        } = match start {
            Start::Run(loaded) => loaded,
            Start::Done(outcome) => return Ok(outcome),
        };

        // The scope's monitor needs the loaded tag and task counter.
        let mut descriptor = message.descriptor();
        descriptor.etag = etag.clone();
        let monitor = Arc::new(TransitionMonitor::start(
            descriptor,
            caller,
            message.flow_context.clone(),
            state.next_task(),
        ));
        let context = TurnContext::new(monitor.clone());
        // State read back from the store keeps going to the store.
        let persisted = persisted || etag.is_some();

        scope::in_scope(Arc::clone(&monitor), async {
            let result = execute_turn(routine, state, context).await;
            let mut actions = monitor.track_completion(result, persisted, self.flow.as_ref())?;

            let outcome = match actions.save_state.result.clone() {
                Some(result) => {
                    for continuation in &monitor.caller_info().continuations {
                        actions.push(Intent::Continuation(ContinuationIntent {
                            continuation: continuation.clone(),
                            result: result.clone(),
                        }));
                    }
                    if !result.is_fault() {
                        register_triggers(&mut actions, &monitor.created_triggers());
                    }
                    TransitionOutcome::Complete(result)
                }
                None => {
                    register_triggers(&mut actions, &monitor.created_triggers());
                    TransitionOutcome::Paused
                }
            };

            self.commit(&message, &monitor, actions, persisted, etag)
                .await?;
            Ok::<_, TransitionError>(outcome)
        })
        .await
    }

    /// Fresh state for an `Invoke`. With persisted state the record is created
    /// exclusively first; losing that race applies the duplicate policy.
    async fn seed(
        &self,
        message: &TransitionMessage,
        persisted: bool,
    ) -> Result<Start, TransitionError> {
        let state = RoutineState::seeded(message.input.clone());
        let caller = message.caller.clone();
        if !persisted {
            return Ok(Start::Run(Loaded {
                state,
                caller,
                etag: None,
            }));
        }

        let record = RoutineRecord::new(message.key(), message.intent_id, RoutineStatus::Scheduled)
            .with_caller(caller.clone());
        match self.fabric.create_if_absent(record).await {
            Ok(etag) => {
                tracing::debug!(key = %message.key(), etag = %etag, "Record created");
                Ok(Start::Run(Loaded {
                    state,
                    caller,
                    etag: Some(etag),
                }))
            }
            Err(e) if e.is_conflict() => self.duplicate_invoke(message, state, caller).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn duplicate_invoke(
        &self,
        message: &TransitionMessage,
        state: RoutineState,
        caller: CallerInfo,
    ) -> Result<Start, TransitionError> {
        let key = message.key();
        let Some(record) = self.fabric.try_read(&key).await? else {
            return Err(TransitionError::ConcurrentTransition { key });
        };

        match record.status {
            // Our own earlier attempt created it and never got further.
            RoutineStatus::Scheduled if record.intent_id == message.intent_id => {
                Ok(Start::Run(Loaded {
                    state,
                    caller,
                    etag: record.etag,
                }))
            }
            RoutineStatus::Scheduled => Err(TransitionError::ConcurrentTransition { key }),
            RoutineStatus::Awaiting => {
                if !self.replay_outbox(message, &record).await? {
                    tracing::debug!(key = %key, "Duplicate invoke of a suspended routine ignored");
                }
                Ok(Start::Done(TransitionOutcome::Paused))
            }
            RoutineStatus::Complete => {
                if !self.replay_outbox(message, &record).await? {
                    tracing::debug!(key = %key, "Duplicate invoke of a completed routine ignored");
                }
                let result = self.stored_result(&record)?;
                Ok(Start::Done(TransitionOutcome::Complete(result)))
            }
        }
    }

    /// Saved state for a `Continue`, with the delivered result injected.
    async fn restore(&self, message: &TransitionMessage) -> Result<Start, TransitionError> {
        let key = message.key();
        let delivery = message
            .delivery
            .as_ref()
            .ok_or_else(|| TransitionError::InvalidState {
                key: key.clone(),
                reason: "continue without a delivered result".to_string(),
            })?;

        let (envelope, etag) = match &message.roamed {
            Some(blob) => (self.decode_envelope(blob.clone())?, None),
            None => {
                if !self.fabric.supports_persistence() {
                    return Err(TransitionError::MissingPersistence(message.target.clone()));
                }
                let record = self.fabric.try_read(&key).await?.ok_or_else(|| {
                    TransitionError::InvalidState {
                        key: key.clone(),
                        reason: "record is missing".to_string(),
                    }
                })?;
                let replayed = self.replay_outbox(message, &record).await?;
                if record.is_complete() {
                    if !replayed {
                        tracing::debug!(key = %key, "Delivery to a completed routine ignored");
                    }
                    let result = self.stored_result(&record)?;
                    return Ok(Start::Done(TransitionOutcome::Complete(result)));
                }
                // This delivery already ran its turn; only its dispatches were lost.
                if replayed {
                    return Ok(Start::Done(TransitionOutcome::Paused));
                }
                let blob = record
                    .state
                    .clone()
                    .ok_or_else(|| TransitionError::InvalidState {
                        key: key.clone(),
                        reason: format!("record is {:?} without saved state", record.status),
                    })?;
                (self.decode_envelope(blob)?, record.etag)
            }
        };

        let StateEnvelope { mut state, caller } = envelope;
        state
            .resolve(delivery.task_id, delivery.result.clone())
            .map_err(|source| TransitionError::PlaceholderMismatch {
                key,
                task_id: delivery.task_id,
                source,
            })?;

        Ok(Start::Run(Loaded {
            state,
            caller,
            etag,
        }))
    }

    pub(crate) fn encode<T>(&self, context: &str, value: &T) -> Result<Bytes, TransitionError>
    where
        C: sealed::EncodeValue<T>,
    {
        self.codec
            .encode(value)
            .map_err(|e| TransitionError::codec(context, e))
    }

    pub(crate) fn decode<T>(&self, context: &str, bytes: Bytes) -> Result<T, TransitionError>
    where
        C: sealed::DecodeValue<T>,
    {
        self.codec
            .decode(bytes)
            .map_err(|e| TransitionError::codec(context, e))
    }

    fn decode_envelope(&self, blob: Bytes) -> Result<StateEnvelope, TransitionError> {
        self.decode("state envelope", blob)
    }

    pub(crate) fn stored_result(
        &self,
        record: &RoutineRecord,
    ) -> Result<RoutineResult, TransitionError> {
        let blob = record
            .result
            .clone()
            .ok_or_else(|| TransitionError::InvalidState {
                key: record.key.clone(),
                reason: "complete record without a result".to_string(),
            })?;
        self.decode("stored result", blob)
    }
}

/// Run one turn, turning errors and panics into faults.
async fn execute_turn(
    routine: UntypedRoutine,
    state: RoutineState,
    context: TurnContext,
) -> TurnResult {
    let turn = AssertUnwindSafe(async move { routine.turn(state, context).await })
        .catch_unwind()
        .await;

    match turn {
        Ok(Ok(Turn {
            poll: TurnPoll::Ready(value),
            ..
        })) => TurnResult::Finished(RoutineResult::Value(value)),
        Ok(Ok(Turn {
            state,
            poll: TurnPoll::Pending(awaiting),
        })) => TurnResult::Suspended { state, awaiting },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Turn returned an error");
            TurnResult::Finished(RoutineResult::Fault(Fault::from(e)))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::warn!(panic = %message, "Turn panicked");
            TurnResult::Finished(RoutineResult::Fault(Fault::new(format!(
                "turn panicked: {message}"
            ))))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Add a register intent for every trigger created this turn or embedded in
/// one of its intents that is not registered yet.
fn register_triggers(actions: &mut ScheduledActions, created: &[TriggerId]) {
    let mut referenced: Vec<TriggerId> = created.to_vec();
    for intent in &actions.intents {
        for trigger in intent.triggers() {
            if !referenced.contains(trigger) {
                referenced.push(trigger.clone());
            }
        }
    }
    for trigger in referenced {
        if !actions.registers(&trigger) {
            actions.push(Intent::RegisterTrigger(trigger));
        }
    }
}
