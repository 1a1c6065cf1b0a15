//! Entry points for code outside the engine.

use crate::error::TransitionError;
use crate::hub::{CompletionHub, ReplySource, ResultSource, StoreSource};
use crate::options::{EngineOptions, HubOptions, WorkerOptions};
use crate::runner::{TransitionOutcome, TransitionRunner};
use crate::worker::TransitionWorker;
use bytes::Bytes;
use routine_core::codec::StateCodec;
use routine_core::{MethodId, RoutineKey, RoutineResolver, RoutineResult, TransitionMessage};
use routine_fabric::Fabric;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A fabric, a codec and a set of routines wired together.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::new(InMemoryFabric::new(), JsonCodec, registry, EngineOptions::default());
/// let worker = engine.worker(WorkerOptions::default());
/// tokio::spawn(worker.start(cancel.clone()));
///
/// let result = engine
///     .invoke_and_wait(MethodId::new("Orders", "PlaceOrder"), input, &cancel)
///     .await?;
/// ```
pub struct Engine<F, C> {
    runner: TransitionRunner<F, C>,
}

impl<F, C> Clone for Engine<F, C> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
        }
    }
}

impl<F, C> Engine<F, C>
where
    F: Fabric,
    C: StateCodec,
{
    pub fn new<R>(fabric: F, codec: C, resolver: R, options: EngineOptions) -> Self
    where
        R: RoutineResolver + 'static,
    {
        Self::with_hub_options(fabric, codec, resolver, options, HubOptions::default())
    }

    /// Like `new`, with a custom poll schedule for the completion hub.
    pub fn with_hub_options<R>(
        fabric: F,
        codec: C,
        resolver: R,
        options: EngineOptions,
        hub_options: HubOptions,
    ) -> Self
    where
        R: RoutineResolver + 'static,
    {
        let fabric = Arc::new(fabric);
        let codec = Arc::new(codec);
        let store = fabric.supports_persistence().then(|| {
            Arc::new(StoreSource::new(Arc::clone(&fabric), Arc::clone(&codec)))
                as Arc<dyn ResultSource>
        });
        let reply_capacity = hub_options.reply_capacity;
        let mut hub = match store.clone() {
            Some(store) => CompletionHub::with_store(hub_options, store),
            None => CompletionHub::new(hub_options),
        };
        // Direct services answer from the replies their callers received.
        if !options.direct_services.is_empty() {
            let replies = Arc::new(ReplySource::new(reply_capacity, store));
            hub = hub.with_direct_replies(options.direct_services.iter().cloned(), replies);
        }
        Self {
            runner: TransitionRunner::new(fabric, codec, Arc::new(resolver), hub, options),
        }
    }

    /// Build around an existing runner.
    pub fn from_runner(runner: TransitionRunner<F, C>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &TransitionRunner<F, C> {
        &self.runner
    }

    pub fn fabric(&self) -> &Arc<F> {
        self.runner.fabric()
    }

    pub fn hub(&self) -> &CompletionHub {
        self.runner.hub()
    }

    pub fn worker(&self, options: WorkerOptions) -> TransitionWorker<F, C> {
        TransitionWorker::new(self.runner.clone(), options)
    }

    /// Queue an external invocation of `target`. Returns the routine's key.
    pub async fn invoke(
        &self,
        target: MethodId,
        input: Bytes,
    ) -> Result<RoutineKey, TransitionError> {
        self.submit(TransitionMessage::invoke(target, input)).await
    }

    /// Queue a prepared message, e.g. one with a chosen routine id.
    pub async fn submit(&self, message: TransitionMessage) -> Result<RoutineKey, TransitionError> {
        let key = message.key();
        tracing::debug!(key = %key, method = %message.target, "Invocation submitted");
        self.fabric().enqueue(message, None).await?;
        Ok(key)
    }

    /// Queue an invocation and wait for its result through the completion hub.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::SubscriptionClosed` if `cancel` fires first.
    pub async fn invoke_and_wait(
        &self,
        target: MethodId,
        input: Bytes,
        cancel: &CancellationToken,
    ) -> Result<RoutineResult, TransitionError> {
        self.submit_and_wait(TransitionMessage::invoke(target, input), cancel)
            .await
    }

    pub async fn submit_and_wait(
        &self,
        message: TransitionMessage,
        cancel: &CancellationToken,
    ) -> Result<RoutineResult, TransitionError> {
        let (token, receiver) = self.hub().subscribe_channel(message.key(), cancel);
        if let Err(e) = self.submit(message).await {
            self.hub().unsubscribe(token);
            return Err(e);
        }
        receiver.await.map_err(|_| TransitionError::SubscriptionClosed)
    }

    /// Look the result of `key` up once.
    pub async fn poll(&self, key: &RoutineKey) -> Result<Option<RoutineResult>, TransitionError> {
        self.hub().poll_once(key).await
    }

    /// Run one transition on the current task, bypassing the queue.
    pub async fn run(&self, message: TransitionMessage) -> TransitionOutcome {
        self.runner.run(message).await
    }
}
