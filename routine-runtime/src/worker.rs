//! Pooled worker that pulls transition messages off the fabric's queue.
//!
//! Many workers may poll the same fabric. Nothing is claimed: two workers
//! that race on the same routine are serialized by the record's tag, and the
//! loser gets a `Retry` outcome which puts the message back on the queue.

use crate::error::TransitionError;
use crate::options::WorkerOptions;
use crate::runner::{TransitionOutcome, TransitionRunner};
use chrono::Utc;
use routine_core::TransitionMessage;
use routine_core::codec::StateCodec;
use routine_fabric::Fabric;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A worker that runs transitions for every message it dequeues.
///
/// # Example
///
/// ```rust,ignore
/// use routine_runtime::{TransitionWorker, WorkerOptions};
///
/// let worker = TransitionWorker::new(runner, WorkerOptions::default().with_worker_id("worker-1"));
///
/// // Poll until cancelled
/// worker.start(cancel).await?;
/// ```
pub struct TransitionWorker<F, C> {
    runner: TransitionRunner<F, C>,
    options: WorkerOptions,
}

impl<F, C> Clone for TransitionWorker<F, C> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            options: self.options.clone(),
        }
    }
}

impl<F, C> TransitionWorker<F, C>
where
    F: Fabric,
    C: StateCodec,
{
    pub fn new(runner: TransitionRunner<F, C>, options: WorkerOptions) -> Self {
        Self { runner, options }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Run one message and act on its outcome.
    ///
    /// `Retry` puts the message back with a backoff until `max_attempts` is
    /// reached; `Fatal` and exhausted retries are dead-lettered.
    pub async fn process(
        &self,
        message: TransitionMessage,
    ) -> Result<TransitionOutcome, TransitionError> {
        let outcome = self.runner.run(message.clone()).await;
        let fabric = self.runner.fabric();

        match &outcome {
            TransitionOutcome::Complete(_) | TransitionOutcome::Paused => {}
            TransitionOutcome::Retry => {
                let attempt = message.attempt + 1;
                if attempt >= self.options.max_attempts {
                    tracing::error!(
                        worker_id = %self.options.worker_id,
                        key = %message.key(),
                        attempts = attempt,
                        "Retries exhausted"
                    );
                    fabric
                        .dead_letter(message, format!("retries exhausted after {attempt} attempts"))
                        .await?;
                } else {
                    let backoff = self.options.retry_backoff * attempt;
                    let visible_at = chrono::Duration::from_std(backoff)
                        .ok()
                        .filter(|delay| !delay.is_zero())
                        .map(|delay| Utc::now() + delay);
                    tracing::debug!(
                        worker_id = %self.options.worker_id,
                        key = %message.key(),
                        attempt,
                        backoff = ?backoff,
                        "Message re-enqueued"
                    );
                    let mut retry = message;
                    retry.attempt = attempt;
                    fabric.enqueue(retry, visible_at).await?;
                }
            }
            TransitionOutcome::Fatal(e) => {
                fabric.dead_letter(message, e.to_string()).await?;
            }
        }
        Ok(outcome)
    }

    /// Process messages one at a time until no visible message is left.
    /// Returns the number of messages processed.
    pub async fn run_until_idle(&self) -> Result<usize, TransitionError> {
        let mut processed = 0;
        loop {
            let batch = self
                .runner
                .fabric()
                .dequeue(self.options.batch_size.get())
                .await?;
            if batch.is_empty() {
                return Ok(processed);
            }
            for message in batch {
                self.process(message).await?;
                processed += 1;
            }
        }
    }

    /// Poll for messages and process them until `cancel` fires.
    ///
    /// Processing is gated by a semaphore sized by `max_concurrency`.
    pub async fn start(self, cancel: CancellationToken) -> Result<(), TransitionError> {
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.get()));
        let worker = Arc::new(self);
        let mut interval = time::interval(worker.options.poll_interval);

        tracing::info!(worker_id = %worker.options.worker_id, "Worker started");
        loop {
            // Wait for available capacity
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let batch = worker
                .runner
                .fabric()
                .dequeue(worker.options.batch_size.get())
                .await?;

            if batch.is_empty() {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => continue,
                }
            }

            // The first message uses the permit already held.
            let mut permit = Some(permit);
            for message in batch {
                let permit = match permit.take() {
                    Some(permit) => permit,
                    None => match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until the transition completes
                    let key = message.key();
                    if let Err(e) = worker.process(message).await {
                        tracing::error!(
                            worker_id = %worker.options.worker_id,
                            key = %key,
                            error = %e,
                            "Failed to settle message"
                        );
                    }
                });
            }
        }

        tracing::info!(worker_id = %worker.options.worker_id, "Worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::options::EngineOptions;
    use crate::serialization::JsonCodec;
    use bytes::Bytes;
    use routine_core::{IntentId, MethodId, RoutineId, RoutineRegistry, StatePolicy, Turn};
    use routine_fabric::{InMemoryFabric, RoutineRecord, RoutineStatus};
    use std::time::Duration;

    fn echo_engine() -> Engine<InMemoryFabric, JsonCodec> {
        let registry = RoutineRegistry::builder()
            .register_fn(MethodId::new("Echo", "Say"), |state, _cx| async move {
                let input = state.input.clone();
                Ok(Turn::ready(state, input))
            })
            .build();
        Engine::new(
            InMemoryFabric::new(),
            JsonCodec,
            registry,
            EngineOptions::default().with_state_policy(StatePolicy::Persisted),
        )
    }

    /// An invoke whose record is already held by another intent.
    async fn contended_invoke(engine: &Engine<InMemoryFabric, JsonCodec>) -> TransitionMessage {
        let message = TransitionMessage::invoke(MethodId::new("Echo", "Say"), Bytes::from("hi"))
            .with_routine_id(RoutineId::new("echo-1"));
        engine
            .fabric()
            .create_if_absent(RoutineRecord::new(
                message.key(),
                IntentId::new(),
                RoutineStatus::Scheduled,
            ))
            .await
            .unwrap();
        message
    }

    #[tokio::test]
    async fn test_retry_is_requeued_with_backoff() {
        let engine = echo_engine();
        let worker = engine.worker(WorkerOptions::default());
        let message = contended_invoke(&engine).await;

        let outcome = worker.process(message).await.unwrap();
        assert!(matches!(outcome, TransitionOutcome::Retry));

        let queued = engine.fabric().queued_messages();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempt, 1);
        // Not visible before the backoff elapses.
        assert!(engine.fabric().dequeue(10).await.unwrap().is_empty());
        assert!(engine.fabric().dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dead_lettered() {
        let engine = echo_engine();
        let worker = engine.worker(WorkerOptions::default().with_max_attempts(1));
        let message = contended_invoke(&engine).await;

        worker.process(message).await.unwrap();

        assert_eq!(engine.fabric().queued(), 0);
        let letters = engine.fabric().dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].1.contains("retries exhausted"));
    }

    #[tokio::test]
    async fn test_fatal_is_dead_lettered() {
        let engine = echo_engine();
        let worker = engine.worker(WorkerOptions::default());
        let message = TransitionMessage::invoke(MethodId::new("Nobody", "Home"), Bytes::new());

        let outcome = worker.process(message).await.unwrap();

        assert!(matches!(
            outcome,
            TransitionOutcome::Fatal(TransitionError::UnknownTarget(_))
        ));
        assert_eq!(engine.fabric().dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_idle_drains_queue() {
        let engine = echo_engine();
        for n in 0..3 {
            engine
                .invoke(MethodId::new("Echo", "Say"), Bytes::from(format!("msg-{n}")))
                .await
                .unwrap();
        }

        let processed = engine
            .worker(WorkerOptions::default())
            .run_until_idle()
            .await
            .unwrap();

        assert_eq!(processed, 3);
        assert_eq!(engine.fabric().queued(), 0);
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let engine = echo_engine();
        let cancel = CancellationToken::new();
        let options = WorkerOptions::default().with_poll_interval(Duration::from_millis(5));
        let handle = tokio::spawn(engine.worker(options).start(cancel.clone()));

        let key = engine
            .invoke(MethodId::new("Echo", "Say"), Bytes::from("bg"))
            .await
            .unwrap();
        let mut result = None;
        for _ in 0..200 {
            result = engine.poll(&key).await.unwrap();
            if result.is_some() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(result, Some(routine_core::RoutineResult::Value(Bytes::from("bg"))));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
