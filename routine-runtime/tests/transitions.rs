//! End-to-end transitions against the in-memory fabric.

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use routine_core::{
    ContinuationDescriptor, ETag, MessageOrigin, MethodId, MethodOptions, RoutineId, RoutineKey,
    RoutineRegistry, RoutineResult, RoutineState, ServiceId, StatePolicy, TaskId,
    TransitionKind, TransitionMessage, TriggerId, Turn, TurnContext,
};
use routine_fabric::{
    Fabric, FabricError, InMemoryFabric, PublishedEvent, RoutineRecord, RoutineStatus,
};
use routine_runtime::{
    Engine, EngineOptions, JsonCodec, TransitionError, TransitionOutcome, WorkerOptions, scope,
    trigger_key,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type TestEngine = Engine<InMemoryFabric, JsonCodec>;

fn place_order() -> MethodId {
    MethodId::new("Orders", "PlaceOrder")
}

fn reserve() -> MethodId {
    MethodId::new("Inventory", "Reserve")
}

/// Calls `Inventory.Reserve` and answers with the reservation.
async fn place_order_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    match state.step {
        0 => {
            let task = cx.call(reserve(), state.input.clone());
            state.put(&JsonCodec, "reserve", &task.get())?;
            state.step = 1;
            Ok(Turn::await_one(state, task))
        }
        _ => {
            let task = state
                .get::<_, u64>(&JsonCodec, "reserve")?
                .context("reserve task missing")?;
            let reserved = match state.take_result(TaskId::new(task)) {
                Some(RoutineResult::Value(bytes)) => bytes,
                other => bail!("reservation failed: {other:?}"),
            };
            let reply = format!("placed:{}", String::from_utf8_lossy(&reserved));
            Ok(Turn::ready(state, Bytes::from(reply)))
        }
    }
}

async fn reserve_turn(state: RoutineState, _cx: TurnContext) -> anyhow::Result<Turn> {
    let item = String::from_utf8(state.input.to_vec())?;
    Ok(Turn::ready(state, Bytes::from(format!("reserved-{item}"))))
}

async fn out_of_stock_turn(_state: RoutineState, _cx: TurnContext) -> anyhow::Result<Turn> {
    bail!("out of stock")
}

async fn panicking_turn(_state: RoutineState, _cx: TurnContext) -> anyhow::Result<Turn> {
    panic!("boom")
}

/// Fans out to two reservations and joins them.
async fn split_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    if state.step == 0 {
        let left = cx.call(reserve(), Bytes::from("left"));
        let right = cx.call(reserve(), Bytes::from("right"));
        state.put(&JsonCodec, "branches", &vec![left.get(), right.get()])?;
        state.step = 1;
        return Ok(Turn::await_all(state, vec![left, right]));
    }

    let branches: Vec<TaskId> = state
        .get::<_, Vec<u64>>(&JsonCodec, "branches")?
        .context("branches missing")?
        .into_iter()
        .map(TaskId::new)
        .collect();
    let pending: Vec<TaskId> = branches
        .iter()
        .copied()
        .filter(|task| state.is_pending(*task))
        .collect();
    if !pending.is_empty() {
        return Ok(Turn::await_all(state, pending));
    }

    let mut parts = Vec::new();
    for task in branches {
        match state.take_result(task) {
            Some(RoutineResult::Value(bytes)) => {
                parts.push(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => bail!("branch {task} failed: {other:?}"),
        }
    }
    Ok(Turn::ready(state, Bytes::from(parts.join(","))))
}

fn order_registry() -> RoutineRegistry {
    RoutineRegistry::builder()
        .register_fn(place_order(), place_order_turn)
        .register_fn(reserve(), reserve_turn)
        .build()
}

fn persisted() -> EngineOptions {
    EngineOptions::default().with_state_policy(StatePolicy::Persisted)
}

async fn drain(engine: &TestEngine) -> usize {
    engine
        .worker(WorkerOptions::default())
        .run_until_idle()
        .await
        .unwrap()
}

fn order_message(routine_id: &str) -> TransitionMessage {
    TransitionMessage::invoke(place_order(), Bytes::from("book"))
        .with_routine_id(RoutineId::new(routine_id))
}

fn placed() -> RoutineResult {
    RoutineResult::Value(Bytes::from("placed:reserved-book"))
}

#[tokio::test]
async fn test_persisted_call_round_trip() {
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(fabric.clone(), JsonCodec, order_registry(), persisted());
    let message = order_message("order-1");
    let key = message.key();

    let cancel = CancellationToken::new();
    let (_token, receiver) = engine.hub().subscribe_channel(key.clone(), &cancel);
    engine.submit(message.clone()).await.unwrap();

    assert_eq!(drain(&engine).await, 3);
    assert_eq!(receiver.await.unwrap(), placed());
    assert_eq!(
        fabric.status_history(&key),
        vec![
            RoutineStatus::Scheduled,
            RoutineStatus::Awaiting,
            RoutineStatus::Complete
        ]
    );

    // The callee's identity is derived from the caller's intent.
    let child = message.intent_id.derive("call/0");
    let child_key = RoutineKey::new(ServiceId::new("Inventory"), RoutineId::from(&child));
    assert_eq!(
        fabric.status_history(&child_key),
        vec![RoutineStatus::Scheduled, RoutineStatus::Complete]
    );
    let record = fabric.try_read(&child_key).await.unwrap().unwrap();
    let caller = record.caller.unwrap().caller.unwrap();
    assert_eq!(caller.routine_id, RoutineId::new("order-1"));
}

#[tokio::test]
async fn test_roaming_state_travels_with_the_call() {
    let fabric = InMemoryFabric::queue_only();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        order_registry(),
        EngineOptions::default(),
    );
    let message = order_message("order-roam");
    let cancel = CancellationToken::new();
    let (_token, receiver) = engine.hub().subscribe_channel(message.key(), &cancel);

    let outcome = engine.run(message).await;
    assert!(matches!(outcome, TransitionOutcome::Paused));

    let queued = fabric.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].target, reserve());
    assert_eq!(queued[0].dispatch_id, Some(queued[0].caller.caller.as_ref().unwrap().intent_id));
    let continuation = &queued[0].caller.continuations[0];
    assert!(continuation.roamed.is_some());

    assert_eq!(drain(&engine).await, 2);
    assert_eq!(receiver.await.unwrap(), placed());
    assert!(fabric.dead_letters().is_empty());
}

#[tokio::test]
async fn test_roaming_with_store_writes_only_the_result() {
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        order_registry(),
        EngineOptions::default(),
    );
    let key = engine.submit(order_message("order-2")).await.unwrap();

    drain(&engine).await;

    assert_eq!(fabric.status_history(&key), vec![RoutineStatus::Complete]);
    assert_eq!(engine.poll(&key).await.unwrap(), Some(placed()));
}

#[tokio::test]
async fn test_concurrent_invoke_loses_exclusive_create() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (started_in, release_in) = (Arc::clone(&started), Arc::clone(&release));
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Slow", "Work"), move |state, _cx| {
            let started = Arc::clone(&started_in);
            let release = Arc::clone(&release_in);
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<_, anyhow::Error>(Turn::ready(state, Bytes::from("done")))
            }
        })
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(fabric.clone(), JsonCodec, registry, persisted());

    let first = TransitionMessage::invoke(MethodId::new("Slow", "Work"), Bytes::new())
        .with_routine_id(RoutineId::new("shared"));
    let second = TransitionMessage::invoke(MethodId::new("Slow", "Work"), Bytes::new())
        .with_routine_id(RoutineId::new("shared"));
    let key = first.key();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(first).await })
    };
    started.notified().await;

    assert!(matches!(engine.run(second).await, TransitionOutcome::Retry));

    release.notify_one();
    let outcome = running.await.unwrap();
    assert!(
        outcome.is_complete(),
        "first invoke should complete, got {outcome:?}"
    );
    assert_eq!(
        fabric.status_history(&key),
        vec![RoutineStatus::Scheduled, RoutineStatus::Complete]
    );
}

#[tokio::test]
async fn test_duplicates_of_a_completed_routine_are_no_ops() {
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(fabric.clone(), JsonCodec, order_registry(), persisted());
    let message = order_message("order-3");
    let key = message.key();
    engine.submit(message.clone()).await.unwrap();
    drain(&engine).await;
    let history = fabric.status_history(&key);

    match engine.run(message.clone()).await {
        TransitionOutcome::Complete(result) => assert_eq!(result, placed()),
        other => panic!("unexpected outcome {other:?}"),
    }

    let late = ContinuationDescriptor {
        target: place_order(),
        routine_id: message.routine_id.clone(),
        intent_id: message.intent_id,
        task_id: TaskId::new(0),
        resume_at: None,
        roamed: None,
    };
    let resume = TransitionMessage::resume(&late, RoutineResult::Value(Bytes::from("late")));
    match engine.run(resume).await {
        TransitionOutcome::Complete(result) => assert_eq!(result, placed()),
        other => panic!("unexpected outcome {other:?}"),
    }

    assert_eq!(fabric.status_history(&key), history);
    assert_eq!(fabric.queued(), 0);
}

#[tokio::test]
async fn test_continue_without_record_is_fatal() {
    let engine = Engine::new(
        InMemoryFabric::new(),
        JsonCodec,
        order_registry(),
        persisted(),
    );
    let stray = ContinuationDescriptor {
        target: place_order(),
        routine_id: RoutineId::new("never-started"),
        intent_id: routine_core::IntentId::new(),
        task_id: TaskId::new(0),
        resume_at: None,
        roamed: None,
    };

    let outcome = engine
        .run(TransitionMessage::resume(&stray, RoutineResult::Cancelled))
        .await;

    assert!(matches!(
        outcome,
        TransitionOutcome::Fatal(TransitionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_fan_in_joins_every_branch() {
    let fabric = InMemoryFabric::new();
    let registry = RoutineRegistry::builder()
        .register_fn_with_options(
            MethodId::new("Orders", "Split"),
            split_turn,
            MethodOptions::default().fan_in(),
        )
        .register_fn(reserve(), reserve_turn)
        .build();
    let engine = Engine::new(fabric.clone(), JsonCodec, registry, EngineOptions::default());
    let key = engine
        .submit(
            TransitionMessage::invoke(MethodId::new("Orders", "Split"), Bytes::new())
                .with_routine_id(RoutineId::new("split-1")),
        )
        .await
        .unwrap();

    drain(&engine).await;

    assert_eq!(
        engine.poll(&key).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("reserved-left,reserved-right")))
    );
    assert_eq!(
        fabric.status_history(&key),
        vec![
            RoutineStatus::Scheduled,
            RoutineStatus::Awaiting,
            RoutineStatus::Awaiting,
            RoutineStatus::Complete
        ]
    );
}

#[tokio::test]
async fn test_fan_in_without_store_is_fatal() {
    let registry = RoutineRegistry::builder()
        .register_fn_with_options(
            MethodId::new("Orders", "Split"),
            split_turn,
            MethodOptions::default().fan_in(),
        )
        .build();
    let engine = Engine::new(
        InMemoryFabric::queue_only(),
        JsonCodec,
        registry,
        EngineOptions::default(),
    );

    let outcome = engine
        .run(TransitionMessage::invoke(MethodId::new("Orders", "Split"), Bytes::new()))
        .await;

    assert!(matches!(
        outcome,
        TransitionOutcome::Fatal(TransitionError::MissingPersistence(_))
    ));
}

#[tokio::test]
async fn test_persisted_policy_without_store_is_fatal() {
    let engine = Engine::new(
        InMemoryFabric::queue_only(),
        JsonCodec,
        order_registry(),
        persisted(),
    );

    let outcome = engine.run(order_message("order-4")).await;

    assert!(matches!(
        outcome,
        TransitionOutcome::Fatal(TransitionError::MissingPersistence(_))
    ));
}

#[tokio::test]
async fn test_await_on_unknown_task_is_unclassifiable() {
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Broken", "Wait"), |state, _cx| async move {
            Ok::<_, anyhow::Error>(Turn::await_one(state, TaskId::new(42)))
        })
        .build();
    let engine = Engine::new(
        InMemoryFabric::new(),
        JsonCodec,
        registry,
        EngineOptions::default(),
    );

    let outcome = engine
        .run(TransitionMessage::invoke(MethodId::new("Broken", "Wait"), Bytes::new()))
        .await;

    assert!(matches!(
        outcome,
        TransitionOutcome::Fatal(TransitionError::Unclassifiable { .. })
    ));
}

#[tokio::test]
async fn test_errors_and_panics_become_faults() {
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Faulty", "Fail"), out_of_stock_turn)
        .register_fn(MethodId::new("Faulty", "Panic"), panicking_turn)
        .build();
    let engine = Engine::new(
        InMemoryFabric::new(),
        JsonCodec,
        registry,
        EngineOptions::default(),
    );

    match engine
        .run(TransitionMessage::invoke(MethodId::new("Faulty", "Fail"), Bytes::new()))
        .await
    {
        TransitionOutcome::Complete(RoutineResult::Fault(fault)) => {
            assert!(fault.message.contains("out of stock"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    match engine
        .run(TransitionMessage::invoke(MethodId::new("Faulty", "Panic"), Bytes::new()))
        .await
    {
        TransitionOutcome::Complete(RoutineResult::Fault(fault)) => {
            assert!(fault.message.contains("boom"))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_callee_fault_reaches_the_caller() {
    let registry = RoutineRegistry::builder()
        .register_fn(place_order(), place_order_turn)
        .register_fn(reserve(), out_of_stock_turn)
        .build();
    let engine = Engine::new(InMemoryFabric::new(), JsonCodec, registry, persisted());
    let key = engine.submit(order_message("order-5")).await.unwrap();

    drain(&engine).await;

    match engine.poll(&key).await.unwrap() {
        Some(RoutineResult::Fault(fault)) => {
            assert!(fault.message.contains("reservation failed"));
            assert!(fault.message.contains("out of stock"));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

fn approve() -> MethodId {
    MethodId::new("Approvals", "Approve")
}

/// Hands a fresh trigger to `Approvals.Approve` and waits for it.
async fn await_approval_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    if state.step == 0 {
        let trigger = cx.new_trigger();
        cx.call_with_triggers(
            approve(),
            Bytes::from(trigger.as_str().to_string()),
            vec![trigger.clone()],
        );
        let task = cx.await_trigger(trigger);
        state.put(&JsonCodec, "approval", &task.get())?;
        state.step = 1;
        return Ok(Turn::await_one(state, task));
    }
    let task = state
        .get::<_, u64>(&JsonCodec, "approval")?
        .context("approval task missing")?;
    match state.take_result(TaskId::new(task)) {
        Some(RoutineResult::Value(bytes)) => Ok(Turn::ready(state, bytes)),
        other => bail!("approval failed: {other:?}"),
    }
}

async fn approve_turn(state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    let trigger = TriggerId::new(String::from_utf8(state.input.to_vec())?);
    cx.activate_trigger(trigger, RoutineResult::Value(Bytes::from("approved")));
    Ok(Turn::ready(state, Bytes::from("ok")))
}

#[tokio::test]
async fn test_trigger_resumes_its_subscriber() {
    let wait = MethodId::new("Approvals", "Wait");
    let registry = RoutineRegistry::builder()
        .register_fn(wait.clone(), await_approval_turn)
        .register_fn(approve(), approve_turn)
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(fabric.clone(), JsonCodec, registry, persisted());
    let message = TransitionMessage::invoke(wait, Bytes::new());
    let key = engine.submit(message.clone()).await.unwrap();

    drain(&engine).await;

    assert_eq!(
        engine.poll(&key).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("approved")))
    );
    let trigger = TriggerId::new(message.intent_id.derive("trigger/0/0").to_string());
    let record = fabric.try_read(&trigger_key(&trigger)).await.unwrap().unwrap();
    assert_eq!(record.status, RoutineStatus::Complete);
}

fn gate() -> TriggerId {
    TriggerId::new("shared-trigger")
}

async fn open_gate_turn(state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    cx.activate_trigger(gate(), RoutineResult::Value(Bytes::from("early")));
    Ok(Turn::ready(state, Bytes::new()))
}

async fn pass_gate_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    if state.step == 0 {
        let task = cx.await_trigger(gate());
        state.step = 1;
        return Ok(Turn::await_one(state, task));
    }
    match state.take_result(TaskId::new(0)) {
        Some(RoutineResult::Value(bytes)) => Ok(Turn::ready(state, bytes)),
        other => bail!("gate stayed shut: {other:?}"),
    }
}

#[tokio::test]
async fn test_trigger_activated_before_subscription() {
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Gate", "Open"), open_gate_turn)
        .register_fn(MethodId::new("Gate", "Pass"), pass_gate_turn)
        .build();
    let engine = Engine::new(InMemoryFabric::new(), JsonCodec, registry, persisted());

    let opened = engine
        .run(TransitionMessage::invoke(MethodId::new("Gate", "Open"), Bytes::new()))
        .await;
    assert!(opened.is_complete());

    let key = engine
        .invoke(MethodId::new("Gate", "Pass"), Bytes::new())
        .await
        .unwrap();
    drain(&engine).await;

    assert_eq!(
        engine.poll(&key).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("early")))
    );
}

#[tokio::test]
async fn test_events_fan_out_to_local_handlers() {
    let handled: Arc<Mutex<Vec<RoutineKey>>> = Arc::default();
    let registry = RoutineRegistry::builder()
        .register_fn(place_order(), |state, cx| async move {
            cx.raise_event("order-placed", state.input.clone());
            Ok::<_, anyhow::Error>(Turn::ready(state, Bytes::from("placed")))
        })
        .register_fn(MethodId::new("Audit", "Record"), {
            let handled = Arc::clone(&handled);
            move |state: RoutineState, cx: TurnContext| {
                if let Ok(mut handled) = handled.lock() {
                    handled.push(cx.routine().key());
                }
                async move { Ok::<_, anyhow::Error>(Turn::ready(state, Bytes::new())) }
            }
        })
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        registry,
        EngineOptions::default()
            .with_event_handler("order-placed", MethodId::new("Audit", "Record")),
    );
    engine
        .invoke(place_order(), Bytes::from("book"))
        .await
        .unwrap();

    drain(&engine).await;

    let events = fabric.published_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "order-placed");
    assert_eq!(events[0].payload, Bytes::from("book"));

    let handled = handled.lock().unwrap().clone();
    assert_eq!(handled.len(), 1);
    // Handlers have no caller waiting, so nothing is stored for them.
    assert!(fabric.try_read(&handled[0]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_direct_calls_run_nested() {
    let depth = Arc::new(AtomicUsize::new(0));
    let seen: Arc<Mutex<Option<RoutineKey>>> = Arc::default();
    let registry = RoutineRegistry::builder()
        .register_fn(place_order(), place_order_turn)
        .register_fn(reserve(), {
            let depth = Arc::clone(&depth);
            let seen = Arc::clone(&seen);
            move |state: RoutineState, cx: TurnContext| {
                depth.store(scope::depth(), Ordering::SeqCst);
                if let (Ok(routine), Ok(mut seen)) = (scope::current_routine(), seen.lock()) {
                    *seen = Some(routine.key());
                }
                reserve_turn(state, cx)
            }
        })
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        registry,
        EngineOptions::default().with_direct_service("Inventory"),
    );
    let key = engine.submit(order_message("order-direct")).await.unwrap();

    // One message for the order, one for its resume; the call never queues.
    assert_eq!(drain(&engine).await, 2);

    assert_eq!(depth.load(Ordering::SeqCst), 2);
    assert_eq!(engine.poll(&key).await.unwrap(), Some(placed()));
    let callee = seen.lock().unwrap().clone().unwrap();
    assert_eq!(callee.service, ServiceId::new("Inventory"));
    assert!(fabric.try_read(&callee).await.unwrap().is_none());
    assert_eq!(scope::depth(), 0);

    // Nothing is stored for the callee; its reply still answers a poll.
    assert_eq!(
        engine.poll(&callee).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("reserved-book")))
    );
}

#[tokio::test]
async fn test_direct_reply_resolves_a_subscription() {
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        order_registry(),
        EngineOptions::default().with_direct_service("Inventory"),
    );
    let message = order_message("order-direct-wait");
    let child = message.intent_id.derive("call/0");
    let callee = RoutineKey::new(ServiceId::new("Inventory"), RoutineId::from(&child));

    let cancel = CancellationToken::new();
    let (_token, receiver) = engine.hub().subscribe_channel(callee.clone(), &cancel);
    assert!(matches!(engine.run(message).await, TransitionOutcome::Paused));

    assert_eq!(
        receiver.await.unwrap(),
        RoutineResult::Value(Bytes::from("reserved-book"))
    );
    assert!(fabric.try_read(&callee).await.unwrap().is_none());
}

/// Suspends once on a checkpoint due in an hour.
async fn remind_later_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    if state.step == 0 {
        let task = cx.checkpoint(Some(Utc::now() + chrono::Duration::hours(1)));
        state.step = 1;
        return Ok(Turn::await_one(state, task));
    }
    Ok(Turn::ready(state, Bytes::from("reminded")))
}

/// Yields once and picks up right away.
async fn yield_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    if state.step == 0 {
        let task = cx.checkpoint(None);
        state.step = 1;
        return Ok(Turn::await_one(state, task));
    }
    Ok(Turn::ready(state, Bytes::from("yielded")))
}

#[tokio::test]
async fn test_timed_checkpoint_waits_for_its_time() {
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Reminders", "Later"), remind_later_turn)
        .register_fn(MethodId::new("Reminders", "Now"), yield_turn)
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        fabric.clone(),
        JsonCodec,
        registry,
        EngineOptions::default(),
    );

    let later = engine
        .invoke(MethodId::new("Reminders", "Later"), Bytes::new())
        .await
        .unwrap();
    let now = engine
        .invoke(MethodId::new("Reminders", "Now"), Bytes::new())
        .await
        .unwrap();

    // Later's invoke, Now's invoke and Now's resume.
    assert_eq!(drain(&engine).await, 3);

    assert_eq!(
        engine.poll(&now).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("yielded")))
    );
    assert_eq!(engine.poll(&later).await.unwrap(), None);

    let queued = fabric.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, TransitionKind::Continue);
    assert_eq!(queued[0].origin, MessageOrigin::Resume);
    assert!(queued[0].roamed.is_some());
}

#[tokio::test]
async fn test_invoke_and_wait_with_background_worker() {
    let engine = Engine::new(
        InMemoryFabric::new(),
        JsonCodec,
        order_registry(),
        persisted(),
    );
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(
        engine
            .worker(WorkerOptions::default().with_poll_interval(Duration::from_millis(5)))
            .start(cancel.clone()),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.invoke_and_wait(place_order(), Bytes::from("book"), &cancel),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result, placed());
    cancel.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wait_on_cancelled_token_fails() {
    let engine = Engine::new(
        InMemoryFabric::new(),
        JsonCodec,
        order_registry(),
        persisted(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = engine
        .invoke_and_wait(place_order(), Bytes::from("book"), &cancel)
        .await;

    assert!(matches!(result, Err(TransitionError::SubscriptionClosed)));
}

#[tokio::test]
async fn test_scope_opens_on_the_loaded_record() {
    let seen: Arc<Mutex<Option<(usize, routine_core::RoutineDescriptor)>>> = Arc::default();
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Echo", "Say"), {
            let seen = Arc::clone(&seen);
            move |state: RoutineState, _cx: TurnContext| {
                if let (Ok(routine), Ok(mut seen)) = (scope::current_routine(), seen.lock()) {
                    *seen = Some((scope::depth(), routine));
                }
                let input = state.input.clone();
                async move { Ok::<_, anyhow::Error>(Turn::ready(state, input)) }
            }
        })
        .build();
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(fabric.clone(), JsonCodec, registry, persisted());
    let message = TransitionMessage::invoke(MethodId::new("Echo", "Say"), Bytes::from("hi"));
    let key = message.key();

    assert!(engine.run(message).await.is_complete());

    let (depth, routine) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(depth, 1);
    assert_eq!(routine.key(), key);
    // The turn already sees the tag of the record created for it.
    assert!(routine.etag.is_some());
    assert_eq!(scope::depth(), 0);
}

/// Wraps an [`InMemoryFabric`] and fails the next `enqueue` once armed.
struct FlakyFabric {
    inner: InMemoryFabric,
    fail_next_enqueue: AtomicBool,
}

impl FlakyFabric {
    fn wrap(inner: InMemoryFabric) -> Self {
        Self {
            inner,
            fail_next_enqueue: AtomicBool::new(false),
        }
    }

    fn fail_next_enqueue(&self) {
        self.fail_next_enqueue.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fabric for FlakyFabric {
    fn supports_persistence(&self) -> bool {
        self.inner.supports_persistence()
    }

    async fn create_if_absent(&self, record: RoutineRecord) -> Result<ETag, FabricError> {
        self.inner.create_if_absent(record).await
    }

    async fn replace_if_match(
        &self,
        record: RoutineRecord,
        expected: &ETag,
    ) -> Result<ETag, FabricError> {
        self.inner.replace_if_match(record, expected).await
    }

    async fn try_read(&self, key: &RoutineKey) -> Result<Option<RoutineRecord>, FabricError> {
        self.inner.try_read(key).await
    }

    async fn enqueue(
        &self,
        message: TransitionMessage,
        visible_at: Option<DateTime<Utc>>,
    ) -> Result<(), FabricError> {
        if self.fail_next_enqueue.swap(false, Ordering::SeqCst) {
            return Err(FabricError::Backend("queue unavailable".to_string()));
        }
        self.inner.enqueue(message, visible_at).await
    }

    async fn dequeue(&self, limit: usize) -> Result<Vec<TransitionMessage>, FabricError> {
        self.inner.dequeue(limit).await
    }

    async fn publish_event(&self, event: PublishedEvent) -> Result<(), FabricError> {
        self.inner.publish_event(event).await
    }

    async fn dead_letter(
        &self,
        message: TransitionMessage,
        reason: String,
    ) -> Result<(), FabricError> {
        self.inner.dead_letter(message, reason).await
    }
}

type FlakyEngine = Engine<FlakyFabric, JsonCodec>;

fn flaky_engine(registry: RoutineRegistry) -> (FlakyEngine, InMemoryFabric) {
    let fabric = InMemoryFabric::new();
    let engine = Engine::new(
        FlakyFabric::wrap(fabric.clone()),
        JsonCodec,
        registry,
        persisted(),
    );
    (engine, fabric)
}

async fn drain_flaky(engine: &FlakyEngine) -> usize {
    engine
        .worker(WorkerOptions::default().with_retry_backoff(Duration::ZERO))
        .run_until_idle()
        .await
        .unwrap()
}

async fn take_one(engine: &FlakyEngine) -> TransitionMessage {
    let mut batch = engine.fabric().dequeue(1).await.unwrap();
    assert_eq!(batch.len(), 1, "expected a queued message");
    batch.remove(0)
}

#[tokio::test]
async fn test_lost_call_is_sent_when_the_invoke_is_redelivered() {
    let (engine, fabric) = flaky_engine(order_registry());
    let message = order_message("order-flaky");
    let key = message.key();

    engine.fabric().fail_next_enqueue();
    let outcome = engine.run(message.clone()).await;
    assert!(matches!(outcome, TransitionOutcome::Retry), "got {outcome:?}");
    // State was saved, the call to Inventory was not.
    let record = fabric.try_read(&key).await.unwrap().unwrap();
    assert_eq!(record.status, RoutineStatus::Awaiting);
    assert!(record.outbox.is_some());
    assert_eq!(fabric.queued(), 0);

    assert!(matches!(engine.run(message).await, TransitionOutcome::Paused));
    let queued = fabric.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].target, reserve());

    drain_flaky(&engine).await;
    assert_eq!(engine.poll(&key).await.unwrap(), Some(placed()));
    assert!(fabric.dead_letters().is_empty());
}

#[tokio::test]
async fn test_lost_continuation_is_sent_when_the_callee_is_redelivered() {
    let (engine, fabric) = flaky_engine(order_registry());
    let message = order_message("order-callee");
    let key = message.key();
    assert!(matches!(engine.run(message).await, TransitionOutcome::Paused));
    let call = take_one(&engine).await;

    engine.fabric().fail_next_enqueue();
    assert!(matches!(engine.run(call.clone()).await, TransitionOutcome::Retry));
    assert!(fabric.try_read(&call.key()).await.unwrap().unwrap().is_complete());
    assert_eq!(fabric.queued(), 0);

    match engine.run(call).await {
        TransitionOutcome::Complete(result) => {
            assert_eq!(result, RoutineResult::Value(Bytes::from("reserved-book")))
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let queued = fabric.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, TransitionKind::Continue);
    assert_eq!(queued[0].key(), key);

    drain_flaky(&engine).await;
    assert_eq!(engine.poll(&key).await.unwrap(), Some(placed()));
}

/// Reserves `a`, then `b`, one call per turn.
async fn ship_turn(mut state: RoutineState, cx: TurnContext) -> anyhow::Result<Turn> {
    let mut parts: Vec<String> = state.get(&JsonCodec, "parts")?.unwrap_or_default();
    if let Some(task) = state.get::<_, u64>(&JsonCodec, "pending")? {
        match state.take_result(TaskId::new(task)) {
            Some(RoutineResult::Value(bytes)) => parts.push(String::from_utf8(bytes.to_vec())?),
            other => bail!("reservation failed: {other:?}"),
        }
    }

    if let Some(item) = ["a", "b"].get(parts.len()) {
        let task = cx.call(reserve(), Bytes::from(*item));
        state.put(&JsonCodec, "parts", &parts)?;
        state.put(&JsonCodec, "pending", &task.get())?;
        return Ok(Turn::await_one(state, task));
    }
    Ok(Turn::ready(state, Bytes::from(format!("shipped:{}", parts.join(",")))))
}

#[tokio::test]
async fn test_lost_call_is_sent_when_the_resume_is_redelivered() {
    let registry = RoutineRegistry::builder()
        .register_fn(MethodId::new("Orders", "Ship"), ship_turn)
        .register_fn(reserve(), reserve_turn)
        .build();
    let (engine, fabric) = flaky_engine(registry);
    let message = TransitionMessage::invoke(MethodId::new("Orders", "Ship"), Bytes::new())
        .with_routine_id(RoutineId::new("ship-1"));
    let key = message.key();

    assert!(matches!(engine.run(message).await, TransitionOutcome::Paused));
    let first_call = take_one(&engine).await;
    assert!(engine.run(first_call).await.is_complete());
    let resume = take_one(&engine).await;
    assert_eq!(resume.kind, TransitionKind::Continue);

    engine.fabric().fail_next_enqueue();
    assert!(matches!(engine.run(resume.clone()).await, TransitionOutcome::Retry));
    assert_eq!(fabric.queued(), 0);

    // The slot was consumed by the first attempt; the outbox is replayed instead.
    assert!(matches!(engine.run(resume).await, TransitionOutcome::Paused));
    let queued = fabric.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].input, Bytes::from("b"));

    drain_flaky(&engine).await;
    assert_eq!(
        engine.poll(&key).await.unwrap(),
        Some(RoutineResult::Value(Bytes::from("shipped:reserved-a,reserved-b")))
    );
    assert!(fabric.dead_letters().is_empty());
}

#[tokio::test]
async fn test_worker_retries_a_backend_failure() {
    let (engine, fabric) = flaky_engine(order_registry());
    let key = engine.submit(order_message("order-worker")).await.unwrap();

    engine.fabric().fail_next_enqueue();
    // Order (failed), order again, reserve, order resume.
    assert_eq!(drain_flaky(&engine).await, 4);

    assert_eq!(engine.poll(&key).await.unwrap(), Some(placed()));
    assert!(fabric.dead_letters().is_empty());
}
