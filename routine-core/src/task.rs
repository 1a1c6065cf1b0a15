use crate::context::TurnContext;
use crate::primitives::TaskId;
use crate::state::RoutineState;
use anyhow::Result;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a routine is waiting for when its turn ends without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Awaiting {
    /// Exactly one placeholder.
    One(TaskId),
    /// Fan-in: every listed placeholder.
    All(Vec<TaskId>),
    /// Fan-in: the first of the listed placeholders.
    Any(Vec<TaskId>),
}

impl Awaiting {
    pub fn tasks(&self) -> Vec<TaskId> {
        match self {
            Awaiting::One(task) => vec![*task],
            Awaiting::All(tasks) | Awaiting::Any(tasks) => tasks.clone(),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnPoll {
    /// The routine finished with a value.
    Ready(Bytes),
    /// The routine suspended.
    Pending(Awaiting),
}

/// The state after a turn, plus how the turn ended.
#[derive(Debug)]
pub struct Turn {
    pub state: RoutineState,
    pub poll: TurnPoll,
}

impl Turn {
    pub fn ready(state: RoutineState, value: Bytes) -> Self {
        Self {
            state,
            poll: TurnPoll::Ready(value),
        }
    }

    pub fn await_one(state: RoutineState, task: TaskId) -> Self {
        Self {
            state,
            poll: TurnPoll::Pending(Awaiting::One(task)),
        }
    }

    pub fn await_all(state: RoutineState, tasks: Vec<TaskId>) -> Self {
        Self {
            state,
            poll: TurnPoll::Pending(Awaiting::All(tasks)),
        }
    }

    pub fn await_any(state: RoutineState, tasks: Vec<TaskId>) -> Self {
        Self {
            state,
            poll: TurnPoll::Pending(Awaiting::Any(tasks)),
        }
    }
}

/// A routine compiled to an explicit state machine.
///
/// Each call to `turn` runs from the current `step` to the next suspension
/// point or to completion. Any error returned becomes a faulted result.
pub trait Routine: Send + Sync {
    fn turn(&self, state: RoutineState, cx: TurnContext) -> BoxFuture<'static, Result<Turn>>;
}

pub type UntypedRoutine = Arc<dyn Routine>;

struct RoutineFnWrapper<F> {
    func: Arc<F>,
}

impl<F, Fut> Routine for RoutineFnWrapper<F>
where
    F: Fn(RoutineState, TurnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Turn>> + Send + 'static,
{
    fn turn(&self, state: RoutineState, cx: TurnContext) -> BoxFuture<'static, Result<Turn>> {
        let func = Arc::clone(&self.func);
        Box::pin(async move { func(state, cx).await })
    }
}

/// Create a [`Routine`] from an async function.
///
/// ```
/// use routine_core::task::{Turn, routine_fn};
///
/// let _echo = routine_fn(|state, _cx| async move {
///     let input = state.input.clone();
///     Ok(Turn::ready(state, input))
/// });
/// ```
pub fn routine_fn<F, Fut>(func: F) -> impl Routine
where
    F: Fn(RoutineState, TurnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Turn>> + Send + 'static,
{
    RoutineFnWrapper {
        func: Arc::new(func),
    }
}
