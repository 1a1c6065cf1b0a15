//! Ambient, nestable "current transition" for code running under a turn.
//!
//! Each tokio task carries its own stack of monitors. A transition served
//! over the synchronous-reply channel runs nested on the caller's stack and
//! pushes a new frame; leaving the nested future pops it again, so the child
//! never shows up in the parent's view. Spawned tasks start with no frame.

use crate::error::TransitionError;
use crate::monitor::TransitionMonitor;
use routine_core::RoutineDescriptor;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static SCOPE_STACK: RefCell<Vec<Arc<TransitionMonitor>>>;
}

/// Pops the stack back to the depth it had before the frame was pushed.
struct ScopeGuard {
    depth: usize,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let _ = SCOPE_STACK.try_with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// Run `fut` with `monitor` as the current transition.
pub async fn in_scope<F>(monitor: Arc<TransitionMonitor>, fut: F) -> F::Output
where
    F: Future,
{
    let pushed = SCOPE_STACK.try_with(|stack| {
        let mut stack = stack.borrow_mut();
        let depth = stack.len();
        stack.push(Arc::clone(&monitor));
        depth
    });

    match pushed {
        Ok(depth) => {
            tracing::trace!(depth = depth + 1, "Entered nested transition scope");
            let _guard = ScopeGuard { depth };
            fut.await
        }
        Err(_) => SCOPE_STACK.scope(RefCell::new(vec![monitor]), fut).await,
    }
}

/// The monitor of the innermost transition.
///
/// # Errors
///
/// Returns `TransitionError::OutsideTransition` when no transition is running
/// on the current task.
pub fn current_monitor() -> Result<Arc<TransitionMonitor>, TransitionError> {
    SCOPE_STACK
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten()
        .ok_or(TransitionError::OutsideTransition)
}

/// Identity of the innermost transition.
pub fn current_routine() -> Result<RoutineDescriptor, TransitionError> {
    current_monitor().map(|monitor| monitor.descriptor().clone())
}

/// Number of transitions open on the current task.
pub fn depth() -> usize {
    SCOPE_STACK
        .try_with(|stack| stack.borrow().len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routine_core::{CallerInfo, IntentId, MethodId, RoutineId};
    use std::collections::BTreeMap;

    fn monitor(method: &str) -> Arc<TransitionMonitor> {
        let intent_id = IntentId::new();
        let routine = RoutineDescriptor {
            method: MethodId::new("Test", method),
            intent_id,
            routine_id: RoutineId::from(&intent_id),
            etag: None,
        };
        Arc::new(TransitionMonitor::start(
            routine,
            CallerInfo::external(),
            BTreeMap::new(),
            0,
        ))
    }

    #[tokio::test]
    async fn test_outside_transition() {
        assert!(matches!(
            current_monitor(),
            Err(TransitionError::OutsideTransition)
        ));
        assert_eq!(depth(), 0);
    }

    #[tokio::test]
    async fn test_nested_scopes_pop_back() {
        let outer = monitor("Outer");
        let inner = monitor("Inner");

        in_scope(outer.clone(), async {
            assert_eq!(depth(), 1);
            assert_eq!(current_routine().unwrap().method.method, "Outer");

            in_scope(inner.clone(), async {
                assert_eq!(depth(), 2);
                assert_eq!(current_routine().unwrap().method.method, "Inner");
            })
            .await;

            assert_eq!(depth(), 1);
            assert_eq!(current_routine().unwrap().method.method, "Outer");
        })
        .await;

        assert_eq!(depth(), 0);
    }

    #[tokio::test]
    async fn test_spawned_tasks_do_not_inherit() {
        in_scope(monitor("Outer"), async {
            let seen = tokio::spawn(async { depth() }).await.unwrap();
            assert_eq!(seen, 0);
        })
        .await;
    }
}
