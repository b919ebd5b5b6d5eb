//! TaskStateMachine — authoritative task state, terminal-absorbing, with
//! asynchronously-dispatched change listeners.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::task::types::{FailureInfo, TaskId, TaskState};

type Listener = Arc<dyn Fn(TaskState) + Send + Sync>;

struct Inner {
    state: TaskState,
    failures: Vec<FailureInfo>,
    listeners: Vec<Listener>,
}

/// Holds current `TaskState` and, once `Failed`, an append-only list of
/// causes. Transitions are idempotent: attempting an illegal transition
/// (e.g. `finished()` after the task already failed) is a silent no-op.
///
/// Listener notification is offloaded onto the ambient tokio runtime so a
/// listener that calls back into a component holding the task's lock cannot
/// deadlock the thread performing the transition.
pub struct TaskStateMachine {
    task_id: TaskId,
    inner: Mutex<Inner>,
    changed: Arc<Notify>,
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            inner: Mutex::new(Inner {
                state: TaskState::Planned,
                failures: Vec::new(),
                listeners: Vec::new(),
            }),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> Vec<FailureInfo> {
        self.inner.lock().failures.clone()
    }

    /// Blocks until the state differs from `current` or `max_wait` elapses.
    /// Spurious wakeups are permitted (the caller will simply observe the
    /// same state and may re-poll) but the wait is always bounded.
    pub async fn wait_for_state_change(&self, current: TaskState, max_wait: Duration) -> TaskState {
        if self.state() != current {
            return self.state();
        }
        let notified = self.changed.notified();
        let _ = timeout(max_wait, notified).await;
        self.state()
    }

    /// Registers a listener fired once, asynchronously, per transition.
    pub fn add_state_change_listener(&self, listener: impl Fn(TaskState) + Send + Sync + 'static) {
        self.inner.lock().listeners.push(Arc::new(listener));
    }

    pub fn start(&self) -> bool {
        self.transition(TaskState::Running, |s| s == TaskState::Planned)
    }

    pub fn finished(&self) -> bool {
        self.transition(TaskState::Finished, |s| s == TaskState::Running)
    }

    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Canceled, |s| !s.is_terminal())
    }

    pub fn abort(&self) -> bool {
        self.transition(TaskState::Aborted, |s| !s.is_terminal())
    }

    /// Transitions to `Failed`, appending `cause` to the failure list. A
    /// second `failed()` call while already `Failed` still appends the new
    /// cause (failures are append-only) without re-firing listeners.
    pub fn failed(&self, cause: FailureInfo) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Failed {
            inner.failures.push(cause);
            return false;
        }
        if inner.state.is_terminal() {
            warn!(task_id = %self.task_id, "ignoring failed() on terminal task");
            return false;
        }
        inner.failures.push(cause);
        inner.state = TaskState::Failed;
        self.fire_locked(&mut inner, TaskState::Failed);
        true
    }

    fn transition(&self, target: TaskState, allowed: impl Fn(TaskState) -> bool) -> bool {
        let mut inner = self.inner.lock();
        if !allowed(inner.state) {
            debug!(
                task_id = %self.task_id,
                from = %inner.state,
                to = %target,
                "ignoring illegal task state transition"
            );
            return false;
        }
        inner.state = target;
        self.fire_locked(&mut inner, target);
        true
    }

    /// Dispatches listeners on the ambient runtime, never while `inner` is
    /// held, then wakes any `wait_for_state_change` pollers.
    fn fire_locked(&self, inner: &mut Inner, new_state: TaskState) {
        info!(task_id = %self.task_id, state = %new_state, "task state transition");
        for listener in inner.listeners.iter().cloned() {
            tokio::spawn(async move {
                listener(new_state);
            });
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn start_then_finish_reaches_terminal() {
        let sm = TaskStateMachine::new(TaskId::new("t1"));
        assert_eq!(sm.state(), TaskState::Planned);
        assert!(sm.start());
        assert_eq!(sm.state(), TaskState::Running);
        assert!(sm.finished());
        assert_eq!(sm.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn terminal_is_absorbing() {
        let sm = TaskStateMachine::new(TaskId::new("t1"));
        sm.start();
        assert!(sm.cancel());
        assert_eq!(sm.state(), TaskState::Canceled);
        // finished()/failed() after a terminal state are no-ops.
        assert!(!sm.finished());
        assert!(!sm.failed(FailureInfo::new("late")));
        assert_eq!(sm.state(), TaskState::Canceled);
        assert!(sm.failures().is_empty());
    }

    #[tokio::test]
    async fn failed_retains_cause() {
        let sm = TaskStateMachine::new(TaskId::new("t1"));
        sm.start();
        assert!(sm.failed(FailureInfo::new("driver blew up")));
        assert_eq!(sm.state(), TaskState::Failed);
        assert_eq!(sm.failures().len(), 1);
        assert_eq!(sm.failures()[0].message, "driver blew up");
    }

    #[tokio::test]
    async fn listener_fires_once_per_transition() {
        let sm = Arc::new(TaskStateMachine::new(TaskId::new("t1")));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        sm.add_state_change_listener(move |_state| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        sm.start();
        sm.finished();
        // listeners run on the ambient runtime; give them a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_for_state_change_returns_on_transition() {
        let sm = Arc::new(TaskStateMachine::new(TaskId::new("t1")));
        let waiter = {
            let sm = sm.clone();
            tokio::spawn(async move {
                sm.wait_for_state_change(TaskState::Planned, Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        sm.start();
        let observed = waiter.await.unwrap();
        assert_eq!(observed, TaskState::Running);
    }

    #[tokio::test]
    async fn wait_for_state_change_bounded_by_timeout() {
        let sm = TaskStateMachine::new(TaskId::new("t1"));
        sm.start();
        let observed = sm
            .wait_for_state_change(TaskState::Running, Duration::from_millis(20))
            .await;
        assert_eq!(observed, TaskState::Running);
    }
}
