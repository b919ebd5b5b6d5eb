//! TaskExecutor — the time-sliced worker pool. The core orchestrator treats
//! this as an external collaborator (spec §4.D); this module supplies one
//! concrete, `tokio`-backed implementation grounded in the teacher's
//! `ParallelExecutor`/`WorkStealingScheduler` pair, round-robin per task
//! handle and divided roughly equally across handles.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{Result, TaskError};
use crate::task::driver::DriverProcessOutcome;
use crate::task::split_runner::DriverSplitRunner;
use crate::task::types::TaskId;

/// Registers a fairness group with a `TaskExecutor`. Opaque beyond equality
/// and `Display`-style logging.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    task_id: TaskId,
}

impl TaskHandle {
    fn new(id: u64, task_id: TaskId) -> Self {
        Self { id, task_id }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for TaskHandle {}

/// External time-slicing worker pool. `add_split` is a non-blocking
/// enqueue from the caller's point of view: `TaskExecution` never awaits
/// it while holding its routing mutex, only spawns a task that does.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn add_task(&self, task_id: TaskId) -> TaskHandle;

    /// Enqueues one runner; resolves once the executor observes it
    /// finished (`Ok`) or it fails mid-quantum (`Err`).
    async fn add_split(&self, handle: &TaskHandle, runner: Arc<DriverSplitRunner>) -> Result<()>;

    /// Aborts all runners still queued under `handle`.
    fn remove_task(&self, handle: &TaskHandle);
}

struct HandleQueue {
    task_id: TaskId,
    runners: VecDeque<Arc<DriverSplitRunner>>,
    removed: bool,
}

struct Scheduler {
    quantum: Duration,
    handles: Mutex<HashMap<u64, HandleQueue>>,
    rotation: Mutex<VecDeque<u64>>,
    work_available: Arc<Notify>,
    shutdown: AtomicBool,
}

/// Reference `TaskExecutor`: a fixed pool of `tokio` worker loops, each
/// visiting task handles in rotation and running one quantum of the oldest
/// queued runner per visit before moving to the next handle — round-robin
/// within a handle, approximately equal division of time across handles.
pub struct TokioTaskExecutor {
    scheduler: Arc<Scheduler>,
    next_handle_id: AtomicU64,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TokioTaskExecutor {
    pub fn new(worker_count: usize, quantum: Duration) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler {
            quantum,
            handles: Mutex::new(HashMap::new()),
            rotation: Mutex::new(VecDeque::new()),
            work_available: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
        });

        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count.max(1) {
            let scheduler = scheduler.clone();
            worker_handles.push(tokio::spawn(async move {
                Self::worker_loop(worker_id, scheduler).await;
            }));
        }

        Arc::new(Self {
            scheduler,
            next_handle_id: AtomicU64::new(1),
            worker_handles: Mutex::new(worker_handles),
        })
    }

    async fn worker_loop(worker_id: usize, scheduler: Arc<Scheduler>) {
        debug!(worker_id, "task executor worker started");
        loop {
            if scheduler.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let next = {
                let mut rotation = scheduler.rotation.lock();
                let mut handles = scheduler.handles.lock();
                Self::next_runnable(&mut rotation, &mut handles)
            };

            let (handle_id, runner) = match next {
                Some(v) => v,
                None => {
                    scheduler.work_available.notified().await;
                    continue;
                }
            };

            let outcome = runner.process_for(scheduler.quantum).await;
            let mut handles = scheduler.handles.lock();
            let Some(queue) = handles.get_mut(&handle_id) else {
                continue;
            };
            if queue.removed {
                continue;
            }
            match outcome {
                Ok(DriverProcessOutcome::Finished) => {
                    debug!(task_id = %queue.task_id, "driver finished");
                }
                Ok(DriverProcessOutcome::Blocked) => {
                    queue.runners.push_back(runner);
                }
                Err(e) => {
                    warn!(task_id = %queue.task_id, error = %e, "driver quantum failed");
                    runner.record_failure(e);
                }
            }
            drop(handles);
            scheduler.work_available.notify_waiters();
        }
    }

    /// Pops the next `(handle_id, runner)` pair to run, rotating the
    /// handle list so the next worker visit starts from a different
    /// handle — this is the "approximately equal division across
    /// handles" fairness knob.
    fn next_runnable(
        rotation: &mut VecDeque<u64>,
        handles: &mut HashMap<u64, HandleQueue>,
    ) -> Option<(u64, Arc<DriverSplitRunner>)> {
        let rounds = rotation.len();
        for _ in 0..rounds {
            let handle_id = rotation.pop_front()?;
            rotation.push_back(handle_id);
            if let Some(queue) = handles.get_mut(&handle_id) {
                if queue.removed {
                    continue;
                }
                if let Some(runner) = queue.runners.pop_front() {
                    return Some((handle_id, runner));
                }
            }
        }
        None
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown.store(true, Ordering::SeqCst);
        self.scheduler.work_available.notify_waiters();
    }
}

#[async_trait]
impl TaskExecutor for TokioTaskExecutor {
    fn add_task(&self, task_id: TaskId) -> TaskHandle {
        let id = self.next_handle_id.fetch_add(1, Ordering::SeqCst);
        info!(task_id = %task_id, handle_id = id, "registered task handle with executor");
        self.scheduler.handles.lock().insert(
            id,
            HandleQueue {
                task_id: task_id.clone(),
                runners: VecDeque::new(),
                removed: false,
            },
        );
        self.scheduler.rotation.lock().push_back(id);
        TaskHandle::new(id, task_id)
    }

    async fn add_split(&self, handle: &TaskHandle, runner: Arc<DriverSplitRunner>) -> Result<()> {
        {
            let mut handles = self.scheduler.handles.lock();
            match handles.get_mut(&handle.id) {
                Some(queue) if !queue.removed => queue.runners.push_back(runner.clone()),
                _ => {
                    return Err(TaskError::Internal(format!(
                        "add_split on unknown or removed handle {}",
                        handle.id
                    )))
                }
            }
        }
        self.scheduler.work_available.notify_waiters();

        loop {
            if let Some(err) = runner.failure() {
                return Err(err);
            }
            if runner.is_finished() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            let handles = self.scheduler.handles.lock();
            match handles.get(&handle.id) {
                Some(queue) if queue.removed => return Ok(()),
                None => return Ok(()),
                _ => {}
            }
        }
    }

    fn remove_task(&self, handle: &TaskHandle) {
        let mut handles = self.scheduler.handles.lock();
        if let Some(queue) = handles.get_mut(&handle.id) {
            queue.removed = true;
            queue.runners.clear();
        }
        let mut rotation = self.scheduler.rotation.lock();
        rotation.retain(|id| *id != handle.id);
        info!(task_id = %handle.task_id, handle_id = handle.id, "removed task handle from executor");
    }
}

impl Drop for TokioTaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
