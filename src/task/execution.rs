//! TaskExecution — the core orchestrator. Owns drivers, routes splits,
//! tracks completion, and coordinates termination. See spec §4.E.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TaskExecutionConfig;
use crate::error::{Result, TaskError};
use crate::task::buffer::{BufferResult, SharedOutputBuffer};
use crate::task::driver::{Driver, DriverContext, DriverFactory};
use crate::task::executor::{TaskExecutor, TaskHandle};
use crate::task::fragment::Fragment;
use crate::task::info::{BufferSummary, TaskInfo, TaskStats};
use crate::task::monitor::QueryMonitor;
use crate::task::split_runner::DriverSplitRunner;
use crate::task::state_machine::TaskStateMachine;
use crate::task::types::{
    FailureInfo, OutputBufferId, OutputBuffers, PlanNodeId, ScheduledSplit, Split,
    SplitCompletionEvent, TaskId, TaskSource, TaskState, VersionCounter,
};

/// Mutex-protected routing state (spec §5 locking discipline): the drivers
/// back-table, the unpartitioned-sources multimap, closed-source set, and
/// per-source acknowledgement high-water marks. A single lock covers all
/// of it; fan-out work per split is O(live drivers) and small enough that
/// holding the lock across it is the simplest correct policy.
#[derive(Default)]
struct RoutingState {
    drivers: Vec<Weak<dyn Driver>>,
    unpartitioned_delivered: HashMap<PlanNodeId, Vec<ScheduledSplit>>,
    unpartitioned_seen: HashMap<PlanNodeId, HashSet<u64>>,
    closed_sources: HashSet<PlanNodeId>,
    max_acknowledged_split: HashMap<PlanNodeId, u64>,
}

struct Inner {
    task_id: TaskId,
    uri: String,
    #[allow(dead_code)]
    config: TaskExecutionConfig,
    state_machine: Arc<TaskStateMachine>,
    shared_buffer: Arc<SharedOutputBuffer>,
    executor: Arc<dyn TaskExecutor>,
    handle: TaskHandle,
    monitor: Arc<dyn QueryMonitor>,
    /// Every source id declared by any factory in the fragment, partitioned
    /// or not — used to reject `addSources` batches for a source the
    /// fragment never declared (spec §7.2).
    known_sources: HashSet<PlanNodeId>,
    partitioned_source: Option<PlanNodeId>,
    partitioned_factory: Option<Arc<dyn DriverFactory>>,
    partitioned_factory_closed: AtomicBool,
    no_more_partitioned_splits: AtomicBool,
    /// Enqueued drivers minus completed ones; never negative (spec
    /// invariant 4). Signed so a bug underflowing it is observable rather
    /// than silently wrapping.
    remaining_driver_count: AtomicI64,
    version: VersionCounter,
    last_heartbeat: Mutex<chrono::DateTime<Utc>>,
    routing: Mutex<RoutingState>,
    stats: Mutex<TaskStats>,
    pending_unpartitioned: Mutex<Vec<Arc<dyn Driver>>>,
}

/// Owns one task's lifecycle end to end. Cheap to clone: internally an
/// `Arc`, so handing a `TaskExecution` to an RPC layer or a completion
/// callback shares the same underlying state.
#[derive(Clone)]
pub struct TaskExecution {
    inner: Arc<Inner>,
}

impl TaskExecution {
    /// Plans the fragment into driver factories, builds every unpartitioned
    /// driver immediately, registers one `TaskHandle`, and installs the
    /// terminal-state listener that removes the handle from the executor.
    /// Does not yet enqueue anything — call `start()` for that.
    pub fn new(
        task_id: TaskId,
        uri: impl Into<String>,
        fragment: Fragment,
        config: TaskExecutionConfig,
        executor: Arc<dyn TaskExecutor>,
        monitor: Arc<dyn QueryMonitor>,
    ) -> Self {
        let state_machine = Arc::new(TaskStateMachine::new(task_id.clone()));
        let shared_buffer = Arc::new(SharedOutputBuffer::new(config.max_buffer_size_bytes));
        let handle = executor.add_task(task_id.clone());
        let known_sources: HashSet<PlanNodeId> = fragment
            .factories
            .iter()
            .flat_map(|f| f.source_ids().to_vec())
            .collect();
        let partitioned_source = fragment.partitioned_source.clone();
        let partitioned_factory = fragment.partitioned_factory();
        let unpartitioned_factories = fragment.unpartitioned_factories();

        let inner = Arc::new(Inner {
            task_id: task_id.clone(),
            uri: uri.into(),
            config,
            state_machine: state_machine.clone(),
            shared_buffer,
            executor,
            handle,
            monitor,
            known_sources,
            partitioned_source,
            partitioned_factory,
            partitioned_factory_closed: AtomicBool::new(false),
            no_more_partitioned_splits: AtomicBool::new(false),
            remaining_driver_count: AtomicI64::new(0),
            version: VersionCounter::new(),
            last_heartbeat: Mutex::new(Utc::now()),
            routing: Mutex::new(RoutingState::default()),
            stats: Mutex::new(TaskStats::default()),
            pending_unpartitioned: Mutex::new(Vec::new()),
        });

        {
            let mut pending = inner.pending_unpartitioned.lock();
            for factory in unpartitioned_factories {
                pending.push(build_driver(factory.as_ref(), &inner, None));
            }
        }

        let listener_inner = inner.clone();
        state_machine.add_state_change_listener(move |state| {
            if state.is_terminal() {
                listener_inner.executor.remove_task(&listener_inner.handle);
            }
        });

        info!(task_id = %inner.task_id, "task execution constructed");
        Self { inner }
    }

    /// Transitions to `Running` and enqueues every unpartitioned driver.
    pub fn start(&self) {
        if !self.inner.state_machine.start() {
            return;
        }
        let pending = std::mem::take(&mut *self.inner.pending_unpartitioned.lock());
        for driver in pending {
            spawn_driver(&self.inner, driver, None);
        }
        check_task_completion(&self.inner);
    }

    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    pub fn state(&self) -> TaskState {
        self.inner.state_machine.state()
    }

    /// Idempotent under replay: batches may repeat previously-acknowledged
    /// sequence ids. Silently dropped if the task is already terminal.
    /// Fails with `TaskError::UnknownSource` if a batch names a source id
    /// the fragment never declared.
    pub fn add_sources(&self, updates: Vec<TaskSource>) -> Result<()> {
        add_sources(&self.inner, updates)
    }

    /// Monotone: once any call sets `no_more_buffer_ids`, later ids are
    /// rejected by the buffer.
    pub fn add_result_queue(&self, outputs: OutputBuffers) -> Result<()> {
        add_result_queue(&self.inner, outputs)
    }

    pub async fn get_results(
        &self,
        output_id: &OutputBufferId,
        starting_sequence_id: u64,
        max_size_bytes: u64,
        max_wait: Duration,
    ) -> Result<BufferResult> {
        self.inner
            .shared_buffer
            .get(output_id, starting_sequence_id, max_size_bytes, max_wait)
            .await
    }

    pub fn abort_results(&self, output_id: &OutputBufferId) {
        self.inner.shared_buffer.abort(output_id);
    }

    pub fn cancel(&self) {
        self.inner.state_machine.cancel();
    }

    pub fn fail(&self, cause: impl Into<String>) {
        self.inner.state_machine.failed(FailureInfo::new(cause.into()));
    }

    pub fn record_heartbeat(&self) {
        *self.inner.last_heartbeat.lock() = Utc::now();
    }

    /// Runs a completion check, then returns a consistent snapshot whose
    /// version is guaranteed to have been minted after that check — a
    /// client observing a terminal state never sees a later, lower
    /// version carrying a non-terminal state.
    pub fn get_task_info(&self) -> TaskInfo {
        get_task_info(&self.inner)
    }
}

fn build_driver(
    factory: &dyn DriverFactory,
    inner: &Arc<Inner>,
    partitioned_split: Option<(PlanNodeId, Split)>,
) -> Arc<dyn Driver> {
    let ctx = DriverContext {
        input_sources: factory.source_ids().to_vec(),
        is_input_driver: factory.is_input_driver(),
        is_output_driver: factory.is_output_driver(),
        output_buffer: if factory.is_output_driver() {
            Some(inner.shared_buffer.clone())
        } else {
            None
        },
    };
    let driver: Arc<dyn Driver> = Arc::from(factory.create_driver(ctx));

    // An initial split is a construction precondition for the scan
    // operator: added before the driver is recorded anywhere.
    if let Some((source_id, split)) = &partitioned_split {
        if let Err(e) = driver.add_split(source_id, split.clone()) {
            warn!(source_id = %source_id, error = %e, "failed to seed partitioned driver with its split");
        }
    }

    // Replay everything this driver would have missed: every unpartitioned
    // split routed so far, and every unpartitioned source already closed.
    let routing = inner.routing.lock();
    for (source_id, splits) in routing.unpartitioned_delivered.iter() {
        for scheduled in splits {
            if let Err(e) = driver.add_split(source_id, scheduled.split.clone()) {
                warn!(source_id = %source_id, error = %e, "failed to replay split into new driver");
            }
        }
    }
    for source_id in routing.closed_sources.iter() {
        if inner.partitioned_source.as_ref() != Some(source_id) {
            driver.no_more_splits(source_id);
        }
    }
    drop(routing);

    driver
}

/// Records the driver weakly, bumps `remainingDriverCount`, and submits it
/// to the executor. The completion future is awaited on a spawned task —
/// never under `routing`'s lock — so the routing mutex is never held
/// across a call into the external `TaskExecutor`.
fn spawn_driver(inner: &Arc<Inner>, driver: Arc<dyn Driver>, source_id: Option<PlanNodeId>) {
    {
        let mut routing = inner.routing.lock();
        routing.drivers.push(Arc::downgrade(&driver));
    }
    inner.remaining_driver_count.fetch_add(1, Ordering::SeqCst);
    inner.stats.lock().drivers_created += 1;

    let runner = Arc::new(DriverSplitRunner::from_driver(driver));
    let inner_clone = inner.clone();
    let executor = inner.executor.clone();
    let handle = inner.handle.clone();
    tokio::spawn(async move {
        let result = executor.add_split(&handle, runner).await;
        on_driver_complete(&inner_clone, result, source_id);
    });
}

fn on_driver_complete(inner: &Arc<Inner>, result: Result<()>, source_id: Option<PlanNodeId>) {
    let success = result.is_ok();
    let failure = result.as_ref().err().map(|e| e.to_string());
    if let Err(e) = &result {
        inner.state_machine.failed(FailureInfo::new(e.to_string()));
    }
    inner.remaining_driver_count.fetch_sub(1, Ordering::SeqCst);
    {
        let mut stats = inner.stats.lock();
        stats.drivers_completed += 1;
        if source_id.is_some() {
            stats.splits_processed += 1;
        }
    }
    try_close_partitioned_factory(inner);
    check_task_completion(inner);
    inner.monitor.split_completed(SplitCompletionEvent {
        task_id: inner.task_id.clone(),
        source_id,
        success,
        failure,
    });
}

/// Once no more partitioned splits will arrive *and* every enqueued driver
/// has completed, closes the partitioned factory. Deliberately later than
/// strictly necessary (closing once all drivers are created would
/// suffice) — a conservative simplification preserved from the original
/// design; harmless because the factory holds no per-driver live state.
fn try_close_partitioned_factory(inner: &Arc<Inner>) {
    let Some(factory) = &inner.partitioned_factory else {
        return;
    };
    if inner.partitioned_factory_closed.load(Ordering::SeqCst) {
        return;
    }
    if !inner.no_more_partitioned_splits.load(Ordering::SeqCst) {
        return;
    }
    if inner.remaining_driver_count.load(Ordering::SeqCst) != 0 {
        return;
    }
    if !inner.partitioned_factory_closed.swap(true, Ordering::SeqCst) {
        debug!(task_id = %inner.task_id, "closing partitioned driver factory");
        factory.close();
    }
}

/// Terminates the task iff: partitioned source absent or closed, no
/// drivers remain outstanding, and the shared buffer — once told to
/// finish — reports itself finished. `sharedBuffer.finish()` is safe to
/// call repeatedly; it is idempotent at the buffer.
fn check_task_completion(inner: &Arc<Inner>) -> bool {
    let state = inner.state_machine.state();
    if state.is_terminal() {
        return state == TaskState::Finished;
    }
    if state != TaskState::Running {
        return false;
    }
    let partitioned_done =
        inner.partitioned_source.is_none() || inner.no_more_partitioned_splits.load(Ordering::SeqCst);
    if !partitioned_done {
        return false;
    }
    if inner.remaining_driver_count.load(Ordering::SeqCst) != 0 {
        return false;
    }
    inner.shared_buffer.finish();
    if !inner.shared_buffer.is_finished() {
        return false;
    }
    inner.state_machine.finished()
}

fn add_sources(inner: &Arc<Inner>, updates: Vec<TaskSource>) -> Result<()> {
    if inner.state_machine.state().is_terminal() {
        debug!(task_id = %inner.task_id, "addSources on terminal task dropped");
        return Ok(());
    }

    for update in &updates {
        if !inner.known_sources.contains(&update.plan_node_id) {
            return Err(TaskError::UnknownSource(update.plan_node_id.to_string()));
        }
    }

    for update in updates {
        let mut newly_acknowledged = Vec::new();
        {
            let mut routing = inner.routing.lock();
            let max_ack_before = routing.max_acknowledged_split.get(&update.plan_node_id).copied();
            for scheduled in &update.splits {
                let should_route = match max_ack_before {
                    None => true,
                    Some(v) => scheduled.sequence_id > v,
                };
                if should_route {
                    newly_acknowledged.push((scheduled.sequence_id, scheduled.split.clone()));
                }
            }
            if let Some(batch_max) = update.splits.iter().map(|s| s.sequence_id).max() {
                let updated = match max_ack_before {
                    None => batch_max,
                    Some(v) => v.max(batch_max),
                };
                routing
                    .max_acknowledged_split
                    .insert(update.plan_node_id.clone(), updated);
            }
        }

        for (sequence_id, split) in newly_acknowledged {
            route_split(inner, update.plan_node_id.clone(), sequence_id, split);
        }

        if update.no_more_splits {
            close_source(inner, update.plan_node_id.clone());
        }
    }

    check_task_completion(inner);
    Ok(())
}

fn route_split(inner: &Arc<Inner>, source_id: PlanNodeId, sequence_id: u64, split: Split) {
    if inner.partitioned_source.as_ref() == Some(&source_id) {
        let Some(factory) = inner.partitioned_factory.clone() else {
            warn!(source_id = %source_id, "split routed for partitioned source with no matching factory");
            return;
        };
        let driver = build_driver(factory.as_ref(), inner, Some((source_id.clone(), split)));
        spawn_driver(inner, driver, Some(source_id));
        return;
    }

    let is_duplicate = {
        let mut routing = inner.routing.lock();
        let seen = routing.unpartitioned_seen.entry(source_id.clone()).or_default();
        if !seen.insert(sequence_id) {
            true
        } else {
            routing
                .unpartitioned_delivered
                .entry(source_id.clone())
                .or_default()
                .push(ScheduledSplit::new(sequence_id, split.clone()));
            false
        }
    };
    if is_duplicate {
        return;
    }

    let mut routing = inner.routing.lock();
    routing.drivers.retain(|weak| match weak.upgrade() {
        Some(driver) => {
            if let Err(e) = driver.add_split(&source_id, split.clone()) {
                warn!(source_id = %source_id, error = %e, "failed to fan out split to driver");
            }
            true
        }
        None => false,
    });
}

fn close_source(inner: &Arc<Inner>, source_id: PlanNodeId) {
    let is_partitioned = inner.partitioned_source.as_ref() == Some(&source_id);
    let already_closed = {
        let mut routing = inner.routing.lock();
        let newly_closed = routing.closed_sources.insert(source_id.clone());
        if newly_closed && !is_partitioned {
            routing.drivers.retain(|weak| match weak.upgrade() {
                Some(driver) => {
                    driver.no_more_splits(&source_id);
                    true
                }
                None => false,
            });
        }
        !newly_closed
    };
    if already_closed {
        return;
    }
    if is_partitioned {
        inner.no_more_partitioned_splits.store(true, Ordering::SeqCst);
        try_close_partitioned_factory(inner);
    }
}

fn add_result_queue(inner: &Arc<Inner>, outputs: OutputBuffers) -> Result<()> {
    for id in outputs.buffer_ids {
        inner.shared_buffer.add_queue(id)?;
    }
    if outputs.no_more_buffer_ids {
        inner.shared_buffer.no_more_queues();
    }
    check_task_completion(inner);
    Ok(())
}

fn get_task_info(inner: &Arc<Inner>) -> TaskInfo {
    check_task_completion(inner);
    let version = inner.version.next();
    let state = inner.state_machine.state();
    let failures = inner.state_machine.failures();
    let closed_sources = inner.routing.lock().closed_sources.clone();
    let stats = inner.stats.lock().clone();
    let last_heartbeat = *inner.last_heartbeat.lock();

    TaskInfo {
        task_id: inner.task_id.clone(),
        version,
        state,
        uri: inner.uri.clone(),
        last_heartbeat,
        buffer: BufferSummary {
            finished: inner.shared_buffer.is_finished(),
            consumer_acknowledgements: inner.shared_buffer.queue_acknowledgements(),
        },
        closed_sources,
        stats,
        failures,
    }
}
