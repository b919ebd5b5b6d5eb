//! DriverSplitRunner — adapts a Driver to the shape the worker pool
//! schedules: `is_finished`, `process_for`. Also tracks a driver's terminal
//! failure, if any, so a caller awaiting completion through `TaskExecutor`
//! can observe it rather than just seeing the runner silently dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TaskError};
use crate::task::driver::{Driver, DriverProcessOutcome};
use crate::task::types::{PlanNodeId, Split};

/// Wraps one Driver for submission to a `TaskExecutor`.
pub struct DriverSplitRunner {
    driver: Arc<dyn Driver>,
    failure: Mutex<Option<TaskError>>,
}

impl DriverSplitRunner {
    pub fn from_driver(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            failure: Mutex::new(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.driver.is_finished()
    }

    /// Records a quantum failure. `TaskExecutor::add_split` polls this so
    /// its returned future resolves with the error instead of waiting
    /// forever for an `is_finished()` that a failed driver may never reach.
    pub fn record_failure(&self, err: TaskError) {
        *self.failure.lock() = Some(err);
    }

    pub fn failure(&self) -> Option<TaskError> {
        self.failure.lock().clone()
    }

    pub async fn process_for(&self, budget: Duration) -> Result<DriverProcessOutcome> {
        self.driver.process_for(budget).await
    }

    pub fn add_split(&self, source_id: &PlanNodeId, split: Split) -> Result<()> {
        self.driver.add_split(source_id, split)
    }

    pub fn no_more_splits(&self, source_id: &PlanNodeId) {
        self.driver.no_more_splits(source_id)
    }
}
