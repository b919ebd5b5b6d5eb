//! Driver / DriverFactory contracts. The data-flow engine behind a Driver
//! (operators, pages, memory accounting) is a black box to this crate —
//! only the `processFor` cooperative-scheduling contract matters here.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::task::buffer::SharedOutputBuffer;
use crate::task::types::PlanNodeId;

/// Outcome of one `process_for` quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverProcessOutcome {
    /// The driver has no more work; it is finished.
    Finished,
    /// The quantum elapsed or the driver blocked; reschedule it.
    Blocked,
}

/// One execution pipeline instance. Splits are fed in and the driver is run
/// cooperatively by the worker pool via repeated `process_for` calls.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Gives the driver one more unit of work for the named source.
    fn add_split(&self, source_id: &PlanNodeId, split: crate::task::types::Split) -> Result<()>;

    /// Closes a source; idempotent.
    fn no_more_splits(&self, source_id: &PlanNodeId);

    /// Runs cooperatively until finished, blocked, or `budget` elapses.
    async fn process_for(&self, budget: Duration) -> Result<DriverProcessOutcome>;

    fn is_finished(&self) -> bool;
}

impl fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Per-driver construction context: which sources this driver consumes and
/// whether it reads from / writes to the task boundary. An output driver is
/// hosted with a handle to the task's shared output buffer so it can push
/// pages directly; the core never inspects page contents itself.
#[derive(Clone)]
pub struct DriverContext {
    pub input_sources: Vec<PlanNodeId>,
    pub is_input_driver: bool,
    pub is_output_driver: bool,
    pub output_buffer: Option<Arc<SharedOutputBuffer>>,
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("input_sources", &self.input_sources)
            .field("is_input_driver", &self.is_input_driver)
            .field("is_output_driver", &self.is_output_driver)
            .finish()
    }
}

/// Builds Driver instances for one pipeline shape in the fragment.
/// `close()` releases compile-time resources once no more drivers will be
/// created from this factory.
pub trait DriverFactory: Send + Sync {
    /// Source ids this factory's drivers consume.
    fn source_ids(&self) -> &[PlanNodeId];

    fn is_input_driver(&self) -> bool;

    fn is_output_driver(&self) -> bool;

    /// Builds one Driver instance bound to `ctx`.
    fn create_driver(&self, ctx: DriverContext) -> Box<dyn Driver>;

    /// Releases compile-time resources. Safe to call once all drivers from
    /// this factory have been created (or, conservatively, once they have
    /// also all completed — see the partitioned-factory close note).
    fn close(&self);
}
