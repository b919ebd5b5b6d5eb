//! Task-level execution core: drivers, splits, buffers, the cooperative
//! scheduler, and the orchestrator tying them together.

pub mod buffer;
pub mod driver;
pub mod executor;
pub mod execution;
pub mod fragment;
pub mod info;
pub mod monitor;
pub mod split_runner;
pub mod state_machine;
pub mod types;

pub use buffer::{BufferResult, Page, SharedOutputBuffer};
pub use driver::{Driver, DriverContext, DriverFactory, DriverProcessOutcome};
pub use execution::TaskExecution;
pub use executor::{TaskExecutor, TaskHandle, TokioTaskExecutor};
pub use fragment::Fragment;
pub use info::{BufferSummary, TaskInfo, TaskStats};
pub use monitor::{QueryMonitor, TracingQueryMonitor};
pub use split_runner::DriverSplitRunner;
pub use state_machine::TaskStateMachine;
pub use types::{
    FailureInfo, OutputBufferId, OutputBuffers, PlanNodeId, ScheduledSplit, Split,
    SplitCompletionEvent, TaskId, TaskSource, TaskState, VersionCounter,
};
