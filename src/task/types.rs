//! Core identifiers and wire-shaped data types for the task execution core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque task identifier, used as a handle key and logged on every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a source (scan operator) within a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanNodeId(pub String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle state. The last four variants are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Failed,
    Aborted,
}

impl TaskState {
    /// True for any of the four absorbing states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Failed | TaskState::Aborted
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Planned => "PLANNED",
            TaskState::Running => "RUNNING",
            TaskState::Finished => "FINISHED",
            TaskState::Canceled => "CANCELED",
            TaskState::Failed => "FAILED",
            TaskState::Aborted => "ABORTED",
        };
        write!(f, "{}", s)
    }
}

/// Opaque descriptor of one input unit of work for a source. The core never
/// interprets the payload; it is passed through to driver/operator code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Split {
    pub payload: Vec<u8>,
}

impl Split {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// A split tagged with its monotone per-source sequence id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledSplit {
    pub sequence_id: u64,
    pub split: Split,
}

impl ScheduledSplit {
    pub fn new(sequence_id: u64, split: Split) -> Self {
        Self { sequence_id, split }
    }
}

/// One batch of splits for one source, as delivered by `addSources`.
///
/// Batches may repeat previously acknowledged sequence ids; the task
/// deduplicates against `maxAcknowledgedSplit` before routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSource {
    pub plan_node_id: PlanNodeId,
    pub splits: Vec<ScheduledSplit>,
    pub no_more_splits: bool,
}

/// One buffer id to register, as delivered by `addResultQueue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputBufferId(pub String);

impl fmt::Display for OutputBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch of output buffer registrations, as delivered by `addResultQueue`.
/// `no_more_buffer_ids` is sticky: once set on any call, later ids are
/// rejected by the buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBuffers {
    pub buffer_ids: Vec<OutputBufferId>,
    pub no_more_buffer_ids: bool,
}

/// A single recorded task failure cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Per-driver split-completion event delivered to a `QueryMonitor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitCompletionEvent {
    pub task_id: TaskId,
    pub source_id: Option<PlanNodeId>,
    pub success: bool,
    pub failure: Option<String>,
}

/// Monotone version counter backing `TaskInfo` snapshots.
///
/// A thin wrapper over an atomic fetch-and-add so every call site reads the
/// same "next version" semantics instead of hand-rolling the ordering.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
