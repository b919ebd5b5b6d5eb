//! TaskInfo snapshotter — versioned, lock-consistent view of a task for
//! polling clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::task::types::{FailureInfo, OutputBufferId, PlanNodeId, TaskId, TaskState};

/// Minimal collective driver statistics. A full implementation would roll
/// these up from each driver's operator stats; that rollup lives in the
/// data-flow engine this crate treats as a black box (spec §1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub drivers_created: u64,
    pub drivers_completed: u64,
    pub splits_processed: u64,
}

/// Summary of the shared output buffer, embedded in `TaskInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSummary {
    pub finished: bool,
    /// Per-queue acknowledged-through sequence id, keyed by output buffer.
    pub consumer_acknowledgements: HashMap<OutputBufferId, u64>,
}

/// A consistent, versioned snapshot of one task. The version is minted
/// *after* a completion check runs, so a client observing a terminal state
/// at version V is guaranteed never to see an earlier, non-terminal version
/// with a higher number (spec invariant: monotone versions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub version: u64,
    pub state: TaskState,
    pub uri: String,
    pub last_heartbeat: DateTime<Utc>,
    pub buffer: BufferSummary,
    pub closed_sources: HashSet<PlanNodeId>,
    pub stats: TaskStats,
    pub failures: Vec<FailureInfo>,
}
