//! QueryMonitor — minimal split-completion event sink. Real metrics/event
//! plumbing is out of scope (spec §1); this trait exists so the
//! orchestrator has somewhere to emit completion events without inventing a
//! full observability stack.

use tracing::{info, warn};

use crate::task::types::SplitCompletionEvent;

pub trait QueryMonitor: Send + Sync {
    fn split_completed(&self, event: SplitCompletionEvent);
}

/// Default monitor: logs every completion via `tracing`.
#[derive(Debug, Default)]
pub struct TracingQueryMonitor;

impl QueryMonitor for TracingQueryMonitor {
    fn split_completed(&self, event: SplitCompletionEvent) {
        if event.success {
            info!(
                task_id = %event.task_id,
                source_id = ?event.source_id,
                "split completed"
            );
        } else {
            warn!(
                task_id = %event.task_id,
                source_id = ?event.source_id,
                failure = ?event.failure,
                "split completed with failure"
            );
        }
    }
}
