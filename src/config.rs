use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a `TaskExecution`.
///
/// Constructed by the host process however it sees fit (config file, env,
/// hardcoded defaults); this crate neither reads nor validates any external
/// configuration format itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionConfig {
    /// Soft cap, in bytes, on pages retained in the shared output buffer.
    pub max_buffer_size_bytes: u64,
    /// Soft cap, in bytes, on memory a task's drivers may use.
    pub max_task_memory_bytes: u64,
    /// Bytes pre-allocated per operator before it must request more.
    pub operator_pre_allocated_bytes: u64,
    /// Wall-clock budget handed to `Driver::process_for` per schedule.
    pub processing_quantum: Duration,
    /// Worker thread count for the reference `TokioTaskExecutor`.
    pub worker_threads: usize,
}

impl Default for TaskExecutionConfig {
    fn default() -> Self {
        Self {
            max_buffer_size_bytes: 32 * 1024 * 1024,
            max_task_memory_bytes: 512 * 1024 * 1024,
            operator_pre_allocated_bytes: 1 * 1024 * 1024,
            processing_quantum: Duration::from_secs(1),
            worker_threads: num_cpus::get(),
        }
    }
}
