//! Result model: one `TaskResult` per submitted task.
//!
//! A result is built exactly once, by the dispatcher, either from a unit
//! response or from a locally raised error (timeout, acquisition failure,
//! destroyed pool).

use std::time::Duration;

use super::TaskId;
use crate::error::PoolError;
use crate::observability::ResourceSnapshot;

/// Outcome of one task, successful or not.
///
/// `duration` is measured from the moment the unit received the task. It is
/// zero when the task failed before execution began (no unit acquired).
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub outcome: Result<serde_json::Value, PoolError>,
    pub duration: Duration,
    pub resources: ResourceSnapshot,
}

impl TaskResult {
    pub fn success(
        task_id: TaskId,
        output: serde_json::Value,
        duration: Duration,
        resources: ResourceSnapshot,
    ) -> Self {
        Self {
            task_id,
            outcome: Ok(output),
            duration,
            resources,
        }
    }

    pub fn failure(
        task_id: TaskId,
        error: PoolError,
        duration: Duration,
        resources: ResourceSnapshot,
    ) -> Self {
        Self {
            task_id,
            outcome: Err(error),
            duration,
            resources,
        }
    }

    /// Failure raised before any unit started working on the task.
    pub fn rejected(task_id: TaskId, error: PoolError, resources: ResourceSnapshot) -> Self {
        Self::failure(task_id, error, Duration::ZERO, resources)
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn output(&self) -> Option<&serde_json::Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PoolError> {
        self.outcome.as_ref().err()
    }
}
