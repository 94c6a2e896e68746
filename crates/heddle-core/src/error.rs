use std::time::Duration;

use thiserror::Error;

use crate::domain::{HandlerError, TaskId};
use crate::typed::RegistryError;

/// Errors surfaced to callers of the pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no execution unit became available within {waited:?}")]
    AcquisitionTimeout { waited: Duration },

    #[error("task {task_id} did not finish within {timeout:?}")]
    TaskTimeout { task_id: TaskId, timeout: Duration },

    #[error("task {task_id} failed: {failure}")]
    TaskExecution {
        task_id: TaskId,
        failure: ExecutionFailure,
    },

    #[error("worker pool has been destroyed")]
    PoolDestroyed,

    #[error("could not replace execution unit in slot {slot} after {attempts} attempt(s): {reason}")]
    ReplacementFailed {
        slot: usize,
        attempts: u32,
        reason: String,
    },
}

/// Why a task that reached a unit did not produce an output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFailure {
    /// The handler ran and returned an error.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The unit went away (crash, forced replacement) before answering.
    #[error("execution unit terminated before responding")]
    UnitTerminated,
}

/// Failure to construct the private state of a new execution unit.
#[derive(Debug, Error)]
pub enum UnitInitError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_failure_message_is_forwarded() {
        let err = PoolError::TaskExecution {
            task_id: TaskId::generate(),
            failure: HandlerError::permanent("bad template").into(),
        };
        assert!(err.to_string().contains("bad template"));
    }
}
