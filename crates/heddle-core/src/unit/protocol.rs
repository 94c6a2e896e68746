//! Messages exchanged between the pool and one execution unit.
//!
//! A unit has exactly one request channel and one response channel. Closing
//! the request channel asks the unit to stop.

use crate::domain::{HandlerError, HandlerKind, TaskId};

/// Pool → unit.
#[derive(Debug)]
pub enum UnitRequest {
    Run {
        task_id: TaskId,
        handler_kind: HandlerKind,
        payload: serde_json::Value,
    },
    Ping,
}

/// Unit → pool.
#[derive(Debug)]
pub enum UnitResponse {
    Completed {
        task_id: TaskId,
        output: serde_json::Value,
    },
    Failed {
        task_id: TaskId,
        error: HandlerError,
    },
    Pong,
}

impl UnitResponse {
    /// Task this response answers, `None` for a probe echo.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            UnitResponse::Completed { task_id, .. } | UnitResponse::Failed { task_id, .. } => {
                Some(*task_id)
            }
            UnitResponse::Pong => None,
        }
    }
}
