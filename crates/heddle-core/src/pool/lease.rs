//! Task dispatcher: acquire a unit, hand it one task, correlate the answer,
//! enforce the timeout and give the unit back (or have it replaced).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::registry::{PoolRegistry, UnitHandle};
use crate::domain::{TaskEnvelope, TaskId, TaskResult, UnitId};
use crate::error::{ExecutionFailure, PoolError};
use crate::observability::ResourceMonitor;
use crate::unit::{UnitRequest, UnitResponse};

/// Exclusive use of one execution unit.
///
/// Dropping the lease gives the unit back. If a task was sent and no answer
/// was read yet, the unit may still be working on it, so it is replaced
/// instead.
pub(crate) struct UnitLease {
    unit: Option<UnitHandle>,
    registry: Arc<PoolRegistry>,
    in_flight: bool,
}

impl UnitLease {
    pub(crate) fn new(unit: UnitHandle, registry: Arc<PoolRegistry>) -> Self {
        Self {
            unit: Some(unit),
            registry,
            in_flight: false,
        }
    }

    fn unit_mut(&mut self) -> Option<&mut UnitHandle> {
        self.unit.as_mut()
    }

    pub(crate) fn slot(&self) -> Option<usize> {
        self.unit.as_ref().map(|u| u.slot)
    }

    pub(crate) fn unit_id(&self) -> Option<UnitId> {
        self.unit.as_ref().map(|u| u.unit_id)
    }

    /// Send `task` to the unit and wait for the matching response.
    pub(crate) async fn execute(
        &mut self,
        task: TaskEnvelope,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, PoolError> {
        let task_id = task.task_id();
        let handler_kind = task.handler_kind().clone();
        let payload = task.into_payload();

        let Some(unit) = self.unit.as_ref() else {
            return Err(terminated(task_id));
        };
        self.registry
            .begin_task(unit.slot, unit.generation, task_id);
        self.in_flight = true;

        let exchange = async {
            let unit = self.unit_mut().ok_or(ExecutionFailure::UnitTerminated)?;
            unit.requests
                .send(UnitRequest::Run {
                    task_id,
                    handler_kind,
                    payload,
                })
                .await
                .map_err(|_| ExecutionFailure::UnitTerminated)?;
            await_response(unit, task_id).await
        };

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(PoolError::TaskTimeout {
                        task_id,
                        timeout: limit,
                    });
                }
            },
            None => exchange.await,
        };

        match result {
            Ok(output) => {
                self.in_flight = false;
                Ok(output)
            }
            Err(ExecutionFailure::Handler(error)) => {
                self.in_flight = false;
                Err(PoolError::TaskExecution {
                    task_id,
                    failure: ExecutionFailure::Handler(error),
                })
            }
            Err(ExecutionFailure::UnitTerminated) if self.registry.is_destroyed() => {
                Err(PoolError::PoolDestroyed)
            }
            Err(ExecutionFailure::UnitTerminated) => Err(terminated(task_id)),
        }
    }

    /// Ping the unit. `false` if it did not echo within `limit`.
    pub(crate) async fn probe(&mut self, limit: Duration) -> bool {
        let Some(unit) = self.unit_mut() else {
            return false;
        };

        let exchange = async {
            if unit.requests.send(UnitRequest::Ping).await.is_err() {
                return false;
            }
            loop {
                match unit.responses.recv().await {
                    Some(UnitResponse::Pong) => return true,
                    // late answer to a task that was given up on
                    Some(other) => {
                        tracing::debug!(unit_id = %unit.unit_id, task_id = ?other.task_id(), "discarding stale response");
                    }
                    None => return false,
                }
            }
        };

        tokio::time::timeout(limit, exchange).await.unwrap_or(false)
    }

    /// Give the unit back to the registry.
    pub(crate) fn release(mut self) {
        self.in_flight = false;
        // Drop does the work
    }

    /// Terminate the unit and have the registry install a fresh one.
    pub(crate) fn replace(mut self, reason: &str) {
        if let Some(unit) = self.unit.take() {
            self.registry.replace(unit.slot, unit.generation, reason);
        }
    }
}

impl Drop for UnitLease {
    fn drop(&mut self) {
        let Some(unit) = self.unit.take() else {
            return;
        };
        if self.in_flight {
            self.registry
                .replace(unit.slot, unit.generation, "lease dropped with a task in flight");
        } else {
            self.registry.release(unit);
        }
    }
}

async fn await_response(
    unit: &mut UnitHandle,
    task_id: TaskId,
) -> Result<serde_json::Value, ExecutionFailure> {
    loop {
        match unit.responses.recv().await {
            Some(UnitResponse::Completed { task_id: id, output }) if id == task_id => {
                return Ok(output);
            }
            Some(UnitResponse::Failed { task_id: id, error }) if id == task_id => {
                return Err(ExecutionFailure::Handler(error));
            }
            Some(UnitResponse::Pong) => {
                tracing::debug!(unit_id = %unit.unit_id, "ignoring probe echo while running a task");
            }
            Some(other) => {
                tracing::warn!(
                    unit_id = %unit.unit_id,
                    expected = %task_id,
                    got = ?other.task_id(),
                    "ignoring response for another task"
                );
            }
            None => return Err(ExecutionFailure::UnitTerminated),
        }
    }
}

fn terminated(task_id: TaskId) -> PoolError {
    PoolError::TaskExecution {
        task_id,
        failure: ExecutionFailure::UnitTerminated,
    }
}

/// Run one task end to end. Never fails: every outcome becomes a
/// [`TaskResult`].
pub(crate) async fn dispatch(
    registry: &Arc<PoolRegistry>,
    monitor: &ResourceMonitor,
    default_timeout: Option<Duration>,
    acquire_timeout: Option<Duration>,
    task: TaskEnvelope,
) -> TaskResult {
    let task_id = task.task_id();
    let timeout = task.timeout().or(default_timeout);

    let mut lease = match registry.acquire(acquire_timeout).await {
        Ok(lease) => lease,
        Err(error) => {
            tracing::debug!(%task_id, %error, "task rejected before execution");
            registry.record_outcome(false);
            return TaskResult::rejected(task_id, error, monitor.snapshot());
        }
    };

    let unit_id = lease.unit_id();
    let slot = lease.slot();
    tracing::debug!(%task_id, handler_kind = %task.handler_kind(), ?unit_id, ?slot, "dispatching task");

    let started = Instant::now();
    let outcome = lease.execute(task, timeout).await;
    let duration = started.elapsed();

    match &outcome {
        Ok(_) => lease.release(),
        Err(PoolError::TaskExecution {
            failure: ExecutionFailure::Handler(error),
            ..
        }) => {
            tracing::debug!(%task_id, ?unit_id, %error, "handler returned an error");
            lease.release();
        }
        Err(PoolError::TaskTimeout { timeout, .. }) => {
            tracing::warn!(%task_id, ?unit_id, ?timeout, "task timed out, replacing unit");
            lease.replace("task timed out");
        }
        Err(error) => {
            tracing::warn!(%task_id, ?unit_id, %error, "unit failed while running task");
            lease.replace("unit terminated during task");
        }
    }

    registry.record_outcome(outcome.is_ok());
    let resources = monitor.snapshot();
    match outcome {
        Ok(output) => TaskResult::success(task_id, output, duration, resources),
        Err(error) => TaskResult::failure(task_id, error, duration, resources),
    }
}
