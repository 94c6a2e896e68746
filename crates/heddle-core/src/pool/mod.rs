//! Pool - 有界ワーカープール
//!
//! 固定数の execution unit に task を振り分け、結果を呼び出し元へ返す。
//!
//! # 構成
//! - **registry**: unit の集合と idle / busy の管理、FIFO の取得待ち行列
//! - **lease**: 1 unit と 1 task の組み合わせ（timeout・応答の突き合わせ）
//! - **supervisor**: 定期的な生存確認と unit の入れ替え
//! - **backoff**: 入れ替えに失敗した slot の再試行間隔

mod backoff;
mod lease;
mod registry;
mod supervisor;


use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use self::backoff::ReplacementPolicy;
pub use self::supervisor::HealthReport;

pub(crate) use self::registry::StartError;

use self::registry::PoolRegistry;
use self::supervisor::HealthSupervisor;
use crate::config::PoolConfig;
use crate::domain::{ErrorKind, HandlerError, HandlerKind, TaskEnvelope, TaskResult};
use crate::error::{ExecutionFailure, PoolError};
use crate::observability::{PoolStats, ResourceMonitor};
use crate::ports::{IdGenerator, UnitFactory};
use crate::typed::Task;

/// Handle to a running worker pool. Cheap to clone; all clones share the
/// same units.
///
/// # 使用例
/// ```ignore
/// let pool = PoolBuilder::new()
///     .register::<RenderTemplate, RenderHandler>()?
///     .capacity(4)
///     .build()?;
///
/// let results = pool.submit_batch(tasks).await;
/// pool.destroy().await;
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    registry: Arc<PoolRegistry>,
    supervisor: Arc<HealthSupervisor>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    monitor: ResourceMonitor,
    ids: Arc<dyn IdGenerator>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Spawn `config.capacity` units and the health supervisor on `runtime`.
    pub(crate) fn start(
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
        ids: Arc<dyn IdGenerator>,
        monitor: ResourceMonitor,
        expected_kinds: &[String],
        runtime: Handle,
    ) -> Result<Self, StartError> {
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();
        let registry = PoolRegistry::start(
            config.capacity,
            factory,
            Arc::clone(&ids),
            runtime.clone(),
            crash_tx,
            config.replacement.clone(),
            expected_kinds,
        )?;

        let supervisor = Arc::new(HealthSupervisor::new(
            Arc::clone(&registry),
            config.health_interval,
            config.probe_timeout,
            config.effective_stall_after(),
        ));
        let shutdown = CancellationToken::new();
        let supervisor_task = runtime.spawn(
            Arc::clone(&supervisor).supervise(crash_rx, shutdown.clone()),
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                registry,
                supervisor,
                supervisor_task: Mutex::new(Some(supervisor_task)),
                shutdown,
                monitor,
                ids,
                config,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Build a task with a freshly minted id.
    pub fn new_task(
        &self,
        handler_kind: impl Into<HandlerKind>,
        payload: serde_json::Value,
    ) -> TaskEnvelope {
        TaskEnvelope::new(self.inner.ids.generate_task_id(), handler_kind.into(), payload)
    }

    /// Run one task and wait for its result. Any failure (acquisition,
    /// timeout, handler error, destroyed pool) is returned as the error.
    pub async fn submit(&self, task: TaskEnvelope) -> Result<TaskResult, PoolError> {
        let result = self.run(task).await;
        match result.outcome {
            Ok(_) => Ok(result),
            Err(error) => Err(error),
        }
    }

    /// Serialize `task`, run it on the handler registered for `T::TYPE` and
    /// decode the output.
    pub async fn submit_typed<T: Task>(&self, task: &T) -> Result<T::Output, PoolError> {
        let task_id = self.inner.ids.generate_task_id();
        let invalid = |message: String| PoolError::TaskExecution {
            task_id,
            failure: ExecutionFailure::Handler(HandlerError::new(
                ErrorKind::InvalidPayload,
                message,
            )),
        };

        let payload = serde_json::to_value(task)
            .map_err(|e| invalid(format!("failed to encode {}: {e}", T::TYPE)))?;
        let envelope = TaskEnvelope::new(task_id, HandlerKind::new(T::TYPE), payload);

        let output = self.run(envelope).await.outcome?;
        serde_json::from_value(output)
            .map_err(|e| invalid(format!("failed to decode output of {}: {e}", T::TYPE)))
    }

    /// Run every task concurrently and collect one result per task, in input
    /// order. A failing task never affects its siblings.
    pub async fn submit_batch(&self, tasks: Vec<TaskEnvelope>) -> Vec<TaskResult> {
        let total = tasks.len();
        tracing::debug!(total, "submitting batch");

        // join_all polls in input order, so waiters queue in input order too
        let results = join_all(tasks.into_iter().map(|task| self.run(task))).await;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        tracing::debug!(total, failed, "batch finished");
        results
    }

    async fn run(&self, task: TaskEnvelope) -> TaskResult {
        lease::dispatch(
            &self.inner.registry,
            &self.inner.monitor,
            self.inner.config.task_timeout,
            self.inner.config.acquire_timeout,
            task,
        )
        .await
    }

    pub fn stats(&self) -> PoolStats {
        let counts = self.inner.registry.counts();
        PoolStats {
            capacity: counts.capacity,
            active: counts.active,
            idle: counts.idle,
            vacant: counts.vacant,
            queued: counts.queued,
            completed: counts.completed,
            failed: counts.failed,
            replaced: counts.replaced,
            memory: self.inner.monitor.snapshot(),
        }
    }

    /// Run one supervision round now. Recovery happens either way; the
    /// return value says whether anything needed recovering.
    pub async fn health_check(&self) -> bool {
        self.health_report().await.is_some_and(|r| r.is_healthy())
    }

    /// Like [`health_check`](Self::health_check), with the details.
    /// `None` once the pool is destroyed.
    pub async fn health_report(&self) -> Option<HealthReport> {
        if self.inner.registry.is_destroyed() {
            return None;
        }
        Some(self.inner.supervisor.run_round().await)
    }

    /// Stop the supervisor, reject queued acquirers and terminate every
    /// unit. Calling it again does nothing.
    pub async fn destroy(&self) {
        if !self.inner.registry.shut_down() {
            return;
        }
        self.inner.shutdown.cancel();

        let supervisor_task = self.inner.supervisor_task.lock().take();
        if let Some(task) = supervisor_task
            && let Err(err) = task.await
            && err.is_panic()
        {
            tracing::error!(error = %err, "health supervisor panicked");
        }

        let stats = self.inner.registry.counts();
        tracing::info!(
            completed = stats.completed,
            failed = stats.failed,
            replaced = stats.replaced,
            "worker pool destroyed"
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.registry.is_destroyed()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.shut_down();
    }
}
