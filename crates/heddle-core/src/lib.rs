//! heddle-core
//!
//! Bounded worker pool: a fixed set of isolated execution units, a FIFO
//! acquisition queue, per-task timeouts and a health supervisor that keeps
//! the pool at full strength.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task envelope, result, handler errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, UnitFactory）
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **unit**: 実行ユニットのメッセージとループ
//! - **pool**: WorkerPool（registry, dispatcher, supervisor, batch）
//! - **app**: PoolBuilder（構築と起動時検証）
//! - **config / error / observability**: 設定、エラー型、統計

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod typed;
pub mod unit;

pub use app::{BuildError, PoolBuilder};
pub use config::{ConfigError, PoolConfig};
pub use domain::{ErrorKind, HandlerError, HandlerKind, TaskEnvelope, TaskId, TaskResult, UnitId};
pub use error::{ExecutionFailure, PoolError, UnitInitError};
pub use observability::{PoolStats, ResourceSnapshot};
pub use pool::{HealthReport, ReplacementPolicy, WorkerPool};
pub use typed::{BlockingHandler, Handler, HandlerRegistry, Task};
