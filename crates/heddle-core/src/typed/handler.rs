//! Handler trait - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<T, H> → DynHandler)
//! - 同期 handler を spawn_blocking に逃がす (BlockingTypedHandler)

use super::task::Task;
use crate::domain::errors::{ErrorKind, HandlerError};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

/// Handler は Task を実行して `T::Output` を返す
///
/// 実行ユニットごとに別インスタンスが作られるので、`&self` の内部に
/// キャッシュを持ってもユニット間で共有されない。
///
/// `handle` は共有ランタイムのワーカースレッド上で poll される。
/// スレッドを止める処理（CPU バウンドな計算、同期 I/O、`std::thread::sleep`）
/// を書くと、タイムアウトやヘルスチェックのタイマーまで遅れる。
/// そういう処理は [`BlockingHandler`] として登録すること。
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// payload / output は `serde_json::Value` のまま扱う。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError>;

    fn handler_kind(&self) -> &str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let task: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(ErrorKind::InvalidPayload, format!("json decode: {e}")))?;
        let output = self.handler.handle(task).await?;
        serde_json::to_value(output)
            .map_err(|e| HandlerError::permanent(format!("json encode: {e}")))
    }

    fn handler_kind(&self) -> &str {
        T::TYPE
    }
}

/// BlockingHandler は同期の（スレッドを止める）Handler
///
/// 各呼び出しは `tokio::task::spawn_blocking` で専用スレッドに載る。
/// タイムアウトで unit が入れ替えられても、走り出した `handle` は
/// そのスレッドで最後まで走り、結果は捨てられる。
pub trait BlockingHandler<T: Task>: Send + Sync + 'static {
    fn handle(&self, task: T) -> Result<T::Output, HandlerError>;
}

pub struct BlockingTypedHandler<T: Task, H: BlockingHandler<T>> {
    handler: Arc<H>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: BlockingHandler<T>> BlockingTypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: BlockingHandler<T>> DynHandler for BlockingTypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        let task: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(ErrorKind::InvalidPayload, format!("json decode: {e}")))?;

        let handler = Arc::clone(&self.handler);
        let output = match tokio::task::spawn_blocking(move || handler.handle(task)).await {
            Ok(result) => result?,
            // unit のタスクごと落として、crash として扱わせる
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                return Err(HandlerError::permanent(format!(
                    "blocking handler cancelled: {err}"
                )));
            }
        };

        serde_json::to_value(output)
            .map_err(|e| HandlerError::permanent(format!("json encode: {e}")))
    }

    fn handler_kind(&self) -> &str {
        T::TYPE
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{Greet, Nap, Spin};
    use std::time::Duration;

    #[derive(Default)]
    pub struct GreetHandler;

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn handle(&self, task: Greet) -> Result<String, HandlerError> {
            Ok(format!("Hello, {}!", task.name))
        }
    }

    /// Sleeps for the requested time, then answers with the same number.
    #[derive(Default)]
    pub struct NapHandler;

    #[async_trait]
    impl Handler<Nap> for NapHandler {
        async fn handle(&self, task: Nap) -> Result<u64, HandlerError> {
            tokio::time::sleep(Duration::from_millis(task.millis)).await;
            if task.fail {
                return Err(HandlerError::permanent("nap interrupted"));
            }
            Ok(task.millis)
        }
    }

    /// Holds its thread for the requested time, like a CPU-bound renderer.
    #[derive(Default)]
    pub struct SpinHandler;

    impl BlockingHandler<Spin> for SpinHandler {
        fn handle(&self, task: Spin) -> Result<u64, HandlerError> {
            std::thread::sleep(Duration::from_millis(task.millis));
            Ok(task.millis)
        }
    }
}
