//! HandlerRegistry - Handler の登録と管理
//!
//! 実行ユニットは 1 つずつ自分の HandlerRegistry を持つ。
//! 構築時は mutable、ユニットに渡した後は読み取り専用。

use crate::typed::handler::{BlockingTypedHandler, TypedHandler};

use super::handler::{BlockingHandler, DynHandler, Handler};
use super::task::Task;
use std::collections::HashMap;
use std::sync::Arc;

/// HandlerRegistry は型付き Handler を handler_kind ごとに保持する
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<RenderModel, _>(RenderModelHandler::default())?;
/// let handler = registry.get("codegen.model.render.v1");
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynHandler>>,
}

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::new(handler)))
    }

    /// 同期 handler を登録（実行は spawn_blocking 上）
    pub fn register_blocking<T: Task, H: BlockingHandler<T>>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(BlockingTypedHandler::new(handler)))
    }

    /// 型消去済みの handler をそのまま登録する（handler_kind は handler 自身が申告）
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let kind = handler.handler_kind().to_string();
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, handler_kind: &str) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(handler_kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
