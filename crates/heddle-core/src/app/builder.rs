//! PoolBuilder - ワーカープールの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ユニットごとに handler を作り直す factory の合成

use std::collections::HashSet;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::{ConfigError, PoolConfig};
use crate::error::UnitInitError;
use crate::observability::ResourceMonitor;
use crate::pool::{StartError, WorkerPool};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator, UnitFactory};
use crate::typed::{BlockingHandler, Handler, HandlerRegistry, RegistryError, Task};

type Registration = Arc<dyn Fn(&mut HandlerRegistry) -> Result<(), RegistryError> + Send + Sync>;

/// PoolBuilder は WorkerPool を構築
///
/// # 使用例
/// ```ignore
/// let pool = PoolBuilder::new()
///     .register::<RenderModel, RenderModelHandler>()?
///     .expect_kinds(&["codegen.model.render.v1"])
///     .capacity(4)
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_kinds() で期待される handler_kind を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 初期ユニットが 1 つでも作れなければ BuildError を返す
pub struct PoolBuilder {
    config: PoolConfig,
    factory: Option<Arc<dyn UnitFactory>>,
    registrations: Vec<Registration>,
    registered_kinds: HashSet<String>,
    expected_kinds: Option<Vec<String>>,
    ids: Option<Arc<dyn IdGenerator>>,
    clock: Option<Arc<dyn Clock>>,
}

/// BuildError はプール構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing handler kinds: {0:?}. These kinds were expected but not registered.")]
    MissingHandlerKinds(Vec<String>),

    #[error("No handlers registered and no unit factory configured")]
    NoHandlers,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to initialize execution unit in slot {slot}: {source}")]
    UnitInit {
        slot: usize,
        #[source]
        source: UnitInitError,
    },

    #[error("WorkerPool must be built inside a tokio runtime")]
    NoRuntime,
}

impl BuildError {
    fn from_start(err: StartError) -> Self {
        match err {
            StartError::Init { slot, source } => BuildError::UnitInit { slot, source },
            StartError::MissingKinds { missing } => BuildError::MissingHandlerKinds(missing),
        }
    }
}

impl PoolBuilder {
    /// 新しい PoolBuilder を作成（設定は PoolConfig::default()）
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            factory: None,
            registrations: Vec::new(),
            registered_kinds: HashSet::new(),
            expected_kinds: None,
            ids: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// ユニットの HandlerRegistry を作る factory を設定
    ///
    /// register() した handler は factory が返した registry に追加される。
    pub fn factory(mut self, factory: impl UnitFactory) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Handler を登録（ユニットごとに `H::default()` で作る）
    ///
    /// # Example
    /// ```ignore
    /// builder.register::<MyTask, MyTaskHandler>()?;
    /// ```
    pub fn register<T, H>(self) -> Result<Self, RegistryError>
    where
        T: Task,
        H: Handler<T> + Default + 'static,
    {
        self.register_with::<T, H, _>(H::default)
    }

    /// Handler を登録（ユニットごとに `make()` で作る）
    pub fn register_with<T, H, F>(self, make: F) -> Result<Self, RegistryError>
    where
        T: Task,
        H: Handler<T> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.push_registration(
            T::TYPE,
            Arc::new(move |registry: &mut HandlerRegistry| {
                registry.register::<T, H>(make())
            }),
        )
    }

    /// 同期 Handler を登録（ユニットごとに `H::default()` で作り、
    /// 各タスクは spawn_blocking のスレッドで実行される）
    ///
    /// CPU バウンドな処理や同期 I/O はこちらで登録する。
    pub fn register_blocking<T, H>(self) -> Result<Self, RegistryError>
    where
        T: Task,
        H: BlockingHandler<T> + Default,
    {
        self.push_registration(
            T::TYPE,
            Arc::new(|registry: &mut HandlerRegistry| {
                registry.register_blocking::<T, H>(H::default())
            }),
        )
    }

    fn push_registration(
        mut self,
        kind: &str,
        registration: Registration,
    ) -> Result<Self, RegistryError> {
        if !self.registered_kinds.insert(kind.to_string()) {
            return Err(RegistryError::AlreadyRegistered(kind.to_string()));
        }
        self.registrations.push(registration);
        Ok(self)
    }

    /// 期待される handler_kind のリストを設定
    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        let mut expected_kinds = Vec::new();
        for &kind in kinds {
            expected_kinds.push(kind.to_string());
        }
        self.expected_kinds = Some(expected_kinds);
        self
    }

    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    /// ID のタイムスタンプと ResourceSnapshot の時刻に使う Clock
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// PoolBuilder を構築して WorkerPool を起動
    ///
    /// # 検証
    /// - PoolConfig::validate()
    /// - expect_kinds() で設定された handler_kind が全て登録されているかチェック
    /// - capacity 個のユニットを作り、どれか 1 つでも失敗したら全体を失敗にする
    pub fn build(self) -> Result<WorkerPool, BuildError> {
        self.config.validate()?;

        if self.factory.is_none() && self.registrations.is_empty() {
            return Err(BuildError::NoHandlers);
        }

        let expected_kinds = self.expected_kinds.unwrap_or_default();
        if self.factory.is_none() {
            let missing_kinds: Vec<String> = expected_kinds
                .iter()
                .filter(|x| !self.registered_kinds.contains(x.as_str()))
                .cloned()
                .collect();
            if !missing_kinds.is_empty() {
                return Err(BuildError::MissingHandlerKinds(missing_kinds));
            }
        }

        let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let factory = Arc::new(ComposedFactory {
            base: self.factory,
            registrations: self.registrations,
        });

        let pool = WorkerPool::start(
            self.config,
            factory,
            ids,
            ResourceMonitor::with_clock(clock),
            &expected_kinds,
            runtime,
        )
        .map_err(BuildError::from_start)?;
        Ok(pool)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 設定された factory の結果に register() 分の handler を足す
struct ComposedFactory {
    base: Option<Arc<dyn UnitFactory>>,
    registrations: Vec<Registration>,
}

impl UnitFactory for ComposedFactory {
    fn create(&self, slot: usize) -> Result<HandlerRegistry, UnitInitError> {
        let mut registry = match &self.base {
            Some(base) => base.create(slot)?,
            None => HandlerRegistry::new(),
        };
        for register in &self.registrations {
            register(&mut registry)?;
        }
        Ok(registry)
    }
}
