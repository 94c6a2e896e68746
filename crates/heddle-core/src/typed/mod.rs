//! Typed - 型付き Task API
//!
//! handler_kind の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` / `BlockingHandler<T>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, 実行ユニットが使う

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{BlockingHandler, BlockingTypedHandler, DynHandler, Handler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::Task;
