//! App - アプリケーション層
//!
//! ports と pool を組み合わせて WorkerPool を組み立てる。
//!
//! # 主要コンポーネント
//! - **PoolBuilder**: handler の登録、設定、起動時検証

pub mod builder;

pub use self::builder::{BuildError, PoolBuilder};
