//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Associated Types (`type Output`)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は handler_kind と入出力の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RenderModel {
///     template: String,
///     name: String,
/// }
///
/// impl Task for RenderModel {
///     const TYPE: &'static str = "codegen.model.render.v1";
///     type Output = String;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize` / `DeserializeOwned`: ユニットの境界を JSON 値としてコピーで渡るため
/// - `Send + Sync + 'static`: ユニットのタスクへ move するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// handler_kind の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    const TYPE: &'static str;

    /// handler が返す値
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::Task;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Greet {
        pub name: String,
    }

    impl Task for Greet {
        const TYPE: &'static str = "test.greet.render.v1";
        type Output = String;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Nap {
        pub millis: u64,
        #[serde(default)]
        pub fail: bool,
    }

    impl Task for Nap {
        const TYPE: &'static str = "test.nap.sleep.v1";
        type Output = u64;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Spin {
        pub millis: u64,
    }

    impl Task for Spin {
        const TYPE: &'static str = "test.spin.compute.v1";
        type Output = u64;
    }
}
