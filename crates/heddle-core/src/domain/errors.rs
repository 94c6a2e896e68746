//! Errors - handler が返すエラーと分類
//!
//! HandlerError は実行ユニットの境界を値としてコピーして渡るので、
//! `Box<dyn Error>` の source は持たず、kind + message だけを持つ。

use serde::{Deserialize, Serialize};

/// ErrorKind は handler エラーの分類
///
/// - Permanent: 恒久的なエラー（同じ入力では何度やっても失敗する）
/// - InvalidPayload: payload を handler の入力型にデコードできなかった
/// - UnknownHandler: handler_kind に対応する handler がユニットに登録されていない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Permanent,
    InvalidPayload,
    UnknownHandler,
}

/// Error produced inside an execution unit while running one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}
