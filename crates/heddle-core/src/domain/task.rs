use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::TaskId;

/// Discriminator that selects the handler inside an execution unit.
///
/// 命名規約は typed 層の `Task::TYPE` と同じ: `{namespace}.{domain}.{action}.v{major}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerKind(String);

impl HandlerKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for HandlerKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// HandlerKind + Payload (+ TaskId, timeout) の“運搬用”データ。
///
/// 投入後は不変。pool は payload の中身を解釈しない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    handler_kind: HandlerKind,
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, handler_kind: HandlerKind, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            handler_kind,
            payload,
            timeout: None,
        }
    }

    /// Override the pool-wide task timeout for this task only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn handler_kind(&self) -> &HandlerKind {
        &self.handler_kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_override_is_optional() {
        let env = TaskEnvelope::new(
            TaskId::generate(),
            HandlerKind::new("test.render.v1"),
            serde_json::json!({}),
        );
        assert_eq!(env.timeout(), None);

        let env = env.with_timeout(Duration::from_millis(250));
        assert_eq!(env.timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn envelope_without_timeout_omits_the_field() {
        let env = TaskEnvelope::new(
            TaskId::generate(),
            HandlerKind::new("test.render.v1"),
            serde_json::json!({"name": "heddle"}),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("timeout").is_none());
        assert_eq!(v["handler_kind"], "test.render.v1");
    }
}
