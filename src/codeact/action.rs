//! Action / Observation
//!
//! Action 是模型请求的一次工具调用（创建后不可变）；Observation 是它的唯一结果，id 与 Action 相同。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// 模型输出中的工具调用（`{"tool": "...", "args": {...}}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Map::new())
}

/// 一次待执行的动作
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub id: Uuid,
    /// 工具名
    pub action_type: String,
    pub arguments: Value,
    /// 发起该动作的任务
    pub task_id: usize,
    /// 模型给出的说明
    pub thought: String,
}

impl Action {
    pub fn new(call: ToolCall, task_id: usize, thought: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type: call.tool,
            arguments: call.args,
            task_id,
            thought: thought.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Success,
    Error,
}

/// 动作执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// 与 Action.id 相同
    pub id: Uuid,
    pub status: ObservationStatus,
    pub content: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    /// 涉及的工作区文件（如 write_file）
    pub file_path: Option<String>,
}

impl Observation {
    pub fn success(id: Uuid, content: impl Into<String>) -> Self {
        Self::with_status(id, ObservationStatus::Success, content)
    }

    pub fn error(id: Uuid, content: impl Into<String>) -> Self {
        Self::with_status(id, ObservationStatus::Error, content)
    }

    fn with_status(id: Uuid, status: ObservationStatus, content: impl Into<String>) -> Self {
        Self {
            id,
            status,
            content: content.into(),
            payload: Value::Null,
            metadata: Map::new(),
            file_path: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ObservationStatus::Success
    }

    /// metadata 中记录的工具名
    pub fn action_type(&self) -> Option<&str> {
        self.metadata.get("action_type").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_args_default_to_empty_object() {
        let call: ToolCall = serde_json::from_str(r#"{"tool":"echo"}"#).unwrap();
        assert_eq!(call.args, serde_json::json!({}));
    }

    #[test]
    fn test_action_ids_are_unique() {
        let call = ToolCall {
            tool: "echo".into(),
            args: serde_json::json!({}),
        };
        let a = Action::new(call.clone(), 1, "");
        let b = Action::new(call, 1, "");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_observation_builders() {
        let id = Uuid::new_v4();
        let obs = Observation::error(id, "boom")
            .with_metadata("action_type", "shell")
            .with_file_path("out.txt");
        assert!(!obs.is_success());
        assert_eq!(obs.action_type(), Some("shell"));
        assert_eq!(obs.file_path.as_deref(), Some("out.txt"));
    }
}
