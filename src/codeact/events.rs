//! 运行消息流：对外唯一可观察的通道（除终态结果外）
//!
//! 每次 Action 派发、每个 Observation、每次任务状态变化各一条，最后一条终态消息后通道关闭。
//! 消息同时写入 RunStore（持久化协作方，缺省为 no-op）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codeact::{Action, Observation, ObservationStatus, Plan, Task, TaskStatus};
use crate::core::RunState;
use crate::persistence::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Success,
    Error,
}

impl From<ObservationStatus> for MessageStatus {
    fn from(s: ObservationStatus) -> Self {
        match s {
            ObservationStatus::Success => MessageStatus::Success,
            ObservationStatus::Error => MessageStatus::Error,
        }
    }
}

/// 消息流中的一条事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMessage {
    pub uuid: Uuid,
    pub action_type: String,
    pub status: MessageStatus,
    pub content: String,
    pub payload: Value,
    pub task_id: Option<usize>,
    pub metadata: Map<String, Value>,
    pub file_path: Option<String>,
    pub timestamp_ms: i64,
}

impl RunMessage {
    pub fn new(action_type: impl Into<String>, status: MessageStatus, content: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            action_type: action_type.into(),
            status,
            content: content.into(),
            payload: Value::Null,
            task_id: None,
            metadata: Map::new(),
            file_path: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_task(mut self, task_id: usize) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Action 派发（pending），uuid 与 Action 相同
    pub fn action(action: &Action) -> Self {
        let mut msg = Self::new(action.action_type.clone(), MessageStatus::Pending, action.thought.clone())
            .with_task(action.task_id)
            .with_payload(action.arguments.clone());
        msg.uuid = action.id;
        msg
    }

    /// Observation，uuid 与对应 Action 相同
    pub fn observation(action: &Action, obs: &Observation) -> Self {
        let mut msg = Self::new(action.action_type.clone(), obs.status.into(), obs.content.clone())
            .with_task(action.task_id)
            .with_payload(obs.payload.clone());
        msg.uuid = obs.id;
        msg.metadata = obs.metadata.clone();
        msg.file_path = obs.file_path.clone();
        msg
    }

    pub fn task(task: &Task) -> Self {
        let status = match task.status {
            TaskStatus::Success => MessageStatus::Success,
            TaskStatus::Error => MessageStatus::Error,
            TaskStatus::Pending | TaskStatus::Active => MessageStatus::Pending,
        };
        let mut msg = Self::new("task_status", status, task.description.clone()).with_task(task.id);
        msg.metadata
            .insert("task_status".to_string(), Value::from(task.status.to_string()));
        msg
    }

    pub fn plan(plan: &Plan) -> Self {
        Self::new("plan", MessageStatus::Success, plan.render_markdown())
            .with_payload(serde_json::to_value(plan.tasks()).unwrap_or(Value::Null))
    }

    pub fn run_state(state: RunState) -> Self {
        Self::new("run_state", MessageStatus::Pending, state.to_string())
    }

    pub fn error(action_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(action_type, MessageStatus::Error, content)
    }

    /// 终态消息：DONE 为 success，其余为 error
    pub fn terminal(state: RunState, content: impl Into<String>) -> Self {
        let status = if state == RunState::Done {
            MessageStatus::Success
        } else {
            MessageStatus::Error
        };
        let mut msg = Self::new("run_finished", status, content);
        msg.metadata
            .insert("state".to_string(), Value::from(state.to_string()));
        msg
    }
}

/// 单个运行的消息发送端
pub struct EventEmitter {
    conversation_id: String,
    tx: mpsc::UnboundedSender<RunMessage>,
    store: Arc<dyn RunStore>,
    closed: AtomicBool,
}

impl EventEmitter {
    pub fn new(
        conversation_id: impl Into<String>,
        store: Arc<dyn RunStore>,
    ) -> (Self, mpsc::UnboundedReceiver<RunMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conversation_id: conversation_id.into(),
                tx,
                store,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// 终态之后的消息被丢弃，返回 false
    pub fn emit(&self, msg: RunMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(action_type = %msg.action_type, "dropping message after terminal event");
            return false;
        }
        self.store.record_message(&self.conversation_id, &msg);
        // 接收端可能已被丢弃，运行不受影响
        let _ = self.tx.send(msg);
        true
    }

    pub fn emit_task(&self, task: &Task) {
        self.store.record_task(&self.conversation_id, task);
        self.emit(RunMessage::task(task));
    }

    /// 发送终态消息并关闭；只有第一次调用生效
    pub fn finish(&self, msg: RunMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let sent = self.emit(msg);
        self.closed.store(true, Ordering::SeqCst);
        sent
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeact::ToolCall;
    use crate::persistence::{InMemoryStore, NoopStore};

    #[test]
    fn test_action_and_observation_share_uuid() {
        let action = Action::new(
            ToolCall {
                tool: "echo".into(),
                args: serde_json::json!({"text": "x"}),
            },
            2,
            "echoing",
        );
        let obs = Observation::success(action.id, "x").with_metadata("action_type", "echo");
        let a = RunMessage::action(&action);
        let o = RunMessage::observation(&action, &obs);
        assert_eq!(a.uuid, o.uuid);
        assert_eq!(a.status, MessageStatus::Pending);
        assert_eq!(o.status, MessageStatus::Success);
        assert_eq!(o.task_id, Some(2));
    }

    #[tokio::test]
    async fn test_no_messages_after_finish() {
        let store = Arc::new(InMemoryStore::default());
        let (emitter, mut rx) = EventEmitter::new("c1", store.clone());
        assert!(emitter.emit(RunMessage::run_state(RunState::Planning)));
        assert!(emitter.finish(RunMessage::terminal(RunState::Cancelled, "cancelled")));
        assert!(!emitter.emit(RunMessage::run_state(RunState::Executing)));
        assert!(!emitter.finish(RunMessage::terminal(RunState::Failed, "again")));
        drop(emitter);

        let mut got = Vec::new();
        while let Some(m) = rx.recv().await {
            got.push(m);
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].action_type, "run_finished");
        assert_eq!(store.messages("c1").len(), 2);
    }

    #[test]
    fn test_emit_without_receiver() {
        let (emitter, rx) = EventEmitter::new("c", Arc::new(NoopStore));
        drop(rx);
        assert!(emitter.emit(RunMessage::error("completion_error", "boom")));
    }
}
