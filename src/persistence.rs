//! 持久化协作方
//!
//! 核心只发出事件，不负责存储；RunStore 由外部数据层实现，按 conversation_id 记录消息与任务状态。
//! 缺省使用 NoopStore，运行照常完成，只是不持久。

use std::collections::HashMap;
use std::sync::Mutex;

use crate::codeact::{RunMessage, Task};

pub trait RunStore: Send + Sync {
    fn record_message(&self, conversation_id: &str, message: &RunMessage);

    fn record_task(&self, conversation_id: &str, task: &Task);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl RunStore for NoopStore {
    fn record_message(&self, _conversation_id: &str, _message: &RunMessage) {}

    fn record_task(&self, _conversation_id: &str, _task: &Task) {}
}

/// 进程内存储（测试与单机使用）；任务按 id 保留最新状态
#[derive(Debug, Default)]
pub struct InMemoryStore {
    messages: Mutex<HashMap<String, Vec<RunMessage>>>,
    tasks: Mutex<HashMap<String, Vec<Task>>>,
}

impl InMemoryStore {
    pub fn messages(&self, conversation_id: &str) -> Vec<RunMessage> {
        self.messages
            .lock()
            .map(|m| m.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn tasks(&self, conversation_id: &str) -> Vec<Task> {
        self.tasks
            .lock()
            .map(|m| m.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl RunStore for InMemoryStore {
    fn record_message(&self, conversation_id: &str, message: &RunMessage) {
        if let Ok(mut m) = self.messages.lock() {
            m.entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
        }
    }

    fn record_task(&self, conversation_id: &str, task: &Task) {
        if let Ok(mut m) = self.tasks.lock() {
            let tasks = m.entry(conversation_id.to_string()).or_default();
            match tasks.iter_mut().find(|t| t.id == task.id) {
                Some(existing) => *existing = task.clone(),
                None => tasks.push(task.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeact::TaskStatus;

    #[test]
    fn test_task_latest_status_kept() {
        let store = InMemoryStore::default();
        let mut task = Task {
            id: 1,
            description: "build".into(),
            status: TaskStatus::Pending,
        };
        store.record_task("c", &task);
        task.status = TaskStatus::Success;
        store.record_task("c", &task);
        let tasks = store.tasks("c");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Success);
        assert!(store.tasks("other").is_empty());
    }
}
