//! 对话轮次
//!
//! Message / Role 与 LLM API 一致；ConversationMemory 保留最近 N 轮（运行开始前的历史会话），
//! 作为规划时的上下文传入。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn from_messages(messages: Vec<Message>, max_turns: usize) -> Self {
        let mut memory = Self { messages, max_turns };
        memory.prune();
        memory
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 超出 max_turns*2 时丢弃最旧的消息
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_turns() {
        let mut mem = ConversationMemory::new(1);
        mem.push(Message::user("a"));
        mem.push(Message::assistant("b"));
        mem.push(Message::user("c"));
        assert_eq!(mem.len(), 2);
        assert_eq!(mem.messages()[0].content, "b");
    }

    #[test]
    fn test_from_messages_prunes() {
        let msgs = (0..10).map(|i| Message::user(i.to_string())).collect();
        let mem = ConversationMemory::from_messages(msgs, 2);
        assert_eq!(mem.len(), 4);
        assert_eq!(mem.messages()[0].content, "6");
    }
}
