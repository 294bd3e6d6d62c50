//! 运行内记忆（Memory）
//!
//! 单次运行内只追加的 (Action, Observation) 序列 + 对话轮次 + 反思指导，是后续补全请求唯一的上下文来源。
//! 标记 memorized 的工具结果在上下文中逐字保留；其他工具结果只在最近一步完整出现，之后省略为摘要行。

use serde::Serialize;

use crate::codeact::{Action, Observation};
use crate::memory::Message;

/// 非 memorized 结果省略后保留的预览字符数
const ELIDED_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEntry {
    /// 对话轮次（目标、模型思考等）
    Turn(Message),
    /// 一次工具调用及其结果
    Step {
        action: Action,
        observation: Observation,
        memorized: bool,
    },
    /// 反思或恢复给出的指导
    Note(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Memory {
    entries: Vec<MemoryEntry>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&mut self, msg: Message) {
        self.entries.push(MemoryEntry::Turn(msg));
    }

    pub fn push_note(&mut self, note: impl Into<String>) {
        self.entries.push(MemoryEntry::Note(note.into()));
    }

    /// 记录一步；调用方保证 observation.id == action.id
    pub fn record(&mut self, action: Action, observation: Observation, memorized: bool) {
        debug_assert_eq!(action.id, observation.id);
        self.entries.push(MemoryEntry::Step {
            action,
            observation,
            memorized,
        });
    }

    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    pub fn steps(&self) -> impl Iterator<Item = (&Action, &Observation)> {
        self.entries.iter().filter_map(|e| match e {
            MemoryEntry::Step {
                action,
                observation,
                ..
            } => Some((action, observation)),
            _ => None,
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }

    /// 最近 n 步（时间顺序）
    pub fn tail_steps(&self, n: usize) -> Vec<(&Action, &Observation)> {
        let steps: Vec<_> = self.steps().collect();
        let start = steps.len().saturating_sub(n);
        steps[start..].to_vec()
    }

    /// 转为补全请求的消息序列
    pub fn to_messages(&self) -> Vec<Message> {
        let last_step = self
            .entries
            .iter()
            .rposition(|e| matches!(e, MemoryEntry::Step { .. }));
        let mut out = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                MemoryEntry::Turn(m) => out.push(m.clone()),
                MemoryEntry::Note(n) => out.push(Message::user(format!("Guidance: {}", n))),
                MemoryEntry::Step {
                    action,
                    observation,
                    memorized,
                } => {
                    let call = serde_json::json!({
                        "tool": action.action_type,
                        "args": action.arguments,
                    });
                    let assistant = if action.thought.trim().is_empty() {
                        call.to_string()
                    } else {
                        format!("{}\n{}", action.thought.trim(), call)
                    };
                    out.push(Message::assistant(assistant));

                    let full = *memorized || Some(i) == last_step;
                    let body = if full {
                        observation.content.clone()
                    } else {
                        elide(&observation.content)
                    };
                    let status = if observation.is_success() { "success" } else { "error" };
                    out.push(Message::user(format!(
                        "Observation from {} [{}]: {}",
                        action.action_type, status, body
                    )));
                }
            }
        }
        out
    }
}

fn elide(content: &str) -> String {
    let total = content.chars().count();
    if total <= ELIDED_PREVIEW_CHARS {
        return content.to_string();
    }
    let preview: String = content.chars().take(ELIDED_PREVIEW_CHARS).collect();
    format!("{}... [output elided, {} chars total]", preview, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeact::ToolCall;

    fn step(tool: &str, content: &str) -> (Action, Observation) {
        let action = Action::new(
            ToolCall {
                tool: tool.to_string(),
                args: serde_json::json!({}),
            },
            1,
            "thinking",
        );
        let obs = Observation::success(action.id, content);
        (action, obs)
    }

    #[test]
    fn test_non_memorized_output_elided_after_next_step() {
        let long = "x".repeat(500);
        let mut mem = Memory::new();
        let (a, o) = step("execute_command", &long);
        mem.record(a, o, false);
        // 最近一步完整可见
        let msgs = mem.to_messages();
        assert!(msgs[1].content.contains(&long));

        let (a, o) = step("echo", "short");
        mem.record(a, o, true);
        let msgs = mem.to_messages();
        assert!(!msgs[1].content.contains(&long));
        assert!(msgs[1].content.contains("output elided, 500 chars total"));
        assert!(msgs[3].content.ends_with("short"));
    }

    #[test]
    fn test_memorized_output_kept_verbatim() {
        let long = "y".repeat(500);
        let mut mem = Memory::new();
        let (a, o) = step("read_file", &long);
        mem.record(a, o, true);
        let (a, o) = step("echo", "x");
        mem.record(a, o, true);
        assert!(mem.to_messages()[1].content.contains(&long));
    }

    #[test]
    fn test_tail_steps() {
        let mut mem = Memory::new();
        for i in 0..5 {
            let (a, o) = step("echo", &i.to_string());
            mem.record(a, o, true);
        }
        mem.push_note("try again");
        let tail = mem.tail_steps(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].1.content, "2");
        assert_eq!(mem.step_count(), 5);
    }
}
