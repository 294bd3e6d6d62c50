//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 CompletionChannel（格式重试）与 Code-Act 循环
//! （补全失败时记失败 / 终止 / 取消）使用。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::CompletionFormat(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output could not be parsed: {raw}. \
                 Reply with a short explanation followed by at most one JSON object. \
                 To call a tool the JSON must be exactly: {{\"tool\": \"<tool name>\", \"args\": {{...}}}}. \
                 For example: {{\"tool\": \"echo\", \"args\": {{\"text\": \"hi\"}}}}."
            )),
            AgentError::Cancelled => RecoveryAction::Abort,
            e if e.is_fatal() => RecoveryAction::Fail,
            AgentError::Llm(_)
            | AgentError::ToolNotFound(_)
            | AgentError::ToolArgumentInvalid { .. }
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::RuntimeAction(_)
            | AgentError::PathEscape(_) => RecoveryAction::RecordFailure,
            _ => RecoveryAction::Fail,
        }
    }
}
