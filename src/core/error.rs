//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / RecordFailure / Fail / Abort。
//! 单个 Action 内的错误（工具、运行时执行）会被转换为 error Observation；
//! 破坏运行前提的错误（无 Plan、无 Runtime）为致命错误。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 无法得到可用的初始 Plan（致命）
    #[error("Planning failed: {0}")]
    Planning(String),

    /// 模型输出在重试后仍无法解析
    #[error("Completion format error: {0}")]
    CompletionFormat(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments for tool '{tool}': {reason}")]
    ToolArgumentInvalid { tool: String, reason: String },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 无法在超时内准备沙箱环境（致命）
    #[error("Runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Runtime action failed: {0}")]
    RuntimeAction(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Invalid task transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: usize,
        from: String,
        to: String,
    },

    #[error("Config error: {0}")]
    Config(String),

    /// 协作式取消，不算错误，但需要沿调用栈向上传递
    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 破坏运行前提的错误：直接使运行进入 FAILED
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Planning(_) | AgentError::RuntimeUnavailable(_) | AgentError::Config(_)
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示注入下一次请求，让 LLM 重新按格式输出
    RetryWithPrompt(String),
    /// 记为一次失败（计入 Failure Counter），运行继续
    RecordFailure,
    /// 终止运行，进入 FAILED
    Fail,
    /// 取消，进入 CANCELLED
    Abort,
}
