//! LLM 客户端抽象
//!
//! 所有后端（OpenAI / OpenAI 兼容 HTTP / Mock）实现 LlmClient::complete_stream，
//! 把各自的流式线格式统一成 StreamEvent 序列（Token 增量 + 用量）。

use std::ops::AddAssign;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::Message;

/// 提供方层面的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream timed out")]
    Timeout,

    #[error("stream cancelled")]
    Cancelled,
}

/// 单次补全的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// 客户端级累计用量（多个运行并发写入）
#[derive(Debug, Clone, Default)]
pub struct UsageMeter {
    prompt_tokens: Arc<AtomicU64>,
    completion_tokens: Arc<AtomicU64>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usage: TokenUsage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    /// (prompt, completion, total)
    pub fn get(&self) -> (u64, u64, u64) {
        let p = self.prompt_tokens.load(Ordering::Relaxed);
        let c = self.completion_tokens.load(Ordering::Relaxed);
        (p, c, p + c)
    }
}

/// 流中的单个事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// 一段 Token 增量
    Delta(String),
    /// 提供方报告的用量（通常在流末尾）
    Usage(TokenUsage),
}

/// 惰性、有限、不可重启的事件流
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// LLM 客户端 trait：流式补全
///
/// 实现必须在 `cancel` 触发后尽快结束流并释放提供方连接。
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 提供方名称（日志用）
    fn name(&self) -> &str;

    async fn complete_stream(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError>;

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// Token 增量接收端（实时展示用）
pub trait DeltaSink: Send + Sync {
    fn on_delta(&self, delta: &str);

    /// 提供方报告的用量；默认忽略
    fn on_usage(&self, _usage: TokenUsage) {}
}

impl<F> DeltaSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_delta(&self, delta: &str) {
        self(delta)
    }
}

/// 丢弃所有增量
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DeltaSink for NoopSink {
    fn on_delta(&self, _delta: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_meter_accumulates() {
        let meter = UsageMeter::new();
        meter.add(TokenUsage::new(10, 5));
        meter.add(TokenUsage::new(1, 2));
        assert_eq!(meter.get(), (11, 7, 18));
    }

    #[test]
    fn test_token_usage_add_assign() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(3, 4);
        total += TokenUsage::new(1, 1);
        assert_eq!(total, TokenUsage::new(4, 5));
    }
}
