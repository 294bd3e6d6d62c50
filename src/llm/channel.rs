//! Completion Channel：统一的流式补全入口
//!
//! stream 消费提供方事件流：每个增量实时推给 DeltaSink，同时缓冲完整文本；流结束后得到 Completion。
//! request 在此之上增加格式重试：解析失败时由 RecoveryEngine 生成纠正提示，固定退避后重试，
//! 超过 format_retries 次后返回 CompletionFormat 错误。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{DeltaSink, LlmClient, LlmError, StreamEvent, TokenUsage};
use crate::memory::Message;

/// 补全重试与超时设置
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    /// 解析失败后的最大重试次数（不含首次）
    pub format_retries: usize,
    /// 每次重试前的固定退避
    pub retry_backoff: Duration,
    /// 单次流的超时
    pub stream_timeout: Duration,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            format_retries: 3,
            retry_backoff: Duration::from_millis(1500),
            stream_timeout: Duration::from_secs(120),
        }
    }
}

/// 一次流式补全的聚合结果
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    /// 收到的增量个数
    pub deltas: usize,
}

/// 可被多个运行并发共享（内部只有 Arc 与不可变设置）
#[derive(Clone)]
pub struct CompletionChannel {
    client: Arc<dyn LlmClient>,
    recovery: RecoveryEngine,
    settings: CompletionSettings,
}

impl CompletionChannel {
    pub fn new(client: Arc<dyn LlmClient>, settings: CompletionSettings) -> Self {
        Self {
            client,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// 执行一次流式补全；取消时立即丢弃流（不再产生增量）
    pub async fn stream(
        &self,
        messages: &[Message],
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<Completion, AgentError> {
        let consume = async {
            let mut stream = self
                .client
                .complete_stream(messages, cancel.child_token())
                .await?;
            let mut completion = Completion::default();
            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::Delta(d) => {
                        sink.on_delta(&d);
                        completion.text.push_str(&d);
                        completion.deltas += 1;
                    }
                    StreamEvent::Usage(u) => {
                        sink.on_usage(u);
                        completion.usage += u;
                    }
                }
            }
            Ok::<_, LlmError>(completion)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(self.settings.stream_timeout, consume) => match res {
                Err(_) => {
                    tracing::warn!(provider = %self.client.name(), "completion stream timed out");
                    Err(AgentError::Llm(LlmError::Timeout))
                }
                Ok(Err(LlmError::Cancelled)) => Err(AgentError::Cancelled),
                Ok(Err(e)) => Err(AgentError::Llm(e)),
                Ok(Ok(completion)) => {
                    tracing::debug!(
                        provider = %self.client.name(),
                        deltas = completion.deltas,
                        chars = completion.text.len(),
                        "completion finished"
                    );
                    Ok(completion)
                }
            },
        }
    }

    /// 流式补全 + 解析；解析失败按重试策略处理。返回解析结果与最后一次 Completion（用量为所有尝试之和）
    pub async fn request<T, F>(
        &self,
        messages: &[Message],
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
        parse: F,
    ) -> Result<(T, Completion), AgentError>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        let mut conversation = messages.to_vec();
        let mut usage = TokenUsage::default();
        let mut attempt = 0;
        loop {
            let mut completion = self.stream(&conversation, sink, cancel).await?;
            usage += completion.usage;
            let reason = match parse(&completion.text) {
                Ok(value) => {
                    completion.usage = usage;
                    return Ok((value, completion));
                }
                Err(reason) => reason,
            };
            let err = AgentError::CompletionFormat(reason);
            if attempt >= self.settings.format_retries {
                tracing::warn!(attempts = attempt + 1, error = %err, "giving up on completion format");
                return Err(err);
            }
            attempt += 1;
            tracing::warn!(attempt, error = %err, "completion unparseable, retrying");
            if let RecoveryAction::RetryWithPrompt(prompt) = self.recovery.handle(&err) {
                conversation.push(Message::assistant(completion.text));
                conversation.push(Message::user(prompt));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(self.settings.retry_backoff) => {}
            }
        }
    }
}
