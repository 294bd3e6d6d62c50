//! OpenAI API 客户端（流式）
//!
//! 通过 async_openai 的 create_stream 调用 OpenAI 端点，把 chunk 的 delta.content 转成 StreamEvent::Delta，
//! 末尾 usage（若提供方返回）转成 StreamEvent::Usage 并计入累计用量。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionStreamOptions, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::llm::{DeltaStream, LlmClient, LlmError, StreamEvent, TokenUsage, UsageMeter};
use crate::memory::{Message, Role};

/// OpenAI 客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: UsageMeter,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: UsageMeter::new(),
        }
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| -> Result<ChatCompletionRequestMessage, OpenAIError> {
                Ok(match m.role {
                    Role::System => ChatCompletionRequestMessage::System(
                        ChatCompletionRequestSystemMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::User => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                    Role::Assistant => ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(m.content.clone())
                            .build()?,
                    ),
                })
            })
            .collect()
    }

    /// 流式请求；要求提供方在 [DONE] 之前附带一条用量
    fn build_request(&self, messages: &[Message]) -> Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages)?)
            .stream_options(ChatCompletionStreamOptions {
                include_usage: Some(true),
                include_obfuscation: None,
            })
            .build()
    }
}

fn map_openai_error(e: OpenAIError) -> LlmError {
    let text = e.to_string();
    if text.contains("429") || text.to_lowercase().contains("rate limit") {
        LlmError::RateLimited {
            retry_after_ms: 1000,
        }
    } else {
        LlmError::Request(text)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError> {
        let request = self.build_request(messages).map_err(map_openai_error)?;

        let mut upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_openai_error)?;

        let meter = self.usage.clone();
        let stream = async_stream::try_stream! {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    chunk = upstream.next() => Some(chunk),
                };
                // 取消：丢弃 upstream 即关闭连接
                let Some(next) = next else {
                    Err::<(), LlmError>(LlmError::Cancelled)?;
                    break;
                };
                let Some(chunk) = next else { break };
                let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
                for choice in &chunk.choices {
                    if let Some(text) = choice.delta.content.as_deref() {
                        if !text.is_empty() {
                            yield StreamEvent::Delta(text.to_string());
                        }
                    }
                }
                if let Some(u) = &chunk.usage {
                    let usage = TokenUsage::new(u.prompt_tokens as u64, u.completion_tokens as u64);
                    meter.add(usage);
                    yield StreamEvent::Usage(usage);
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
