//! LLM 层：流式客户端抽象、Completion Channel 与各提供方实现（OpenAI / OpenAI 兼容 HTTP / Mock）

pub mod channel;
pub mod deepseek;
pub mod http;
pub mod mock;
pub mod openai;
pub mod sse;
pub mod traits;

pub use channel::{Completion, CompletionChannel, CompletionSettings};
pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use http::HttpStreamClient;
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use sse::SseDecoder;
pub use traits::{
    DeltaSink, DeltaStream, LlmClient, LlmError, NoopSink, StreamEvent, TokenUsage, UsageMeter,
};
