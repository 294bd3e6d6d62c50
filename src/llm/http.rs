//! OpenAI 兼容端点的原始 HTTP 流式客户端
//!
//! 直接 POST `{base_url}/chat/completions`（stream=true），用 reqwest 字节流 + SseDecoder 解帧。
//! 用于 DeepSeek、Ollama、vLLM 等兼容端点。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::llm::sse::decode_openai_stream;
use crate::llm::{DeltaStream, LlmClient, LlmError, StreamEvent, UsageMeter};
use crate::memory::{Message, Role};

/// OpenAI 兼容 HTTP 客户端
pub struct HttpStreamClient {
    name: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    pub usage: UsageMeter,
}

impl HttpStreamClient {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        model: &str,
        api_key: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            usage: UsageMeter::new(),
        }
    }

    fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": m.content })
            })
            .collect()
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let cut: String = input.chars().take(max_len).collect();
    format!("{}...", cut)
}

#[async_trait]
impl LlmClient for HttpStreamClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(1000);
            return Err(LlmError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!(
                "{} stream request failed with status {}: {}",
                self.name,
                status,
                truncate_for_error(&text, 500)
            )));
        }

        let meter = self.usage.clone();
        let events = decode_openai_stream(resp.bytes_stream(), cancel).inspect(move |ev| {
            if let Ok(StreamEvent::Usage(u)) = ev {
                meter.add(*u);
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages_roles() {
        let wire = HttpStreamClient::wire_messages(&[
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ]);
        let roles: Vec<&str> = wire.iter().filter_map(|m| m["role"].as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
    }

    #[test]
    fn test_blank_api_key_is_dropped() {
        let c = HttpStreamClient::new("x", "http://localhost:1/v1/", "m", Some("  ".into()));
        assert!(c.api_key.is_none());
        assert_eq!(c.base_url, "http://localhost:1/v1");
    }
}
