//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：离线冒烟用。首轮对目标调用 echo，看到 Observation 后直接结束任务。
//! - ScriptedLlmClient：按脚本依次返回增量序列，可在脚本末尾挂起（测试取消）并记录每次请求。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use crate::llm::{DeltaStream, LlmClient, LlmError, StreamEvent, TokenUsage, UsageMeter};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息，收到 Observation 后回复纯文本（结束当前任务）
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn reply(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        if last_user.starts_with("Observation") {
            "The task is complete.".to_string()
        } else {
            let args = serde_json::json!({ "text": format!("Echo from Mock: {}", last_user) });
            format!(
                "I will echo the request.\n{}",
                serde_json::json!({ "tool": "echo", "args": args })
            )
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError> {
        let content = Self::reply(messages);
        Ok(Box::pin(stream::iter(vec![Ok::<_, LlmError>(
            StreamEvent::Delta(content),
        )])))
    }
}

#[derive(Debug, Clone)]
enum ScriptItem {
    /// 依次发出增量后正常结束
    Complete(Vec<String>),
    /// 发出增量后挂起，直到取消
    Stall(Vec<String>),
}

#[derive(Debug, Default)]
struct ScriptState {
    items: VecDeque<ScriptItem>,
    last: Option<ScriptItem>,
    requests: Vec<Vec<Message>>,
}

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    state: Mutex<ScriptState>,
    repeat_last: bool,
    stall_when_exhausted: bool,
    /// 每条完整回复末尾报告的用量
    usage: Option<TokenUsage>,
    meter: UsageMeter,
}

impl ScriptedLlmClient {
    /// 每条回复作为一个增量发出
    pub fn new<S: Into<String>>(responses: Vec<S>) -> Self {
        let items = responses
            .into_iter()
            .map(|r| ScriptItem::Complete(vec![r.into()]))
            .collect();
        Self {
            state: Mutex::new(ScriptState {
                items,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 每条回复由若干增量组成
    pub fn from_deltas(responses: Vec<Vec<&str>>) -> Self {
        let items = responses
            .into_iter()
            .map(|r| ScriptItem::Complete(r.into_iter().map(String::from).collect()))
            .collect();
        Self {
            state: Mutex::new(ScriptState {
                items,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// 脚本耗尽后重复最后一条回复
    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// 每条完整回复结束时附带一次用量事件
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// 脚本耗尽后挂起，直到取消
    pub fn then_stall(mut self) -> Self {
        self.stall_when_exhausted = true;
        self
    }

    /// 追加一条「发出增量后挂起」的回复
    pub fn with_stall(self, deltas: Vec<&str>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .items
                .push_back(ScriptItem::Stall(deltas.into_iter().map(String::from).collect()));
        }
        self
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().map(|s| s.requests.len()).unwrap_or(0)
    }

    /// 每次请求收到的完整消息列表
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    fn next_item(&self, messages: &[Message]) -> Result<ScriptItem, LlmError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LlmError::Request("script state poisoned".to_string()))?;
        state.requests.push(messages.to_vec());
        if let Some(item) = state.items.pop_front() {
            state.last = Some(item.clone());
            return Ok(item);
        }
        if self.repeat_last {
            if let Some(last) = state.last.clone() {
                return Ok(last);
            }
        }
        if self.stall_when_exhausted {
            return Ok(ScriptItem::Stall(Vec::new()));
        }
        Err(LlmError::Request("script exhausted".to_string()))
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.meter.get()
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<DeltaStream, LlmError> {
        match self.next_item(messages)? {
            ScriptItem::Complete(deltas) => {
                let mut events: Vec<Result<StreamEvent, LlmError>> =
                    deltas.into_iter().map(|d| Ok(StreamEvent::Delta(d))).collect();
                if let Some(usage) = self.usage {
                    self.meter.add(usage);
                    events.push(Ok(StreamEvent::Usage(usage)));
                }
                Ok(Box::pin(stream::iter(events)))
            }
            ScriptItem::Stall(deltas) => Ok(Box::pin(async_stream::stream! {
                for d in deltas {
                    yield Ok(StreamEvent::Delta(d));
                }
                cancel.cancelled().await;
                yield Err(LlmError::Cancelled);
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_mock_echoes_then_finishes() {
        let client = MockLlmClient;
        let mut s = client
            .complete_stream(&[Message::user("hello")], CancellationToken::new())
            .await
            .unwrap();
        let Some(Ok(StreamEvent::Delta(first))) = s.next().await else {
            panic!("expected delta");
        };
        assert!(first.contains("\"tool\":\"echo\""));

        let mut s = client
            .complete_stream(
                &[Message::user("Observation from echo: hi")],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let Some(Ok(StreamEvent::Delta(second))) = s.next().await else {
            panic!("expected delta");
        };
        assert!(!second.contains('{'));
    }

    #[tokio::test]
    async fn test_scripted_exhaustion() {
        let client = ScriptedLlmClient::new(vec!["one"]);
        assert!(client
            .complete_stream(&[], CancellationToken::new())
            .await
            .is_ok());
        assert!(client
            .complete_stream(&[], CancellationToken::new())
            .await
            .is_err());
        assert_eq!(client.request_count(), 2);
    }
}
