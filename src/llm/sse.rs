//! SSE 帧解码
//!
//! 提供方的流式响应是以空行分隔的帧，每帧若干 `data: ...` 行。SseDecoder 负责跨网络分块拼帧
//! （含被切断的 UTF-8 序列），decode_openai_stream 再把 OpenAI 兼容 payload 转成 StreamEvent。

use std::str;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::{DeltaStream, LlmError, StreamEvent, TokenUsage};

/// 流结束标记
pub const DONE_SENTINEL: &str = "[DONE]";

/// 增量帧解码器：push 原始字节，返回已完整的帧 payload（多条 data 行以 `\n` 拼接）
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(payload) = frame_payload(&raw) {
                frames.push(payload);
            }
        }
        frames
    }

    /// 流结束时处理残留（最后一帧可能缺少结尾空行）
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        frame_payload(&raw)
    }
}

/// 查找第一个帧分隔符（`\n\n` 或 `\r\n\r\n`），返回 (帧结束位置, 分隔符长度)
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn frame_payload(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let data: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// 解析单个 OpenAI 兼容 payload 为事件列表
pub fn parse_openai_payload(payload: &str) -> Result<Vec<StreamEvent>, LlmError> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(payload = %payload, "skipping non-json sse payload");
            return Ok(Vec::new());
        }
    };
    if let Some(err) = value.get("error") {
        let detail = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(LlmError::Stream(detail));
    }

    let mut events = Vec::new();
    if let Some(choices) = value.get("choices").and_then(|v| v.as_array()) {
        for choice in choices {
            if let Some(text) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
            {
                if !text.is_empty() {
                    events.push(StreamEvent::Delta(text.to_string()));
                }
            }
        }
    }
    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        let prompt = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        events.push(StreamEvent::Usage(TokenUsage::new(prompt, completion)));
    }
    Ok(events)
}

/// 把原始字节流解码为 DeltaStream；cancel 触发后停止读取并丢弃底层连接
pub fn decode_openai_stream<S, B, E>(bytes: S, cancel: CancellationToken) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();
        let mut done = false;
        while !done {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                chunk = bytes.next() => Some(chunk),
            };
            let Some(next) = next else {
                Err::<(), LlmError>(LlmError::Cancelled)?;
                break;
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
            for payload in decoder.push(chunk.as_ref()) {
                if payload.trim() == DONE_SENTINEL {
                    done = true;
                    break;
                }
                for event in parse_openai_payload(&payload)? {
                    yield event;
                }
            }
        }
        if !done {
            if let Some(payload) = decoder.finish() {
                if payload.trim() != DONE_SENTINEL {
                    for event in parse_openai_payload(&payload)? {
                        yield event;
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

/// 把若干文本增量编码为 OpenAI 兼容 SSE 字节（测试与离线回放用）
pub fn encode_openai_frames(deltas: &[&str]) -> String {
    let mut out = String::new();
    for d in deltas {
        let frame = serde_json::json!({ "choices": [{ "delta": { "content": d } }] });
        out.push_str("data: ");
        out.push_str(&frame.to_string());
        out.push_str("\n\n");
    }
    out.push_str("data: [DONE]\n\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_decoder_splits_frames() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"data: a\n\ndata: b\n\nda");
        assert_eq!(frames, vec!["a".to_string(), "b".to_string()]);
        let frames = dec.push(b"ta: c\n\n");
        assert_eq!(frames, vec!["c".to_string()]);
        assert!(dec.finish().is_none());
    }

    #[test]
    fn test_decoder_handles_crlf_and_multiline_data() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"event: x\r\ndata: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn test_decoder_reassembles_split_utf8() {
        let mut dec = SseDecoder::new();
        let bytes = "data: 你好\n\n".as_bytes();
        // 在多字节字符中间切开
        let (a, b) = bytes.split_at(8);
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b), vec!["你好".to_string()]);
    }

    #[test]
    fn test_parse_error_payload() {
        let err = parse_openai_payload(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert_eq!(err, LlmError::Stream("quota exceeded".to_string()));
    }

    #[test]
    fn test_parse_usage_payload() {
        let events =
            parse_openai_payload(r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#)
                .unwrap();
        assert_eq!(events, vec![StreamEvent::Usage(TokenUsage::new(7, 3))]);
    }

    #[tokio::test]
    async fn test_decode_stream_stops_at_done() {
        let body = format!("{}data: {{\"choices\":[{{\"delta\":{{\"content\":\"ignored\"}}}}]}}\n\n", encode_openai_frames(&["a", "b"]));
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(body.into_bytes())];
        let mut s = decode_openai_stream(stream::iter(chunks), CancellationToken::new());
        let mut got = Vec::new();
        while let Some(ev) = s.next().await {
            got.push(ev.unwrap());
        }
        assert_eq!(
            got,
            vec![
                StreamEvent::Delta("a".to_string()),
                StreamEvent::Delta("b".to_string())
            ]
        );
    }
}
