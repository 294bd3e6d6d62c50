//! 模型输出解析
//!
//! 一次补全 = 一段说明（thought）+ 至多一个 JSON 工具调用 `{"tool": "...", "args": {...}}`。
//! 工具调用是输出中第一个带 "tool" 键的完整 JSON 对象；正文里其它花括号（示例字典、配置片段）不影响解析。
//! 没有工具调用表示模型认为当前任务已完成；出现了 "tool" 键却读不出完整调用属于格式错误，由 CompletionChannel 重试。

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codeact::ToolCall;

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub thought: String,
    pub tool_call: Option<ToolCall>,
}

/// 输出中的一个完整 JSON 值：[start, end) 字节区间
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSpan {
    pub start: usize,
    pub end: usize,
    pub value: Value,
}

static TOOL_KEY_RE: OnceLock<Regex> = OnceLock::new();

fn tool_key_re() -> &'static Regex {
    TOOL_KEY_RE.get_or_init(|| Regex::new(r#""tool"\s*:"#).unwrap())
}

/// 从每个 `openers` 字符起尝试读一个完整 JSON 值，读到后从其末尾继续扫描。
/// 读不出的位置（散文里的花括号、被截断的 JSON）直接跳过。
pub fn scan_json_values(text: &str, openers: &[char]) -> Vec<JsonSpan> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find(openers) {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = start + stream.byte_offset();
                found.push(JsonSpan { start, end, value });
                pos = end;
            }
            // 开括号都是 ASCII，+1 仍落在字符边界上
            _ => pos = start + 1,
        }
    }
    found
}

/// 解析第一个能反序列化为 T 的 JSON 对象或数组；找不到时返回可读原因
pub fn parse_json_block<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    let spans = scan_json_values(output, &['{', '[']);
    let mut last_err = None;
    for span in spans {
        match serde_json::from_value::<T>(span.value) {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(format!("{}: {}", e, &output[span.start..span.end])),
        }
    }
    Err(last_err.unwrap_or_else(|| "no JSON object found".to_string()))
}

/// 去掉调用前紧挨着的 ```json 围栏
fn thought_before(text: &str) -> String {
    let before = text.trim_end();
    let before = before
        .strip_suffix("```json")
        .or_else(|| before.strip_suffix("```"))
        .unwrap_or(before);
    before.trim().to_string()
}

/// 解析 Code-Act 步骤输出
pub fn parse_step(output: &str) -> Result<StepOutput, String> {
    let trimmed = output.trim();
    let call_span = scan_json_values(trimmed, &['{'])
        .into_iter()
        .find(|span| span.value.get("tool").is_some());

    let Some(span) = call_span else {
        if let Some(m) = tool_key_re().find(trimmed) {
            return Err(format!(
                "incomplete tool call JSON: {}",
                &trimmed[m.start()..]
            ));
        }
        return Ok(StepOutput {
            thought: trimmed.to_string(),
            tool_call: None,
        });
    };

    let raw = &trimmed[span.start..span.end];
    let call: ToolCall = serde_json::from_value(span.value).map_err(|e| format!("{}: {}", e, raw))?;
    let thought = thought_before(&trimmed[..span.start]);
    if call.tool.trim().is_empty() {
        return Ok(StepOutput {
            thought: if thought.is_empty() { trimmed.to_string() } else { thought },
            tool_call: None,
        });
    }
    if !call.args.is_object() {
        return Err(format!("\"args\" of tool '{}' must be a JSON object", call.tool));
    }
    Ok(StepOutput {
        thought,
        tool_call: Some(call),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thought_plus_call() {
        let out = parse_step("List files first.\n{\"tool\": \"execute_command\", \"args\": {\"command\": \"ls\"}}").unwrap();
        assert_eq!(out.thought, "List files first.");
        let call = out.tool_call.unwrap();
        assert_eq!(call.tool, "execute_command");
        assert_eq!(call.args["command"], "ls");
    }

    #[test]
    fn test_fenced_block() {
        let out = parse_step("Reading.\n```json\n{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}}\n```").unwrap();
        assert_eq!(out.thought, "Reading.");
        assert_eq!(out.tool_call.unwrap().tool, "read_file");
    }

    #[test]
    fn test_no_json_means_finish() {
        let out = parse_step("The task is complete.").unwrap();
        assert!(out.tool_call.is_none());
        assert_eq!(out.thought, "The task is complete.");
    }

    #[test]
    fn test_broken_json_is_format_error() {
        assert!(parse_step("{\"tool\": \"echo\", \"args\": ").is_err());
        assert!(parse_step("{\"tool\": \"echo\", \"args\": [1]}").is_err());
        assert!(parse_step("{\"tool\": 5}").is_err());
    }

    #[test]
    fn test_braces_in_prose_are_a_final_answer() {
        let out = parse_step("Done. The config now reads {port: 8080}.").unwrap();
        assert!(out.tool_call.is_none());
        assert_eq!(out.thought, "Done. The config now reads {port: 8080}.");

        let out = parse_step("Wrote the list [1, 2] and the map {\"a\": 1} to out.json.").unwrap();
        assert!(out.tool_call.is_none());
    }

    #[test]
    fn test_call_after_example_dict() {
        let out = parse_step(
            "I'll write a dict like {} first.\n{\"tool\": \"echo\", \"args\": {\"text\": \"{}\"}}\nThen check it.",
        )
        .unwrap();
        assert_eq!(out.thought, "I'll write a dict like {} first.");
        let call = out.tool_call.unwrap();
        assert_eq!(call.tool, "echo");
        assert_eq!(call.args["text"], "{}");
    }

    #[test]
    fn test_first_call_wins() {
        let out = parse_step(
            "{\"tool\": \"read_file\", \"args\": {\"path\": \"a\"}} {\"tool\": \"write_file\", \"args\": {}}",
        )
        .unwrap();
        assert_eq!(out.tool_call.unwrap().tool, "read_file");
    }

    #[test]
    fn test_scan_skips_unbalanced() {
        let spans = scan_json_values("a { b {\"x\": [1, {\"y\": 2}]} c", &['{']);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].value["x"][1]["y"], 2);
    }

    #[test]
    fn test_parse_json_block() {
        #[derive(serde::Deserialize)]
        struct Tasks {
            tasks: Vec<String>,
        }
        let t: Tasks = parse_json_block("Here:\n{\"tasks\": [\"a\", \"b\"]}").unwrap();
        assert_eq!(t.tasks, vec!["a", "b"]);
        let t: Tasks = parse_json_block("Like {\"other\": 1}; so {\"tasks\": [\"c\"]} trailing }").unwrap();
        assert_eq!(t.tasks, vec!["c"]);
        assert!(parse_json_block::<Tasks>("none").is_err());
    }
}
