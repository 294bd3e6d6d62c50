//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构注入 system prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 工具调用请求格式：与步骤解析的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是 Available tools 中的一个
    pub tool: String,
    /// 工具参数，需满足该工具的 parameters schema
    pub args: serde_json::Map<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_names_both_fields() {
        let v: Value = serde_json::from_str(&tool_call_schema_json()).unwrap();
        let required = v["required"].as_array().unwrap();
        assert!(required.iter().any(|r| r == "tool"));
        assert!(required.iter().any(|r| r == "args"));
    }
}
