//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时做参数校验、加超时并统一转为 Observation。
//! 注册时校验名称唯一、参数 schema 可编译，编译好的校验器随工具保存；加载阶段遇到不合格的工具只告警并跳过。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codeact::{Observation, ObservationStatus};
use crate::core::AgentError;
use crate::runtime::RuntimeSession;

/// 工具名最大长度
const MAX_TOOL_NAME_LEN: usize = 64;

/// 单次调用的上下文
#[derive(Clone, Copy)]
pub struct ToolContext<'a> {
    /// 与 Action.id 相同
    pub correlation_id: Uuid,
    pub conversation_id: &'a str,
    /// 仅当工具 requires_runtime 时存在
    pub runtime: Option<&'a dyn RuntimeSession>,
}

impl<'a> ToolContext<'a> {
    pub fn runtime(&self) -> Result<&'a dyn RuntimeSession, String> {
        self.runtime
            .ok_or_else(|| "this tool needs a runtime session but none is connected".to_string())
    }
}

/// 工具执行结果（由执行器补全 id 与 metadata 后转为 Observation）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub status: ObservationStatus,
    pub content: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    pub file_path: Option<String>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            status: ObservationStatus::Success,
            content: content.into(),
            payload: Value::Null,
            metadata: Map::new(),
            file_path: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            status: ObservationStatus::Error,
            ..Self::success(content)
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }
}

impl From<Observation> for ToolOutput {
    fn from(obs: Observation) -> Self {
        Self {
            status: obs.status,
            content: obs.content,
            payload: obs.payload,
            metadata: obs.metadata,
            file_path: obs.file_path,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不接受任何参数约束
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 结果是否逐字保留在 Memory 中
    fn memorized(&self) -> bool {
        false
    }

    /// 是否需要沙箱运行时
    fn requires_runtime(&self) -> bool {
        false
    }

    /// 覆盖执行器的默认超时
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Err 表示执行失败，执行器会转为 error Observation
    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String>;
}

fn validate_descriptor(tool: &dyn Tool) -> Result<Validator, String> {
    let name = tool.name();
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(format!("invalid tool name length: '{}'", name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(format!("invalid characters in tool name '{}'", name));
    }
    let schema = tool.parameters_schema();
    if !schema.is_object() {
        return Err(format!("parameter schema of '{}' is not an object", name));
    }
    if let Some(ty) = schema.get("type") {
        if ty != "object" {
            return Err(format!("parameter schema of '{}' must describe an object", name));
        }
    }
    jsonschema::validator_for(&schema)
        .map_err(|e| format!("parameter schema of '{}' does not compile: {}", name, e))
}

/// 已注册的工具及其参数校验器
#[derive(Clone)]
struct Registered {
    tool: Arc<dyn Tool>,
    validator: Arc<Validator>,
}

/// 工具注册表：运行期间只读，按名称存储
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 批量加载：不合格的工具告警后跳过
    pub fn load(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut registry = Self::new();
        for tool in tools {
            let name = tool.name().to_string();
            if let Err(e) = registry.register_arc(tool) {
                tracing::warn!(tool = %name, error = %e, "skipping malformed tool");
            }
        }
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), AgentError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(AgentError::Config(format!("duplicate tool name '{}'", name)));
        }
        let validator = validate_descriptor(tool.as_ref()).map_err(AgentError::Config)?;
        tracing::debug!(tool = %name, memorized = tool.memorized(), "tool registered");
        self.tools.insert(
            name,
            Registered {
                tool,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    /// 注册时编译好的参数校验器
    pub fn validator(&self, name: &str) -> Option<Arc<Validator>> {
        self.tools.get(name).map(|r| Arc::clone(&r.validator))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名称排序
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按白名单收窄；白名单为空时返回全部
    pub fn subset(&self, allowlist: &[String]) -> ToolRegistry {
        if allowlist.is_empty() {
            return self.clone();
        }
        let mut tools = HashMap::new();
        for name in allowlist {
            match self.tools.get(name) {
                Some(registered) => {
                    tools.insert(name.clone(), registered.clone());
                }
                None => tracing::warn!(tool = %name, "allowlisted tool is not registered"),
            }
        }
        ToolRegistry { tools }
    }

    /// 返回 (name, description) 列表，用于生成 prompt 中的 Available tools 段落
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                let desc = self.tools.get(&name)?.tool.description().to_string();
                Some((name, desc))
            })
            .collect()
    }

    /// 全部工具的 schema JSON（名称、描述、参数），按名称排序
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|Registered { tool, .. }| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    struct BadSchema;

    #[async_trait]
    impl Tool for BadSchema {
        fn name(&self) -> &str {
            "bad"
        }
        fn description(&self) -> &str {
            "broken schema"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"x": {"type": 42}}})
        }
        async fn execute(&self, _: Value, _: ToolContext<'_>) -> Result<ToolOutput, String> {
            Ok(ToolOutput::success(""))
        }
    }

    struct BadName;

    #[async_trait]
    impl Tool for BadName {
        fn name(&self) -> &str {
            "has space"
        }
        fn description(&self) -> &str {
            ""
        }
        async fn execute(&self, _: Value, _: ToolContext<'_>) -> Result<ToolOutput, String> {
            Ok(ToolOutput::success(""))
        }
    }

    #[test]
    fn test_load_skips_malformed_tools() {
        let registry = ToolRegistry::load(vec![
            Arc::new(EchoTool),
            Arc::new(BadSchema),
            Arc::new(BadName),
            Arc::new(EchoTool),
        ]);
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        assert!(matches!(
            registry.register(EchoTool),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_subset_and_schema() {
        let registry = ToolRegistry::load(vec![Arc::new(EchoTool)]);
        let sub = registry.subset(&["echo".to_string(), "ghost".to_string()]);
        assert_eq!(sub.len(), 1);
        assert!(registry.subset(&["ghost".to_string()]).is_empty());
        assert_eq!(registry.subset(&[]).len(), 1);
        assert!(sub.validator("echo").is_some());
        assert!(sub.validator("ghost").is_none());

        let schema: Value = serde_json::from_str(&registry.to_schema_json()).unwrap();
        assert_eq!(schema[0]["name"], "echo");
        assert_eq!(schema[0]["parameters"]["required"][0], "text");
    }
}
