//! MCP 桥接：把外部协议网关暴露的工具包装成普通 Tool
//!
//! 传输层不在这里实现；McpGateway 只约定 list_tools / call_tool 两个操作。
//! 桥接后的工具名为 `<server>.<tool>`，与原生工具一样注册、校验和审计。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{Tool, ToolContext, ToolOutput};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text { text: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl McpCallResult {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                McpContent::Text { text } => Some(text.as_str()),
                McpContent::Unsupported => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait McpGateway: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, AgentError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallResult, AgentError>;
}

pub struct McpTool {
    gateway: Arc<dyn McpGateway>,
    info: McpToolInfo,
    qualified_name: String,
}

impl McpTool {
    pub fn new(gateway: Arc<dyn McpGateway>, info: McpToolInfo) -> Self {
        let qualified_name = format!("{}.{}", gateway.server_name(), info.name);
        Self {
            gateway,
            info,
            qualified_name,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String> {
        tracing::debug!(tool = %self.qualified_name, correlation_id = %ctx.correlation_id, "mcp call");
        let result = self
            .gateway
            .call_tool(&self.info.name, args)
            .await
            .map_err(|e| e.to_string())?;
        let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
        let out = if result.is_error {
            ToolOutput::error(result.text())
        } else {
            ToolOutput::success(result.text())
        };
        Ok(out.with_payload(payload))
    }
}

/// 列出网关全部工具并包装为 Tool；交给 ToolRegistry::load 做校验
pub async fn bridge_tools(gateway: Arc<dyn McpGateway>) -> Result<Vec<Arc<dyn Tool>>, AgentError> {
    let infos = gateway.list_tools().await?;
    tracing::info!(server = %gateway.server_name(), count = infos.len(), "bridging mcp tools");
    Ok(infos
        .into_iter()
        .map(|info| Arc::new(McpTool::new(Arc::clone(&gateway), info)) as Arc<dyn Tool>)
        .collect())
}
