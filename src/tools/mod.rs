pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod mcp;
pub mod patch;
pub mod registry;
pub mod schema;
pub mod shell;

use std::sync::Arc;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{ReadFileTool, WriteFileTool};
pub use mcp::{bridge_tools, McpCallResult, McpContent, McpGateway, McpTool, McpToolInfo};
pub use patch::ApplyPatchTool;
pub use registry::{Tool, ToolContext, ToolOutput, ToolRegistry};
pub use schema::tool_call_schema_json;
pub use shell::{ExecuteCommandTool, DEFAULT_FORBIDDEN_PATTERNS};

/// 内置工具集合
pub fn builtin_tools(forbidden_patterns: Vec<String>, action_timeout_secs: u64) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ExecuteCommandTool::new(forbidden_patterns, action_timeout_secs)),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(ApplyPatchTool),
        Arc::new(EchoTool),
    ]
}
