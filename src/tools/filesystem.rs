//! 工作区文件读写工具：read_file（memorized）、write_file
//!
//! 读写都经由运行时会话，路径越界由后端（SafeFs 或远程服务）拒绝。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext, ToolOutput};

/// 单次读取返回的最大字节数
const MAX_READ_BYTES: usize = 256 * 1024;

fn path_arg(args: &Value) -> Result<&str, String> {
    args.get("path")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| "Missing path".to_string())
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace. Args: {\"path\": \"relative/path\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" }
            },
            "required": ["path"]
        })
    }

    fn memorized(&self) -> bool {
        true
    }

    fn requires_runtime(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String> {
        let path = path_arg(&args)?;
        let bytes = ctx.runtime()?.read_file(path).await.map_err(|e| e.to_string())?;
        let total = bytes.len();
        let shown = &bytes[..total.min(MAX_READ_BYTES)];
        let mut content = String::from_utf8_lossy(shown).into_owned();
        if total > MAX_READ_BYTES {
            content.push_str(&format!("\n... [truncated, {} bytes total]", total));
        }
        Ok(ToolOutput::success(content)
            .with_payload(serde_json::json!({ "bytes": total }))
            .with_file_path(path))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace. Args: {\"path\": \"...\", \"content\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"]
        })
    }

    fn requires_runtime(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String> {
        let path = path_arg(&args)?;
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
        ctx.runtime()?
            .write_file(path, content.as_bytes())
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolOutput::success(format!("Wrote {} bytes to {}", content.len(), path))
            .with_payload(serde_json::json!({ "bytes": content.len() }))
            .with_file_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        LocalProcessRuntime, PortAllocator, PortSettings, RuntimeSession, RuntimeSettings,
        SessionSpec,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_then_read_through_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RuntimeSettings {
            workspace_root: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        };
        let rt = LocalProcessRuntime::new(
            SessionSpec::new("u", "c"),
            Arc::new(settings),
            Arc::new(PortAllocator::new(PortSettings::default()).unwrap()),
        );
        rt.connect().await.unwrap();
        let ctx = ToolContext {
            correlation_id: uuid::Uuid::new_v4(),
            conversation_id: "c",
            runtime: Some(&rt),
        };

        let out = WriteFileTool
            .execute(serde_json::json!({"path": "notes/a.md", "content": "# hi"}), ctx)
            .await
            .unwrap();
        assert_eq!(out.file_path.as_deref(), Some("notes/a.md"));

        let out = ReadFileTool
            .execute(serde_json::json!({"path": "notes/a.md"}), ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "# hi");

        let err = ReadFileTool
            .execute(serde_json::json!({"path": "../../etc/passwd"}), ctx)
            .await
            .unwrap_err();
        assert!(err.contains("Path escape"));
        rt.release().await.unwrap();
    }
}
