//! apply_patch：在工作区应用 unified diff

use async_trait::async_trait;
use serde_json::Value;

use crate::runtime::RuntimeAction;
use crate::tools::{Tool, ToolContext, ToolOutput};

pub struct ApplyPatchTool;

/// 粗略检查是否像 unified diff
fn looks_like_diff(patch: &str) -> bool {
    patch.lines().any(|l| l.starts_with("--- ")) && patch.lines().any(|l| l.starts_with("+++ "))
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff (git format, paths relative to the workspace root)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "patch": { "type": "string", "description": "Unified diff text" }
            },
            "required": ["patch"]
        })
    }

    fn requires_runtime(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String> {
        let patch = args.get("patch").and_then(|v| v.as_str()).unwrap_or("");
        if !looks_like_diff(patch) {
            return Err("patch is not a unified diff (missing ---/+++ headers)".to_string());
        }
        let mut patch = patch.to_string();
        if !patch.ends_with('\n') {
            patch.push('\n');
        }
        let action = RuntimeAction::apply_patch(ctx.correlation_id, patch);
        let obs = ctx
            .runtime()?
            .do_action(&action)
            .await
            .map_err(|e| e.to_string())?;
        let mut out = ToolOutput::from(obs);
        if out.content.trim().is_empty() {
            out.content = "Patch applied".to_string();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_detection() {
        assert!(looks_like_diff("--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b\n"));
        assert!(!looks_like_diff("just text"));
    }
}
