//! execute_command：在运行时会话的工作区内执行 shell 命令
//!
//! 禁止 rm -rf、mkfs、fork bomb 等危险子串（可配置）；实际执行由 RuntimeSession::do_action 完成，
//! 因此本地、容器、远程三种后端行为一致。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::runtime::RuntimeAction;
use crate::tools::{Tool, ToolContext, ToolOutput};

/// 默认禁止的子串
pub const DEFAULT_FORBIDDEN_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod 777 /",
    "shutdown",
    "reboot",
    ":(){ :|:& };:", // fork bomb
];

pub struct ExecuteCommandTool {
    forbidden: Vec<String>,
    action_timeout_secs: u64,
}

impl ExecuteCommandTool {
    pub fn new(forbidden: Vec<String>, action_timeout_secs: u64) -> Self {
        let forbidden = forbidden.into_iter().map(|s| s.to_lowercase()).collect();
        Self {
            forbidden,
            action_timeout_secs,
        }
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        if raw.trim().is_empty() {
            return Err("Empty command".to_string());
        }
        let lower = raw.to_lowercase();
        match self.forbidden.iter().find(|p| lower.contains(p.as_str())) {
            Some(p) => Err(format!("Forbidden pattern: {}", p)),
            None => Ok(()),
        }
    }
}

impl Default for ExecuteCommandTool {
    fn default() -> Self {
        Self::new(
            DEFAULT_FORBIDDEN_PATTERNS.iter().map(|s| s.to_string()).collect(),
            120,
        )
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the sandboxed workspace and return exit code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Optional per-command timeout in seconds"
                }
            },
            "required": ["command"]
        })
    }

    fn requires_runtime(&self) -> bool {
        true
    }

    fn timeout(&self) -> Option<Duration> {
        // 运行时自己按 action 超时终止命令，这里只留余量
        Some(Duration::from_secs(self.action_timeout_secs + 10))
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check(command)?;
        let timeout_secs = args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(|t| t.min(self.action_timeout_secs));

        tracing::info!(command = %command, "execute_command");
        let runtime = ctx.runtime()?;
        let action = RuntimeAction::run(ctx.correlation_id, command, timeout_secs);
        runtime
            .do_action(&action)
            .await
            .map(ToolOutput::from)
            .map_err(|e| e.to_string())
    }
}
