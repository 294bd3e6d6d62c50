//! 子进程执行辅助：带超时运行命令，输出转 Observation
//!
//! 本地与容器后端共用；超时会杀掉子进程（kill_on_drop）。

use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use uuid::Uuid;

use crate::codeact::Observation;
use crate::core::AgentError;

/// 单个输出流保留的最大字符数
const MAX_OUTPUT_CHARS: usize = 16_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn truncate_output(s: &str) -> String {
    let total = s.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return s.to_string();
    }
    // 保留尾部：错误信息通常在最后
    let tail: String = s.chars().skip(total - MAX_OUTPUT_CHARS).collect();
    format!("[{} chars truncated]\n{}", total - MAX_OUTPUT_CHARS, tail)
}

/// 运行命令；超时或无法启动返回 RuntimeAction 错误
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<CommandOutput, AgentError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd
        .spawn()
        .map_err(|e| AgentError::RuntimeAction(format!("spawn failed: {}", e)))?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            AgentError::RuntimeAction(format!("command timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| AgentError::RuntimeAction(format!("execution failed: {}", e)))?;
    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
        stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
    })
}

/// 非零退出码为 error Observation；payload 带完整的 exit_code / stdout / stderr
pub fn observation_from_output(id: Uuid, output: &CommandOutput) -> Observation {
    let mut content = output.stdout.trim_end().to_string();
    if !output.stderr.trim().is_empty() {
        if !content.is_empty() {
            content.push('\n');
        }
        content.push_str("stderr: ");
        content.push_str(output.stderr.trim_end());
    }
    let payload = json!({
        "exit_code": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
    });
    if output.success() {
        Observation::success(id, content).with_payload(payload)
    } else {
        let content = format!("Exit {:?}\n{}", output.exit_code, content);
        Observation::error(id, content).with_payload(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_and_observe() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hi; echo warn >&2"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
        let obs = observation_from_output(Uuid::new_v4(), &out);
        assert!(obs.is_success());
        assert!(obs.content.contains("hi"));
        assert!(obs.content.contains("stderr: warn"));
        assert_eq!(obs.payload["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error_observation() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        let obs = observation_from_output(Uuid::new_v4(), &out);
        assert!(!obs.is_success());
        assert!(obs.content.starts_with("Exit Some(3)"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let err = run_with_timeout(cmd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RuntimeAction(_)));
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let s = format!("{}END", "a".repeat(MAX_OUTPUT_CHARS));
        let t = truncate_output(&s);
        assert!(t.ends_with("END"));
        assert!(t.starts_with("[3 chars truncated]"));
    }
}
