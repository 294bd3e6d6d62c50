//! 工具执行器
//!
//! 持有只读 ToolRegistry 与默认超时。validate 查找工具并按参数 schema 校验；invoke 在超时内执行，
//! 结果统一归一为 Observation（metadata.action_type = 工具名）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::codeact::{Action, Observation, ObservationStatus};
use crate::core::AgentError;
use crate::tools::{Tool, ToolContext, ToolOutput, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 查找并校验参数；失败时直接给出 error Observation，不会触达运行时
    pub fn validate(&self, action: &Action) -> Result<Arc<dyn Tool>, Observation> {
        let reject = |err: AgentError, kind: &str| {
            Observation::error(action.id, err.to_string())
                .with_metadata("action_type", action.action_type.clone())
                .with_metadata("error_kind", kind)
        };
        let (Some(tool), Some(validator)) = (
            self.registry.get(&action.action_type),
            self.registry.validator(&action.action_type),
        ) else {
            let err = AgentError::ToolNotFound(format!(
                "{} (available: {})",
                action.action_type,
                self.tool_names().join(", ")
            ));
            return Err(reject(err, "tool_not_found"));
        };
        if let Err(e) = validator.validate(&action.arguments) {
            let err = AgentError::ToolArgumentInvalid {
                tool: action.action_type.clone(),
                reason: e.to_string(),
            };
            return Err(reject(err, "tool_argument_invalid"));
        }
        Ok(tool)
    }

    /// 执行已校验的工具；超时返回 ToolTimeout，工具返回 Err 则为 ToolExecutionFailed，均转为 error Observation
    pub async fn invoke(&self, tool: &dyn Tool, action: &Action, ctx: ToolContext<'_>) -> Observation {
        let start = Instant::now();
        let limit = tool.timeout().unwrap_or(self.timeout);
        let result = timeout(limit, tool.execute(action.arguments.clone(), ctx)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(out)) if out.status == ObservationStatus::Success => (true, "ok"),
            Ok(Ok(_)) => (false, "error"),
            Ok(Err(_)) => (false, "failed"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.name(),
            "correlation_id": ctx.correlation_id.to_string(),
            "conversation_id": ctx.conversation_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&action.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        let output = match result {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => ToolOutput::error(AgentError::ToolExecutionFailed(e).to_string()),
            Err(_) => ToolOutput::error(
                AgentError::ToolTimeout(format!("{} after {}s", tool.name(), limit.as_secs()))
                    .to_string(),
            ),
        };
        let mut obs = Observation {
            id: action.id,
            status: output.status,
            content: output.content,
            payload: output.payload,
            metadata: output.metadata,
            file_path: output.file_path,
        };
        obs.metadata
            .insert("action_type".to_string(), Value::from(tool.name()));
        obs.metadata
            .insert("duration_ms".to_string(), Value::from(duration_ms));
        obs.metadata
            .insert("memorized".to_string(), Value::from(tool.memorized()));
        obs
    }

    /// validate + invoke
    pub async fn dispatch(&self, action: &Action, ctx: ToolContext<'_>) -> Observation {
        match self.validate(action) {
            Ok(tool) => self.invoke(tool.as_ref(), action, ctx).await,
            Err(obs) => obs,
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeact::ToolCall;
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// 记录 parameters_schema 被调用的次数
    #[derive(Default)]
    struct SchemaCounter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SchemaCounter {
        fn name(&self) -> &str {
            "counted"
        }
        fn description(&self) -> &str {
            "counts schema lookups"
        }
        fn parameters_schema(&self) -> Value {
            self.calls.fetch_add(1, Ordering::SeqCst);
            serde_json::json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            })
        }
        async fn execute(&self, _: Value, _: ToolContext<'_>) -> Result<ToolOutput, String> {
            Ok(ToolOutput::success("counted"))
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }
        async fn execute(&self, _: Value, _: ToolContext<'_>) -> Result<ToolOutput, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::success("late"))
        }
    }

    fn executor() -> ToolExecutor {
        let registry = ToolRegistry::load(vec![Arc::new(EchoTool), Arc::new(Slow)]);
        ToolExecutor::new(Arc::new(registry), Duration::from_secs(5))
    }

    fn action(tool: &str, args: Value) -> Action {
        Action::new(
            ToolCall {
                tool: tool.to_string(),
                args,
            },
            1,
            "",
        )
    }

    fn ctx(id: Uuid) -> ToolContext<'static> {
        ToolContext {
            correlation_id: id,
            conversation_id: "conv",
            runtime: None,
        }
    }

    #[tokio::test]
    async fn test_validated_dispatch_tags_action_type() {
        let exec = executor();
        let a = action("echo", serde_json::json!({"text": "hi"}));
        let tool = exec.validate(&a).ok().unwrap();
        let obs = exec.invoke(tool.as_ref(), &a, ctx(a.id)).await;
        assert_eq!(obs.id, a.id);
        assert!(obs.is_success());
        assert_eq!(obs.content, "hi");
        assert_eq!(obs.action_type(), Some("echo"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_observation() {
        let exec = executor();
        let a = action("nope", serde_json::json!({}));
        let obs = exec.dispatch(&a, ctx(a.id)).await;
        assert!(!obs.is_success());
        assert_eq!(obs.id, a.id);
        assert!(obs.content.contains("Tool not found"));
        assert_eq!(obs.metadata["error_kind"], "tool_not_found");
    }

    #[tokio::test]
    async fn test_schema_violation_is_error_observation() {
        let exec = executor();
        let a = action("echo", serde_json::json!({"text": 5}));
        let obs = exec.dispatch(&a, ctx(a.id)).await;
        assert!(!obs.is_success());
        assert!(obs.content.contains("Invalid arguments for tool 'echo'"));
    }

    #[tokio::test]
    async fn test_schema_compiled_once_at_registration() {
        let tool = SchemaCounter::default();
        let calls = Arc::clone(&tool.calls);
        let registry = ToolRegistry::load(vec![Arc::new(tool)]);
        let exec = ToolExecutor::new(Arc::new(registry.subset(&[])), Duration::from_secs(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        for n in 0..3 {
            let a = action("counted", serde_json::json!({"n": n}));
            assert!(exec.dispatch(&a, ctx(a.id)).await.is_success());
        }
        let bad = action("counted", serde_json::json!({"n": "three"}));
        assert!(!exec.dispatch(&bad, ctx(bad.id)).await.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_error_observation() {
        let exec = executor();
        let a = action("slow", serde_json::json!({}));
        let obs = exec.dispatch(&a, ctx(a.id)).await;
        assert!(!obs.is_success());
        assert!(obs.content.contains("Tool timeout"));
        assert_eq!(obs.action_type(), Some("slow"));
    }
}
