//! 运行摘要：SUMMARIZING 时请模型总结，失败则退化为本地渲染；FAILED 运行只给本地部分摘要

use tokio_util::sync::CancellationToken;

use crate::codeact::prompts::SUMMARY_PROMPT;
use crate::codeact::Plan;
use crate::llm::{CompletionChannel, NoopSink};
use crate::memory::{Memory, Message};

/// 本地摘要中列出的最近步骤数
const RECENT_STEPS: usize = 5;

/// 不调用模型的摘要：Plan + 步数统计 + 最近几步
pub fn render_local_summary(goal: &str, plan: &Plan, memory: &Memory, outcome: &str) -> String {
    let steps: Vec<_> = memory.steps().collect();
    let failed = steps.iter().filter(|(_, o)| !o.is_success()).count();
    let mut s = format!(
        "Goal: {}\nOutcome: {}\nActions: {} ({} failed)\n\n{}",
        goal,
        outcome,
        steps.len(),
        failed,
        plan.render_markdown()
    );
    let recent = memory.tail_steps(RECENT_STEPS);
    if !recent.is_empty() {
        s.push_str("\nRecent actions:\n");
        for (a, o) in recent {
            let first_line = o.content.lines().next().unwrap_or("");
            s.push_str(&format!(
                "- {} [{}] {}\n",
                a.action_type,
                if o.is_success() { "ok" } else { "error" },
                first_line.chars().take(120).collect::<String>()
            ));
        }
    }
    s
}

/// 模型摘要；任何失败（包括取消）都退化为本地摘要
pub async fn summarize(
    channel: &CompletionChannel,
    goal: &str,
    plan: &Plan,
    memory: &Memory,
    cancel: &CancellationToken,
) -> String {
    let local = render_local_summary(goal, plan, memory, "completed");
    let messages = vec![
        Message::system(SUMMARY_PROMPT),
        Message::user(local.clone()),
    ];
    match channel.stream(&messages, &NoopSink, cancel).await {
        Ok(c) if !c.text.trim().is_empty() => c.text.trim().to_string(),
        Ok(_) => local,
        Err(e) => {
            tracing::warn!(error = %e, "model summary failed, using local summary");
            local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeact::{Action, Observation, ToolCall};
    use crate::llm::{CompletionSettings, ScriptedLlmClient};
    use std::sync::Arc;

    #[test]
    fn test_local_summary_counts_failures() {
        let plan = Plan::new(["build"]).unwrap();
        let mut memory = Memory::new();
        for ok in [true, false] {
            let a = Action::new(
                ToolCall {
                    tool: "execute_command".into(),
                    args: serde_json::json!({"command": "make"}),
                },
                1,
                "",
            );
            let o = if ok {
                Observation::success(a.id, "done")
            } else {
                Observation::error(a.id, "Exit Some(2)\nmake: *** error")
            };
            memory.record(a, o, false);
        }
        let s = render_local_summary("build it", &plan, &memory, "iteration limit reached");
        assert!(s.contains("Actions: 2 (1 failed)"));
        assert!(s.contains("execute_command [error] Exit Some(2)"));
    }

    #[tokio::test]
    async fn test_falls_back_when_model_fails() {
        let channel = CompletionChannel::new(
            Arc::new(ScriptedLlmClient::new(Vec::<String>::new())),
            CompletionSettings::default(),
        );
        let plan = Plan::new(["x"]).unwrap();
        let s = summarize(&channel, "g", &plan, &Memory::new(), &CancellationToken::new()).await;
        assert!(s.starts_with("Goal: g"));
    }
}
