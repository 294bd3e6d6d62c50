//! 反思策略
//!
//! 连续失败达到阈值后，把失败尾部与当前 Plan 交给模型，得到修订（追加新任务和/或指导）或停止建议。
//! 与规划共用 CompletionChannel 的格式重试。

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::codeact::parser::parse_json_block;
use crate::codeact::prompts::REFLECTION_PROMPT;
use crate::codeact::{Action, Observation, Plan};
use crate::core::AgentError;
use crate::llm::{CompletionChannel, DeltaSink};
use crate::memory::Message;

/// 失败内容在反思请求中保留的字符数
const FAILURE_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionOutcome {
    /// 追加任务（可为空）并附带指导
    Revise {
        tasks: Vec<String>,
        guidance: Option<String>,
    },
    Stop { reason: String },
}

#[derive(Deserialize)]
struct RawReflection {
    decision: String,
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    guidance: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

pub fn parse_reflection(output: &str) -> Result<ReflectionOutcome, String> {
    let raw: RawReflection = parse_json_block(output)?;
    match raw.decision.trim().to_lowercase().as_str() {
        "revise" | "retry" | "continue" => {
            let tasks: Vec<String> = raw
                .tasks
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            let guidance = raw
                .guidance
                .map(|g| g.trim().to_string())
                .filter(|g| !g.is_empty());
            if tasks.is_empty() && guidance.is_none() {
                return Err("a revise decision needs new tasks or guidance".to_string());
            }
            Ok(ReflectionOutcome::Revise { tasks, guidance })
        }
        "stop" | "abort" => Ok(ReflectionOutcome::Stop {
            reason: raw
                .reason
                .unwrap_or_else(|| "the model recommended stopping".to_string()),
        }),
        other => Err(format!("unknown decision '{}', expected revise or stop", other)),
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() <= FAILURE_PREVIEW_CHARS {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(FAILURE_PREVIEW_CHARS).collect::<String>())
    }
}

pub struct ReflectionStrategy<'a> {
    channel: &'a CompletionChannel,
}

impl<'a> ReflectionStrategy<'a> {
    pub fn new(channel: &'a CompletionChannel) -> Self {
        Self { channel }
    }

    pub async fn reflect(
        &self,
        goal: &str,
        plan: &Plan,
        failures: &[(&Action, &Observation)],
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<ReflectionOutcome, AgentError> {
        let mut report = String::new();
        for (i, (action, obs)) in failures.iter().enumerate() {
            report.push_str(&format!(
                "{}. tool `{}` args {}\n   result: {}\n",
                i + 1,
                action.action_type,
                action.arguments,
                preview(&obs.content)
            ));
        }
        if report.is_empty() {
            report.push_str("(the model's completions themselves failed)\n");
        }
        let messages = vec![
            Message::system(REFLECTION_PROMPT),
            Message::user(format!(
                "Goal: {}\n\n{}\nConsecutive failures:\n{}",
                goal,
                plan.render_markdown(),
                report
            )),
        ];
        let (outcome, _) = self
            .channel
            .request(&messages, sink, cancel, parse_reflection)
            .await?;
        tracing::info!(?outcome, "reflection finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_revise_and_stop() {
        assert_eq!(
            parse_reflection("{\"decision\": \"revise\", \"tasks\": [\"install deps\"], \"guidance\": \"use pip\"}")
                .unwrap(),
            ReflectionOutcome::Revise {
                tasks: vec!["install deps".into()],
                guidance: Some("use pip".into()),
            }
        );
        assert_eq!(
            parse_reflection("{\"decision\": \"stop\", \"reason\": \"no network\"}").unwrap(),
            ReflectionOutcome::Stop {
                reason: "no network".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_empty_revise_and_unknown() {
        assert!(parse_reflection("{\"decision\": \"revise\"}").is_err());
        assert!(parse_reflection("{\"decision\": \"dance\"}").is_err());
        assert!(parse_reflection("I think we should stop").is_err());
    }
}
