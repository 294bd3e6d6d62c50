//! 规划策略：目标 → 初始 Plan
//!
//! - single_shot：整个目标作为唯一任务，不调用模型
//! - server_assisted：请模型输出 `{"tasks": [...]}`，格式错误按 CompletionChannel 的重试策略处理
//! - local_only：不调用模型，按编号列表或 "then" 连接拆分；拆不开则退化为单任务
//!
//! 任何失败都是 PlanningError（取消除外）。

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::codeact::parser::parse_json_block;
use crate::codeact::prompts::PLANNING_PROMPT;
use crate::codeact::Plan;
use crate::core::AgentError;
use crate::llm::{CompletionChannel, DeltaSink};
use crate::memory::Message;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    #[default]
    SingleShot,
    ServerAssisted,
    LocalOnly,
}

impl fmt::Display for PlanningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanningMode::SingleShot => "single_shot",
            PlanningMode::ServerAssisted => "server_assisted",
            PlanningMode::LocalOnly => "local_only",
        })
    }
}

impl FromStr for PlanningMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "single_shot" | "single" => Ok(PlanningMode::SingleShot),
            "server_assisted" | "server" => Ok(PlanningMode::ServerAssisted),
            "local_only" | "local" => Ok(PlanningMode::LocalOnly),
            other => Err(AgentError::Config(format!("unknown planning mode: {}", other))),
        }
    }
}

/// `{"tasks": [...]}` 或直接数组；元素可以是字符串或 `{"description": ...}`
pub fn parse_task_list(output: &str) -> Result<Vec<String>, String> {
    let value: Value = parse_json_block(output)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("tasks")
            .and_then(|t| t.as_array())
            .ok_or_else(|| "missing \"tasks\" array".to_string())?,
        _ => return Err("expected {\"tasks\": [...]}".to_string()),
    };
    let tasks: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(o) => o
                .get("description")
                .and_then(|d| d.as_str())
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();
    if tasks.is_empty() {
        return Err("task list is empty".to_string());
    }
    Ok(tasks)
}

static LIST_ITEM_RE: OnceLock<Regex> = OnceLock::new();
static THEN_SEP_RE: OnceLock<Regex> = OnceLock::new();

/// 编号或项目符号列表的一行
fn list_item_re() -> &'static Regex {
    LIST_ITEM_RE.get_or_init(|| Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*])\s+(.+?)\s*$").unwrap())
}

/// "then" / "and then" / ";" 分隔
fn then_sep_re() -> &'static Regex {
    THEN_SEP_RE.get_or_init(|| Regex::new(r"(?i)\s*(?:;|,?\s+and then\s+|,?\s+then\s+)\s*").unwrap())
}

/// 本地拆分：编号/项目符号列表，或 "then" / ";" 连接的句子
pub fn split_goal_locally(goal: &str) -> Vec<String> {
    let goal = goal.trim();
    let items: Vec<String> = list_item_re()
        .captures_iter(goal)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect();
    if items.len() >= 2 {
        return items;
    }
    let parts: Vec<String> = then_sep_re()
        .split(goal)
        .map(|p| p.trim().trim_end_matches('.').trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() >= 2 {
        return parts;
    }
    vec![goal.to_string()]
}

pub struct PlanningStrategy<'a> {
    channel: &'a CompletionChannel,
}

impl<'a> PlanningStrategy<'a> {
    pub fn new(channel: &'a CompletionChannel) -> Self {
        Self { channel }
    }

    pub async fn plan(
        &self,
        goal: &str,
        history: &[Message],
        mode: PlanningMode,
        sink: &dyn DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<Plan, AgentError> {
        if goal.trim().is_empty() {
            return Err(AgentError::Planning("goal is empty".to_string()));
        }
        let tasks = match mode {
            PlanningMode::SingleShot => vec![goal.trim().to_string()],
            PlanningMode::LocalOnly => split_goal_locally(goal),
            PlanningMode::ServerAssisted => {
                let mut messages = vec![Message::system(PLANNING_PROMPT)];
                messages.extend_from_slice(history);
                messages.push(Message::user(format!("Goal: {}", goal.trim())));
                match self
                    .channel
                    .request(&messages, sink, cancel, parse_task_list)
                    .await
                {
                    Ok((tasks, _)) => tasks,
                    Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) => return Err(AgentError::Planning(e.to_string())),
                }
            }
        };
        tracing::info!(mode = %mode, tasks = tasks.len(), "initial plan ready");
        Plan::new(tasks)
    }
}
