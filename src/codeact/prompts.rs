//! 提示词模板

use crate::codeact::{Plan, Task};
use crate::tools::{tool_call_schema_json, ToolRegistry};

pub const PLANNING_PROMPT: &str = "You break a user's goal into a short ordered list of concrete tasks \
that an engineering agent can execute one after another in a sandboxed workspace. \
Reply with JSON only, in the form {\"tasks\": [\"first task\", \"second task\"]}. \
Use between 1 and 8 tasks; each task is one sentence.";

pub const REFLECTION_PROMPT: &str = "The agent failed several times in a row. \
Review the failures and decide how to continue. Reply with JSON only:\n\
{\"decision\": \"revise\", \"tasks\": [\"new task\"], \"guidance\": \"what to do differently\"}\n\
to replace the failing task with new tasks (tasks may be empty if guidance alone is enough), or\n\
{\"decision\": \"stop\", \"reason\": \"why the goal cannot be reached\"}\n\
to give up.";

pub const SUMMARY_PROMPT: &str = "Summarize for the user what was done in this run, \
which files changed and what the outcome was. Plain text, at most 8 sentences.";

/// Code-Act 循环的 system prompt：工具 schema、调用格式、Plan 与当前任务
pub fn code_act_system_prompt(tools: &ToolRegistry, plan: &Plan, current: &Task) -> String {
    let tool_lines: Vec<String> = tools
        .tool_descriptions()
        .into_iter()
        .map(|(name, desc)| format!("- {}: {}", name, desc))
        .collect();
    format!(
        "You are an autonomous engineering agent working inside a sandboxed workspace.\n\
         Work on the current task only. In every reply write a short explanation, then at most one JSON tool call:\n\
         {{\"tool\": \"<tool name>\", \"args\": {{...}}}}\n\
         Reply without any JSON once the current task is finished.\n\n\
         Tool call format (JSON Schema):\n{}\n\n\
         Available tools:\n{}\n\n\
         Tool parameter schemas:\n{}\n\n\
         {}\n\
         Current task: #{} {}",
        tool_call_schema_json(),
        tool_lines.join("\n"),
        tools.to_schema_json(),
        plan.render_markdown(),
        current.id,
        current.description
    )
}
