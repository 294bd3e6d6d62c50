//! Code-Act 主循环
//!
//! 每轮：检查停止条件 → 激活当前任务 → 拼请求（system: 工具 schema + Plan + 当前任务；Memory）→ 流式补全 →
//! 无工具调用则当前任务完成；有则校验、（按需懒连接运行时）执行、写回 Observation、更新失败计数。
//! 停止条件按顺序检查：取消 → 全部完成 → 迭代上限 → 连续失败达到阈值（交给反思）。
//! 迭代计数跨反思累计，保证运行必然终止。

use tokio_util::sync::CancellationToken;

use crate::codeact::parser::parse_step;
use crate::codeact::prompts::code_act_system_prompt;
use crate::codeact::{Action, Observation, Plan, RunMessage, TaskStatus};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine, RunContext};
use crate::llm::CompletionChannel;
use crate::memory::{Memory, Message};
use crate::runtime::RuntimeLease;
use crate::tools::{ToolContext, ToolExecutor};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: usize,
    /// 连续失败多少次后进入反思
    pub failure_threshold: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Completed,
    IterationLimit,
    Reflect,
    Cancelled,
}

/// 循环在多次进入（反思前后）之间保留的状态
#[derive(Debug, Clone)]
pub struct LoopState {
    pub plan: Plan,
    pub memory: Memory,
    /// 运行前的对话轮次
    pub history: Vec<Message>,
    pub iterations: usize,
    pub consecutive_failures: usize,
}

impl LoopState {
    pub fn new(plan: Plan, history: Vec<Message>, goal: &str) -> Self {
        let mut memory = Memory::new();
        memory.push_turn(Message::user(goal.to_string()));
        Self {
            plan,
            memory,
            history,
            iterations: 0,
            consecutive_failures: 0,
        }
    }

    /// 最近一串失败的步骤（供反思使用）
    pub fn failure_tail(&self) -> Vec<(&Action, &Observation)> {
        self.memory
            .tail_steps(self.consecutive_failures)
            .into_iter()
            .filter(|(_, o)| !o.is_success())
            .collect()
    }

    /// 应用反思修订：有新任务时当前任务记为 error 并被新任务接替；指导写入 Memory。
    /// 返回状态发生变化的任务 id
    pub fn apply_revision(
        &mut self,
        tasks: Vec<String>,
        guidance: Option<String>,
    ) -> Result<Vec<usize>, AgentError> {
        let mut changed = Vec::new();
        if !tasks.is_empty() {
            let current = self.plan.current().map(|t| t.id);
            if let Some(id) = current {
                self.plan.transition(id, TaskStatus::Error)?;
                changed.push(id);
            }
            let new_ids = self.plan.append(tasks);
            if let Some(id) = current {
                self.plan.supersede(id, new_ids.clone());
            }
            changed.extend(new_ids);
        }
        if let Some(g) = guidance {
            self.memory.push_note(g);
        }
        self.consecutive_failures = 0;
        Ok(changed)
    }
}

enum StepResult {
    Observed { obs: Observation, memorized: bool },
    Cancelled(Observation),
    Fatal(Observation, AgentError),
}

fn interrupted(action: &Action, reason: &str) -> Observation {
    Observation::error(action.id, reason)
        .with_metadata("action_type", action.action_type.clone())
        .with_metadata("cancelled", true)
}

pub struct CodeActLoop<'a> {
    channel: &'a CompletionChannel,
    executor: &'a ToolExecutor,
    settings: &'a LoopSettings,
    recovery: RecoveryEngine,
}

impl<'a> CodeActLoop<'a> {
    pub fn new(
        channel: &'a CompletionChannel,
        executor: &'a ToolExecutor,
        settings: &'a LoopSettings,
    ) -> Self {
        Self {
            channel,
            executor,
            settings,
            recovery: RecoveryEngine::new(),
        }
    }

    /// 运行到某个停止条件；Err 只用于致命错误
    pub async fn run(
        &self,
        ctx: &RunContext,
        state: &mut LoopState,
        lease: &mut RuntimeLease,
    ) -> Result<LoopExit, AgentError> {
        let sink = ctx.delta_sink();
        loop {
            if ctx.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }
            if state.plan.is_complete() {
                return Ok(LoopExit::Completed);
            }
            if state.iterations >= self.settings.max_iterations {
                tracing::warn!(iterations = state.iterations, "iteration limit reached");
                return Ok(LoopExit::IterationLimit);
            }
            if state.consecutive_failures >= self.settings.failure_threshold {
                tracing::info!(failures = state.consecutive_failures, "failure threshold reached");
                return Ok(LoopExit::Reflect);
            }

            let Some(task) = state.plan.current().cloned() else {
                return Err(AgentError::Planning(
                    "plan has unresolved failed tasks and nothing runnable".to_string(),
                ));
            };
            if state.plan.transition(task.id, TaskStatus::Active)? {
                if let Some(t) = state.plan.get(task.id) {
                    ctx.emitter.emit_task(t);
                }
            }
            state.iterations += 1;
            tracing::debug!(iteration = state.iterations, task = task.id, "code-act iteration");

            let mut messages = vec![Message::system(code_act_system_prompt(
                self.executor.registry(),
                &state.plan,
                &task,
            ))];
            messages.extend(state.history.iter().cloned());
            messages.extend(state.memory.to_messages());

            let step = match self
                .channel
                .request(&messages, &sink, &ctx.cancel, parse_step)
                .await
            {
                Ok((step, _)) => step,
                Err(e) => match self.recovery.handle(&e) {
                    RecoveryAction::Abort => return Ok(LoopExit::Cancelled),
                    RecoveryAction::Fail => return Err(e),
                    RecoveryAction::RetryWithPrompt(prompt) => {
                        record_completion_failure(ctx, state, task.id, &e, prompt);
                        continue;
                    }
                    RecoveryAction::RecordFailure => {
                        let note = format!("The previous completion failed ({}). Try again.", e);
                        record_completion_failure(ctx, state, task.id, &e, note);
                        continue;
                    }
                },
            };

            let Some(call) = step.tool_call else {
                // 无工具调用：当前任务完成
                if !step.thought.is_empty() {
                    state.memory.push_turn(Message::assistant(step.thought));
                }
                state.plan.transition(task.id, TaskStatus::Success)?;
                if let Some(t) = state.plan.get(task.id) {
                    ctx.emitter.emit_task(t);
                }
                state.consecutive_failures = 0;
                continue;
            };

            let action = Action::new(call, task.id, step.thought);
            ctx.emitter.emit(RunMessage::action(&action));
            match self.execute(ctx, &action, lease).await {
                StepResult::Observed { obs, memorized } => {
                    record_step(ctx, state, action, obs, memorized);
                }
                StepResult::Cancelled(obs) => {
                    record_step(ctx, state, action, obs, false);
                    return Ok(LoopExit::Cancelled);
                }
                StepResult::Fatal(obs, e) => {
                    record_step(ctx, state, action, obs, false);
                    return Err(e);
                }
            }
        }
    }

    async fn execute(&self, ctx: &RunContext, action: &Action, lease: &mut RuntimeLease) -> StepResult {
        let tool = match self.executor.validate(action) {
            Ok(tool) => tool,
            Err(obs) => return StepResult::Observed { obs, memorized: false },
        };
        let memorized = tool.memorized();
        let cancel: &CancellationToken = &ctx.cancel;

        let runtime = if tool.requires_runtime() {
            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                r = lease.acquire() => r,
            };
            match acquired {
                Ok(rt) => Some(rt),
                Err(AgentError::Cancelled) => {
                    return StepResult::Cancelled(interrupted(
                        action,
                        "Cancelled while provisioning the runtime",
                    ))
                }
                Err(e) => {
                    let obs = Observation::error(action.id, e.to_string())
                        .with_metadata("action_type", action.action_type.clone());
                    return StepResult::Fatal(obs, e);
                }
            }
        } else {
            None
        };

        let tool_ctx = ToolContext {
            correlation_id: action.id,
            conversation_id: &ctx.conversation_id,
            runtime,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                StepResult::Cancelled(interrupted(action, "Cancelled while the action was running"))
            }
            obs = self.executor.invoke(tool.as_ref(), action, tool_ctx) => {
                StepResult::Observed { obs, memorized }
            }
        }
    }
}

fn record_step(ctx: &RunContext, state: &mut LoopState, action: Action, obs: Observation, memorized: bool) {
    ctx.emitter.emit(RunMessage::observation(&action, &obs));
    if obs.is_success() {
        state.consecutive_failures = 0;
    } else {
        state.consecutive_failures += 1;
        tracing::info!(
            tool = %action.action_type,
            failures = state.consecutive_failures,
            "action failed"
        );
    }
    state.memory.record(action, obs, memorized);
}

fn record_completion_failure(
    ctx: &RunContext,
    state: &mut LoopState,
    task_id: usize,
    err: &AgentError,
    note: String,
) {
    tracing::warn!(error = %err, "completion failed");
    ctx.emitter
        .emit(RunMessage::error("completion_error", err.to_string()).with_task(task_id));
    state.memory.push_note(note);
    state.consecutive_failures += 1;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_revision_supersedes_current() {
        let mut plan = Plan::new(["compile"]).unwrap();
        plan.transition(1, TaskStatus::Active).unwrap();
        let mut state = LoopState::new(plan, Vec::new(), "goal");
        state.consecutive_failures = 3;
        let changed = state
            .apply_revision(vec!["install compiler".into(), "compile again".into()], Some("use gcc".into()))
            .unwrap();
        assert_eq!(changed, vec![1, 2, 3]);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.plan.get(1).unwrap().status, TaskStatus::Error);
        assert_eq!(state.plan.current().unwrap().id, 2);
        assert!(!state.plan.is_complete());
        assert!(state
            .memory
            .to_messages()
            .iter()
            .any(|m| m.content == "Guidance: use gcc"));
    }

    #[test]
    fn test_guidance_only_revision_keeps_tasks() {
        let plan = Plan::new(["a"]).unwrap();
        let mut state = LoopState::new(plan, Vec::new(), "goal");
        let changed = state.apply_revision(Vec::new(), Some("slow down".into())).unwrap();
        assert!(changed.is_empty());
        assert_eq!(state.plan.tasks().len(), 1);
    }
}
