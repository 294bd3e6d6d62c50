//! Agent 编排器：驱动单次运行的状态机
//!
//! INIT → PLANNING（建 Plan）→ EXECUTING（Code-Act 循环）⇄ REFLECTING → SUMMARIZING → DONE；
//! 致命错误进入 FAILED，取消进入 CANCELLED。
//! 每个运行在独立的 tokio 任务中执行，只通过 Message 流与终态结果对外可见。
//! 无论从哪条路径结束，已连接的 Runtime Session 都在终态消息之前释放且只释放一次。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::codeact::{
    render_local_summary, summarize, CodeActLoop, EventEmitter, LoopExit, LoopSettings, LoopState,
    Plan, PlanningMode, PlanningStrategy, ReflectionOutcome, ReflectionStrategy, RunMessage,
};
use crate::core::{AgentError, RunContext, RunKey, RunState, RunStateMachine, SessionSupervisor};
use crate::llm::{CompletionChannel, TokenUsage};
use crate::memory::{ConversationMemory, Memory, Message};
use crate::persistence::{NoopStore, RunStore};
use crate::runtime::{RuntimeFactory, RuntimeKind, RuntimeLease, SessionSpec};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 编排器级设置（所有运行共用）
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub loop_settings: LoopSettings,
    /// 单次工具调用的默认超时
    pub tool_timeout: Duration,
    pub provision_timeout: Duration,
    /// SUMMARIZING 时是否请模型写摘要
    pub summarize: bool,
    pub default_runtime: RuntimeKind,
    pub default_planning_mode: PlanningMode,
    /// 带入运行的历史轮数上限
    pub max_context_turns: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            loop_settings: LoopSettings::default(),
            tool_timeout: Duration::from_secs(30),
            provision_timeout: Duration::from_secs(60),
            summarize: true,
            default_runtime: RuntimeKind::Local,
            default_planning_mode: PlanningMode::SingleShot,
            max_context_turns: 20,
        }
    }
}

/// 启动一次运行的参数
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub goal: String,
    pub conversation_id: String,
    pub user_id: String,
    /// 未指定时使用编排器默认后端
    pub runtime_kind: Option<RuntimeKind>,
    pub planning_mode: Option<PlanningMode>,
    /// 为空表示全部工具
    pub tool_allowlist: Vec<String>,
    /// 运行前的对话轮次
    pub history: Vec<Message>,
}

impl RunRequest {
    pub fn new(
        goal: impl Into<String>,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            goal: goal.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            runtime_kind: None,
            planning_mode: None,
            tool_allowlist: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn with_runtime(mut self, kind: RuntimeKind) -> Self {
        self.runtime_kind = Some(kind);
        self
    }

    pub fn with_planning_mode(mut self, mode: PlanningMode) -> Self {
        self.planning_mode = Some(mode);
        self
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_allowlist = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// 运行终态结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub state: RunState,
    /// DONE 时为摘要；FAILED 时为诊断与部分摘要
    pub summary: String,
    pub plan: Option<Plan>,
    pub memory: Memory,
    pub iterations: usize,
    /// 本次运行所有补全的用量之和
    pub usage: TokenUsage,
}

/// 运行句柄：消息流、增量流、取消与等待
pub struct RunHandle {
    pub run_id: Uuid,
    pub conversation_id: String,
    pub events: mpsc::UnboundedReceiver<RunMessage>,
    pub deltas: broadcast::Receiver<String>,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 等待运行结束（消息流仍可在之后继续读取已缓冲的消息）
    pub async fn wait(self) -> Result<(RunOutcome, mpsc::UnboundedReceiver<RunMessage>), tokio::task::JoinError> {
        let outcome = self.join.await?;
        Ok((outcome, self.events))
    }
}

struct Finish {
    state: RunState,
    content: String,
    loop_state: Option<LoopState>,
}

impl Finish {
    fn failed(content: impl Into<String>, loop_state: Option<LoopState>) -> Self {
        Self {
            state: RunState::Failed,
            content: content.into(),
            loop_state,
        }
    }

    fn cancelled(loop_state: Option<LoopState>) -> Self {
        Self {
            state: RunState::Cancelled,
            content: "Run cancelled".to_string(),
            loop_state,
        }
    }
}

/// 多个运行并发共享的编排器；内部只有 Arc 与不可变设置
#[derive(Clone)]
pub struct Orchestrator {
    channel: CompletionChannel,
    registry: Arc<ToolRegistry>,
    factory: Arc<dyn RuntimeFactory>,
    store: Arc<dyn RunStore>,
    settings: Arc<OrchestratorSettings>,
    supervisor: Arc<SessionSupervisor>,
}

impl Orchestrator {
    pub fn new(
        channel: CompletionChannel,
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn RuntimeFactory>,
    ) -> Self {
        Self {
            channel,
            registry,
            factory,
            store: Arc::new(NoopStore),
            settings: Arc::new(OrchestratorSettings::default()),
            supervisor: Arc::new(SessionSupervisor::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// 取消某用户某会话正在执行的运行
    pub fn cancel(&self, user_id: &str, conversation_id: &str) -> bool {
        self.supervisor.cancel(&RunKey::new(user_id, conversation_id))
    }

    /// 异步启动一次运行，立即返回句柄
    pub fn start_run(&self, request: RunRequest) -> RunHandle {
        let run_id = Uuid::new_v4();
        let key = RunKey::new(request.user_id.clone(), request.conversation_id.clone());
        let cancel = self.supervisor.register(&key, run_id);
        let (emitter, events) = EventEmitter::new(request.conversation_id.clone(), Arc::clone(&self.store));
        let (ctx, deltas) = RunContext::new(
            run_id,
            request.conversation_id.clone(),
            request.user_id.clone(),
            request.goal.clone(),
            cancel.clone(),
            emitter,
        );
        let span = tracing::info_span!(
            "run",
            %run_id,
            conversation_id = %request.conversation_id,
            user_id = %request.user_id
        );
        let conversation_id = request.conversation_id.clone();
        let this = self.clone();
        let join = tokio::spawn(
            async move {
                let outcome = this.execute(&ctx, request).await;
                this.supervisor.remove(&key, ctx.run_id);
                outcome
            }
            .instrument(span),
        );
        RunHandle {
            run_id,
            conversation_id,
            events,
            deltas,
            cancel,
            join,
        }
    }

    async fn execute(&self, ctx: &RunContext, request: RunRequest) -> RunOutcome {
        tracing::info!(goal = %ctx.goal, "run started");
        let mut sm = RunStateMachine::new();
        let mut lease: Option<RuntimeLease> = None;

        let finish = self.drive(ctx, &request, &mut sm, &mut lease).await;

        if let Some(lease) = lease.as_mut() {
            lease.release().await;
        }
        if let Err((from, to)) = sm.advance(finish.state) {
            tracing::warn!(%from, %to, "invalid terminal transition");
        }
        let usage = ctx.usage();
        tracing::info!(
            state = %finish.state,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "run finished"
        );
        ctx.emitter
            .finish(RunMessage::terminal(finish.state, finish.content.clone()));

        let (plan, memory, iterations) = match finish.loop_state {
            Some(s) => (Some(s.plan), s.memory, s.iterations),
            None => (None, Memory::new(), 0),
        };
        RunOutcome {
            run_id: ctx.run_id,
            state: finish.state,
            summary: finish.content,
            plan,
            memory,
            iterations,
            usage,
        }
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        request: &RunRequest,
        sm: &mut RunStateMachine,
        lease_slot: &mut Option<RuntimeLease>,
    ) -> Finish {
        advance(ctx, sm, RunState::Planning);

        let kind = request.runtime_kind.unwrap_or(self.settings.default_runtime);
        let spec = SessionSpec::new(ctx.user_id.clone(), ctx.conversation_id.clone());
        let session = match self.factory.create(kind, spec) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, runtime = %kind, "cannot create runtime session");
                return Finish::failed(e.to_string(), None);
            }
        };
        let lease = lease_slot.insert(RuntimeLease::new(session, self.settings.provision_timeout));

        let executor = ToolExecutor::new(
            Arc::new(self.registry.subset(&request.tool_allowlist)),
            self.settings.tool_timeout,
        );
        let sink = ctx.delta_sink();
        let mode = request
            .planning_mode
            .unwrap_or(self.settings.default_planning_mode);

        let history = ConversationMemory::from_messages(
            request.history.clone(),
            self.settings.max_context_turns,
        )
        .messages()
        .to_vec();

        let plan = match PlanningStrategy::new(&self.channel)
            .plan(&ctx.goal, &history, mode, &sink, &ctx.cancel)
            .await
        {
            Ok(plan) => plan,
            Err(AgentError::Cancelled) => return Finish::cancelled(None),
            Err(e) => {
                tracing::error!(error = %e, "planning failed");
                return Finish::failed(e.to_string(), None);
            }
        };
        ctx.emitter.emit(RunMessage::plan(&plan));
        for task in plan.tasks() {
            ctx.emitter.emit_task(task);
        }

        let mut state = LoopState::new(plan, history, &ctx.goal);
        if ctx.is_cancelled() {
            return Finish::cancelled(Some(state));
        }
        advance(ctx, sm, RunState::Executing);

        let code_act = CodeActLoop::new(&self.channel, &executor, &self.settings.loop_settings);
        loop {
            let exit = match code_act.run(ctx, &mut state, lease).await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::error!(error = %e, "run aborted by a fatal error");
                    let partial = render_local_summary(&ctx.goal, &state.plan, &state.memory, "failed");
                    return Finish::failed(format!("{}\n\n{}", e, partial), Some(state));
                }
            };
            match exit {
                LoopExit::Cancelled => return Finish::cancelled(Some(state)),
                LoopExit::IterationLimit => {
                    let partial = render_local_summary(
                        &ctx.goal,
                        &state.plan,
                        &state.memory,
                        "iteration limit reached",
                    );
                    return Finish::failed(partial, Some(state));
                }
                LoopExit::Completed => {
                    advance(ctx, sm, RunState::Summarizing);
                    let summary = if self.settings.summarize {
                        summarize(&self.channel, &ctx.goal, &state.plan, &state.memory, &ctx.cancel).await
                    } else {
                        render_local_summary(&ctx.goal, &state.plan, &state.memory, "completed")
                    };
                    if ctx.is_cancelled() {
                        return Finish::cancelled(Some(state));
                    }
                    return Finish {
                        state: RunState::Done,
                        content: summary,
                        loop_state: Some(state),
                    };
                }
                LoopExit::Reflect => {
                    advance(ctx, sm, RunState::Reflecting);
                    let outcome = {
                        let failures = state.failure_tail();
                        ReflectionStrategy::new(&self.channel)
                            .reflect(&ctx.goal, &state.plan, &failures, &sink, &ctx.cancel)
                            .await
                    };
                    match outcome {
                        Ok(ReflectionOutcome::Revise { tasks, guidance }) => {
                            match state.apply_revision(tasks, guidance) {
                                Ok(changed) => {
                                    for id in changed {
                                        if let Some(task) = state.plan.get(id) {
                                            ctx.emitter.emit_task(task);
                                        }
                                    }
                                }
                                Err(e) => return Finish::failed(e.to_string(), Some(state)),
                            }
                            advance(ctx, sm, RunState::Executing);
                        }
                        Ok(ReflectionOutcome::Stop { reason }) => {
                            let partial = render_local_summary(
                                &ctx.goal,
                                &state.plan,
                                &state.memory,
                                "stopped after reflection",
                            );
                            return Finish::failed(format!("{}\n\n{}", reason, partial), Some(state));
                        }
                        Err(AgentError::Cancelled) => return Finish::cancelled(Some(state)),
                        Err(e) => {
                            tracing::error!(error = %e, "reflection failed");
                            return Finish::failed(format!("Reflection failed: {}", e), Some(state));
                        }
                    }
                }
            }
        }
    }
}

/// 状态迁移并发出 run_state 消息；终态消息由 finish 统一发出
fn advance(ctx: &RunContext, sm: &mut RunStateMachine, next: RunState) {
    match sm.advance(next) {
        Ok(()) => {
            if !next.is_terminal() {
                ctx.emitter.emit(RunMessage::run_state(next));
            }
        }
        Err((from, to)) => tracing::warn!(%from, %to, "ignoring invalid run state transition"),
    }
}
