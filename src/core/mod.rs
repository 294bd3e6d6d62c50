//! 核心编排层：错误与恢复、运行状态机、运行上下文、会话监管、编排器与构建器

pub mod builder;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use builder::{create_agent_builder, create_llm_from_config, AgentBuilder};
pub use context::{BroadcastSink, RunContext};
pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunHandle, RunOutcome, RunRequest};
pub use recovery::RecoveryEngine;
pub use session_supervisor::{RunKey, SessionSupervisor};
pub use state::{RunState, RunStateMachine};
