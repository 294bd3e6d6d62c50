//! Hive - Rust 自主智能体执行引擎
//!
//! 模块划分：
//! - **codeact**: Action/Observation、Plan、规划 / 反思 / 摘要策略与 Code-Act 主循环
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、运行状态机、错误与恢复、会话监管
//! - **llm**: 流式补全客户端抽象、Completion Channel 与实现（OpenAI / 兼容 HTTP / Mock）
//! - **memory**: 对话轮次与运行内 Memory
//! - **persistence**: 消息与任务状态的持久化协作方
//! - **runtime**: 运行时会话（本地进程 / 容器 / 远程沙箱）、端口分配、工作区路径
//! - **tools**: 工具注册表、执行器、内置工具与 MCP 桥接

pub mod codeact;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod persistence;
pub mod runtime;
pub mod tools;

pub use crate::core::{Orchestrator, RunHandle, RunOutcome, RunRequest, RunState};
