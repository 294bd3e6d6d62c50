//! Code-Act 层：Action/Observation、Plan、模型输出解析、规划 / 反思 / 摘要策略与主循环

pub mod action;
pub mod events;
pub mod loop_;
pub mod parser;
pub mod planner;
pub mod prompts;
pub mod reflection;
pub mod summary;
pub mod tracker;

pub use action::{Action, Observation, ObservationStatus, ToolCall};
pub use events::{EventEmitter, MessageStatus, RunMessage};
pub use loop_::{CodeActLoop, LoopExit, LoopSettings, LoopState};
pub use parser::{parse_step, StepOutput};
pub use planner::{PlanningMode, PlanningStrategy};
pub use reflection::{ReflectionOutcome, ReflectionStrategy};
pub use summary::{render_local_summary, summarize};
pub use tracker::{Plan, Task, TaskLogEntry, TaskStatus};
