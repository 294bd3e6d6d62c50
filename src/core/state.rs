//! 运行状态机：INIT → PLANNING → EXECUTING ⇄ REFLECTING → SUMMARIZING → DONE，
//! 以及 FAILED / CANCELLED 两个终态。
//!
//! 所有迁移经 RunStateMachine::advance 校验，非法迁移返回错误而不是静默覆盖。

use std::fmt;

use serde::Serialize;

/// 单次运行所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    Planning,
    Executing,
    Reflecting,
    Summarizing,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        // 任意非终态都可以被取消
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Init, Planning)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Reflecting)
                | (Executing, Summarizing)
                | (Executing, Failed)
                | (Reflecting, Executing)
                | (Reflecting, Failed)
                | (Summarizing, Done)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Init => "INIT",
            RunState::Planning => "PLANNING",
            RunState::Executing => "EXECUTING",
            RunState::Reflecting => "REFLECTING",
            RunState::Summarizing => "SUMMARIZING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// 记录迁移历史的状态机
#[derive(Clone, Debug)]
pub struct RunStateMachine {
    current: RunState,
    history: Vec<RunState>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self {
            current: RunState::Init,
            history: vec![RunState::Init],
        }
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// 迁移到 next；非法迁移返回 Err((from, to))
    pub fn advance(&mut self, next: RunState) -> Result<(), (RunState, RunState)> {
        if !self.current.can_transition_to(next) {
            return Err((self.current, next));
        }
        tracing::debug!(from = %self.current, to = %next, "run state transition");
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut sm = RunStateMachine::new();
        for s in [
            RunState::Planning,
            RunState::Executing,
            RunState::Reflecting,
            RunState::Executing,
            RunState::Summarizing,
            RunState::Done,
        ] {
            sm.advance(s).unwrap();
        }
        assert_eq!(sm.current(), RunState::Done);
        assert_eq!(sm.history().len(), 7);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut sm = RunStateMachine::new();
        sm.advance(RunState::Cancelled).unwrap();
        assert!(sm.advance(RunState::Planning).is_err());
        assert!(sm.advance(RunState::Cancelled).is_err());
    }

    #[test]
    fn test_cannot_skip_planning() {
        let mut sm = RunStateMachine::new();
        assert_eq!(
            sm.advance(RunState::Executing),
            Err((RunState::Init, RunState::Executing))
        );
    }
}
