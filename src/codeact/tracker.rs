//! Plan / Task 跟踪
//!
//! Plan 是有序任务列表：结构只追加（任务顺序创建后固定），状态单调
//! pending → active → {success, error}。每次状态变化写入追加式执行日志，
//! 渲染成 Markdown 只在边界发生（prompt 重定位、摘要），日志本身才是事实来源。

use std::fmt;

use serde::Serialize;

use crate::core::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Success,
    Error,
}

impl TaskStatus {
    fn rank(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Active => 1,
            TaskStatus::Success | TaskStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    /// 从 1 开始，按创建顺序递增
    pub id: usize,
    pub description: String,
    pub status: TaskStatus,
}

/// 执行日志条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskLogEntry {
    Created { task: usize, description: String },
    Transition { task: usize, from: TaskStatus, to: TaskStatus },
    /// 失败任务已被反思追加的任务接替
    Superseded { task: usize, by: Vec<usize> },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    tasks: Vec<Task>,
    log: Vec<TaskLogEntry>,
    /// 被反思接替的失败任务
    superseded: Vec<usize>,
}

impl Plan {
    /// 从非空描述列表创建 Plan
    pub fn new<I, S>(descriptions: I) -> Result<Self, AgentError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut plan = Self::default();
        plan.append(descriptions);
        if plan.tasks.is_empty() {
            return Err(AgentError::Planning("plan has no tasks".to_string()));
        }
        Ok(plan)
    }

    /// 追加任务（空白描述被忽略），返回新任务 id
    pub fn append<I, S>(&mut self, descriptions: I) -> Vec<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids = Vec::new();
        for d in descriptions {
            let description = d.into().trim().to_string();
            if description.is_empty() {
                continue;
            }
            let id = self.tasks.len() + 1;
            self.log.push(TaskLogEntry::Created {
                task: id,
                description: description.clone(),
            });
            self.tasks.push(Task {
                id,
                description,
                status: TaskStatus::Pending,
            });
            ids.push(id);
        }
        ids
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn log(&self) -> &[TaskLogEntry] {
        &self.log
    }

    pub fn get(&self, id: usize) -> Option<&Task> {
        id.checked_sub(1).and_then(|i| self.tasks.get(i))
    }

    /// 第一个非终态任务
    pub fn current(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| !t.status.is_terminal())
    }

    /// 单调状态迁移；同状态视为无操作
    pub fn transition(&mut self, id: usize, to: TaskStatus) -> Result<bool, AgentError> {
        let task = id
            .checked_sub(1)
            .and_then(|i| self.tasks.get_mut(i))
            .ok_or_else(|| AgentError::InvalidTransition {
                task: id,
                from: "missing".to_string(),
                to: to.to_string(),
            })?;
        let from = task.status;
        if from == to {
            return Ok(false);
        }
        if from.is_terminal() || to.rank() <= from.rank() {
            return Err(AgentError::InvalidTransition {
                task: id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        self.log.push(TaskLogEntry::Transition { task: id, from, to });
        Ok(true)
    }

    /// 反思后：失败任务 id 被新追加的任务接替
    pub fn supersede(&mut self, id: usize, by: Vec<usize>) {
        if !self.superseded.contains(&id) {
            self.superseded.push(id);
        }
        self.log.push(TaskLogEntry::Superseded { task: id, by });
    }

    /// 所有任务终态，且失败任务都已被接替
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| match t.status {
            TaskStatus::Success => true,
            TaskStatus::Error => self.superseded.contains(&t.id),
            _ => false,
        })
    }

    pub fn render_markdown(&self) -> String {
        let mut s = String::from("## Plan\n");
        for t in &self.tasks {
            let mark = match t.status {
                TaskStatus::Pending => "[ ]",
                TaskStatus::Active => "[>]",
                TaskStatus::Success => "[x]",
                TaskStatus::Error => "[!]",
            };
            s.push_str(&format!("- {} {}. {}", mark, t.id, t.description));
            if self.superseded.contains(&t.id) {
                s.push_str(" (superseded)");
            }
            s.push('\n');
        }
        s
    }
}
