//! 运行时会话：隔离的执行环境
//!
//! 一个运行（Run）对应一个会话，首次需要时懒连接，运行结束恰好释放一次。
//! 三种后端：本地进程、容器（docker CLI）、远程沙箱服务（HTTP）。

pub mod docker;
pub mod lease;
pub mod local;
pub mod ports;
pub mod process;
pub mod remote;
pub mod safe_fs;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codeact::Observation;
use crate::core::AgentError;

pub use docker::DockerRuntime;
pub use lease::RuntimeLease;
pub use local::LocalProcessRuntime;
pub use ports::{PortAllocation, PortAllocator, PortRange, PortSettings};
pub use remote::RemoteRuntime;
pub use safe_fs::SafeFs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Local,
    Docker,
    Remote,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeKind::Local => "local",
            RuntimeKind::Docker => "docker",
            RuntimeKind::Remote => "remote",
        };
        f.write_str(s)
    }
}

impl FromStr for RuntimeKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RuntimeKind::Local),
            "docker" | "container" => Ok(RuntimeKind::Docker),
            "remote" => Ok(RuntimeKind::Remote),
            other => Err(AgentError::Config(format!("unknown runtime kind: {}", other))),
        }
    }
}

/// 会话归属
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub user_id: String,
    pub conversation_id: String,
}

impl SessionSpec {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// 端口分配与远程会话共用的键，与工作区相对路径一致
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            path_component(&self.user_id),
            path_component(&self.conversation_id)
        )
    }

    /// 工作区相对路径 `<user>/<conversation>`
    ///
    /// 每段为清洗后的可读前缀加原始 id 的摘要，不同 id 不会落到同一目录。
    pub fn workspace_rel(&self) -> PathBuf {
        PathBuf::from(path_component(&self.user_id)).join(path_component(&self.conversation_id))
    }

    /// 容器等外部资源的名称片段：`<user>-<conversation>-<digest>`，保留大小写
    pub fn slug(&self) -> String {
        let raw = format!("{}\0{}", self.user_id, self.conversation_id);
        format!(
            "{}-{}-{}",
            readable(&self.user_id),
            readable(&self.conversation_id),
            digest(&raw)
        )
    }
}

/// 可读前缀的最大长度
const READABLE_PREFIX_LEN: usize = 32;

fn path_component(raw: &str) -> String {
    format!("{}-{}", readable(raw), digest(raw))
}

fn readable(raw: &str) -> String {
    sanitize(raw).chars().take(READABLE_PREFIX_LEN).collect()
}

/// 原始 id 的稳定摘要（UUID v5 的前 16 个十六进制字符）
fn digest(raw: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, raw.as_bytes());
    id.simple().to_string()[..16].to_string()
}

pub(crate) fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// connect() 成功后的会话信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub kind: RuntimeKind,
    pub workspace: String,
    pub ports: Option<PortAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeActionKind {
    RunCommand {
        command: String,
        timeout_secs: Option<u64>,
    },
    /// unified diff，在工作区根下应用
    ApplyPatch { patch: String },
}

/// 发给运行时的动作；结果 Observation 的 id 与之相同
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeAction {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: RuntimeActionKind,
}

impl RuntimeAction {
    pub fn run(id: Uuid, command: impl Into<String>, timeout_secs: Option<u64>) -> Self {
        Self {
            id,
            kind: RuntimeActionKind::RunCommand {
                command: command.into(),
                timeout_secs,
            },
        }
    }

    pub fn apply_patch(id: Uuid, patch: impl Into<String>) -> Self {
        Self {
            id,
            kind: RuntimeActionKind::ApplyPatch {
                patch: patch.into(),
            },
        }
    }
}

/// 运行时会话
///
/// 所有方法取 &self，后端自行做内部可变；release 必须幂等。
#[async_trait]
pub trait RuntimeSession: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// 获取或创建环境并连接
    async fn connect(&self) -> Result<SessionInfo, AgentError>;

    async fn do_action(&self, action: &RuntimeAction) -> Result<Observation, AgentError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AgentError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), AgentError>;

    /// 释放环境与端口；connect 失败或中途被丢弃后调用也要清理已分配的部分
    async fn release(&self) -> Result<(), AgentError>;
}

/// 按种类创建会话（尚未连接）
pub trait RuntimeFactory: Send + Sync {
    fn create(
        &self,
        kind: RuntimeKind,
        spec: SessionSpec,
    ) -> Result<Box<dyn RuntimeSession>, AgentError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub kind: RuntimeKind,
    /// 工作区根目录，会话目录为 `<root>/<user>/<conversation>`
    pub workspace_root: PathBuf,
    pub provision_timeout_secs: u64,
    pub action_timeout_secs: u64,
    pub docker_image: String,
    pub remote_base_url: String,
    pub remote_api_key: Option<String>,
    pub ports: PortSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Local,
            workspace_root: PathBuf::from("workspace"),
            provision_timeout_secs: 60,
            action_timeout_secs: 120,
            docker_image: "python:3.12-slim".to_string(),
            remote_base_url: "http://127.0.0.1:8700".to_string(),
            remote_api_key: None,
            ports: PortSettings::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// 默认工厂：三种后端共享同一个端口分配器
pub struct BackendFactory {
    settings: Arc<RuntimeSettings>,
    ports: Arc<PortAllocator>,
}

impl BackendFactory {
    pub fn new(settings: RuntimeSettings) -> Result<Self, AgentError> {
        let ports = Arc::new(PortAllocator::new(settings.ports.clone())?);
        Ok(Self {
            settings: Arc::new(settings),
            ports,
        })
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }
}

impl RuntimeFactory for BackendFactory {
    fn create(
        &self,
        kind: RuntimeKind,
        spec: SessionSpec,
    ) -> Result<Box<dyn RuntimeSession>, AgentError> {
        let settings = Arc::clone(&self.settings);
        let ports = Arc::clone(&self.ports);
        Ok(match kind {
            RuntimeKind::Local => Box::new(LocalProcessRuntime::new(spec, settings, ports)),
            RuntimeKind::Docker => Box::new(DockerRuntime::new(spec, settings, ports)),
            RuntimeKind::Remote => Box::new(RemoteRuntime::new(spec, settings, ports)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("Docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!(RuntimeKind::Remote.to_string(), "remote");
        assert!("vm".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_workspace_rel_sanitized() {
        let spec = SessionSpec::new("alice@x", "../conv 1");
        let rel = spec.workspace_rel();
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("alice_x-"));
        assert!(parts[1].starts_with("___conv_1-"));
        assert_eq!(spec.key(), rel.display().to_string());
        // 同一输入得到同一路径
        assert_eq!(SessionSpec::new("alice@x", "../conv 1").workspace_rel(), rel);
    }

    #[test]
    fn test_distinct_ids_never_share_resources() {
        let pairs = [
            (SessionSpec::new("u", "a/b"), SessionSpec::new("u", "a_b")),
            (SessionSpec::new("Alice", "c1"), SessionSpec::new("alice", "c1")),
            (SessionSpec::new("a/b", "c"), SessionSpec::new("a", "b/c")),
            (SessionSpec::new("u-1", "c"), SessionSpec::new("u", "1-c")),
        ];
        for (a, b) in pairs {
            assert_ne!(a.workspace_rel(), b.workspace_rel(), "{:?} vs {:?}", a, b);
            assert_ne!(a.key(), b.key());
            assert_ne!(a.slug(), b.slug());
        }
    }

    #[test]
    fn test_action_serializes_flat() {
        let id = Uuid::new_v4();
        let v = serde_json::to_value(RuntimeAction::run(id, "ls", Some(5))).unwrap();
        assert_eq!(v["type"], "run_command");
        assert_eq!(v["command"], "ls");
        assert_eq!(v["id"], id.to_string());
    }
}
