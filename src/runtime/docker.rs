//! 容器后端：通过 docker CLI 获取或创建容器
//!
//! 工作区目录挂载到容器 /workspace，文件读写与补丁应用走宿主机侧 SafeFs；命令经 `docker exec` 执行。
//! 同一 (user, conversation) 复用同名容器，最后一个持有端口 slot 的会话释放时才删除容器。

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use super::local::{apply_patch_on_host, port_env};
use super::process::{observation_from_output, run_with_timeout};
use super::{
    PortAllocator, RuntimeAction, RuntimeActionKind, RuntimeKind, RuntimeSession,
    RuntimeSettings, SafeFs, SessionInfo, SessionSpec,
};
use crate::codeact::Observation;
use crate::core::AgentError;

const CONTAINER_WORKDIR: &str = "/workspace";

#[derive(Debug, Clone)]
struct Connected {
    info: SessionInfo,
    fs: SafeFs,
}

pub struct DockerRuntime {
    spec: SessionSpec,
    settings: Arc<RuntimeSettings>,
    ports: Arc<PortAllocator>,
    holder: String,
    /// connect 已分配端口但尚未释放（包括 connect 中途被中断的情况）
    ports_held: AtomicBool,
    container: String,
    state: Mutex<Option<Connected>>,
}

impl DockerRuntime {
    pub fn new(spec: SessionSpec, settings: Arc<RuntimeSettings>, ports: Arc<PortAllocator>) -> Self {
        let container = format!("hive-{}", spec.slug());
        Self {
            spec,
            settings,
            ports,
            holder: Uuid::new_v4().to_string(),
            ports_held: AtomicBool::new(false),
            container,
            state: Mutex::new(None),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    fn connected(&self) -> Result<Connected, AgentError> {
        self.state
            .lock()
            .map_err(|_| AgentError::RuntimeAction("runtime state poisoned".to_string()))?
            .clone()
            .ok_or_else(|| AgentError::RuntimeAction("session not connected".to_string()))
    }

    async fn docker(&self, args: &[String], timeout: Duration) -> Result<String, AgentError> {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        let out = run_with_timeout(cmd, timeout)
            .await
            .map_err(|e| AgentError::RuntimeUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(AgentError::RuntimeUnavailable(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout.trim().to_string())
    }

    /// `Some(true)` 运行中，`Some(false)` 已存在但停止，`None` 不存在
    async fn container_state(&self, timeout: Duration) -> Option<bool> {
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.container.clone(),
        ];
        self.docker(&args, timeout).await.ok().map(|s| s == "true")
    }

    /// 分配端口并获取或创建容器；出错时由 connect 统一清理
    async fn provision(&self) -> Result<SessionInfo, AgentError> {
        let timeout = self.settings.provision_timeout();
        let host_dir: PathBuf = self.settings.workspace_root.join(self.spec.workspace_rel());
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(|e| AgentError::RuntimeUnavailable(format!("cannot create workspace: {}", e)))?;
        let fs = SafeFs::new(&host_dir);
        let ports = self.ports.allocate(&self.spec.key(), &self.holder)?;
        self.ports_held.store(true, Ordering::SeqCst);

        match self.container_state(timeout).await {
            Some(true) => tracing::info!(container = %self.container, "reusing running container"),
            Some(false) => {
                self.docker(&["start".to_string(), self.container.clone()], timeout)
                    .await?;
            }
            None => {
                let mut args = vec![
                    "run".to_string(),
                    "-d".to_string(),
                    "--name".to_string(),
                    self.container.clone(),
                    "-v".to_string(),
                    format!("{}:{}", fs.root().display(), CONTAINER_WORKDIR),
                    "-w".to_string(),
                    CONTAINER_WORKDIR.to_string(),
                ];
                for range in ports.ranges() {
                    args.push("-p".to_string());
                    args.push(format!("{0}:{0}", range.to_docker_spec()));
                }
                for (k, v) in port_env(Some(&ports)) {
                    args.push("-e".to_string());
                    args.push(format!("{}={}", k, v));
                }
                args.push(self.settings.docker_image.clone());
                args.extend(["sleep".to_string(), "infinity".to_string()]);
                self.docker(&args, timeout).await?;
            }
        }

        let info = SessionInfo {
            session_id: self.container.clone(),
            kind: RuntimeKind::Docker,
            workspace: CONTAINER_WORKDIR.to_string(),
            ports: Some(ports),
        };
        tracing::info!(container = %self.container, image = %self.settings.docker_image, "docker runtime connected");
        if let Ok(mut state) = self.state.lock() {
            *state = Some(Connected {
                info: info.clone(),
                fs,
            });
        }
        Ok(info)
    }
}

#[async_trait]
impl RuntimeSession for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn connect(&self) -> Result<SessionInfo, AgentError> {
        if let Ok(c) = self.connected() {
            return Ok(c.info);
        }
        match self.provision().await {
            Ok(info) => Ok(info),
            Err(e) => {
                if let Err(cleanup) = self.release().await {
                    tracing::warn!(container = %self.container, error = %cleanup, "cleanup after failed connect failed");
                }
                Err(e)
            }
        }
    }

    async fn do_action(&self, action: &RuntimeAction) -> Result<Observation, AgentError> {
        let c = self.connected()?;
        let (command, timeout) = match &action.kind {
            RuntimeActionKind::RunCommand {
                command,
                timeout_secs,
            } => (
                command.clone(),
                timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.settings.action_timeout()),
            ),
            RuntimeActionKind::ApplyPatch { patch } => {
                let obs =
                    apply_patch_on_host(&c.fs, action, patch, self.settings.action_timeout()).await?;
                return Ok(obs
                    .with_metadata("runtime", "docker")
                    .with_metadata("container", self.container.clone()));
            }
        };
        let mut cmd = Command::new("docker");
        cmd.args([
            "exec",
            "-w",
            CONTAINER_WORKDIR,
            self.container.as_str(),
            "sh",
            "-c",
            command.as_str(),
        ]);
        let output = run_with_timeout(cmd, timeout).await?;
        Ok(observation_from_output(action.id, &output)
            .with_metadata("runtime", "docker")
            .with_metadata("container", self.container.clone()))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        self.connected()?.fs.read(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), AgentError> {
        self.connected()?.fs.write(path, content).await.map(|_| ())
    }

    async fn release(&self) -> Result<(), AgentError> {
        let connected = self.state.lock().ok().and_then(|mut s| s.take()).is_some();
        let held = self.ports_held.swap(false, Ordering::SeqCst);
        if !connected && !held {
            return Ok(());
        }
        if !self.ports.release(&self.spec.key(), &self.holder) {
            tracing::info!(container = %self.container, "container still held by another session, keeping it");
            return Ok(());
        }
        let args = vec!["rm".to_string(), "-f".to_string(), self.container.clone()];
        match self.docker(&args, self.settings.provision_timeout()).await {
            Ok(_) => {
                tracing::info!(container = %self.container, "docker runtime released");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(container = %self.container, error = %e, "container removal failed");
                Err(AgentError::RuntimeAction(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortSettings;

    fn runtime(user: &str, conv: &str, ports: &Arc<PortAllocator>) -> DockerRuntime {
        DockerRuntime::new(
            SessionSpec::new(user, conv),
            Arc::new(RuntimeSettings::default()),
            Arc::clone(ports),
        )
    }

    #[test]
    fn test_container_name_sanitized_and_distinct() {
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        let upper = runtime("Alice", "conv/42", &ports);
        assert!(upper.container_name().starts_with("hive-Alice-conv_42-"));
        assert!(upper
            .container_name()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        let lower = runtime("alice", "conv/42", &ports);
        let lookalike = runtime("Alice", "conv_42", &ports);
        assert_ne!(upper.container_name(), lower.container_name());
        assert_ne!(upper.container_name(), lookalike.container_name());
        assert_eq!(upper.container_name(), runtime("Alice", "conv/42", &ports).container_name());
    }

    #[tokio::test]
    async fn test_interrupted_connect_is_cleaned_up_by_release() {
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        let rt = runtime("u", "c", &ports);
        // 模拟 connect 在分配端口后被丢弃
        ports.allocate(&rt.spec.key(), &rt.holder).unwrap();
        rt.ports_held.store(true, Ordering::SeqCst);

        // 容器删除可能失败（测试环境无 docker），端口必须归还
        let _ = rt.release().await;
        assert_eq!(ports.in_use(), 0);
        rt.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_without_connect_is_noop() {
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        runtime("u", "c", &ports).release().await.unwrap();
    }
}
