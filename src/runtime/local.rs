//! 本地进程后端：工作区为宿主机目录，命令经 `sh -c` 执行

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use super::process::{observation_from_output, run_with_timeout};
use super::{
    PortAllocation, PortAllocator, RuntimeAction, RuntimeActionKind, RuntimeKind, RuntimeSession,
    RuntimeSettings, SafeFs, SessionInfo, SessionSpec,
};
use crate::codeact::Observation;
use crate::core::AgentError;

#[derive(Debug, Clone)]
struct Connected {
    info: SessionInfo,
    fs: SafeFs,
}

pub struct LocalProcessRuntime {
    spec: SessionSpec,
    settings: Arc<RuntimeSettings>,
    ports: Arc<PortAllocator>,
    /// 端口 slot 的持有者标识，每个会话实例唯一
    holder: String,
    state: Mutex<Option<Connected>>,
}

impl LocalProcessRuntime {
    pub fn new(spec: SessionSpec, settings: Arc<RuntimeSettings>, ports: Arc<PortAllocator>) -> Self {
        Self {
            spec,
            settings,
            ports,
            holder: Uuid::new_v4().to_string(),
            state: Mutex::new(None),
        }
    }

    fn connected(&self) -> Result<Connected, AgentError> {
        self.state
            .lock()
            .map_err(|_| AgentError::RuntimeAction("runtime state poisoned".to_string()))?
            .clone()
            .ok_or_else(|| AgentError::RuntimeAction("session not connected".to_string()))
    }

    fn workspace_dir(&self) -> PathBuf {
        self.settings.workspace_root.join(self.spec.workspace_rel())
    }
}

/// 端口区间以环境变量暴露给命令
pub(crate) fn port_env(ports: Option<&PortAllocation>) -> Vec<(String, String)> {
    let Some(p) = ports else {
        return Vec::new();
    };
    vec![
        ("HIVE_EXEC_PORTS".to_string(), p.execution.to_docker_spec()),
        ("HIVE_INSPECT_PORTS".to_string(), p.inspection.to_docker_spec()),
        ("HIVE_APP_PORTS".to_string(), p.app.to_docker_spec()),
    ]
}

/// 补丁写到工作区 `.hive/patches/<id>.patch`，返回相对路径
pub(crate) async fn stage_patch(fs: &SafeFs, id: Uuid, patch: &str) -> Result<String, AgentError> {
    let rel = format!(".hive/patches/{}.patch", id);
    fs.write(&rel, patch.as_bytes()).await?;
    Ok(rel)
}

/// 在宿主机侧对工作区目录应用 unified diff
///
/// 容器后端的工作区是挂载目录，补丁同样在宿主机侧应用，不依赖镜像里是否装有 git。
pub(crate) async fn apply_patch_on_host(
    fs: &SafeFs,
    action: &RuntimeAction,
    patch: &str,
    timeout: Duration,
) -> Result<Observation, AgentError> {
    let rel = stage_patch(fs, action.id, patch).await?;
    let mut cmd = Command::new("git");
    cmd.args(["apply", "--whitespace=nowarn", rel.as_str()])
        .current_dir(fs.root());
    // 工作区可能位于某个 git 仓库之内，不让 git 向上找到它
    if let Some(parent) = fs.root().parent() {
        cmd.env("GIT_CEILING_DIRECTORIES", parent);
    }
    let output = run_with_timeout(cmd, timeout).await?;
    Ok(observation_from_output(action.id, &output))
}

#[async_trait]
impl RuntimeSession for LocalProcessRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn connect(&self) -> Result<SessionInfo, AgentError> {
        if let Ok(c) = self.connected() {
            return Ok(c.info);
        }
        let dir = self.workspace_dir();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AgentError::RuntimeUnavailable(format!("cannot create workspace {}: {}", dir.display(), e))
        })?;
        let ports = self.ports.allocate(&self.spec.key(), &self.holder)?;
        let fs = SafeFs::new(&dir);
        let info = SessionInfo {
            session_id: format!("local-{}", Uuid::new_v4()),
            kind: RuntimeKind::Local,
            workspace: fs.root().display().to_string(),
            ports: Some(ports),
        };
        tracing::info!(session = %info.session_id, workspace = %info.workspace, "local runtime connected");
        if let Ok(mut state) = self.state.lock() {
            *state = Some(Connected {
                info: info.clone(),
                fs,
            });
        }
        Ok(info)
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
                return Ok(obs.with_metadata("runtime", "local"));
            }
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .current_dir(c.fs.root())
            .envs(port_env(c.info.ports.as_ref()));
        let output = run_with_timeout(cmd, timeout).await?;
        Ok(observation_from_output(action.id, &output).with_metadata("runtime", "local"))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        self.connected()?.fs.read(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), AgentError> {
        self.connected()?.fs.write(path, content).await.map(|_| ())
    }

    async fn release(&self) -> Result<(), AgentError> {
        let taken = self.state.lock().ok().and_then(|mut s| s.take());
        if let Some(c) = taken {
            self.ports.release(&self.spec.key(), &self.holder);
            tracing::info!(session = %c.info.session_id, "local runtime released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PortSettings;

    fn runtime(root: &std::path::Path) -> (LocalProcessRuntime, Arc<PortAllocator>) {
        let settings = RuntimeSettings {
            workspace_root: root.to_path_buf(),
            ..RuntimeSettings::default()
        };
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        (
            LocalProcessRuntime::new(
                SessionSpec::new("u1", "c1"),
                Arc::new(settings),
                Arc::clone(&ports),
            ),
            ports,
        )
    }

    #[tokio::test]
    async fn test_connect_run_release() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, ports) = runtime(dir.path());
        let info = rt.connect().await.unwrap();
        assert!(info.workspace.contains("c1-"));
        assert_eq!(ports.in_use(), 1);

        rt.write_file("hello.txt", b"hi there").await.unwrap();
        let obs = rt
            .do_action(&RuntimeAction::run(Uuid::new_v4(), "cat hello.txt && echo $HIVE_EXEC_PORTS", None))
            .await
            .unwrap();
        assert!(obs.is_success());
        assert!(obs.content.contains("hi there"));
        assert!(obs.content.contains("30000-30009"));

        rt.release().await.unwrap();
        rt.release().await.unwrap();
        assert_eq!(ports.in_use(), 0);
        assert!(rt.read_file("hello.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_superseded_session_release_keeps_live_ports() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(RuntimeSettings {
            workspace_root: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        });
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        let make = |user: &str, conv: &str| {
            LocalProcessRuntime::new(
                SessionSpec::new(user, conv),
                Arc::clone(&settings),
                Arc::clone(&ports),
            )
        };
        let old_run = make("u", "c1");
        let new_run = make("u", "c1");
        old_run.connect().await.unwrap();
        let live = new_run.connect().await.unwrap().ports.unwrap();

        old_run.release().await.unwrap();
        assert_eq!(ports.in_use(), 1);

        let other = make("u", "c2").connect().await.unwrap().ports.unwrap();
        assert_ne!(live.slot, other.slot);
        for a in live.ranges() {
            for b in other.ranges() {
                assert!(!a.overlaps(&b));
            }
        }
    }

    #[tokio::test]
    async fn test_lookalike_conversations_get_separate_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(RuntimeSettings {
            workspace_root: dir.path().to_path_buf(),
            ..RuntimeSettings::default()
        });
        let ports = Arc::new(PortAllocator::new(PortSettings::default()).unwrap());
        let a = LocalProcessRuntime::new(SessionSpec::new("u", "a/b"), Arc::clone(&settings), Arc::clone(&ports));
        let b = LocalProcessRuntime::new(SessionSpec::new("u", "a_b"), Arc::clone(&settings), Arc::clone(&ports));
        let wa = a.connect().await.unwrap().workspace;
        let wb = b.connect().await.unwrap().workspace;
        assert_ne!(wa, wb);

        a.write_file("secret.txt", b"from a").await.unwrap();
        assert!(b.read_file("secret.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_patch_applied_on_host_workspace() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        fs.write("app.py", b"print('hi')\n").await.unwrap();
        let patch = "--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-print('hi')\n+print('hello')\n";
        let action = RuntimeAction::apply_patch(Uuid::new_v4(), patch);
        let obs = apply_patch_on_host(&fs, &action, patch, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(obs.is_success(), "{}", obs.content);
        assert_eq!(obs.id, action.id);
        assert_eq!(fs.read("app.py").await.unwrap(), b"print('hello')\n");

        let stale = RuntimeAction::apply_patch(Uuid::new_v4(), patch);
        let obs = apply_patch_on_host(&fs, &stale, patch, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!obs.is_success());
    }

    #[tokio::test]
    async fn test_action_before_connect_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, _) = runtime(dir.path());
        let err = rt
            .do_action(&RuntimeAction::run(Uuid::new_v4(), "true", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RuntimeAction(_)));
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, _) = runtime(dir.path());
        rt.connect().await.unwrap();
        assert!(matches!(
            rt.write_file("../../x", b"1").await,
            Err(AgentError::PathEscape(_))
        ));
    }
}
