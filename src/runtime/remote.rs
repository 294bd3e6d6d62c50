//! 远程沙箱后端：多租户沙箱服务的 HTTP 客户端
//!
//! - `POST   {base}/sessions`                 创建或复用会话
//! - `POST   {base}/sessions/{id}/actions`    执行动作，返回 exit_code / stdout / stderr
//! - `GET    {base}/sessions/{id}/files?path=` 读文件（原始字节）
//! - `PUT    {base}/sessions/{id}/files?path=` 写文件（原始字节）
//! - `DELETE {base}/sessions/{id}`            释放
//! - `DELETE {base}/sessions?session_key=`    释放尚未拿到 id 的会话（connect 中途被中断）

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::process::{observation_from_output, CommandOutput};
use super::{
    PortAllocator, RuntimeAction, RuntimeKind, RuntimeSession, RuntimeSettings, SessionInfo,
    SessionSpec,
};
use crate::codeact::Observation;
use crate::core::AgentError;

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    session_id: String,
    #[serde(default)]
    workspace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    exit_code: Option<i32>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

pub struct RemoteRuntime {
    spec: SessionSpec,
    settings: Arc<RuntimeSettings>,
    ports: Arc<PortAllocator>,
    holder: String,
    ports_held: AtomicBool,
    client: reqwest::Client,
    base_url: String,
    state: Mutex<Option<SessionInfo>>,
}

impl RemoteRuntime {
    pub fn new(
        spec: SessionSpec,
        settings: Arc<RuntimeSettings>,
        ports: Arc<PortAllocator>,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AgentError::Config(format!("http client: {}", e)))?;
        let base_url = settings.remote_base_url.trim_end_matches('/').to_string();
        Ok(Self {
            spec,
            settings,
            ports,
            holder: Uuid::new_v4().to_string(),
            ports_held: AtomicBool::new(false),
            client,
            base_url,
            state: Mutex::new(None),
        })
    }

    fn session_id(&self) -> Result<String, AgentError> {
        self.state
            .lock()
            .map_err(|_| AgentError::RuntimeAction("runtime state poisoned".to_string()))?
            .as_ref()
            .map(|i| i.session_id.clone())
            .ok_or_else(|| AgentError::RuntimeAction("session not connected".to_string()))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.settings.remote_api_key.as_deref() {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, String> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(format!("{}: {}", status, body.chars().take(300).collect::<String>()))
    }
}

#[async_trait]
impl RuntimeSession for RemoteRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Remote
    }

    async fn connect(&self) -> Result<SessionInfo, AgentError> {
        let existing = self.state.lock().ok().and_then(|s| s.clone());
        if let Some(info) = existing {
            return Ok(info);
        }
        let ports = self.ports.allocate(&self.spec.key(), &self.holder)?;
        self.ports_held.store(true, Ordering::SeqCst);
        let body = json!({
            "session_key": self.spec.key(),
            "user_id": self.spec.user_id,
            "conversation_id": self.spec.conversation_id,
            "ports": ports,
        });
        let result = async {
            let resp = self
                .authed(self.client.post(format!("{}/sessions", self.base_url)))
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            Self::check(resp)
                .await?
                .json::<CreateSessionResponse>()
                .await
                .map_err(|e| e.to_string())
        }
        .await;
        let created = match result {
            Ok(c) => c,
            Err(e) => {
                if let Err(cleanup) = self.release().await {
                    tracing::debug!(error = %cleanup, "cleanup after failed connect failed");
                }
                return Err(AgentError::RuntimeUnavailable(format!(
                    "sandbox service {}: {}",
                    self.base_url, e
                )));
            }
        };
        let info = SessionInfo {
            session_id: created.session_id,
            kind: RuntimeKind::Remote,
            workspace: created
                .workspace
                .unwrap_or_else(|| self.spec.workspace_rel().display().to_string()),
            ports: Some(ports),
        };
        tracing::info!(session = %info.session_id, base_url = %self.base_url, "remote runtime connected");
        if let Ok(mut state) = self.state.lock() {
            *state = Some(info.clone());
        }
        Ok(info)
    }

    async fn do_action(&self, action: &RuntimeAction) -> Result<Observation, AgentError> {
        let id = self.session_id()?;
        let resp = self
            .authed(
                self.client
                    .post(format!("{}/sessions/{}/actions", self.base_url, id))
                    .timeout(self.settings.action_timeout()),
            )
            .json(action)
            .send()
            .await
            .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
        let out: ActionResponse = Self::check(resp)
            .await
            .map_err(AgentError::RuntimeAction)?
            .json()
            .await
            .map_err(|e| AgentError::RuntimeAction(format!("bad action response: {}", e)))?;
        let output = CommandOutput {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        };
        Ok(observation_from_output(action.id, &output).with_metadata("runtime", "remote"))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, AgentError> {
        let id = self.session_id()?;
        let resp = self
            .authed(
                self.client
                    .get(format!("{}/sessions/{}/files", self.base_url, id))
                    .query(&[("path", path)]),
            )
            .send()
            .await
            .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
        let bytes = Self::check(resp)
            .await
            .map_err(AgentError::RuntimeAction)?
            .bytes()
            .await
            .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), AgentError> {
        let id = self.session_id()?;
        let resp = self
            .authed(
                self.client
                    .put(format!("{}/sessions/{}/files", self.base_url, id))
                    .query(&[("path", path)])
                    .body(content.to_vec()),
            )
            .send()
            .await
            .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
        Self::check(resp).await.map_err(AgentError::RuntimeAction)?;
        Ok(())
    }

    async fn release(&self) -> Result<(), AgentError> {
        let taken = self.state.lock().ok().and_then(|mut s| s.take());
        let held = self.ports_held.swap(false, Ordering::SeqCst);
        if taken.is_none() && !held {
            return Ok(());
        }
        let key = self.spec.key();
        if !self.ports.release(&key, &self.holder) {
            tracing::info!(session_key = %key, "remote session still held by another run");
            return Ok(());
        }
        let req = match &taken {
            Some(info) => self
                .client
                .delete(format!("{}/sessions/{}", self.base_url, info.session_id)),
            None => self
                .client
                .delete(format!("{}/sessions", self.base_url))
                .query(&[("session_key", key.as_str())]),
        };
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| AgentError::RuntimeAction(e.to_string()))?;
        Self::check(resp).await.map_err(AgentError::RuntimeAction)?;
        match taken {
            Some(info) => tracing::info!(session = %info.session_id, "remote runtime released"),
            None => tracing::info!(session_key = %key, "interrupted remote session released"),
        }
        Ok(())
    }
}
