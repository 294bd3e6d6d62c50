//! 运行时租约
//!
//! 包装一个未连接的会话：首次 acquire 时在 provisioning 超时内 connect；
//! connect 成功过、超时或中途被取消的会话都会被 release，且最多一次。

use std::time::Duration;

use super::{RuntimeKind, RuntimeSession, SessionInfo};
use crate::core::AgentError;

pub struct RuntimeLease {
    session: Box<dyn RuntimeSession>,
    provision_timeout: Duration,
    info: Option<SessionInfo>,
    /// connect 已开始但尚未返回（acquire 的 future 被丢弃时保持为 true）
    pending: bool,
    released: bool,
}

impl RuntimeLease {
    pub fn new(session: Box<dyn RuntimeSession>, provision_timeout: Duration) -> Self {
        Self {
            session,
            provision_timeout,
            info: None,
            pending: false,
            released: false,
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.session.kind()
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        self.info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.info.is_some() && !self.released
    }

    /// 懒连接；失败或超时一律为 RuntimeUnavailable
    pub async fn acquire(&mut self) -> Result<&dyn RuntimeSession, AgentError> {
        if self.released {
            return Err(AgentError::RuntimeUnavailable(
                "runtime session already released".to_string(),
            ));
        }
        if self.info.is_none() {
            let kind = self.session.kind();
            tracing::info!(runtime = %kind, "provisioning runtime");
            self.pending = true;
            let outcome = tokio::time::timeout(self.provision_timeout, self.session.connect()).await;
            self.pending = false;
            let info = match outcome {
                Ok(Ok(info)) => info,
                Ok(Err(AgentError::RuntimeUnavailable(msg))) => {
                    return Err(AgentError::RuntimeUnavailable(msg))
                }
                Ok(Err(e)) => return Err(AgentError::RuntimeUnavailable(e.to_string())),
                Err(_) => {
                    // 超时丢弃了 connect，可能已留下半成品环境
                    self.released = true;
                    if let Err(e) = self.session.release().await {
                        tracing::warn!(error = %e, "release after provisioning timeout failed");
                    }
                    return Err(AgentError::RuntimeUnavailable(format!(
                        "{} runtime not ready within {}s",
                        kind,
                        self.provision_timeout.as_secs()
                    )))
                }
            };
            self.info = Some(info);
        }
        Ok(self.session.as_ref())
    }

    /// 返回本次调用是否真正触发了 release
    pub async fn release(&mut self) -> bool {
        if self.released || (self.info.is_none() && !self.pending) {
            return false;
        }
        self.pending = false;
        self.released = true;
        if let Err(e) = self.session.release().await {
            tracing::warn!(error = %e, "runtime release failed");
        }
        true
    }
}
