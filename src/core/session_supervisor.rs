//! 会话监管：按 (user_id, conversation_id) 跟踪正在执行的运行及其取消令牌
//!
//! 每个会话同一时刻只有一个运行；同一用户的同一会话发起新运行时，旧运行会被取消。
//! 不同用户即使使用相同的 conversation_id 也互不影响。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 运行的归属键，与运行时会话使用同一对 id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunKey {
    pub user_id: String,
    pub conversation_id: String,
}

impl RunKey {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

struct LiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
}

/// 运行级生命周期管理
pub struct SessionSupervisor {
    /// 进程级令牌，所有运行的令牌都是它的子令牌
    root: CancellationToken,
    runs: Mutex<HashMap<RunKey, LiveRun>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// 为新运行创建取消令牌并登记
    pub fn register(&self, key: &RunKey, run_id: Uuid) -> CancellationToken {
        let cancel = self.root.child_token();
        if let Ok(mut runs) = self.runs.lock() {
            let previous = runs.insert(
                key.clone(),
                LiveRun {
                    run_id,
                    cancel: cancel.clone(),
                },
            );
            if let Some(prev) = previous {
                tracing::info!(
                    user_id = %key.user_id,
                    conversation_id = %key.conversation_id,
                    previous_run = %prev.run_id,
                    "new run supersedes a live run, cancelling it"
                );
                prev.cancel.cancel();
            }
        }
        cancel
    }

    /// 取消某会话当前的运行；没有运行时返回 false
    pub fn cancel(&self, key: &RunKey) -> bool {
        let token = self
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(key).map(|r| r.cancel.clone()));
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    /// 运行结束时注销；只移除同一 run_id 的登记
    pub fn remove(&self, key: &RunKey, run_id: Uuid) {
        if let Ok(mut runs) = self.runs.lock() {
            if runs.get(key).map(|r| r.run_id) == Some(run_id) {
                runs.remove(key);
            }
        }
    }

    pub fn run_id(&self, key: &RunKey) -> Option<Uuid> {
        self.runs
            .lock()
            .ok()
            .and_then(|runs| runs.get(key).map(|r| r.run_id))
    }

    pub fn active_runs(&self) -> Vec<RunKey> {
        let mut keys: Vec<RunKey> = self
            .runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// 取消所有运行（进程退出）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_by_conversation() {
        let sup = SessionSupervisor::new();
        let key = RunKey::new("u1", "c1");
        let token = sup.register(&key, Uuid::new_v4());
        assert!(!token.is_cancelled());
        assert!(!sup.cancel(&RunKey::new("u1", "other")));
        assert!(sup.cancel(&key));
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_new_run_supersedes_old() {
        let sup = SessionSupervisor::new();
        let key = RunKey::new("u1", "c1");
        let first = Uuid::new_v4();
        let old = sup.register(&key, first);
        let second = Uuid::new_v4();
        let new = sup.register(&key, second);
        assert!(old.is_cancelled());
        assert!(!new.is_cancelled());

        // 旧运行的注销不影响新运行
        sup.remove(&key, first);
        assert_eq!(sup.run_id(&key), Some(second));
        sup.remove(&key, second);
        assert!(sup.active_runs().is_empty());
    }

    #[test]
    fn test_same_conversation_id_for_two_users() {
        let sup = SessionSupervisor::new();
        let alice = RunKey::new("alice", "conv-1");
        let bob = RunKey::new("bob", "conv-1");
        let alice_run = sup.register(&alice, Uuid::new_v4());
        let bob_run = sup.register(&bob, Uuid::new_v4());
        assert!(!alice_run.is_cancelled());
        assert_eq!(sup.active_runs(), vec![alice.clone(), bob.clone()]);

        assert!(sup.cancel(&bob));
        assert!(bob_run.is_cancelled());
        assert!(!alice_run.is_cancelled());
    }

    #[test]
    fn test_cancel_all() {
        let sup = SessionSupervisor::new();
        let a = sup.register(&RunKey::new("u", "a"), Uuid::new_v4());
        let b = sup.register(&RunKey::new("u", "b"), Uuid::new_v4());
        sup.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
