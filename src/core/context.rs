//! 单次运行的上下文：贯穿每个挂起点的 run id、归属、取消令牌、消息发送端与增量广播

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codeact::EventEmitter;
use crate::llm::{DeltaSink, TokenUsage, UsageMeter};

/// 增量广播缓冲（慢订阅者会丢掉最旧的增量）
pub const DELTA_CHANNEL_CAPACITY: usize = 1024;

pub struct RunContext {
    pub run_id: Uuid,
    pub conversation_id: String,
    pub user_id: String,
    pub goal: String,
    pub cancel: CancellationToken,
    pub emitter: EventEmitter,
    deltas: broadcast::Sender<String>,
    usage: UsageMeter,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        goal: impl Into<String>,
        cancel: CancellationToken,
        emitter: EventEmitter,
    ) -> (Self, broadcast::Receiver<String>) {
        let (deltas, rx) = broadcast::channel(DELTA_CHANNEL_CAPACITY);
        (
            Self {
                run_id,
                conversation_id: conversation_id.into(),
                user_id: user_id.into(),
                goal: goal.into(),
                cancel,
                emitter,
                deltas,
                usage: UsageMeter::new(),
            },
            rx,
        )
    }

    pub fn delta_sink(&self) -> BroadcastSink {
        BroadcastSink {
            deltas: self.deltas.clone(),
            usage: self.usage.clone(),
        }
    }

    /// 本运行至今的用量（只统计经由 delta_sink 的补全）
    pub fn usage(&self) -> TokenUsage {
        let (prompt, completion, _) = self.usage.get();
        TokenUsage::new(prompt, completion)
    }

    pub fn subscribe_deltas(&self) -> broadcast::Receiver<String> {
        self.deltas.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 把增量转发到广播通道（没有订阅者时直接丢弃），并累计本运行的用量
#[derive(Clone)]
pub struct BroadcastSink {
    deltas: broadcast::Sender<String>,
    usage: UsageMeter,
}

impl DeltaSink for BroadcastSink {
    fn on_delta(&self, delta: &str) {
        let _ = self.deltas.send(delta.to_string());
    }

    fn on_usage(&self, usage: TokenUsage) {
        self.usage.add(usage);
    }
}
