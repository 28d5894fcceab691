//! 控制循环事件：阶段转换、错误、自愈、停止、观察丢弃、周期完成
//!
//! 调度器只通过 EventSink::publish 发布；BroadcastEventBus 用 tokio broadcast 扇出给任意订阅者。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{LoopId, Phase};
use crate::cycle::types::now_ms;

/// 单条循环事件（可序列化为 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    PhaseTransition {
        loop_id: LoopId,
        from: Phase,
        to: Phase,
        cycle_id: String,
        timestamp: i64,
    },
    /// 协作方调用失败（已交给恢复管理器）
    Error {
        loop_id: LoopId,
        phase: Phase,
        message: String,
        timestamp: i64,
    },
    /// ERROR → OBSERVE
    AutoHeal {
        loop_id: LoopId,
        reason: String,
        timestamp: i64,
    },
    Stopped {
        loop_id: LoopId,
        reason: String,
        timestamp: i64,
    },
    ObservationDropped {
        loop_id: LoopId,
        observation_id: String,
        dropped_total: u64,
        timestamp: i64,
    },
    CycleCompleted {
        loop_id: LoopId,
        cycle_id: String,
        cycle_count: u64,
        success: bool,
        duration_ms: i64,
        timestamp: i64,
    },
}

impl LoopEvent {
    pub fn loop_id(&self) -> &str {
        match self {
            LoopEvent::PhaseTransition { loop_id, .. }
            | LoopEvent::Error { loop_id, .. }
            | LoopEvent::AutoHeal { loop_id, .. }
            | LoopEvent::Stopped { loop_id, .. }
            | LoopEvent::ObservationDropped { loop_id, .. }
            | LoopEvent::CycleCompleted { loop_id, .. } => loop_id,
        }
    }

    pub fn phase_transition(loop_id: &str, from: Phase, to: Phase, cycle_id: &str) -> Self {
        LoopEvent::PhaseTransition {
            loop_id: loop_id.to_string(),
            from,
            to,
            cycle_id: cycle_id.to_string(),
            timestamp: now_ms(),
        }
    }

    pub fn error(loop_id: &str, phase: Phase, message: impl Into<String>) -> Self {
        LoopEvent::Error {
            loop_id: loop_id.to_string(),
            phase,
            message: message.into(),
            timestamp: now_ms(),
        }
    }
}

/// 事件出口
pub trait EventSink: Send + Sync {
    fn publish(&self, event: LoopEvent);
}

/// 丢弃所有事件
#[derive(Debug, Clone, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: LoopEvent) {}
}

/// 基于 broadcast 的事件总线；无订阅者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<LoopEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEventBus {
    fn publish(&self, event: LoopEvent) {
        let _ = self.tx.send(event);
    }
}
