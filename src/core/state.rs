//! 状态投影：LoopStatus
//!
//! 外部只能看到轻量的 LoopStatus（阶段、周期数、连续失败数）；
//! 完整状态由调度器内部持有，每次变更后投影并通过 watch 通道发布。

use serde::Serialize;

use crate::core::phase::Phase;

/// 控制循环 ID（`loop_<uuid>`）
pub type LoopId = String;

/// (agent_id, channel_id) 唯一确定一个控制循环
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LoopKey {
    pub agent_id: String,
    pub channel_id: String,
}

impl LoopKey {
    pub fn new(agent_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for LoopKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.agent_id, self.channel_id)
    }
}

/// status() 返回的只读快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoopStatus {
    pub loop_id: LoopId,
    pub agent_id: String,
    pub channel_id: String,
    pub current_phase: Phase,
    pub cycle_count: u64,
    pub consecutive_errors: u32,
    /// 队列溢出丢弃的观察累计数
    pub dropped_observations: u64,
    /// 队列中待处理的观察数
    pub pending_observations: usize,
}

impl LoopStatus {
    pub fn initial(loop_id: LoopId, key: &LoopKey) -> Self {
        Self {
            loop_id,
            agent_id: key.agent_id.clone(),
            channel_id: key.channel_id.clone(),
            current_phase: Phase::Idle,
            cycle_count: 0,
            consecutive_errors: 0,
            dropped_observations: 0,
            pending_observations: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.current_phase == Phase::Stopped
    }
}

/// 内部计数快照（用于投影）
#[derive(Clone, Copy, Debug)]
pub struct CoreSnapshot {
    pub phase: Phase,
    pub cycle_count: u64,
    pub consecutive_errors: u32,
}

impl CoreSnapshot {
    /// 与队列统计合并，得到对外的 LoopStatus
    pub fn project(&self, base: &LoopStatus, dropped: u64, pending: usize) -> LoopStatus {
        LoopStatus {
            loop_id: base.loop_id.clone(),
            agent_id: base.agent_id.clone(),
            channel_id: base.channel_id.clone(),
            current_phase: self.phase,
            cycle_count: self.cycle_count,
            consecutive_errors: self.consecutive_errors,
            dropped_observations: dropped,
            pending_observations: pending,
        }
    }
}
