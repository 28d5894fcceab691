//! 模式学习：每个完成的周期把完整的阶段产物序列交给学习子系统
//!
//! 调度器在 REFLECT → OBSERVE 时以 fire-and-forget 方式调用，失败只记录日志，不影响循环。

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::cycle::types::PhaseResult;

/// 周期结果（success 取自 Reflection）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub success: bool,
    pub duration_ms: i64,
}

/// 一个完成的周期
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedCycle {
    pub agent_id: String,
    pub channel_id: String,
    pub cycle_id: String,
    /// 按 ORPAR 顺序排列的阶段结果
    pub phase_sequence: Vec<PhaseResult>,
    pub outcome: CycleOutcome,
}

#[derive(Debug, thiserror::Error)]
#[error("pattern learner failed: {0}")]
pub struct LearnerError(pub String);

/// 模式学习子系统的窄接口
#[async_trait]
pub trait PatternLearner: Send + Sync {
    async fn record_completed_cycle(&self, cycle: CompletedCycle) -> Result<(), LearnerError>;
}

/// 空实现
#[derive(Debug, Clone, Default)]
pub struct NoopLearner;

#[async_trait]
impl PatternLearner for NoopLearner {
    async fn record_completed_cycle(&self, _cycle: CompletedCycle) -> Result<(), LearnerError> {
        Ok(())
    }
}

/// 记录全部周期，供检查与测试
#[derive(Debug, Default)]
pub struct RecordingLearner {
    cycles: Mutex<Vec<CompletedCycle>>,
}

impl RecordingLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycles(&self) -> Vec<CompletedCycle> {
        self.cycles.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.cycles.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PatternLearner for RecordingLearner {
    async fn record_completed_cycle(&self, cycle: CompletedCycle) -> Result<(), LearnerError> {
        tracing::debug!(cycle_id = %cycle.cycle_id, phases = cycle.phase_sequence.len(), "recording completed cycle");
        self.cycles
            .lock()
            .map_err(|_| LearnerError("recording lock poisoned".to_string()))?
            .push(cycle);
        Ok(())
    }
}
