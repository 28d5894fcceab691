//! 错误恢复管理器
//!
//! 按控制循环统计连续失败次数，返回 Retry（指数退避）或 Escalate；
//! 升级时驱动状态机进入 ERROR，再按 enable_auto_healing 自愈回 OBSERVE 或停止。

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::core::error::{CollaboratorError, EscalationReason, RecoveryDecision, TransitionError};
use crate::core::phase::{Phase, PhaseStateMachine, PhaseTransition};
use crate::core::state::LoopId;

/// [recovery] 段：重试与自愈参数
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    /// 连续失败上限（成功即清零）；达到即升级
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// 单个阶段的最大重试次数。阶段成功才会前进，所以同一阶段的失败次数就是连续失败数：
    /// 实际可重试次数为 min(max_retries, max_consecutive_errors - 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 首次重试延迟（毫秒），之后每次 ×2
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_enable_auto_healing")]
    pub enable_auto_healing: bool,
    /// 被限流时的最小退避（毫秒）
    #[serde(default = "default_rate_limit_floor_ms")]
    pub rate_limit_floor_ms: u64,
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_enable_auto_healing() -> bool {
    true
}

fn default_rate_limit_floor_ms() -> u64 {
    5000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: default_max_consecutive_errors(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            enable_auto_healing: default_enable_auto_healing(),
            rate_limit_floor_ms: default_rate_limit_floor_ms(),
        }
    }
}

/// 自愈结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealOutcome {
    /// 依次发生的转移（进入 ERROR，再到 OBSERVE 或 STOPPED）
    pub transitions: Vec<PhaseTransition>,
    pub healed: bool,
}

impl HealOutcome {
    pub fn final_phase(&self) -> Option<Phase> {
        self.transitions.last().map(|t| t.to)
    }
}

/// 错误恢复管理器：失败计数、退避计算、升级与自愈
#[derive(Debug)]
pub struct ErrorRecoveryManager {
    config: RecoveryConfig,
    /// 每个循环的连续失败数
    consecutive: HashMap<LoopId, u32>,
}

impl ErrorRecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            consecutive: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn consecutive_errors(&self, loop_id: &str) -> u32 {
        self.consecutive.get(loop_id).copied().unwrap_or(0)
    }

    /// 记录一次失败并给出决策
    pub fn on_failure(&mut self, loop_id: &str, err: &CollaboratorError) -> RecoveryDecision {
        let counter = self.consecutive.entry(loop_id.to_string()).or_default();
        *counter += 1;
        let consecutive = *counter;

        let decision = if !err.is_retryable() {
            RecoveryDecision::Escalate(EscalationReason::NonRetryable)
        } else if consecutive >= self.config.max_consecutive_errors {
            RecoveryDecision::Escalate(EscalationReason::MaxConsecutiveErrors)
        } else if consecutive > self.config.max_retries {
            RecoveryDecision::Escalate(EscalationReason::RetriesExhausted)
        } else {
            RecoveryDecision::Retry(self.backoff(consecutive, err))
        };

        tracing::warn!(
            loop_id,
            consecutive,
            error = %err,
            ?decision,
            "collaborator failure"
        );
        decision
    }

    /// 阶段调用成功：连续失败清零
    pub fn on_success(&mut self, loop_id: &str) {
        if let Some(c) = self.consecutive.get_mut(loop_id) {
            *c = 0;
        }
    }

    /// 第 attempt 次失败后的退避：retry_delay × 2^(attempt-1)，限流时不低于 provider 给出的下限
    fn backoff(&self, attempt: u32, err: &CollaboratorError) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.config.retry_delay_ms.saturating_mul(1u64 << exp);
        let ms = match err {
            CollaboratorError::RateLimited { retry_after_ms } => base
                .max(*retry_after_ms)
                .max(self.config.rate_limit_floor_ms),
            _ => base,
        };
        Duration::from_millis(ms)
    }

    /// 升级：强制进入 ERROR；开启自愈则立即回到 OBSERVE 并清零计数，否则进入 STOPPED
    pub fn escalate(
        &mut self,
        loop_id: &str,
        machine: &mut PhaseStateMachine,
        reason: EscalationReason,
    ) -> Result<HealOutcome, TransitionError> {
        machine.end_call();
        let mut transitions = Vec::with_capacity(2);
        if machine.phase() != Phase::Error {
            transitions.push(machine.transition(Phase::Error)?);
        }

        let healed = self.config.enable_auto_healing;
        if healed {
            transitions.push(machine.transition(Phase::Observe)?);
            self.on_success(loop_id);
            tracing::info!(loop_id, %reason, "auto-healed back to observe");
        } else {
            transitions.push(machine.transition(Phase::Stopped)?);
            tracing::warn!(loop_id, %reason, "auto-healing disabled, loop stopped");
        }

        Ok(HealOutcome {
            transitions,
            healed,
        })
    }

    /// 循环注销时丢弃计数
    pub fn forget(&mut self, loop_id: &str) {
        self.consecutive.remove(loop_id);
    }
}

impl Default for ErrorRecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}
