//! 错误类型与恢复决策
//!
//! 与 ErrorRecoveryManager 配合：协作方失败由恢复管理器吸收并转换为 Retry / Escalate，
//! 只有转移错误、选模错误、注册表冲突会直接返回给调用方。

use std::time::Duration;

use thiserror::Error;

use crate::core::phase::Phase;

/// 阶段转移被拒绝（同步返回，状态不变）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// 非法边；expected 为当前阶段唯一合法的下一阶段，错误文本本身是对外契约
    #[error("Cannot go from {from} to {to}. Expected: {expected}")]
    Invalid {
        from: Phase,
        to: Phase,
        expected: Phase,
    },

    /// STOPPED 为终态
    #[error("Control loop stopped: cannot go from stopped to {to}")]
    Stopped { to: Phase },

    /// 上一次转移触发的协作方调用尚未返回
    #[error("Collaborator call in flight during {phase}; cannot go to {to}")]
    CallInFlight { phase: Phase, to: Phase },
}

/// 外部协作方（推理后端 / 记忆存储）调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Transient collaborator failure: {0}")]
    Transient(String),

    #[error("Collaborator call exceeded deadline of {deadline_ms}ms")]
    Timeout { deadline_ms: u64 },

    #[error("Rate limited by provider, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// 协作方有响应但负载未通过 schema 校验：相同输入不重试
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Collaborator call cancelled")]
    Cancelled,
}

impl CollaboratorError {
    /// 是否允许以相同输入重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Transient(_)
                | CollaboratorError::Timeout { .. }
                | CollaboratorError::RateLimited { .. }
        )
    }
}

/// 选模失败：模型表中找不到任何可用条目
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No model available for {operation} (strategy: {strategy})")]
    NoModel { operation: String, strategy: String },
}

/// 调度器对外的统一错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CycleError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Max consecutive errors exceeded ({count})")]
    MaxConsecutiveErrorsExceeded { count: u32 },

    #[error("Control loop already exists for agent {agent_id} on channel {channel_id}")]
    RegistryConflict { agent_id: String, channel_id: String },

    #[error("Model selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Control loop stopped")]
    LoopStopped,

    #[error("No control loop for agent {agent_id} on channel {channel_id}")]
    LoopNotFound { agent_id: String, channel_id: String },
}

/// 升级（进入 ERROR）的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    /// 当前阶段重试次数耗尽
    RetriesExhausted,
    /// 周期内连续失败次数达到上限
    MaxConsecutiveErrors,
    /// 不可重试的错误（如 schema 校验失败）
    NonRetryable,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationReason::RetriesExhausted => "retries exhausted",
            EscalationReason::MaxConsecutiveErrors => "max consecutive errors",
            EscalationReason::NonRetryable => "non-retryable failure",
        };
        f.write_str(s)
    }
}

/// 恢复管理器针对一次失败给出的决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// 退避后以相同阶段重新调用
    Retry(Duration),
    /// 强制进入 ERROR
    Escalate(EscalationReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = TransitionError::Invalid {
            from: Phase::Observe,
            to: Phase::Act,
            expected: Phase::Reason,
        };
        assert_eq!(
            err.to_string(),
            "Cannot go from observe to act. Expected: reason"
        );
    }

    #[test]
    fn test_stopped_is_distinct() {
        let err = TransitionError::Stopped { to: Phase::Observe };
        assert!(err.to_string().contains("stopped"));
        assert!(!err.to_string().contains("Expected"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(CollaboratorError::Transient("net".into()).is_retryable());
        assert!(CollaboratorError::Timeout { deadline_ms: 10 }.is_retryable());
        assert!(CollaboratorError::RateLimited { retry_after_ms: 10 }.is_retryable());
        assert!(!CollaboratorError::SchemaValidation("bad".into()).is_retryable());
        assert!(!CollaboratorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_cycle_error_from_transition() {
        let err: CycleError = TransitionError::Stopped { to: Phase::Reason }.into();
        assert!(matches!(err, CycleError::InvalidTransition(_)));
    }
}
