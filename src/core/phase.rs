//! 阶段状态机：IDLE → OBSERVE → REASON → PLAN → ACT → REFLECT → OBSERVE
//!
//! attempt_transition 为纯校验函数；PhaseStateMachine::transition 在校验通过后才修改状态。
//! 任意非终态可进入 ERROR；ERROR 只能回到 OBSERVE（自愈）或进入 STOPPED。

use serde::{Deserialize, Serialize};

use crate::core::error::TransitionError;

/// 控制循环所处阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// 首次观察之前
    Idle,
    Observe,
    Reason,
    Plan,
    Act,
    Reflect,
    Error,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Observe => "observe",
            Phase::Reason => "reason",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Reflect => "reflect",
            Phase::Error => "error",
            Phase::Stopped => "stopped",
        }
    }

    /// 正向循环中的唯一合法后继；STOPPED 没有后继
    pub fn expected_next(&self) -> Option<Phase> {
        match self {
            Phase::Idle => Some(Phase::Observe),
            Phase::Observe => Some(Phase::Reason),
            Phase::Reason => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Act),
            Phase::Act => Some(Phase::Reflect),
            Phase::Reflect => Some(Phase::Observe),
            Phase::Error => Some(Phase::Observe),
            Phase::Stopped => None,
        }
    }

    /// 该阶段对应的认知操作（仅五个认知阶段有）
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Phase::Observe => Some(Operation::Observation),
            Phase::Reason => Some(Operation::Reasoning),
            Phase::Plan => Some(Operation::Planning),
            Phase::Act => Some(Operation::Action),
            Phase::Reflect => Some(Operation::Reflection),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 认知操作类型（选模与推理请求的维度）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Observation,
    Reasoning,
    Planning,
    Action,
    Reflection,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Observation,
        Operation::Reasoning,
        Operation::Planning,
        Operation::Action,
        Operation::Reflection,
    ];

    pub fn phase(&self) -> Phase {
        match self {
            Operation::Observation => Phase::Observe,
            Operation::Reasoning => Phase::Reason,
            Operation::Planning => Phase::Plan,
            Operation::Action => Phase::Act,
            Operation::Reflection => Phase::Reflect,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Observation => "observation",
            Operation::Reasoning => "reasoning",
            Operation::Planning => "planning",
            Operation::Action => "action",
            Operation::Reflection => "reflection",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 纯校验：current → requested 是否合法，合法则返回新阶段
pub fn attempt_transition(current: Phase, requested: Phase) -> Result<Phase, TransitionError> {
    if current == Phase::Stopped {
        return Err(TransitionError::Stopped { to: requested });
    }

    let legal = match (current, requested) {
        (Phase::Error, Phase::Observe) | (Phase::Error, Phase::Stopped) => true,
        (Phase::Error, _) => false,
        (_, Phase::Error) => true,
        (from, to) => from.expected_next() == Some(to),
    };

    if legal {
        Ok(requested)
    } else {
        Err(TransitionError::Invalid {
            from: current,
            to: requested,
            // 非 STOPPED 状态一定有后继
            expected: current.expected_next().unwrap_or(Phase::Observe),
        })
    }
}

/// 一次成功转移的记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    /// REFLECT → OBSERVE 时为 true
    pub cycle_completed: bool,
}

/// 单个控制循环的阶段状态机，由调度器独占
#[derive(Debug)]
pub struct PhaseStateMachine {
    phase: Phase,
    cycle_count: u64,
    call_in_flight: bool,
}

impl PhaseStateMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            cycle_count: 0,
            call_in_flight: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Stopped
    }

    pub fn call_in_flight(&self) -> bool {
        self.call_in_flight
    }

    /// 校验并执行转移；被拒绝时不修改任何状态
    pub fn transition(&mut self, to: Phase) -> Result<PhaseTransition, TransitionError> {
        if self.call_in_flight && self.phase != Phase::Stopped {
            return Err(TransitionError::CallInFlight {
                phase: self.phase,
                to,
            });
        }
        let from = self.phase;
        let next = attempt_transition(from, to)?;
        let cycle_completed = from == Phase::Reflect && next == Phase::Observe;
        if cycle_completed {
            self.cycle_count += 1;
        }
        self.phase = next;
        tracing::debug!(from = %from, to = %next, cycle = self.cycle_count, "phase transition");
        Ok(PhaseTransition {
            from,
            to: next,
            cycle_completed,
        })
    }

    /// 标记协作方调用开始；期间拒绝一切转移
    pub fn begin_call(&mut self) {
        self.call_in_flight = true;
    }

    pub fn end_call(&mut self) {
        self.call_in_flight = false;
    }

    /// 手动停止：任意状态均可直接进入 STOPPED，重复调用无副作用。
    /// 返回 None 表示此前已停止。
    pub fn force_stop(&mut self) -> Option<PhaseTransition> {
        if self.phase == Phase::Stopped {
            return None;
        }
        let from = self.phase;
        self.phase = Phase::Stopped;
        self.call_in_flight = false;
        Some(PhaseTransition {
            from,
            to: Phase::Stopped,
            cycle_completed: false,
        })
    }
}

impl Default for PhaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 8] = [
        Phase::Idle,
        Phase::Observe,
        Phase::Reason,
        Phase::Plan,
        Phase::Act,
        Phase::Reflect,
        Phase::Error,
        Phase::Stopped,
    ];

    fn machine_at(phase: Phase) -> PhaseStateMachine {
        let mut m = PhaseStateMachine::new();
        let path: &[Phase] = match phase {
            Phase::Idle => &[],
            Phase::Observe => &[Phase::Observe],
            Phase::Reason => &[Phase::Observe, Phase::Reason],
            Phase::Plan => &[Phase::Observe, Phase::Reason, Phase::Plan],
            Phase::Act => &[Phase::Observe, Phase::Reason, Phase::Plan, Phase::Act],
            Phase::Reflect => &[
                Phase::Observe,
                Phase::Reason,
                Phase::Plan,
                Phase::Act,
                Phase::Reflect,
            ],
            Phase::Error => &[Phase::Observe, Phase::Error],
            Phase::Stopped => &[Phase::Observe, Phase::Error, Phase::Stopped],
        };
        for p in path {
            m.transition(*p).unwrap();
        }
        m
    }

    #[test]
    fn test_full_cycle_increments_count_once() {
        let mut m = machine_at(Phase::Reflect);
        assert_eq!(m.cycle_count(), 0);
        let t = m.transition(Phase::Observe).unwrap();
        assert!(t.cycle_completed);
        assert_eq!(m.cycle_count(), 1);
        assert_eq!(m.phase(), Phase::Observe);
    }

    #[test]
    fn test_illegal_pairs_rejected_without_mutation() {
        for from in ALL {
            for to in ALL {
                if attempt_transition(from, to).is_ok() {
                    continue;
                }
                let mut m = machine_at(from);
                let count = m.cycle_count();
                assert!(m.transition(to).is_err(), "{from} -> {to} should fail");
                assert_eq!(m.phase(), from);
                assert_eq!(m.cycle_count(), count);
            }
        }
    }

    #[test]
    fn test_only_expected_edges_are_legal() {
        for from in [Phase::Idle, Phase::Observe, Phase::Reason, Phase::Plan, Phase::Act, Phase::Reflect] {
            for to in ALL {
                let ok = attempt_transition(from, to).is_ok();
                let expected = Some(to) == from.expected_next() || to == Phase::Error;
                assert_eq!(ok, expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_observe_to_act_guidance() {
        let err = attempt_transition(Phase::Observe, Phase::Act).unwrap_err();
        assert!(err.to_string().contains("Expected: reason"));
    }

    #[test]
    fn test_error_exits() {
        assert_eq!(attempt_transition(Phase::Error, Phase::Observe), Ok(Phase::Observe));
        assert_eq!(attempt_transition(Phase::Error, Phase::Stopped), Ok(Phase::Stopped));
        assert!(attempt_transition(Phase::Error, Phase::Reason).is_err());
        assert!(attempt_transition(Phase::Error, Phase::Error).is_err());
    }

    #[test]
    fn test_stopped_is_terminal() {
        for to in ALL {
            assert!(matches!(
                attempt_transition(Phase::Stopped, to),
                Err(TransitionError::Stopped { .. })
            ));
        }
    }

    #[test]
    fn test_in_flight_blocks_transition() {
        let mut m = machine_at(Phase::Reason);
        m.begin_call();
        assert!(matches!(
            m.transition(Phase::Plan),
            Err(TransitionError::CallInFlight { .. })
        ));
        m.end_call();
        assert!(m.transition(Phase::Plan).is_ok());
    }

    #[test]
    fn test_force_stop_idempotent() {
        let mut m = machine_at(Phase::Plan);
        assert!(m.force_stop().is_some());
        assert!(m.force_stop().is_none());
        assert!(m.is_stopped());
    }
}
