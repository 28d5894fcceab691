//! 核心层：阶段状态机、错误与恢复、状态投影、循环监管、动作执行池

pub mod action_pool;
pub mod error;
pub mod phase;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use action_pool::{ActionPool, ExecutionMode};
pub use error::{
    CollaboratorError, CycleError, EscalationReason, RecoveryDecision, SelectionError,
    TransitionError,
};
pub use phase::{attempt_transition, Operation, Phase, PhaseStateMachine, PhaseTransition};
pub use recovery::{ErrorRecoveryManager, HealOutcome, RecoveryConfig};
pub use session_supervisor::LoopSupervisor;
pub use state::{CoreSnapshot, LoopId, LoopKey, LoopStatus};
