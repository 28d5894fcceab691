//! ORPAR 周期：产物类型、周期上下文、观察队列、计划执行、事件、调度器与注册表

pub mod context;
pub mod events;
pub mod plan;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use context::{CycleContext, CycleContextStore, CycleMetadata, PhaseResults, SharedContext};
pub use events::{BroadcastEventBus, EventSink, LoopEvent, NoopEventSink};
pub use plan::{execute_plan, ActionRunner, InferenceActionRunner};
pub use queue::{ObservationQueue, SubmitOutcome};
pub use registry::ControlLoopRegistry;
pub use scheduler::{ControlLoop, LoopConfig, LoopDependencies, TickOutcome, MIN_CYCLE_INTERVAL_MS};
pub use types::{
    ActionStatus, Observation, ObservationSource, PhaseResult, Plan, PlanAction, PlanStatus,
    Reasoning, Reflection,
};
