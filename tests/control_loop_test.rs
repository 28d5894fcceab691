//! 控制循环集成测试：完整周期、选模升级、非法转移、注册表并发、恢复与停止

use std::sync::Arc;
use std::time::Duration;

use orpar::core::{attempt_transition, CycleError, ExecutionMode, Operation, Phase};
use orpar::cycle::{
    ActionStatus, ControlLoop, ControlLoopRegistry, LoopConfig, LoopDependencies, Observation,
    ObservationSource, PhaseResult, TickOutcome,
};
use orpar::learning::RecordingLearner;
use orpar::llm::{ComplexityTier, InferenceError, ModelTable, ScriptedInference};
use orpar::memory::InMemoryPhaseMemory;
use serde_json::json;

const AGENT: &str = "agent-1";
const CHANNEL: &str = "chan-1";

fn models() -> ModelTable {
    ModelTable::new("acme")
        .with_tier("acme", ComplexityTier::Simple, "acme-mini")
        .with_tier("acme", ComplexityTier::Moderate, "acme-pro")
        .with_tier("acme", ComplexityTier::Complex, "acme-max")
}

fn manual_config() -> LoopConfig {
    let mut cfg = LoopConfig::new(AGENT, CHANNEL);
    cfg.auto_run = false;
    cfg.recovery.retry_delay_ms = 1;
    cfg
}

struct Harness {
    backend: Arc<ScriptedInference>,
    learner: Arc<RecordingLearner>,
    registry: Arc<ControlLoopRegistry>,
}

impl Harness {
    fn new(backend: ScriptedInference) -> Self {
        let backend = Arc::new(backend);
        let learner = Arc::new(RecordingLearner::new());
        let deps = LoopDependencies::new(backend.clone(), models()).with_learner(learner.clone());
        Self {
            backend,
            learner,
            registry: ControlLoopRegistry::new(deps),
        }
    }

    async fn start(&self, cfg: LoopConfig) -> Arc<ControlLoop> {
        self.registry.start(cfg).await
    }

    async fn wait_for_learner(&self, count: usize) {
        for _ in 0..100 {
            if self.learner.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("learner saw {} cycles, expected {count}", self.learner.len());
    }
}

fn observation(text: &str) -> Observation {
    Observation::new(AGENT, ObservationSource::User, text)
}

async fn run_cycle(control_loop: &ControlLoop) -> TickOutcome {
    let mut last = TickOutcome::Idle;
    for _ in 0..5 {
        last = control_loop.tick().await.unwrap();
    }
    last
}

#[tokio::test]
async fn test_happy_path_single_cycle() {
    let h = Harness::new(ScriptedInference::new());
    let control_loop = h.start(manual_config()).await;
    assert_eq!(control_loop.status().current_phase, Phase::Observe);

    control_loop.submit_observation(observation("status?")).await.unwrap();
    let last = run_cycle(&control_loop).await;

    assert_eq!(last, TickOutcome::CycleCompleted { cycle_count: 1 });
    let status = control_loop.status();
    assert_eq!(status.current_phase, Phase::Observe);
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.consecutive_errors, 0);
    assert_eq!(h.backend.models_for(Operation::Reasoning), vec!["acme-mini".to_string()]);

    h.wait_for_learner(1).await;
    let cycles = h.learner.cycles();
    assert_eq!(cycles.len(), 1);
    let phases: Vec<Phase> = cycles[0].phase_sequence.iter().map(|r| r.phase()).collect();
    assert_eq!(
        phases,
        vec![Phase::Observe, Phase::Reason, Phase::Plan, Phase::Act, Phase::Reflect]
    );
    assert!(cycles[0].outcome.success);
}

#[tokio::test]
async fn test_reasoning_failures_upgrade_model_tier() {
    let backend = ScriptedInference::new();
    backend.fail_next(Operation::Reasoning, InferenceError::Transport("reset".into()));
    backend.fail_next(Operation::Reasoning, InferenceError::Timeout);
    let h = Harness::new(backend);

    let mut cfg = manual_config();
    cfg.initial_shared_context.confidence = 1.0;
    let control_loop = h.start(cfg).await;
    control_loop.submit_observation(observation("status?")).await.unwrap();

    control_loop.tick().await.unwrap();
    let outcome = control_loop.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Advanced { from: Phase::Reason, to: Phase::Plan });

    let used = h.backend.models_for(Operation::Reasoning);
    assert_eq!(used.len(), 3);
    assert_eq!(used[0], "acme-mini");
    assert_eq!(used[2], "acme-pro");
    assert_eq!(control_loop.status().consecutive_errors, 0);
}

#[tokio::test]
async fn test_illegal_transition_leaves_phase_unchanged() {
    let h = Harness::new(ScriptedInference::new());
    let control_loop = h.start(manual_config()).await;

    let err = attempt_transition(control_loop.status().current_phase, Phase::Act).unwrap_err();
    assert!(err.to_string().contains("Expected: reason"));
    assert_eq!(control_loop.status().current_phase, Phase::Observe);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_returns_same_instance() {
    let h = Harness::new(ScriptedInference::new());
    let (a, b) = tokio::join!(h.start(manual_config()), h.start(manual_config()));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(h.registry.len().await, 1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = h.registry.clone();
        handles.push(tokio::spawn(async move { registry.start(manual_config()).await }));
    }
    for handle in handles {
        assert!(Arc::ptr_eq(&handle.await.unwrap(), &a));
    }
}

#[tokio::test]
async fn test_consecutive_failures_auto_heal_to_observe() {
    let backend = ScriptedInference::new();
    backend.fail_always(Operation::Reasoning, InferenceError::Transport("down".into()));
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("hello")).await.unwrap();
    control_loop.tick().await.unwrap();
    assert_eq!(control_loop.tick().await.unwrap(), TickOutcome::Healed);

    let status = control_loop.status();
    assert_eq!(status.current_phase, Phase::Observe);
    assert_eq!(status.consecutive_errors, 0);
    assert_eq!(status.cycle_count, 0);
    assert_eq!(h.backend.models_for(Operation::Reasoning).len(), 3);

    // 恢复后循环继续工作
    h.backend.clear_failures();
    control_loop.submit_observation(observation("again")).await.unwrap();
    run_cycle(&control_loop).await;
    assert_eq!(control_loop.status().cycle_count, 1);
    assert!(control_loop.context().await.metadata.errors.len() >= 3);
}

#[tokio::test]
async fn test_auto_heal_disabled_stops_loop() {
    let backend = ScriptedInference::new();
    backend.fail_always(Operation::Planning, InferenceError::Transport("down".into()));
    let h = Harness::new(backend);
    let mut cfg = manual_config();
    cfg.recovery.enable_auto_healing = false;
    let control_loop = h.start(cfg).await;

    control_loop.submit_observation(observation("hello")).await.unwrap();
    control_loop.tick().await.unwrap();
    control_loop.tick().await.unwrap();
    assert_eq!(control_loop.tick().await.unwrap(), TickOutcome::Stopped);

    assert_eq!(control_loop.status().current_phase, Phase::Stopped);
    assert_eq!(
        control_loop.stop_reason().await,
        Some(CycleError::MaxConsecutiveErrorsExceeded { count: 3 })
    );
    let errors = control_loop.context().await.metadata.errors;
    assert_eq!(errors.len(), 4);
    assert!(errors[0].starts_with("plan:"));

    assert!(h.registry.get(AGENT, CHANNEL).await.is_none());
    assert_eq!(control_loop.tick().await, Err(CycleError::LoopStopped));
    let replacement = h.start(manual_config()).await;
    assert_ne!(replacement.id(), control_loop.id());
}

#[tokio::test]
async fn test_schema_failure_is_not_retried() {
    let backend = ScriptedInference::new();
    backend.fail_next(Operation::Reasoning, InferenceError::SchemaValidation("bad".into()));
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("hello")).await.unwrap();
    control_loop.tick().await.unwrap();
    assert_eq!(control_loop.tick().await.unwrap(), TickOutcome::Healed);
    assert_eq!(h.backend.models_for(Operation::Reasoning).len(), 1);
}

#[tokio::test]
async fn test_malformed_output_is_schema_failure() {
    let backend = ScriptedInference::new().with_output(Operation::Reflection, json!({"insights": []}));
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("hello")).await.unwrap();
    assert_eq!(run_cycle(&control_loop).await, TickOutcome::Healed);
    assert_eq!(h.backend.models_for(Operation::Reflection).len(), 1);
    assert_eq!(control_loop.status().cycle_count, 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_deregisters() {
    let h = Harness::new(ScriptedInference::new());
    let control_loop = h.start(manual_config()).await;
    control_loop.submit_observation(observation("pending")).await.unwrap();

    assert!(control_loop.stop().await);
    assert!(!control_loop.stop().await);
    let status = control_loop.status();
    assert_eq!(status.current_phase, Phase::Stopped);
    assert_eq!(status.pending_observations, 0);
    assert!(h.registry.is_empty().await);

    let err = h.registry.deliver(AGENT, CHANNEL, observation("late")).await.unwrap_err();
    assert!(matches!(err, CycleError::LoopNotFound { .. }));
}

#[tokio::test]
async fn test_shared_context_resets_unless_carried_forward() {
    let h = Harness::new(ScriptedInference::new());
    let reset_loop = h.start(manual_config()).await;
    reset_loop.submit_observation(observation("one")).await.unwrap();
    run_cycle(&reset_loop).await;
    assert!(reset_loop.context().await.shared_context.insights.is_empty());

    let mut cfg = LoopConfig::new(AGENT, "chan-carry");
    cfg.auto_run = false;
    cfg.carry_forward_shared_context = true;
    let carry_loop = h.start(cfg).await;
    carry_loop.submit_observation(observation("two")).await.unwrap();
    run_cycle(&carry_loop).await;
    let shared = carry_loop.context().await.shared_context;
    assert_eq!(shared.insights, vec!["status requests are cheap".to_string()]);
}

#[tokio::test]
async fn test_parallel_plan_execution() {
    let backend = ScriptedInference::new().with_output(
        Operation::Planning,
        json!({
            "goal": "fan out",
            "actions": [
                {"id": "fetch-a", "description": "a", "action": "fetch", "priority": 1},
                {"id": "fetch-b", "description": "b", "action": "fetch", "priority": 1},
                {"id": "merge", "description": "merge", "action": "merge", "priority": 2,
                 "dependencies": ["fetch-a", "fetch-b"]}
            ]
        }),
    );
    let h = Harness::new(backend);
    let mut cfg = manual_config();
    cfg.execution_mode = ExecutionMode::Parallel;
    let control_loop = h.start(cfg).await;

    control_loop.submit_observation(observation("go")).await.unwrap();
    run_cycle(&control_loop).await;
    assert_eq!(h.backend.models_for(Operation::Action).len(), 3);

    h.wait_for_learner(1).await;
    let cycle = &h.learner.cycles()[0];
    let executed = cycle
        .phase_sequence
        .iter()
        .find_map(|r| match r {
            PhaseResult::Action(plan) => Some(plan.clone()),
            _ => None,
        })
        .unwrap();
    assert!(executed.actions.iter().all(|a| a.status == ActionStatus::Completed));
}

#[tokio::test]
async fn test_action_timeout_is_retried_then_escalates() {
    let backend = ScriptedInference::new();
    backend.fail_always(Operation::Action, InferenceError::Timeout);
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("go")).await.unwrap();
    for _ in 0..3 {
        control_loop.tick().await.unwrap();
    }
    assert_eq!(control_loop.status().current_phase, Phase::Act);
    assert_eq!(control_loop.tick().await.unwrap(), TickOutcome::Healed);

    assert_eq!(h.backend.models_for(Operation::Action).len(), 3);
    let status = control_loop.status();
    assert_eq!(status.current_phase, Phase::Observe);
    assert_eq!(status.cycle_count, 0);
    let errors = control_loop.context().await.metadata.errors;
    assert_eq!(errors.iter().filter(|e| e.starts_with("act:")).count(), 3);
}

#[tokio::test]
async fn test_action_timeout_recovers_on_retry() {
    let backend = ScriptedInference::new();
    backend.fail_next(Operation::Action, InferenceError::Timeout);
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("go")).await.unwrap();
    let last = run_cycle(&control_loop).await;
    assert_eq!(last, TickOutcome::CycleCompleted { cycle_count: 1 });
    // collect 超时一次后重试成功，再执行 respond
    assert_eq!(h.backend.models_for(Operation::Action).len(), 3);
    let errors = control_loop.context().await.metadata.errors;
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("act:"));

    h.wait_for_learner(1).await;
    let plan = h.learner.cycles()[0]
        .phase_sequence
        .iter()
        .find_map(|r| match r {
            PhaseResult::Action(plan) => Some(plan.clone()),
            _ => None,
        })
        .unwrap();
    assert!(plan.actions.iter().all(|a| a.status == ActionStatus::Completed));
}

#[tokio::test]
async fn test_malformed_action_output_feeds_reflection() {
    let backend = ScriptedInference::new();
    backend.fail_next(Operation::Action, InferenceError::SchemaValidation("no result".into()));
    let h = Harness::new(backend);
    let control_loop = h.start(manual_config()).await;

    control_loop.submit_observation(observation("go")).await.unwrap();
    let last = run_cycle(&control_loop).await;
    assert_eq!(last, TickOutcome::CycleCompleted { cycle_count: 1 });
    // respond 依赖 collect，collect 失败后 respond 被跳过
    assert_eq!(h.backend.models_for(Operation::Action).len(), 1);

    h.wait_for_learner(1).await;
    let plan = h.learner.cycles()[0]
        .phase_sequence
        .iter()
        .find_map(|r| match r {
            PhaseResult::Action(plan) => Some(plan.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(plan.actions[0].status, ActionStatus::Failed);
    assert_eq!(plan.actions[1].status, ActionStatus::Skipped);
}

#[tokio::test]
async fn test_reflection_insights_reach_next_reasoning() {
    let backend = Arc::new(ScriptedInference::new());
    let deps = LoopDependencies::new(backend.clone(), models())
        .with_memory(Arc::new(InMemoryPhaseMemory::default()));
    let registry = ControlLoopRegistry::new(deps);
    let control_loop = registry.start(manual_config()).await;

    control_loop.submit_observation(observation("status requests")).await.unwrap();
    run_cycle(&control_loop).await;
    control_loop.submit_observation(observation("more status requests")).await.unwrap();
    run_cycle(&control_loop).await;

    let prompts = backend.prompts_for(Operation::Reasoning);
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[0]["memories"], json!([]));
    let memories = prompts[1]["memories"].as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0]["content"], json!("status requests are cheap"));
}

#[tokio::test]
async fn test_queue_overflow_drops_oldest() {
    let h = Harness::new(ScriptedInference::new());
    let mut cfg = manual_config();
    cfg.max_observations = 2;
    let control_loop = h.start(cfg).await;

    for i in 0..4 {
        control_loop.submit_observation(observation(&format!("obs {i}"))).await.unwrap();
    }
    let status = control_loop.status();
    assert_eq!(status.pending_observations, 2);
    assert_eq!(status.dropped_observations, 2);

    control_loop.tick().await.unwrap();
    let ctx = control_loop.context().await;
    let drained = ctx.previous_phase_results.observation.unwrap();
    let contents: Vec<_> = drained.iter().map(|o| o.content.clone()).collect();
    assert_eq!(contents, vec![json!("obs 2"), json!("obs 3")]);
}

#[tokio::test]
async fn test_driver_runs_cycle_on_its_own() {
    let h = Harness::new(ScriptedInference::new());
    let mut cfg = LoopConfig::new(AGENT, CHANNEL);
    cfg.cycle_interval_ms = 100;
    cfg.batch_threshold = Some(1);
    let control_loop = h.start(cfg).await;
    let mut status_rx = control_loop.watch_status();

    control_loop.submit_observation(observation("auto")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), status_rx.wait_for(|s| s.cycle_count >= 1))
        .await
        .expect("cycle did not complete in time")
        .unwrap();

    assert_eq!(h.registry.shutdown().await, 1);
    assert!(control_loop.is_stopped());
}
