//! 控制循环调度器：驱动单个 (agent, channel) 的 ORPAR 周期
//!
//! - 每次 tick 最多推进一个阶段；OBSERVE 且队列为空时 tick 为空操作
//! - REASON / PLAN / ACT / REFLECT 各发起一次协作方调用，调用期间状态机拒绝任何转移
//! - 协作方失败交给 ErrorRecoveryManager：Retry 时退避后以同一阶段重新选模、重新调用；
//!   Escalate 时进入 ERROR，再自愈回 OBSERVE 或停止
//! - stop() 先取消进行中的调用，再强制进入 STOPPED、关闭队列并从注册表注销

use std::sync::{Arc, Weak};
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::{
    ActionPool, CollaboratorError, CoreSnapshot, CycleError, ErrorRecoveryManager,
    EscalationReason, ExecutionMode, LoopId, LoopKey, LoopStatus, LoopSupervisor, Operation,
    Phase, PhaseStateMachine, PhaseTransition, RecoveryConfig, RecoveryDecision,
};
use crate::cycle::context::{CycleContext, CycleContextStore, SharedContext};
use crate::cycle::events::{EventSink, LoopEvent, NoopEventSink};
use crate::cycle::plan::{execute_plan, InferenceActionRunner};
use crate::cycle::queue::{ObservationQueue, SubmitOutcome};
use crate::cycle::registry::ControlLoopRegistry;
use crate::cycle::types::{
    new_id, now_ms, Metadata, Observation, PhaseResult, Plan, PlanDraft, PlanStatus, Reasoning,
    ReasoningOutput, Reflection, ReflectionOutput,
};
use crate::learning::{CompletedCycle, CycleOutcome, NoopLearner, PatternLearner};
use crate::llm::schema::{decode, schema_of};
use crate::llm::{
    call_with_deadline, ComplexityInput, InferenceBackend, InferenceRequest, ModelSelector,
    ModelTable, SelectionStrategy,
};
use crate::memory::{MemoryEntry, NoopMemory, PhaseMemory};

/// tick 间隔下限
pub const MIN_CYCLE_INTERVAL_MS: u64 = 100;

fn default_cycle_interval_ms() -> u64 {
    1000
}

fn default_max_observations() -> usize {
    100
}

fn default_max_parallel_actions() -> usize {
    3
}

fn default_call_deadline_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// 单个控制循环的配置（创建后不可变）
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoopConfig {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub channel_id: String,
    /// tick 间隔（毫秒），不低于 100
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// 观察队列容量
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    /// 队列达到该长度时立即唤醒调度器，不等下一个 tick
    #[serde(default)]
    pub batch_threshold: Option<usize>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_max_parallel_actions")]
    pub max_parallel_actions: usize,
    /// 周期结束后是否保留共享上下文（否则恢复为 initial_shared_context）
    #[serde(default)]
    pub carry_forward_shared_context: bool,
    #[serde(default)]
    pub initial_shared_context: SharedContext,
    /// 单次协作方调用的截止时间
    #[serde(default = "default_call_deadline_ms")]
    pub call_deadline_ms: u64,
    /// 由注册表启动时是否自动运行定时驱动
    #[serde(default = "default_true")]
    pub auto_run: bool,
    /// 记忆读写的 scope，缺省为 agent_id
    #[serde(default)]
    pub memory_scope: Option<String>,
}

impl LoopConfig {
    pub fn new(agent_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> LoopKey {
        LoopKey::new(self.agent_id.clone(), self.channel_id.clone())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(MIN_CYCLE_INTERVAL_MS))
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms.max(1))
    }

    pub fn memory_scope(&self) -> &str {
        self.memory_scope.as_deref().unwrap_or(&self.agent_id)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            channel_id: String::new(),
            cycle_interval_ms: default_cycle_interval_ms(),
            max_observations: default_max_observations(),
            batch_threshold: None,
            recovery: RecoveryConfig::default(),
            strategy: SelectionStrategy::default(),
            execution_mode: ExecutionMode::default(),
            max_parallel_actions: default_max_parallel_actions(),
            carry_forward_shared_context: false,
            initial_shared_context: SharedContext::default(),
            call_deadline_ms: default_call_deadline_ms(),
            auto_run: true,
            memory_scope: None,
        }
    }
}

/// 控制循环依赖的外部协作方
#[derive(Clone)]
pub struct LoopDependencies {
    pub backend: Arc<dyn InferenceBackend>,
    pub learner: Arc<dyn PatternLearner>,
    pub memory: Arc<dyn PhaseMemory>,
    pub events: Arc<dyn EventSink>,
    pub models: Arc<ModelTable>,
}

impl LoopDependencies {
    /// 仅推理后端与模型表；学习、记忆、事件使用空实现
    pub fn new(backend: Arc<dyn InferenceBackend>, models: ModelTable) -> Self {
        Self {
            backend,
            learner: Arc::new(NoopLearner),
            memory: Arc::new(NoopMemory),
            events: Arc::new(NoopEventSink),
            models: Arc::new(models),
        }
    }

    pub fn with_learner(mut self, learner: Arc<dyn PatternLearner>) -> Self {
        self.learner = learner;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn PhaseMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

/// 一次 tick 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// 没有可做的事（OBSERVE 且队列为空）
    Idle,
    Advanced { from: Phase, to: Phase },
    /// REFLECT → OBSERVE，周期完成
    CycleCompleted { cycle_count: u64 },
    /// 升级后自愈回到 OBSERVE
    Healed,
    Stopped,
}

/// 阶段调用的产物
enum PhaseArtifact {
    Reasoning(Reasoning, Option<f64>),
    Plan(Plan),
    Action(Plan),
    Reflection(Reflection, Option<f64>),
}

/// 由循环独占修改的内部状态
struct LoopCore {
    machine: PhaseStateMachine,
    store: CycleContextStore,
    recovery: ErrorRecoveryManager,
    /// 循环自行停止时的原因
    stop_reason: Option<CycleError>,
    /// ACT 重试时接着执行的计划（保留已完成的动作）
    act_progress: Option<Plan>,
}

/// 单个 (agent, channel) 的控制循环
pub struct ControlLoop {
    id: LoopId,
    key: LoopKey,
    config: LoopConfig,
    deps: LoopDependencies,
    core: Mutex<LoopCore>,
    queue: ObservationQueue,
    supervisor: LoopSupervisor,
    pool: ActionPool,
    status_tx: watch::Sender<LoopStatus>,
    wake: Notify,
    registry: Weak<ControlLoopRegistry>,
}

impl ControlLoop {
    /// 创建循环并进入 OBSERVE；registry 为空 Weak 时停止后不注销
    pub fn new(
        config: LoopConfig,
        deps: LoopDependencies,
        registry: Weak<ControlLoopRegistry>,
    ) -> Arc<Self> {
        let id = new_id("loop");
        let key = config.key();
        let mut machine = PhaseStateMachine::new();
        let mut store = CycleContextStore::new(
            &config.agent_id,
            &config.channel_id,
            config.initial_shared_context.clone(),
        );

        // IDLE → OBSERVE 总是合法
        let started = machine.transition(Phase::Observe).ok();
        store.set_phase(machine.phase());
        let cycle_id = store.cycle_id().to_string();

        let core = LoopCore {
            machine,
            store,
            recovery: ErrorRecoveryManager::new(config.recovery.clone()),
            stop_reason: None,
            act_progress: None,
        };
        let mut status = LoopStatus::initial(id.clone(), &key);
        status.current_phase = core.machine.phase();
        let (status_tx, _) = watch::channel(status);

        let this = Arc::new(Self {
            queue: ObservationQueue::new(config.max_observations),
            pool: ActionPool::new(config.execution_mode, config.max_parallel_actions),
            supervisor: LoopSupervisor::new(),
            status_tx,
            wake: Notify::new(),
            id,
            key,
            config,
            deps,
            core: Mutex::new(core),
            registry,
        });

        if let Some(t) = started {
            this.publish_transition(&t, &cycle_id);
        }
        tracing::info!(loop_id = %this.id, key = %this.key, "control loop started");
        this
    }

    /// 不挂在注册表上的独立循环
    pub fn standalone(config: LoopConfig, deps: LoopDependencies) -> Arc<Self> {
        Self::new(config, deps, Weak::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &LoopKey {
        &self.key
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// 已开始停止（取消已触发）
    pub fn is_stopped(&self) -> bool {
        self.supervisor.is_cancelled()
    }

    pub fn status(&self) -> LoopStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }

    /// 当前周期上下文的副本
    pub async fn context(&self) -> CycleContext {
        self.core.lock().await.store.snapshot()
    }

    /// 循环自行停止时的原因（手动 stop 为 None）
    pub async fn stop_reason(&self) -> Option<CycleError> {
        self.core.lock().await.stop_reason.clone()
    }

    /// 提交观察；队列满时丢弃最旧一条并发布 ObservationDropped
    pub async fn submit_observation(&self, observation: Observation) -> Result<SubmitOutcome, CycleError> {
        if self.supervisor.is_cancelled() {
            return Err(CycleError::LoopStopped);
        }
        let outcome = self.queue.submit(observation).await?;
        if let SubmitOutcome::DroppedOldest { dropped, .. } = &outcome {
            self.deps.events.publish(LoopEvent::ObservationDropped {
                loop_id: self.id.clone(),
                observation_id: dropped.id.clone(),
                dropped_total: self.queue.dropped_count(),
                timestamp: now_ms(),
            });
        }
        self.refresh_queue_stats();

        if let Some(threshold) = self.config.batch_threshold {
            if outcome.queued() >= threshold {
                self.wake.notify_one();
            }
        }
        Ok(outcome)
    }

    /// 推进至多一个阶段
    pub async fn tick(&self) -> Result<TickOutcome, CycleError> {
        if self.supervisor.is_cancelled() {
            return Err(CycleError::LoopStopped);
        }
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let result = match core.machine.phase() {
            Phase::Stopped => Err(CycleError::LoopStopped),
            Phase::Idle | Phase::Error => self
                .advance(core, Phase::Observe)
                .map(|t| TickOutcome::Advanced { from: t.from, to: t.to }),
            Phase::Observe => self.observe(core).await,
            phase => self.run_phase(core, phase).await,
        };

        self.publish_status(core);
        let self_stopped = core.machine.is_stopped() && core.stop_reason.is_some();
        drop(guard);

        if self_stopped {
            self.teardown().await;
        }
        result
    }

    /// 停止循环：取消进行中的调用，强制 STOPPED，关闭队列并注销。
    /// 返回 true 表示本次调用完成了停止（重复调用返回 false）
    pub async fn stop(&self) -> bool {
        self.supervisor.cancel();
        let mut guard = self.core.lock().await;
        let core = &mut *guard;
        let transition = core.machine.force_stop();
        if let Some(t) = &transition {
            core.store.set_phase(Phase::Stopped);
            self.publish_transition(t, core.store.cycle_id());
            self.deps.events.publish(LoopEvent::Stopped {
                loop_id: self.id.clone(),
                reason: "stop requested".to_string(),
                timestamp: now_ms(),
            });
            tracing::info!(loop_id = %self.id, key = %self.key, from = %t.from, "control loop stopped");
        }
        core.recovery.forget(&self.id);
        self.publish_status(core);
        drop(guard);

        self.teardown().await;
        transition.is_some()
    }

    /// 启动定时驱动：每个间隔 tick 一次，达到 batch_threshold 时立即唤醒
    pub fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let token = this.supervisor.cancel_token();
            let mut interval = tokio::time::interval(this.config.cycle_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = this.wake.notified() => {}
                }
                match this.tick().await {
                    Ok(TickOutcome::Stopped) | Err(CycleError::LoopStopped) => break,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(loop_id = %this.id, error = %e, "tick failed"),
                }
            }
            tracing::debug!(loop_id = %this.id, "driver exited");
        })
    }

    // ---- phases ----

    async fn observe(&self, core: &mut LoopCore) -> Result<TickOutcome, CycleError> {
        let batch = self.queue.drain(self.queue.capacity()).await;
        self.refresh_queue_stats();
        if batch.is_empty() {
            return Ok(TickOutcome::Idle);
        }
        tracing::debug!(loop_id = %self.id, count = batch.len(), "observations drained");
        core.store.mark_cycle_start();
        core.store.record_phase_result(PhaseResult::Observation(batch));
        let t = self.advance(core, Phase::Reason)?;
        Ok(TickOutcome::Advanced { from: t.from, to: t.to })
    }

    /// 执行一个需要协作方调用的阶段；失败时按恢复决策重试或升级
    async fn run_phase(&self, core: &mut LoopCore, phase: Phase) -> Result<TickOutcome, CycleError> {
        let Some(operation) = phase.operation() else {
            return Ok(TickOutcome::Idle);
        };

        loop {
            let choice = {
                let input = ComplexityInput {
                    context: core.store.context(),
                    consecutive_errors: core.recovery.consecutive_errors(&self.id),
                    now_ms: now_ms(),
                };
                ModelSelector::select(operation, &self.config.strategy, &input, &self.deps.models)?
            };
            tracing::debug!(
                loop_id = %self.id,
                %phase,
                model = %choice.model,
                tier = ?choice.tier,
                score = ?choice.complexity.map(|c| c.score),
                "model selected"
            );
            core.store.record_model_usage(phase, &choice.model);

            core.machine.begin_call();
            let token = self.supervisor.child_token();
            let result = self
                .call_phase(
                    phase,
                    &choice.model,
                    core.store.context(),
                    &mut core.act_progress,
                    token,
                )
                .await;
            core.machine.end_call();

            let err = match result {
                Ok(artifact) => {
                    core.recovery.on_success(&self.id);
                    return self.fold(core, artifact);
                }
                Err(err) => err,
            };

            if self.supervisor.is_cancelled() {
                return Ok(TickOutcome::Stopped);
            }

            core.store.record_error(format!("{phase}: {err}"));
            self.deps.events.publish(LoopEvent::error(&self.id, phase, err.to_string()));

            match core.recovery.on_failure(&self.id, &err) {
                RecoveryDecision::Retry(delay) => {
                    self.publish_status(core);
                    if !self.supervisor.sleep(delay).await {
                        return Ok(TickOutcome::Stopped);
                    }
                }
                RecoveryDecision::Escalate(reason) => {
                    return self.escalate(core, reason, err);
                }
            }
        }
    }

    async fn call_phase(
        &self,
        phase: Phase,
        model: &str,
        ctx: &CycleContext,
        act_progress: &mut Option<Plan>,
        cancel: CancellationToken,
    ) -> Result<PhaseArtifact, CollaboratorError> {
        let results = &ctx.previous_phase_results;
        match phase {
            Phase::Reason => {
                let observations = results.observation.clone().unwrap_or_default();
                let query = observations
                    .iter()
                    .map(|o| match &o.content {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                let memories = self
                    .deps
                    .memory
                    .read(self.config.memory_scope(), Phase::Reflect, &query)
                    .await?;
                let out: ReasoningOutput = self
                    .infer(
                        Operation::Reasoning,
                        model,
                        json!({
                            "observations": observations,
                            "memories": memories,
                            "shared_context": ctx.shared_context,
                        }),
                        cancel,
                    )
                    .await?;
                let reasoning = Reasoning {
                    id: new_id("reasoning"),
                    agent_id: self.config.agent_id.clone(),
                    content: out.content,
                    timestamp: now_ms(),
                    metadata: Metadata::new(),
                };
                Ok(PhaseArtifact::Reasoning(reasoning, out.confidence))
            }
            Phase::Plan => {
                let reasoning_id = results
                    .reasoning
                    .as_ref()
                    .map(|r| r.id.clone())
                    .unwrap_or_default();
                let draft: PlanDraft = self
                    .infer(
                        Operation::Planning,
                        model,
                        json!({
                            "reasoning": results.reasoning,
                            "shared_context": ctx.shared_context,
                        }),
                        cancel,
                    )
                    .await?;
                let plan = Plan::from_draft(&self.config.agent_id, &reasoning_id, draft).map_err(
                    |e| match e {
                        CycleError::InvalidPlan(msg) => CollaboratorError::SchemaValidation(msg),
                        other => CollaboratorError::SchemaValidation(other.to_string()),
                    },
                )?;
                Ok(PhaseArtifact::Plan(plan))
            }
            Phase::Act => {
                let Some(planned) = results.planning.as_ref() else {
                    return Err(CollaboratorError::SchemaValidation(
                        "no plan recorded for this cycle".to_string(),
                    ));
                };
                let mut plan = match act_progress.take() {
                    Some(p) if p.id == planned.id => p,
                    _ => planned.clone(),
                };
                let runner = InferenceActionRunner::new(
                    self.deps.backend.clone(),
                    model,
                    self.config.call_deadline(),
                    json!({ "goal": plan.goal, "shared_context": ctx.shared_context }),
                );
                let status = match execute_plan(&mut plan, &runner, &self.pool, &cancel).await {
                    Ok(status) => status,
                    Err(err) => {
                        *act_progress = Some(plan);
                        return Err(err);
                    }
                };
                if status == PlanStatus::Aborted && cancel.is_cancelled() {
                    return Err(CollaboratorError::Cancelled);
                }
                Ok(PhaseArtifact::Action(plan))
            }
            Phase::Reflect => {
                let plan = results.action.as_ref().or(results.planning.as_ref());
                let out: ReflectionOutput = self
                    .infer(
                        Operation::Reflection,
                        model,
                        json!({
                            "reasoning": results.reasoning,
                            "plan": plan,
                            "shared_context": ctx.shared_context,
                        }),
                        cancel,
                    )
                    .await?;
                let reflection = Reflection {
                    id: new_id("reflection"),
                    agent_id: self.config.agent_id.clone(),
                    plan_id: plan.map(|p| p.id.clone()).unwrap_or_default(),
                    success: out.success,
                    insights: out.insights,
                    improvements: out.improvements,
                    metadata: Metadata::new(),
                    timestamp: now_ms(),
                };
                if !reflection.insights.is_empty() {
                    self.deps
                        .memory
                        .write(
                            self.config.memory_scope(),
                            Phase::Reflect,
                            MemoryEntry::new(reflection.insights.join(" ")),
                        )
                        .await?;
                }
                Ok(PhaseArtifact::Reflection(reflection, out.confidence))
            }
            other => Err(CollaboratorError::SchemaValidation(format!(
                "phase {other} has no collaborator call"
            ))),
        }
    }

    async fn infer<T: DeserializeOwned + JsonSchema>(
        &self,
        operation: Operation,
        model: &str,
        prompt_context: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<T, CollaboratorError> {
        let request = InferenceRequest {
            operation,
            model: model.to_string(),
            prompt_context,
            schema: schema_of::<T>(),
            deadline: self.config.call_deadline(),
        };
        let value = call_with_deadline(self.deps.backend.as_ref(), request, cancel).await?;
        decode(value)
    }

    /// 写入阶段产物并转到下一阶段
    fn fold(&self, core: &mut LoopCore, artifact: PhaseArtifact) -> Result<TickOutcome, CycleError> {
        match artifact {
            PhaseArtifact::Reasoning(reasoning, confidence) => {
                if let Some(c) = confidence {
                    core.store.shared_mut().set_confidence(c);
                }
                core.store.record_phase_result(PhaseResult::Reasoning(reasoning));
                let t = self.advance(core, Phase::Plan)?;
                Ok(TickOutcome::Advanced { from: t.from, to: t.to })
            }
            PhaseArtifact::Plan(plan) => {
                tracing::debug!(loop_id = %self.id, plan_id = %plan.id, actions = plan.actions.len(), "plan created");
                core.store.record_phase_result(PhaseResult::Planning(plan));
                let t = self.advance(core, Phase::Act)?;
                Ok(TickOutcome::Advanced { from: t.from, to: t.to })
            }
            PhaseArtifact::Action(plan) => {
                if plan.status != PlanStatus::Completed {
                    tracing::warn!(loop_id = %self.id, plan_id = %plan.id, status = ?plan.status, "plan did not complete");
                }
                core.store.record_phase_result(PhaseResult::Action(plan));
                let t = self.advance(core, Phase::Reflect)?;
                Ok(TickOutcome::Advanced { from: t.from, to: t.to })
            }
            PhaseArtifact::Reflection(reflection, confidence) => {
                let success = reflection.success;
                if let Some(c) = confidence {
                    core.store.shared_mut().set_confidence(c);
                }
                core.store.shared_mut().add_insights(reflection.insights.clone());
                core.store.record_phase_result(PhaseResult::Reflection(reflection));
                self.advance(core, Phase::Observe)?;
                let cycle_count = self.complete_cycle(core, success);
                Ok(TickOutcome::CycleCompleted { cycle_count })
            }
        }
    }

    /// REFLECT → OBSERVE 之后：交给模式学习（不等待），发布事件，重置周期上下文
    fn complete_cycle(&self, core: &mut LoopCore, success: bool) -> u64 {
        let ctx = core.store.context();
        let duration_ms = now_ms() - ctx.metadata.start_time;
        let cycle_count = core.machine.cycle_count();
        let completed = CompletedCycle {
            agent_id: ctx.agent_id.clone(),
            channel_id: ctx.channel_id.clone(),
            cycle_id: ctx.cycle_id.clone(),
            phase_sequence: ctx.previous_phase_results.sequence(),
            outcome: CycleOutcome { success, duration_ms },
        };

        self.deps.events.publish(LoopEvent::CycleCompleted {
            loop_id: self.id.clone(),
            cycle_id: completed.cycle_id.clone(),
            cycle_count,
            success,
            duration_ms,
            timestamp: now_ms(),
        });
        tracing::info!(loop_id = %self.id, cycle_id = %completed.cycle_id, cycle_count, success, duration_ms, "cycle completed");

        let learner = self.deps.learner.clone();
        let loop_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = learner.record_completed_cycle(completed).await {
                tracing::warn!(loop_id = %loop_id, error = %e, "pattern learner failed");
            }
        });

        core.store.begin_next_cycle(self.config.carry_forward_shared_context);
        cycle_count
    }

    fn escalate(
        &self,
        core: &mut LoopCore,
        reason: EscalationReason,
        last_error: CollaboratorError,
    ) -> Result<TickOutcome, CycleError> {
        let consecutive = core.recovery.consecutive_errors(&self.id);
        let cycle_id = core.store.cycle_id().to_string();
        core.act_progress = None;
        let outcome = core.recovery.escalate(&self.id, &mut core.machine, reason)?;
        for t in &outcome.transitions {
            core.store.set_phase(t.to);
            self.publish_transition(t, &cycle_id);
        }

        if outcome.healed {
            core.store.record_error(format!("auto-healed after {reason}"));
            core.store.begin_next_cycle(self.config.carry_forward_shared_context);
            self.deps.events.publish(LoopEvent::AutoHeal {
                loop_id: self.id.clone(),
                reason: reason.to_string(),
                timestamp: now_ms(),
            });
            return Ok(TickOutcome::Healed);
        }

        let stop_reason = match reason {
            EscalationReason::MaxConsecutiveErrors => {
                CycleError::MaxConsecutiveErrorsExceeded { count: consecutive }
            }
            _ => CycleError::Collaborator(last_error),
        };
        core.store.record_error(format!("stopped: {stop_reason}"));
        self.deps.events.publish(LoopEvent::Stopped {
            loop_id: self.id.clone(),
            reason: stop_reason.to_string(),
            timestamp: now_ms(),
        });
        tracing::warn!(loop_id = %self.id, key = %self.key, reason = %stop_reason, "control loop stopped after escalation");
        core.stop_reason = Some(stop_reason);
        Ok(TickOutcome::Stopped)
    }

    // ---- helpers ----

    fn advance(&self, core: &mut LoopCore, to: Phase) -> Result<PhaseTransition, CycleError> {
        let cycle_id = core.store.cycle_id().to_string();
        let t = core.machine.transition(to)?;
        core.store.set_phase(t.to);
        self.publish_transition(&t, &cycle_id);
        Ok(t)
    }

    fn publish_transition(&self, t: &PhaseTransition, cycle_id: &str) {
        self.deps
            .events
            .publish(LoopEvent::phase_transition(&self.id, t.from, t.to, cycle_id));
    }

    fn publish_status(&self, core: &LoopCore) {
        let snapshot = CoreSnapshot {
            phase: core.machine.phase(),
            cycle_count: core.machine.cycle_count(),
            consecutive_errors: core.recovery.consecutive_errors(&self.id),
        };
        self.status_tx.send_modify(|status| {
            *status = snapshot.project(status, self.queue.dropped_count(), self.queue.len());
        });
    }

    fn refresh_queue_stats(&self) {
        self.status_tx.send_modify(|status| {
            status.dropped_observations = self.queue.dropped_count();
            status.pending_observations = self.queue.len();
        });
    }

    /// 取消、关闭队列并从注册表注销；可重复调用
    async fn teardown(&self) {
        self.supervisor.cancel();
        self.queue.close().await;
        self.refresh_queue_stats();
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.key, &self.id).await;
        }
    }
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &*self.status_tx.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::events::BroadcastEventBus;
    use crate::cycle::types::ObservationSource;
    use crate::llm::{ComplexityTier, InferenceError, ScriptedInference};

    fn models() -> ModelTable {
        ModelTable::new("acme")
            .with_tier("acme", ComplexityTier::Simple, "acme-mini")
            .with_tier("acme", ComplexityTier::Moderate, "acme-pro")
            .with_tier("acme", ComplexityTier::Complex, "acme-max")
    }

    fn config() -> LoopConfig {
        let mut cfg = LoopConfig::new("agent-1", "chan-1");
        cfg.auto_run = false;
        cfg.recovery.retry_delay_ms = 1;
        cfg
    }

    fn standalone(backend: Arc<ScriptedInference>) -> Arc<ControlLoop> {
        ControlLoop::standalone(config(), LoopDependencies::new(backend, models()))
    }

    async fn run_cycle(cl: &ControlLoop) {
        for _ in 0..5 {
            cl.tick().await.unwrap();
        }
    }

    #[test]
    fn test_loop_config_defaults() {
        let cfg: LoopConfig = serde_json::from_value(json!({"agent_id": "a", "channel_id": "c"})).unwrap();
        assert_eq!(cfg.cycle_interval_ms, 1000);
        assert_eq!(cfg.max_observations, 100);
        assert_eq!(cfg.call_deadline_ms, 30_000);
        assert_eq!(cfg.max_parallel_actions, 3);
        assert!(!cfg.carry_forward_shared_context);
        assert!(cfg.auto_run);
        assert_eq!(cfg.memory_scope(), "a");
    }

    #[test]
    fn test_interval_floor() {
        let mut cfg = LoopConfig::new("a", "c");
        cfg.cycle_interval_ms = 5;
        assert_eq!(cfg.cycle_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_starts_in_observe_and_idles_without_input() {
        let cl = standalone(Arc::new(ScriptedInference::new()));
        assert_eq!(cl.status().current_phase, Phase::Observe);
        assert_eq!(cl.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(cl.status().cycle_count, 0);
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let backend = Arc::new(ScriptedInference::new());
        let cl = standalone(backend.clone());
        cl.submit_observation(Observation::new("agent-1", ObservationSource::User, "status?"))
            .await
            .unwrap();
        run_cycle(&cl).await;

        let status = cl.status();
        assert_eq!(status.current_phase, Phase::Observe);
        assert_eq!(status.cycle_count, 1);
        // 两个动作各一次 action 调用
        assert_eq!(backend.models_for(Operation::Action).len(), 2);
        let ctx = cl.context().await;
        assert!(ctx.previous_phase_results.is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_transitions() {
        let bus = Arc::new(BroadcastEventBus::new(64));
        let mut rx = bus.subscribe();
        let deps = LoopDependencies::new(Arc::new(ScriptedInference::new()), models()).with_events(bus.clone());
        let cl = ControlLoop::standalone(config(), deps);
        cl.submit_observation(Observation::new("agent-1", ObservationSource::User, "hi"))
            .await
            .unwrap();
        run_cycle(&cl).await;

        let mut transitions = Vec::new();
        let mut completed = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                LoopEvent::PhaseTransition { to, .. } => transitions.push(to),
                LoopEvent::CycleCompleted { .. } => completed += 1,
                _ => {}
            }
        }
        assert_eq!(
            transitions,
            vec![
                Phase::Observe,
                Phase::Reason,
                Phase::Plan,
                Phase::Act,
                Phase::Reflect,
                Phase::Observe
            ]
        );
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_retry_stays_in_phase() {
        let backend = Arc::new(ScriptedInference::new());
        backend.fail_next(Operation::Reasoning, InferenceError::Transport("reset".into()));
        let cl = standalone(backend.clone());
        cl.submit_observation(Observation::new("agent-1", ObservationSource::User, "hi"))
            .await
            .unwrap();
        cl.tick().await.unwrap();
        let outcome = cl.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Advanced { from: Phase::Reason, to: Phase::Plan });
        assert_eq!(backend.models_for(Operation::Reasoning).len(), 2);
        assert_eq!(cl.status().consecutive_errors, 0);
        assert_eq!(cl.context().await.metadata.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_plan_escalates_without_retry() {
        let backend = Arc::new(ScriptedInference::new().with_output(
            Operation::Planning,
            json!({
                "goal": "loop",
                "actions": [
                    {"id": "a", "description": "a", "action": "a", "dependencies": ["b"]},
                    {"id": "b", "description": "b", "action": "b", "dependencies": ["a"]}
                ]
            }),
        ));
        let cl = standalone(backend.clone());
        cl.submit_observation(Observation::new("agent-1", ObservationSource::User, "hi"))
            .await
            .unwrap();
        cl.tick().await.unwrap();
        cl.tick().await.unwrap();
        let outcome = cl.tick().await.unwrap();
        assert_eq!(outcome, TickOutcome::Healed);
        assert_eq!(backend.models_for(Operation::Planning).len(), 1);
        assert_eq!(cl.status().current_phase, Phase::Observe);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cl = standalone(Arc::new(ScriptedInference::new()));
        assert!(cl.stop().await);
        assert!(!cl.stop().await);
        assert_eq!(cl.status().current_phase, Phase::Stopped);
        assert_eq!(cl.tick().await, Err(CycleError::LoopStopped));
        let err = cl
            .submit_observation(Observation::new("agent-1", ObservationSource::User, "late"))
            .await
            .unwrap_err();
        assert_eq!(err, CycleError::LoopStopped);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_call() {
        let backend = Arc::new(ScriptedInference::new().with_latency(Duration::from_secs(30)));
        let cl = standalone(backend);
        cl.submit_observation(Observation::new("agent-1", ObservationSource::User, "hi"))
            .await
            .unwrap();
        cl.tick().await.unwrap();

        let ticking = {
            let cl = cl.clone();
            tokio::spawn(async move { cl.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(5), cl.stop()).await.unwrap();
        assert!(stopped);
        assert_eq!(ticking.await.unwrap(), Ok(TickOutcome::Stopped));
        assert_eq!(cl.status().current_phase, Phase::Stopped);
        assert_eq!(cl.status().consecutive_errors, 0);
    }
}
