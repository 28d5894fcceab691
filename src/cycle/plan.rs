//! 计划构建与执行
//!
//! 构建时用入度表做拓扑排序（Kahn），依赖环、未知依赖、重复 ID 都在此处拒绝；
//! 执行时只有全部依赖已完成的动作才能进入 executing，同批就绪动作按 priority 升序。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::core::{ActionPool, CollaboratorError, CycleError, Operation};
use crate::cycle::types::{
    new_id, now_ms, ActionOutput, ActionStatus, Plan, PlanAction, PlanDraft, PlanStatus,
};
use crate::llm::schema::{decode, schema_of};
use crate::llm::traits::call_with_deadline;
use crate::llm::{InferenceBackend, InferenceRequest};

impl Plan {
    /// 由推理输出构建计划；依赖关系非法时返回 InvalidPlan
    pub fn from_draft(
        agent_id: &str,
        reasoning_id: &str,
        draft: PlanDraft,
    ) -> Result<Plan, CycleError> {
        let actions = draft
            .actions
            .into_iter()
            .enumerate()
            .map(|(i, a)| PlanAction {
                id: a.id.unwrap_or_else(|| format!("action_{}", i + 1)),
                description: a.description,
                action: a.action,
                parameters: a.parameters,
                priority: a.priority,
                dependencies: a.dependencies,
                status: ActionStatus::Pending,
                result: None,
                error: None,
            })
            .collect::<Vec<_>>();

        let plan = Plan {
            id: new_id("plan"),
            agent_id: agent_id.to_string(),
            reasoning_id: reasoning_id.to_string(),
            goal: draft.goal,
            description: draft.description,
            actions,
            status: PlanStatus::Created,
            created_at: now_ms(),
        };
        plan.validate()?;
        Ok(plan)
    }

    /// 校验依赖图：ID 唯一、依赖存在、无环；返回一个合法的拓扑顺序
    pub fn validate(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

        for action in &self.actions {
            if in_degree.insert(action.id.as_str(), 0).is_some() {
                return Err(CycleError::InvalidPlan(format!(
                    "duplicate action id `{}`",
                    action.id
                )));
            }
            adjacency.entry(action.id.as_str()).or_default();
        }

        for action in &self.actions {
            let mut seen = HashSet::new();
            for dep in &action.dependencies {
                if !in_degree.contains_key(dep.as_str()) {
                    return Err(CycleError::InvalidPlan(format!(
                        "action `{}` depends on unknown action `{}`",
                        action.id, dep
                    )));
                }
                if !seen.insert(dep.as_str()) {
                    continue;
                }
                adjacency.entry(dep.as_str()).or_default().push(action.id.as_str());
                *in_degree.entry(action.id.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = self
            .actions
            .iter()
            .map(|a| a.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.actions.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            if let Some(dependents) = adjacency.get(id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() != self.actions.len() {
            let stuck: Vec<&str> = self
                .actions
                .iter()
                .map(|a| a.id.as_str())
                .filter(|id| !order.iter().any(|o| o == id))
                .collect();
            return Err(CycleError::InvalidPlan(format!(
                "dependency cycle among actions: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// 可执行的动作下标：pending 且全部依赖已完成；按 (priority, 声明顺序) 排序
    pub fn ready_actions(&self) -> Vec<usize> {
        let completed: HashSet<&str> = self
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Completed)
            .map(|a| a.id.as_str())
            .collect();
        let mut ready: Vec<usize> = self
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.status == ActionStatus::Pending
                    && a.dependencies.iter().all(|d| completed.contains(d.as_str()))
            })
            .map(|(i, _)| i)
            .collect();
        ready.sort_by_key(|i| (self.actions[*i].priority, *i));
        ready
    }

    pub fn all_completed(&self) -> bool {
        self.actions.iter().all(|a| a.status == ActionStatus::Completed)
    }
}

/// 动作执行器：ACT 阶段对单个动作的外部调用
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(
        &self,
        action: &PlanAction,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// 通过推理后端（operation = action）执行动作
pub struct InferenceActionRunner {
    backend: Arc<dyn InferenceBackend>,
    model: String,
    deadline: Duration,
    /// 随每个动作一起下发的上下文（目标、约束等）
    context: serde_json::Value,
}

impl InferenceActionRunner {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        model: impl Into<String>,
        deadline: Duration,
        context: serde_json::Value,
    ) -> Self {
        Self {
            backend,
            model: model.into(),
            deadline,
            context,
        }
    }
}

#[async_trait]
impl ActionRunner for InferenceActionRunner {
    async fn run(
        &self,
        action: &PlanAction,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, CollaboratorError> {
        let request = InferenceRequest {
            operation: Operation::Action,
            model: self.model.clone(),
            prompt_context: serde_json::json!({
                "action": action,
                "context": self.context,
            }),
            schema: schema_of::<ActionOutput>(),
            deadline: self.deadline,
        };
        let value = call_with_deadline(self.backend.as_ref(), request, cancel).await?;
        decode::<ActionOutput>(value).map(|out| out.result)
    }
}

/// 按依赖顺序执行计划，返回最终计划状态
///
/// 可重试的失败（超时、传输错误、限流）让该动作回到 pending 并返回 Err：
/// 已完成的动作保留结果，同一计划再次执行时只跑剩余动作。
/// 不可重试的失败标记为 failed，其依赖方被跳过。
pub async fn execute_plan(
    plan: &mut Plan,
    runner: &dyn ActionRunner,
    pool: &ActionPool,
    cancel: &CancellationToken,
) -> Result<PlanStatus, CollaboratorError> {
    plan.status = PlanStatus::Executing;

    loop {
        if cancel.is_cancelled() {
            for a in plan.actions.iter_mut().filter(|a| !a.status.is_finished()) {
                a.status = ActionStatus::Aborted;
            }
            plan.status = PlanStatus::Aborted;
            return Ok(plan.status);
        }

        let ready = plan.ready_actions();
        let width = pool.wave_width(ready.len());
        if width == 0 {
            break;
        }
        let wave: Vec<usize> = ready.into_iter().take(width).collect();

        for idx in &wave {
            plan.actions[*idx].status = ActionStatus::Executing;
        }
        tracing::debug!(plan_id = %plan.id, wave = wave.len(), mode = ?pool.mode(), "executing action wave");

        let calls = wave.iter().map(|idx| {
            let action = plan.actions[*idx].clone();
            let token = cancel.child_token();
            async move {
                let _permit = match pool.acquire().await {
                    Ok(p) => p,
                    Err(_) => return Err(CollaboratorError::Cancelled),
                };
                runner.run(&action, token).await
            }
        });
        let results = join_all(calls).await;

        let mut retryable = None;
        for (idx, result) in wave.into_iter().zip(results) {
            let action = &mut plan.actions[idx];
            match result {
                Ok(value) => {
                    action.status = ActionStatus::Completed;
                    action.result = Some(value);
                }
                Err(CollaboratorError::Cancelled) => {
                    action.status = ActionStatus::Aborted;
                    action.error = Some(CollaboratorError::Cancelled.to_string());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(action_id = %action.id, error = %e, "plan action failed, will retry");
                    action.status = ActionStatus::Pending;
                    action.error = Some(e.to_string());
                    retryable.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(action_id = %action.id, error = %e, "plan action failed");
                    action.status = ActionStatus::Failed;
                    action.error = Some(e.to_string());
                }
            }
        }
        if let Some(err) = retryable {
            return Err(err);
        }
    }

    // 依赖未完成而无法执行的动作
    for a in plan.actions.iter_mut().filter(|a| a.status == ActionStatus::Pending) {
        a.status = ActionStatus::Skipped;
        a.error = Some("dependency not completed".to_string());
    }

    plan.status = if plan.all_completed() {
        PlanStatus::Completed
    } else if plan.actions.iter().any(|a| a.status == ActionStatus::Aborted) {
        PlanStatus::Aborted
    } else {
        PlanStatus::Failed
    };
    Ok(plan.status)
}
