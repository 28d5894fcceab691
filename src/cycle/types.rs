//! 周期产物：Observation / Reasoning / Plan / PlanAction / Reflection
//!
//! 以及推理后端各阶段的结构化输出（schemars 生成 schema，随请求下发）。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::Phase;

/// 任意键值元数据
pub type Metadata = serde_json::Map<String, serde_json::Value>;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

/// 观察来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationSource {
    User,
    System,
    /// 其他 Agent 的调度器投递
    Agent,
}

/// 观察：提交后不可变，由 REASON 阶段消费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub agent_id: String,
    pub source: ObservationSource,
    pub content: serde_json::Value,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Observation {
    pub fn new(
        agent_id: impl Into<String>,
        source: ObservationSource,
        content: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            id: new_id("obs"),
            agent_id: agent_id.into(),
            source,
            content: content.into(),
            timestamp: now_ms(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 推理结果：每个周期恰好一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reasoning {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Created,
    Executing,
    Completed,
    Failed,
    Aborted,
}

/// 动作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Aborted,
    Skipped,
}

impl ActionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ActionStatus::Pending | ActionStatus::Executing)
    }
}

/// 计划中的单个动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    pub id: String,
    pub description: String,
    /// 动作标识
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// 越小越先执行
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: ActionStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// 计划：每个周期一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub agent_id: String,
    pub reasoning_id: String,
    pub goal: String,
    pub description: String,
    pub actions: Vec<PlanAction>,
    pub status: PlanStatus,
    pub created_at: i64,
}

/// 反思：周期终态产物，success 是模式学习归因的唯一信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub agent_id: String,
    pub plan_id: String,
    pub success: bool,
    pub insights: Vec<String>,
    pub improvements: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: i64,
}

/// 单个阶段的结果（写入 previous_phase_results，也是交给模式学习的序列元素）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", content = "result", rename_all = "lowercase")]
pub enum PhaseResult {
    Observation(Vec<Observation>),
    Reasoning(Reasoning),
    Planning(Plan),
    /// ACT 阶段执行完毕后的计划（带各动作状态）
    Action(Plan),
    Reflection(Reflection),
}

impl PhaseResult {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseResult::Observation(_) => Phase::Observe,
            PhaseResult::Reasoning(_) => Phase::Reason,
            PhaseResult::Planning(_) => Phase::Plan,
            PhaseResult::Action(_) => Phase::Act,
            PhaseResult::Reflection(_) => Phase::Reflect,
        }
    }

    /// 序列化后的字节数，供复杂度评分分档
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

// ---- 推理后端的结构化输出 ----

/// REASON 阶段输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReasoningOutput {
    /// 推理内容
    pub content: String,
    /// 0-1，可选；提供时更新共享上下文的置信度
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// PLAN 阶段输出中的动作草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionDraft {
    /// 计划内唯一；缺省时按序号生成
    #[serde(default)]
    pub id: Option<String>,
    pub description: String,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// PLAN 阶段输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanDraft {
    pub goal: String,
    #[serde(default)]
    pub description: String,
    pub actions: Vec<ActionDraft>,
}

/// ACT 阶段单个动作的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionOutput {
    pub result: serde_json::Value,
}

/// REFLECT 阶段输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReflectionOutput {
    pub success: bool,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_defaults() {
        let obs = Observation::new("agent-1", ObservationSource::User, "hello");
        assert!(obs.id.starts_with("obs_"));
        assert_eq!(obs.content, serde_json::json!("hello"));
        assert!(obs.metadata.is_empty());
    }

    #[test]
    fn test_phase_result_serializes_tagged() {
        let r = PhaseResult::Reasoning(Reasoning {
            id: "r1".into(),
            agent_id: "a".into(),
            content: "think".into(),
            timestamp: 0,
            metadata: Metadata::new(),
        });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["phase"], "reasoning");
        assert_eq!(v["result"]["content"], "think");
        assert_eq!(r.phase(), Phase::Reason);
    }

    #[test]
    fn test_reflection_output_defaults() {
        let out: ReflectionOutput = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(out.success);
        assert!(out.insights.is_empty());
        assert_eq!(out.confidence, None);
    }
}
