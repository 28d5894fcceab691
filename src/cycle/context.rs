//! 周期上下文：跨阶段结果、共享目标/约束/洞察、计时与模型使用
//!
//! CycleContextStore 由调度器独占；snapshot() 给评分器与模式学习一份不可变副本。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Phase;
use crate::cycle::types::{new_id, now_ms, Observation, PhaseResult, Plan, Reasoning, Reflection};

/// 错误轨迹最多保留条数（超出时丢弃最旧）
const MAX_ERROR_TRAIL: usize = 256;

/// 各阶段的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseResults {
    pub observation: Option<Vec<Observation>>,
    pub reasoning: Option<Reasoning>,
    pub planning: Option<Plan>,
    pub action: Option<Plan>,
    pub reflection: Option<Reflection>,
}

impl PhaseResults {
    /// 按 ORPAR 顺序排列的已有结果
    pub fn sequence(&self) -> Vec<PhaseResult> {
        let mut out = Vec::with_capacity(5);
        if let Some(o) = &self.observation {
            out.push(PhaseResult::Observation(o.clone()));
        }
        if let Some(r) = &self.reasoning {
            out.push(PhaseResult::Reasoning(r.clone()));
        }
        if let Some(p) = &self.planning {
            out.push(PhaseResult::Planning(p.clone()));
        }
        if let Some(a) = &self.action {
            out.push(PhaseResult::Action(a.clone()));
        }
        if let Some(r) = &self.reflection {
            out.push(PhaseResult::Reflection(r.clone()));
        }
        out
    }

    /// 最近一个阶段的结果（同一周期内按阶段顺序写入，顺序靠后者即最近）
    pub fn most_recent(&self) -> Option<PhaseResult> {
        self.sequence().pop()
    }

    pub fn is_empty(&self) -> bool {
        self.observation.is_none()
            && self.reasoning.is_none()
            && self.planning.is_none()
            && self.action.is_none()
            && self.reflection.is_none()
    }
}

/// 跨阶段共享的目标、约束、资源、洞察与置信度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub insights: Vec<String>,
    /// 0-1
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

impl Default for SharedContext {
    fn default() -> Self {
        Self {
            goals: Vec::new(),
            constraints: Vec::new(),
            resources: Vec::new(),
            insights: Vec::new(),
            confidence: default_confidence(),
        }
    }
}

impl SharedContext {
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            default_confidence()
        };
    }

    /// 不重复地追加洞察
    pub fn add_insights<I: IntoIterator<Item = String>>(&mut self, insights: I) {
        for insight in insights {
            if !self.insights.contains(&insight) {
                self.insights.push(insight);
            }
        }
    }
}

/// 计时、模型使用与错误轨迹
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleMetadata {
    pub start_time: i64,
    pub phase_completion_times: BTreeMap<Phase, i64>,
    pub model_usage: BTreeMap<Phase, String>,
    pub errors: Vec<String>,
}

/// 单个周期的上下文
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleContext {
    pub id: String,
    pub agent_id: String,
    pub channel_id: String,
    pub cycle_id: String,
    pub phase: Phase,
    pub timestamp: i64,
    pub previous_phase_results: PhaseResults,
    pub shared_context: SharedContext,
    pub metadata: CycleMetadata,
}

impl CycleContext {
    pub fn new(agent_id: impl Into<String>, channel_id: impl Into<String>, shared: SharedContext) -> Self {
        let now = now_ms();
        Self {
            id: new_id("ctx"),
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            cycle_id: new_id("cycle"),
            phase: Phase::Idle,
            timestamp: now,
            previous_phase_results: PhaseResults::default(),
            shared_context: shared,
            metadata: CycleMetadata {
                start_time: now,
                phase_completion_times: BTreeMap::new(),
                model_usage: BTreeMap::new(),
                errors: Vec::new(),
            },
        }
    }
}

/// 周期上下文存储，由所属调度器独占修改
#[derive(Debug)]
pub struct CycleContextStore {
    context: CycleContext,
    /// 不延续共享上下文时，新周期恢复为此种子
    seed: SharedContext,
}

impl CycleContextStore {
    pub fn new(agent_id: &str, channel_id: &str, seed: SharedContext) -> Self {
        Self {
            context: CycleContext::new(agent_id, channel_id, seed.clone()),
            seed,
        }
    }

    pub fn context(&self) -> &CycleContext {
        &self.context
    }

    pub fn cycle_id(&self) -> &str {
        &self.context.cycle_id
    }

    /// 写入阶段结果并记录完成时间
    pub fn record_phase_result(&mut self, result: PhaseResult) {
        let phase = result.phase();
        let now = now_ms();
        let results = &mut self.context.previous_phase_results;
        match result {
            PhaseResult::Observation(o) => results.observation = Some(o),
            PhaseResult::Reasoning(r) => results.reasoning = Some(r),
            PhaseResult::Planning(p) => results.planning = Some(p),
            PhaseResult::Action(p) => results.action = Some(p),
            PhaseResult::Reflection(r) => results.reflection = Some(r),
        }
        self.context.metadata.phase_completion_times.insert(phase, now);
        self.context.timestamp = now;
    }

    pub fn record_model_usage(&mut self, phase: Phase, model: &str) {
        self.context.metadata.model_usage.insert(phase, model.to_string());
    }

    /// 追加错误轨迹；不影响恢复管理器的计数
    pub fn record_error(&mut self, message: impl Into<String>) {
        let errors = &mut self.context.metadata.errors;
        errors.push(message.into());
        if errors.len() > MAX_ERROR_TRAIL {
            let excess = errors.len() - MAX_ERROR_TRAIL;
            errors.drain(0..excess);
        }
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.context.phase = phase;
        self.context.timestamp = now_ms();
    }

    /// 标记周期真正开始（首个观察批次被取出时）
    pub fn mark_cycle_start(&mut self) {
        self.context.metadata.start_time = now_ms();
    }

    pub fn shared(&self) -> &SharedContext {
        &self.context.shared_context
    }

    pub fn shared_mut(&mut self) -> &mut SharedContext {
        &mut self.context.shared_context
    }

    pub fn snapshot(&self) -> CycleContext {
        self.context.clone()
    }

    /// 进入下一周期：清空阶段结果、完成时间、模型使用，换新 cycle_id；
    /// carry_forward=false 时共享上下文恢复为种子。错误轨迹保留。
    pub fn begin_next_cycle(&mut self, carry_forward: bool) {
        let now = now_ms();
        let ctx = &mut self.context;
        ctx.cycle_id = new_id("cycle");
        ctx.previous_phase_results = PhaseResults::default();
        ctx.metadata.phase_completion_times.clear();
        ctx.metadata.model_usage.clear();
        ctx.metadata.start_time = now;
        ctx.timestamp = now;
        if !carry_forward {
            ctx.shared_context = self.seed.clone();
        }
    }
}
