//! 复杂度评分
//!
//! 对周期上下文快照求和打分（各项独立、相加），再按固定阈值分为 simple / moderate / complex。
//! 每次选模前重新计算，不缓存。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::cycle::CycleContext;

/// simple 与 moderate 的分界
pub const SIMPLE_BELOW: f64 = 1.2;
/// moderate 与 complex 的分界（含）
pub const MODERATE_MAX: f64 = 3.0;

/// 结果大小分档（序列化字节数）
const SMALL_RESULT_BYTES: usize = 512;
const MEDIUM_RESULT_BYTES: usize = 4096;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// 模型能力档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub const ALL: [ComplexityTier; 3] = [
        ComplexityTier::Simple,
        ComplexityTier::Moderate,
        ComplexityTier::Complex,
    ];

    pub fn from_score(score: f64) -> Self {
        if score < SIMPLE_BELOW {
            ComplexityTier::Simple
        } else if score <= MODERATE_MAX {
            ComplexityTier::Moderate
        } else {
            ComplexityTier::Complex
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 评分输入：上下文快照 + 恢复管理器的连续失败数 + 当前时刻
#[derive(Debug, Clone, Copy)]
pub struct ComplexityInput<'a> {
    pub context: &'a CycleContext,
    pub consecutive_errors: u32,
    /// 毫秒时间戳；显式传入以保持评分为纯函数
    pub now_ms: i64,
}

/// 各项得分明细
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComplexityBreakdown {
    pub completed_phases: f64,
    pub errors: f64,
    pub context_elements: f64,
    pub result_size: f64,
    pub uncertainty: f64,
    pub elapsed: f64,
    pub model_variance: f64,
}

impl ComplexityBreakdown {
    pub fn total(&self) -> f64 {
        self.completed_phases
            + self.errors
            + self.context_elements
            + self.result_size
            + self.uncertainty
            + self.elapsed
            + self.model_variance
    }
}

/// 评分结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComplexityScore {
    pub score: f64,
    pub tier: ComplexityTier,
    pub breakdown: ComplexityBreakdown,
}

/// 复杂度评分器（无状态）
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityScorer;

impl ComplexityScorer {
    pub fn score(input: &ComplexityInput<'_>) -> ComplexityScore {
        let ctx = input.context;
        let shared = &ctx.shared_context;

        let completed = ctx.metadata.phase_completion_times.len() as f64;

        let distinct: HashSet<&str> = shared
            .goals
            .iter()
            .chain(&shared.constraints)
            .chain(&shared.resources)
            .chain(&shared.insights)
            .map(String::as_str)
            .collect();

        // 尚无结果按 small 计
        let size = ctx
            .previous_phase_results
            .most_recent()
            .map(|r| r.serialized_size())
            .unwrap_or(0);
        let result_size = if size < SMALL_RESULT_BYTES {
            0.3
        } else if size < MEDIUM_RESULT_BYTES {
            0.5
        } else {
            0.8
        };

        let confidence = if shared.confidence.is_finite() {
            shared.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let elapsed_ms = (input.now_ms - ctx.metadata.start_time).max(0) as f64;

        let models: HashSet<&str> = ctx.metadata.model_usage.values().map(String::as_str).collect();
        let model_variance = match models.len() {
            0 | 1 => 0.0,
            2 => 0.3,
            3 => 0.4,
            _ => 0.5,
        };

        let breakdown = ComplexityBreakdown {
            completed_phases: 0.2 * completed,
            errors: 0.5 * f64::from(input.consecutive_errors),
            context_elements: 0.1 * distinct.len() as f64,
            result_size,
            uncertainty: 0.5 * (1.0 - confidence),
            elapsed: 0.2 * (elapsed_ms / MS_PER_HOUR),
            model_variance,
        };
        let score = breakdown.total();
        ComplexityScore {
            score,
            tier: ComplexityTier::from_score(score),
            breakdown,
        }
    }
}
