//! 模型选择器
//!
//! 根据操作类型、复杂度档位与选择策略，从调用方提供的模型表中选出模型 ID：
//! - Complexity：复杂度档位直接索引 (provider, operation, tier)
//! - CostAware：档位不超过预算
//! - LoadBalanced：按时间在 provider 列表中轮转，忽略复杂度
//! - Specialized：按 (operation, tag) 查专用表
//!
//! 选择器是纯函数，从不调用推理后端。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{Operation, SelectionError};
use crate::llm::complexity::{ComplexityInput, ComplexityScore, ComplexityScorer, ComplexityTier};

/// 选择策略（按循环或按调用指定）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// 复杂度档位索引模型表
    #[default]
    Complexity,
    /// 档位不超过 budget
    CostAware { budget: ComplexityTier },
    /// 按时间轮转 provider
    LoadBalanced {
        providers: Vec<String>,
        #[serde(default = "default_rotation_ms")]
        rotation_ms: u64,
    },
    /// 按 (operation, tag) 查表
    Specialized { tag: String },
}

fn default_rotation_ms() -> u64 {
    60_000
}

impl SelectionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionStrategy::Complexity => "complexity",
            SelectionStrategy::CostAware { .. } => "cost_aware",
            SelectionStrategy::LoadBalanced { .. } => "load_balanced",
            SelectionStrategy::Specialized { .. } => "specialized",
        }
    }
}

/// 模型表：(provider, operation, tier) → model，(operation, tag) → model
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    default_provider: String,
    tiers: HashMap<(String, Operation, ComplexityTier), String>,
    specialized: HashMap<(Operation, String), String>,
    fallback: Option<String>,
}

impl ModelTable {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            default_provider: default_provider.into(),
            ..Self::default()
        }
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn with_model(
        mut self,
        provider: impl Into<String>,
        operation: Operation,
        tier: ComplexityTier,
        model: impl Into<String>,
    ) -> Self {
        self.insert(provider, operation, tier, model);
        self
    }

    /// 对所有操作登记同一档位的模型
    pub fn with_tier(
        mut self,
        provider: impl Into<String>,
        tier: ComplexityTier,
        model: impl Into<String>,
    ) -> Self {
        let provider = provider.into();
        let model = model.into();
        for op in Operation::ALL {
            self.insert(provider.clone(), op, tier, model.clone());
        }
        self
    }

    pub fn with_specialized(
        mut self,
        operation: Operation,
        tag: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.specialized.insert((operation, tag.into()), model.into());
        self
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback = Some(model.into());
        self
    }

    pub fn insert(
        &mut self,
        provider: impl Into<String>,
        operation: Operation,
        tier: ComplexityTier,
        model: impl Into<String>,
    ) {
        self.tiers
            .insert((provider.into(), operation, tier), model.into());
    }

    pub fn insert_specialized(&mut self, operation: Operation, tag: impl Into<String>, model: impl Into<String>) {
        self.specialized.insert((operation, tag.into()), model.into());
    }

    pub fn set_fallback(&mut self, model: impl Into<String>) {
        self.fallback = Some(model.into());
    }

    pub fn get(&self, provider: &str, operation: Operation, tier: ComplexityTier) -> Option<&str> {
        self.tiers
            .get(&(provider.to_string(), operation, tier))
            .map(String::as_str)
    }

    /// 目标档位缺失时先向下找更便宜的档位，再向上，最后用 fallback
    fn resolve(&self, provider: &str, operation: Operation, tier: ComplexityTier) -> Option<(String, ComplexityTier)> {
        let down = ComplexityTier::ALL.iter().rev().filter(|t| **t <= tier);
        let up = ComplexityTier::ALL.iter().filter(|t| **t > tier);
        down.chain(up)
            .find_map(|t| self.get(provider, operation, *t).map(|m| (m.to_string(), *t)))
    }

    /// 指定档位上限时只向下查找
    fn resolve_capped(&self, provider: &str, operation: Operation, cap: ComplexityTier) -> Option<(String, ComplexityTier)> {
        ComplexityTier::ALL
            .iter()
            .rev()
            .filter(|t| **t <= cap)
            .find_map(|t| self.get(provider, operation, *t).map(|m| (m.to_string(), *t)))
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty() && self.specialized.is_empty() && self.fallback.is_none()
    }
}

/// 一次选模结果
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub model: String,
    /// 实际命中的档位（Specialized / fallback 时为 None）
    pub tier: Option<ComplexityTier>,
    /// 本次使用的复杂度评分（LoadBalanced / Specialized 不评分）
    pub complexity: Option<ComplexityScore>,
}

/// 模型选择器（无状态）
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSelector;

impl ModelSelector {
    pub fn select(
        operation: Operation,
        strategy: &SelectionStrategy,
        input: &ComplexityInput<'_>,
        table: &ModelTable,
    ) -> Result<ModelChoice, SelectionError> {
        let choice = match strategy {
            SelectionStrategy::Complexity => {
                let score = ComplexityScorer::score(input);
                table
                    .resolve(table.default_provider(), operation, score.tier)
                    .map(|(model, tier)| ModelChoice {
                        model,
                        tier: Some(tier),
                        complexity: Some(score),
                    })
            }
            SelectionStrategy::CostAware { budget } => {
                let score = ComplexityScorer::score(input);
                let capped = score.tier.min(*budget);
                table
                    .resolve_capped(table.default_provider(), operation, capped)
                    .map(|(model, tier)| ModelChoice {
                        model,
                        tier: Some(tier),
                        complexity: Some(score),
                    })
            }
            SelectionStrategy::LoadBalanced {
                providers,
                rotation_ms,
            } => {
                if providers.is_empty() {
                    None
                } else {
                    let slot = input.now_ms.max(0) as u64 / (*rotation_ms).max(1);
                    let provider = &providers[(slot % providers.len() as u64) as usize];
                    table
                        .resolve(provider, operation, ComplexityTier::Simple)
                        .map(|(model, tier)| ModelChoice {
                            model,
                            tier: Some(tier),
                            complexity: None,
                        })
                }
            }
            SelectionStrategy::Specialized { tag } => table
                .specialized
                .get(&(operation, tag.clone()))
                .map(|model| ModelChoice {
                    model: model.clone(),
                    tier: None,
                    complexity: None,
                }),
        };

        choice
            .or_else(|| {
                table.fallback.as_ref().map(|model| ModelChoice {
                    model: model.clone(),
                    tier: None,
                    complexity: None,
                })
            })
            .ok_or_else(|| SelectionError::NoModel {
                operation: operation.to_string(),
                strategy: strategy.name().to_string(),
            })
    }
}
