//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ORPAR__*` 覆盖（双下划线表示嵌套，如 `ORPAR__RECOVERY__MAX_RETRIES=5`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::{Operation, RecoveryConfig};
use crate::cycle::LoopConfig;
use crate::llm::{ComplexityTier, ModelTable};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    /// [loop] 段：新建循环的默认参数（agent_id / channel_id 在启动时填入）
    #[serde(default, rename = "loop")]
    pub loop_defaults: LoopConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub models: ModelsSection,
}

/// [app] 段：应用名、演示用的 agent / channel
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_channel_id")]
    pub channel_id: String,
    /// 事件总线容量
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_agent_id() -> String {
    "agent-1".to_string()
}

fn default_channel_id() -> String {
    "default".to_string()
}

fn default_event_capacity() -> usize {
    256
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            agent_id: default_agent_id(),
            channel_id: default_channel_id(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// 某个 provider / 操作的三档模型
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct TierModels {
    pub simple: Option<String>,
    pub moderate: Option<String>,
    pub complex: Option<String>,
}

impl TierModels {
    fn entries(&self) -> impl Iterator<Item = (ComplexityTier, &str)> {
        [
            (ComplexityTier::Simple, self.simple.as_deref()),
            (ComplexityTier::Moderate, self.moderate.as_deref()),
            (ComplexityTier::Complex, self.complex.as_deref()),
        ]
        .into_iter()
        .filter_map(|(tier, model)| model.map(|m| (tier, m)))
    }
}

/// 专用模型：(operation, tag) → model
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SpecializedModel {
    pub operation: Operation,
    pub tag: String,
    pub model: String,
}

/// [models] 段：模型表
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsSection {
    /// 默认 provider（Complexity / CostAware 策略使用）
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 默认 provider 对全部操作的三档模型
    #[serde(default)]
    pub tiers: TierModels,
    /// 默认 provider 按操作覆盖（键为 reasoning / planning / action / reflection / observation）
    #[serde(default)]
    pub operations: HashMap<String, TierModels>,
    /// 其他 provider 对全部操作的三档模型（LoadBalanced 轮转用）
    #[serde(default)]
    pub providers: HashMap<String, TierModels>,
    #[serde(default)]
    pub specialized: Vec<SpecializedModel>,
    pub fallback: Option<String>,
}

fn default_provider() -> String {
    "default".to_string()
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            tiers: TierModels::default(),
            operations: HashMap::new(),
            providers: HashMap::new(),
            specialized: Vec::new(),
            fallback: None,
        }
    }
}

impl ModelsSection {
    /// 构建模型表；按操作的覆盖优先于全局档位
    pub fn to_table(&self) -> ModelTable {
        let mut table = ModelTable::new(self.provider.clone());

        for (tier, model) in self.tiers.entries() {
            for op in Operation::ALL {
                table.insert(self.provider.clone(), op, tier, model);
            }
        }
        for (name, tiers) in &self.operations {
            let Some(op) = Operation::ALL.into_iter().find(|o| o.as_str() == name) else {
                tracing::warn!(operation = %name, "unknown operation in [models.operations], ignored");
                continue;
            };
            for (tier, model) in tiers.entries() {
                table.insert(self.provider.clone(), op, tier, model);
            }
        }
        for (provider, tiers) in &self.providers {
            for (tier, model) in tiers.entries() {
                for op in Operation::ALL {
                    table.insert(provider.clone(), op, tier, model);
                }
            }
        }
        for s in &self.specialized {
            table.insert_specialized(s.operation, s.tag.clone(), s.model.clone());
        }
        if let Some(fallback) = &self.fallback {
            table.set_fallback(fallback.clone());
        }
        table
    }
}

impl AppConfig {
    /// 以 [loop] 为模板、[recovery] 为恢复参数，生成某个 agent / channel 的循环配置
    pub fn loop_config(&self, agent_id: &str, channel_id: &str) -> LoopConfig {
        LoopConfig {
            agent_id: agent_id.to_string(),
            channel_id: channel_id.to_string(),
            recovery: self.recovery.clone(),
            ..self.loop_defaults.clone()
        }
    }
}

/// 从 config 目录加载配置，环境变量 ORPAR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ORPAR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ORPAR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方决定是否用新配置重建循环）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
