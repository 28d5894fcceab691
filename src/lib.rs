//! ORPAR - 认知周期调度器
//!
//! 每个 (agent, channel) 一个控制循环，依次经过 Observe → Reason → Plan → Act → Reflect，
//! 按上下文复杂度为每次推理选择模型，失败时重试、升级并自愈。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段状态机、错误类型、恢复管理、状态投影、循环监管、动作执行池
//! - **cycle**: 周期产物、周期上下文、观察队列、计划执行、事件、调度器与注册表
//! - **learning**: 模式学习接口
//! - **llm**: 推理后端抽象、复杂度评分、模型选择、脚本化后端
//! - **memory**: 阶段记忆
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod cycle;
pub mod learning;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{CycleError, LoopStatus, Phase};
pub use crate::cycle::{ControlLoop, ControlLoopRegistry, LoopConfig, LoopDependencies};
