//! 推理层：后端抽象、复杂度评分、模型选择、结构化输出 Schema、脚本化后端

pub mod complexity;
pub mod mock;
pub mod schema;
pub mod selector;
pub mod traits;

pub use complexity::{ComplexityInput, ComplexityScore, ComplexityScorer, ComplexityTier};
pub use mock::{RecordedCall, ScriptedInference};
pub use selector::{ModelChoice, ModelSelector, ModelTable, SelectionStrategy};
pub use traits::{call_with_deadline, InferenceBackend, InferenceError, InferenceRequest};
