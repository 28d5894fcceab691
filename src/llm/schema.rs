//! 结构化输出 Schema（schemars 自动生成）
//!
//! 推理请求随附目标类型的 JSON Schema；返回值再按目标类型解码，解码失败即 schema 校验失败。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

use crate::core::CollaboratorError;

/// 目标类型的 JSON Schema
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}

/// 将后端返回值解码为目标类型
pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, CollaboratorError> {
    serde_json::from_value(value).map_err(|e| CollaboratorError::SchemaValidation(e.to_string()))
}
