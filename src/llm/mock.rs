//! 脚本化推理后端（用于测试与演示，无需 API）
//!
//! 每种操作返回预置的结构化输出；可按操作排入失败序列、设置固定延迟，并记录每次调用的模型。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::Operation;
use crate::llm::traits::{InferenceBackend, InferenceError, InferenceRequest};

/// 一次调用记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub model: String,
    pub prompt_context: serde_json::Value,
}

#[derive(Debug, Default)]
struct Script {
    outputs: HashMap<Operation, serde_json::Value>,
    failures: HashMap<Operation, VecDeque<InferenceError>>,
    always_fail: HashMap<Operation, InferenceError>,
    calls: Vec<RecordedCall>,
}

/// 脚本化后端
#[derive(Debug)]
pub struct ScriptedInference {
    script: Mutex<Script>,
    latency: Option<Duration>,
}

impl ScriptedInference {
    pub fn new() -> Self {
        let mut outputs = HashMap::new();
        outputs.insert(
            Operation::Reasoning,
            json!({"content": "The observation asks for a status summary.", "confidence": 0.8}),
        );
        outputs.insert(
            Operation::Planning,
            json!({
                "goal": "answer the request",
                "description": "collect then respond",
                "actions": [
                    {"id": "collect", "description": "collect facts", "action": "collect", "priority": 1},
                    {"id": "respond", "description": "send reply", "action": "respond", "priority": 2, "dependencies": ["collect"]}
                ]
            }),
        );
        outputs.insert(Operation::Action, json!({"result": "done"}));
        outputs.insert(
            Operation::Reflection,
            json!({"success": true, "insights": ["status requests are cheap"], "improvements": []}),
        );
        Self {
            script: Mutex::new(Script {
                outputs,
                ..Script::default()
            }),
            latency: None,
        }
    }

    /// 每次调用前等待固定时长（可被取消）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_output(self, operation: Operation, output: serde_json::Value) -> Self {
        self.lock().outputs.insert(operation, output);
        self
    }

    /// 该操作接下来的一次调用返回 err（可多次排队）
    pub fn fail_next(&self, operation: Operation, err: InferenceError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(err);
    }

    /// 该操作的每次调用都返回 err
    pub fn fail_always(&self, operation: Operation, err: InferenceError) {
        self.lock().always_fail.insert(operation, err);
    }

    pub fn clear_failures(&self) {
        let mut script = self.lock();
        script.failures.clear();
        script.always_fail.clear();
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// 某操作每次调用使用的模型（按调用顺序）
    pub fn models_for(&self, operation: Operation) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.model.clone())
            .collect()
    }

    /// 某操作每次调用收到的 prompt_context
    pub fn prompts_for(&self, operation: Operation) -> Vec<serde_json::Value> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.prompt_context.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptedInference {
    fn default() -> Self {
        Self::new()
    }
}

/// 轻量 schema 校验：对象输出必须包含 schema 的全部 required 字段
fn check_required(schema: &serde_json::Value, output: &serde_json::Value) -> Result<(), InferenceError> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    let Some(obj) = output.as_object() else {
        return Err(InferenceError::SchemaValidation("output is not an object".to_string()));
    };
    for field in required.iter().filter_map(|f| f.as_str()) {
        if !obj.contains_key(field) {
            return Err(InferenceError::SchemaValidation(format!("missing field `{field}`")));
        }
    }
    Ok(())
}

#[async_trait]
impl InferenceBackend for ScriptedInference {
    async fn infer(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, InferenceError> {
        if let Some(latency) = self.latency {
            tokio::select! {
                _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }

        let outcome = {
            let mut script = self.lock();
            script.calls.push(RecordedCall {
                operation: request.operation,
                model: request.model.clone(),
                prompt_context: request.prompt_context.clone(),
            });
            let always = script.always_fail.get(&request.operation).cloned();
            if let Some(err) = always {
                Err(err)
            } else if let Some(err) = script
                .failures
                .get_mut(&request.operation)
                .and_then(|q| q.pop_front())
            {
                Err(err)
            } else {
                Ok(script
                    .outputs
                    .get(&request.operation)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null))
            }
        };

        let output = outcome?;
        check_required(&request.schema, &output)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::types::ReasoningOutput;
    use crate::llm::schema::schema_of;

    fn request(op: Operation) -> InferenceRequest {
        InferenceRequest {
            operation: op,
            model: "m".into(),
            prompt_context: json!({}),
            schema: schema_of::<ReasoningOutput>(),
            deadline: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_scripted_failure_then_success() {
        let backend = ScriptedInference::new();
        backend.fail_next(Operation::Reasoning, InferenceError::Timeout);
        let first = backend.infer(request(Operation::Reasoning), CancellationToken::new()).await;
        assert_eq!(first, Err(InferenceError::Timeout));
        let second = backend.infer(request(Operation::Reasoning), CancellationToken::new()).await;
        assert!(second.is_ok());
        assert_eq!(backend.models_for(Operation::Reasoning).len(), 2);
    }

    #[tokio::test]
    async fn test_required_field_check() {
        let backend = ScriptedInference::new().with_output(Operation::Reasoning, json!({"text": "no content"}));
        let res = backend.infer(request(Operation::Reasoning), CancellationToken::new()).await;
        assert!(matches!(res, Err(InferenceError::SchemaValidation(_))));
    }

    #[tokio::test]
    async fn test_latency_cancellable() {
        let backend = ScriptedInference::new().with_latency(Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();
        let res = backend.infer(request(Operation::Reasoning), token).await;
        assert_eq!(res, Err(InferenceError::Cancelled));
    }
}
