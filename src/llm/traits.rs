//! 推理后端抽象
//!
//! 所有后端实现 InferenceBackend::infer：按操作、模型、提示上下文与 schema 返回结构化结果。
//! 后端必须在返回成功前按 schema 校验；校验失败与传输失败是不同的错误类型。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::{CollaboratorError, Operation};

/// 单次推理请求
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub operation: Operation,
    pub model: String,
    /// 提示上下文（提示词内容由后端决定）
    pub prompt_context: serde_json::Value,
    /// 期望输出的 JSON Schema
    pub schema: serde_json::Value,
    pub deadline: Duration,
}

/// 推理后端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Inference timed out")]
    Timeout,

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Inference cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn into_collaborator(self, deadline: Duration) -> CollaboratorError {
        match self {
            InferenceError::Transport(msg) => CollaboratorError::Transient(msg),
            InferenceError::Timeout => CollaboratorError::Timeout {
                deadline_ms: deadline.as_millis() as u64,
            },
            InferenceError::RateLimited { retry_after_ms } => {
                CollaboratorError::RateLimited { retry_after_ms }
            }
            InferenceError::SchemaValidation(msg) => CollaboratorError::SchemaValidation(msg),
            InferenceError::Cancelled => CollaboratorError::Cancelled,
        }
    }
}

/// 推理后端 trait
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// 执行一次推理；cancel 被取消时应尽快返回 Cancelled
    async fn infer(
        &self,
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, InferenceError>;
}

/// 带截止时间与取消的单次调用；超时视为协作方失败，并取消本次调用的 token
pub async fn call_with_deadline(
    backend: &dyn InferenceBackend,
    request: InferenceRequest,
    cancel: CancellationToken,
) -> Result<serde_json::Value, CollaboratorError> {
    let deadline = request.deadline;
    let call = backend.infer(request, cancel.clone());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
        res = tokio::time::timeout(deadline, call) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into_collaborator(deadline)),
            Err(_) => {
                cancel.cancel();
                Err(CollaboratorError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                })
            }
        },
    }
}
