//! 阶段记忆：按 (scope, phase) 写入与检索
//!
//! REASON 阶段先按观察内容检索相关记忆，REFLECT 阶段写回洞察。
//! InMemoryPhaseMemory 按关键词重叠检索，适合测试与单机运行；后续可接真实向量库。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{CollaboratorError, Phase};
use crate::cycle::types::{now_ms, Metadata};

/// 单条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: i64,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
            timestamp: now_ms(),
        }
    }
}

/// 多层记忆存储的窄接口
#[async_trait]
pub trait PhaseMemory: Send + Sync {
    /// 检索与 query 相关的记忆
    async fn read(
        &self,
        scope: &str,
        phase: Phase,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, CollaboratorError>;

    async fn write(&self, scope: &str, phase: Phase, entry: MemoryEntry) -> Result<(), CollaboratorError>;
}

/// 空实现：未接入记忆时使用
#[derive(Debug, Clone, Default)]
pub struct NoopMemory;

#[async_trait]
impl PhaseMemory for NoopMemory {
    async fn read(&self, _scope: &str, _phase: Phase, _query: &str) -> Result<Vec<MemoryEntry>, CollaboratorError> {
        Ok(Vec::new())
    }

    async fn write(&self, _scope: &str, _phase: Phase, _entry: MemoryEntry) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

type Bucket = Vec<(MemoryEntry, HashSet<String>)>;

/// 内存实现：每个 (scope, phase) 一个桶，超出 max_entries 丢弃最旧
#[derive(Debug)]
pub struct InMemoryPhaseMemory {
    buckets: RwLock<HashMap<(String, Phase), Bucket>>,
    max_entries: usize,
    /// 每次检索最多返回条数
    top_k: usize,
}

impl InMemoryPhaseMemory {
    pub fn new(max_entries: usize, top_k: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            top_k: top_k.max(1),
        }
    }

    /// 某个桶当前的条数
    pub fn len(&self, scope: &str, phase: Phase) -> usize {
        self.buckets
            .read()
            .map(|b| b.get(&(scope.to_string(), phase)).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    fn poisoned() -> CollaboratorError {
        CollaboratorError::Transient("memory store lock poisoned".to_string())
    }
}

impl Default for InMemoryPhaseMemory {
    fn default() -> Self {
        Self::new(1000, 5)
    }
}

#[async_trait]
impl PhaseMemory for InMemoryPhaseMemory {
    async fn read(&self, scope: &str, phase: Phase, query: &str) -> Result<Vec<MemoryEntry>, CollaboratorError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let buckets = self.buckets.read().map_err(|_| Self::poisoned())?;
        let Some(bucket) = buckets.get(&(scope.to_string(), phase)) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(usize, &MemoryEntry)> = bucket
            .iter()
            .map(|(entry, tokens)| (query_tokens.intersection(tokens).count(), entry))
            .filter(|(s, _)| *s > 0)
            .collect();
        // 同分时较新的在前
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        Ok(scored
            .into_iter()
            .take(self.top_k)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn write(&self, scope: &str, phase: Phase, entry: MemoryEntry) -> Result<(), CollaboratorError> {
        if entry.content.trim().is_empty() {
            return Ok(());
        }
        let tokens = tokenize_lower(&entry.content);
        let mut buckets = self.buckets.write().map_err(|_| Self::poisoned())?;
        let bucket = buckets.entry((scope.to_string(), phase)).or_default();
        bucket.push((entry, tokens));
        let n = bucket.len();
        if n > self.max_entries {
            bucket.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}
