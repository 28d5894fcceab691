//! 动作执行池：Sequential / Parallel
//!
//! ACT 阶段按依赖顺序执行计划动作；Parallel 模式下无依赖关系的动作可并发，
//! 使用 Semaphore 限制同时执行的动作数。

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// 计划动作的执行模式（按循环配置，默认串行）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 一次只执行一个就绪动作
    #[default]
    Sequential,
    /// 就绪动作并发执行，受 max_parallel 限制
    Parallel,
}

/// 动作执行池
#[derive(Debug, Clone)]
pub struct ActionPool {
    mode: ExecutionMode,
    /// 并发限制（默认 3）
    semaphore: Arc<Semaphore>,
}

impl ActionPool {
    pub fn new(mode: ExecutionMode, max_parallel: usize) -> Self {
        let permits = match mode {
            ExecutionMode::Sequential => 1,
            ExecutionMode::Parallel => max_parallel.max(1),
        };
        Self {
            mode,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// 本轮从就绪集合中取出的动作数
    pub fn wave_width(&self, ready: usize) -> usize {
        match self.mode {
            ExecutionMode::Sequential => ready.min(1),
            ExecutionMode::Parallel => ready,
        }
    }

    /// 获取执行许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ActionPool {
    fn default() -> Self {
        Self::new(ExecutionMode::Sequential, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_width() {
        let pool = ActionPool::default();
        assert_eq!(pool.wave_width(5), 1);
        assert_eq!(pool.wave_width(0), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_parallel_permits_bounded() {
        let pool = ActionPool::new(ExecutionMode::Parallel, 2);
        assert_eq!(pool.wave_width(5), 5);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }
}
